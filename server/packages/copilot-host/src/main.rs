fn main() {
    if let Err(err) = copilot_host::cli::run_copilot_host() {
        tracing::error!(error = %err, "copilot-host failed");
        std::process::exit(1);
    }
}
