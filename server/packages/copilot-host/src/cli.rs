use std::str::FromStr;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use clap::{Args, Parser, Subcommand};
use copilot_host_activity_schema::activity_json_schema;
use copilot_host_error::HostError;
use thiserror::Error;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::config::HostConfig;
use crate::control::CopilotHostControl;
use crate::host::{HostField, HostFlag, InMemoryHostBinding};
use crate::http_connection::HttpConnectionFactory;
use crate::identity::StaticTokenIdentityFactory;
use crate::router::{build_router, AppState};
use crate::session::SessionDeps;
use crate::token_cache::TokenCache;
use crate::transcript::TranscriptRenderer;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;

#[derive(Parser, Debug)]
#[command(name = "copilot-host", bin_name = "copilot-host")]
#[command(about = "Multi-tab Copilot chat host", version)]
#[command(arg_required_else_help = true)]
pub struct CopilotHostCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the host bridge server against an agent backend.
    Serve(ServeArgs),
    /// Print the activity JSON Schema.
    Schema,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base URL of the agent backend.
    #[arg(long, env = "COPILOT_HOST_AGENT_ENDPOINT")]
    agent_endpoint: Url,

    #[arg(long, env = "COPILOT_HOST_APP_CLIENT_ID")]
    app_client_id: Option<String>,

    #[arg(long, env = "COPILOT_HOST_TENANT_ID")]
    tenant_id: Option<String>,

    #[arg(long, env = "COPILOT_HOST_ENVIRONMENT_ID")]
    environment_id: Option<String>,

    #[arg(long, env = "COPILOT_HOST_AGENT_ID")]
    agent_id: Option<String>,

    /// Bearer token handed to the agent backend.
    #[arg(long, short = 't', env = "COPILOT_HOST_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(long)]
    send_context: bool,

    #[arg(long)]
    show_tool_calls: bool,

    #[arg(long)]
    show_thoughts: bool,

    #[arg(long)]
    keep_connection_alive: bool,

    #[arg(long)]
    max_sessions: Option<usize>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_copilot_host() -> Result<(), CliError> {
    let cli = CopilotHostCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    match &cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Schema => print_schema(),
    }
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn print_schema() -> Result<(), CliError> {
    let schema = serde_json::to_string_pretty(&activity_json_schema())?;
    println!("{schema}");
    Ok(())
}

fn run_serve(args: &ServeArgs) -> Result<(), CliError> {
    let mut config = HostConfig::from_env();
    if let Some(max_sessions) = args.max_sessions.filter(|max| *max > 0) {
        config.max_sessions = max_sessions;
    }

    let host = Arc::new(host_binding(args));
    let transcripts = Arc::new(TranscriptRenderer::new());
    let deps = SessionDeps {
        token_cache: Arc::new(TokenCache::new(
            Arc::new(StaticTokenIdentityFactory::new(args.token.clone())),
            config.authority_base.clone(),
            config.scopes.clone(),
        )),
        connections: Arc::new(HttpConnectionFactory::new(args.agent_endpoint.clone())),
        renderer: transcripts.clone(),
        host: host.clone(),
        style: config.style.clone(),
    };
    let cors = build_cors_layer(args)?;
    let addr = format!("{}:{}", args.host, args.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let control = Arc::new(CopilotHostControl::init(&config, deps).await?);
        let router = build_router(AppState {
            control: control.clone(),
            host,
            transcripts,
        })
        .layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, endpoint = %args.agent_endpoint, "bridge: listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                control.dispose();
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn host_binding(args: &ServeArgs) -> InMemoryHostBinding {
    let host = InMemoryHostBinding::new();
    let fields = [
        (HostField::AppClientId, &args.app_client_id),
        (HostField::TenantId, &args.tenant_id),
        (HostField::EnvironmentId, &args.environment_id),
        (HostField::AgentIdentifier, &args.agent_id),
    ];
    for (field, value) in fields {
        if let Some(value) = value {
            host.set_field(field, value);
        }
    }
    host.set_flag(HostFlag::SendContext, args.send_context);
    host.set_flag(HostFlag::ShowToolCalls, args.show_tool_calls);
    host.set_flag(HostFlag::ShowThoughts, args.show_thoughts);
    host.set_flag(HostFlag::KeepConnectionAlive, args.keep_connection_alive);
    host
}

/// Origins default to none, methods and headers to any.
fn build_cors_layer(args: &ServeArgs) -> Result<CorsLayer, CliError> {
    let origins: Vec<HeaderValue> =
        parse_all(&args.cors_allow_origin, CliError::InvalidCorsOrigin)?;
    let methods: Vec<Method> = parse_all(&args.cors_allow_method, CliError::InvalidCorsMethod)?;
    let headers: Vec<HeaderName> =
        parse_all(&args.cors_allow_header, CliError::InvalidCorsHeader)?;

    let cors = if origins.is_empty() {
        CorsLayer::new().allow_origin(AllowOrigin::predicate(|_, _| false))
    } else {
        CorsLayer::new().allow_origin(origins)
    };
    let cors = if methods.is_empty() {
        cors.allow_methods(Any)
    } else {
        cors.allow_methods(methods)
    };
    let cors = if headers.is_empty() {
        cors.allow_headers(Any)
    } else {
        cors.allow_headers(headers)
    };
    Ok(cors)
}

fn parse_all<T: FromStr>(
    values: &[String],
    invalid: fn(String) -> CliError,
) -> Result<Vec<T>, CliError> {
    values
        .iter()
        .map(|value| value.parse().map_err(|_| invalid(value.clone())))
        .collect()
}
