use std::time::Duration;

use copilot_host_error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        // Roughly one second of display frames.
        Self {
            max_attempts: 60,
            interval: Duration::from_millis(16),
        }
    }
}

/// Resolves once `probe` reports the collaborators present, checking at most
/// `max_attempts` times.
pub async fn wait_until_ready(
    mut probe: impl FnMut() -> bool,
    policy: ReadinessPolicy,
) -> Result<(), HostError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        if probe() {
            tracing::debug!(attempt, "readiness: dependencies available");
            return Ok(());
        }
        if attempt < attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }
    tracing::error!(attempts, "readiness: dependencies never became available");
    Err(HostError::DependenciesUnavailable { attempts })
}
