use std::time::Duration;

use crate::readiness::ReadinessPolicy;
use crate::render::StyleOptions;

pub const DEFAULT_MAX_SESSIONS: usize = 5;
pub const DEFAULT_TOKEN_SCOPE: &str = "https://api.powerplatform.com/.default";
pub const DEFAULT_AUTHORITY_BASE: &str = "https://login.microsoftonline.com/";

const MAX_SESSIONS_ENV: &str = "COPILOT_HOST_MAX_SESSIONS";
const READINESS_ATTEMPTS_ENV: &str = "COPILOT_HOST_READINESS_ATTEMPTS";
const READINESS_INTERVAL_ENV: &str = "COPILOT_HOST_READINESS_INTERVAL_MS";
const TOKEN_SCOPE_ENV: &str = "COPILOT_HOST_TOKEN_SCOPE";

#[derive(Debug, Clone, PartialEq)]
pub struct HostConfig {
    pub max_sessions: usize,
    pub readiness: ReadinessPolicy,
    pub scopes: Vec<String>,
    /// Tenant id is appended to form the authority.
    pub authority_base: String,
    pub style: StyleOptions,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            readiness: ReadinessPolicy::default(),
            scopes: vec![DEFAULT_TOKEN_SCOPE.to_string()],
            authority_base: DEFAULT_AUTHORITY_BASE.to_string(),
            style: StyleOptions::default(),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlays the `COPILOT_HOST_*` variables on the defaults. Unparsable or
    /// zero values are ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let positive = |key: &str| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .filter(|value| *value > 0)
        };

        if let Some(max) = positive(MAX_SESSIONS_ENV) {
            config.max_sessions = max as usize;
        }
        if let Some(attempts) = positive(READINESS_ATTEMPTS_ENV) {
            config.readiness.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        if let Some(interval) = positive(READINESS_INTERVAL_ENV) {
            config.readiness.interval = Duration::from_millis(interval);
        }
        if let Some(scope) = lookup(TOKEN_SCOPE_ENV).filter(|scope| !scope.trim().is_empty()) {
            config.scopes = vec![scope.trim().to_string()];
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_the_hosted_control() {
        let config = HostConfig::default();
        assert_eq!(config.max_sessions, 5);
        assert_eq!(config.readiness.max_attempts, 60);
        assert_eq!(config.scopes, vec![DEFAULT_TOKEN_SCOPE.to_string()]);
    }

    #[test]
    fn env_overrides_apply() {
        let config = HostConfig::from_lookup(lookup(&[
            (MAX_SESSIONS_ENV, "8"),
            (READINESS_INTERVAL_ENV, "50"),
            (TOKEN_SCOPE_ENV, " api://custom/.default "),
        ]));
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.readiness.interval, Duration::from_millis(50));
        assert_eq!(config.scopes, vec!["api://custom/.default".to_string()]);
    }

    #[test]
    fn zero_and_garbage_fall_back() {
        let config = HostConfig::from_lookup(lookup(&[
            (MAX_SESSIONS_ENV, "0"),
            (READINESS_ATTEMPTS_ENV, "many"),
        ]));
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(config.readiness.max_attempts, 60);
    }
}
