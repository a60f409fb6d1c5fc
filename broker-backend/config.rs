use std::path::PathBuf;
use std::time::Duration;

use crate::broker::poller::PollPolicy;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub data_dir: PathBuf,
    /// Instance copied when a provision request does not name one.
    pub source_instance_id: Option<String>,
    pub copy_provider: CopyProviderConfig,
    pub broker_auth: Option<BasicAuth>,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CopyProviderConfig {
    Remote {
        base_url: String,
        api_key: Option<String>,
    },
    Simulated {
        ready_after_checks: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a Config from a variable lookup (as it would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = get("PORT").and_then(|v| v.parse().ok()).unwrap_or(8081);

        let sentry_dsn = get("SENTRY_DSN");

        let environment = get("ENVIRONMENT").unwrap_or_else(|| "local".to_string());

        let data_dir = get("CDM_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cdm")
        });

        let copy_provider = match get("COPY_PROVIDER_URL") {
            Some(base_url) => CopyProviderConfig::Remote {
                base_url,
                api_key: get("COPY_PROVIDER_API_KEY"),
            },
            None => CopyProviderConfig::Simulated {
                ready_after_checks: get("SIM_READY_AFTER_CHECKS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(2),
            },
        };

        let broker_auth = match (get("SECURITY_USER_NAME"), get("SECURITY_USER_PASSWORD")) {
            (Some(username), Some(password)) => Some(BasicAuth { username, password }),
            _ => None,
        };

        let defaults = PollPolicy::default();
        let poll = PollPolicy {
            interval: get("POLL_INTERVAL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            max_attempts: get("POLL_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            multiplier: get("POLL_BACKOFF_MULTIPLIER")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|m| m.is_finite() && *m >= 1.0)
                .unwrap_or(defaults.multiplier),
            max_interval: get("POLL_MAX_INTERVAL_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_interval),
        };

        Config {
            port,
            sentry_dsn,
            environment,
            data_dir,
            source_instance_id: get("SOURCE_INSTANCE_ID"),
            copy_provider,
            broker_auth,
            poll,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_config_invalid_port_uses_default() {
        let config = config(&[("PORT", "not-a-number")]);
        assert_eq!(config.port, 8081);
    }

    #[test]
    fn test_config_valid_port() {
        let config = config(&[("PORT", "3000")]);
        assert_eq!(config.port, 3000);
    }

    #[test]
    fn test_config_empty_sentry_dsn_is_none() {
        let config = config(&[("SENTRY_DSN", "")]);
        assert!(config.sentry_dsn.is_none());
    }

    #[test]
    fn test_config_default_environment() {
        let config = config(&[]);
        assert_eq!(config.environment, "local");
    }

    #[test]
    fn test_config_data_dir_override() {
        let config = config(&[("CDM_DATA_DIR", "/var/lib/cdm")]);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/cdm"));
    }

    #[test]
    fn test_config_simulated_provider_without_url() {
        let config = config(&[("SIM_READY_AFTER_CHECKS", "5")]);
        assert_eq!(
            config.copy_provider,
            CopyProviderConfig::Simulated {
                ready_after_checks: 5
            }
        );
    }

    #[test]
    fn test_config_remote_provider() {
        let config = config(&[
            ("COPY_PROVIDER_URL", "http://copies.internal:9000"),
            ("COPY_PROVIDER_API_KEY", "k-1"),
        ]);
        assert_eq!(
            config.copy_provider,
            CopyProviderConfig::Remote {
                base_url: "http://copies.internal:9000".into(),
                api_key: Some("k-1".into()),
            }
        );
    }

    #[test]
    fn test_config_auth_requires_both_values() {
        assert!(config(&[("SECURITY_USER_NAME", "admin")]).broker_auth.is_none());
        let config = config(&[
            ("SECURITY_USER_NAME", "admin"),
            ("SECURITY_USER_PASSWORD", "secret"),
        ]);
        assert_eq!(
            config.broker_auth,
            Some(BasicAuth {
                username: "admin".into(),
                password: "secret".into(),
            })
        );
    }

    #[test]
    fn test_config_poll_policy() {
        let config = config(&[
            ("POLL_INTERVAL_SECS", "5"),
            ("POLL_MAX_ATTEMPTS", "10"),
            ("POLL_BACKOFF_MULTIPLIER", "1.5"),
            ("POLL_MAX_INTERVAL_SECS", "30"),
        ]);
        assert_eq!(config.poll.interval, Duration::from_secs(5));
        assert_eq!(config.poll.max_attempts, 10);
        assert_eq!(config.poll.multiplier, 1.5);
        assert_eq!(config.poll.max_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_rejects_nonsense_poll_values() {
        let config = config(&[("POLL_MAX_ATTEMPTS", "0"), ("POLL_BACKOFF_MULTIPLIER", "0.5")]);
        assert_eq!(config.poll, PollPolicy::default());
    }
}
