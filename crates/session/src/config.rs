//! Runtime configuration for sockets, login timing and credential layout.
//!
//! Every struct has constant defaults and an env override layer. The
//! `from_lookup` constructors take the variable source as a closure so parsing
//! can be exercised without touching the process environment.

use std::path::PathBuf;
use std::time::Duration;

use tracing::level_filters::LevelFilter;
use tracing::warn;

const ENV_CONNECT_TIMEOUT: &str = "WA_GATEWAY_CONNECT_TIMEOUT_MS";
const ENV_QUERY_TIMEOUT: &str = "WA_GATEWAY_QUERY_TIMEOUT_MS";
const ENV_QR_TIMEOUT: &str = "WA_GATEWAY_QR_TIMEOUT_MS";
const ENV_KEEPALIVE: &str = "WA_GATEWAY_KEEPALIVE_MS";
const ENV_RETRY_DELAY: &str = "WA_GATEWAY_RETRY_DELAY_MS";
const ENV_BROWSER_OS: &str = "WA_GATEWAY_BROWSER_OS";
const ENV_BROWSER_NAME: &str = "WA_GATEWAY_BROWSER_NAME";
const ENV_BROWSER_VERSION: &str = "WA_GATEWAY_BROWSER_VERSION";
const ENV_CREDENTIALS_DIR: &str = "WA_GATEWAY_CREDENTIALS_DIR";
const ENV_LEGACY_CREDENTIALS_DIR: &str = "WA_GATEWAY_LEGACY_CREDENTIALS_DIR";

/// Client identity the transport presents to the server ("linked device" label).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub os: String,
    pub browser: String,
    pub version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            os: "Mac OS".into(),
            browser: "Desktop".into(),
            version: "14.4.1".into(),
        }
    }
}

impl ClientIdentity {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Self {
        match lookup(ENV_BROWSER_OS).filter(|v| !v.trim().is_empty()) {
            Some(os) => Self {
                os,
                browser: lookup(ENV_BROWSER_NAME).unwrap_or_else(|| "Chrome".into()),
                version: lookup(ENV_BROWSER_VERSION).unwrap_or_else(|| "121.0.6167.85".into()),
            },
            None => Self::default(),
        }
    }
}

/// Options handed to the transport for every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub connect_timeout: Duration,
    pub default_query_timeout: Duration,
    pub qr_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub retry_request_delay: Duration,
    pub client: ClientIdentity,
    pub sync_full_history: bool,
    pub sync_history_messages: bool,
    pub mark_online_on_connect: bool,
    pub fire_init_queries: bool,
    pub emit_own_events: bool,
    pub high_quality_link_previews: bool,
    /// Verbosity of the transport's own logger. Set per connection.
    pub transport_log_level: LevelFilter,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(20_000),
            default_query_timeout: Duration::from_millis(60_000),
            qr_timeout: Duration::from_millis(60_000),
            keep_alive_interval: Duration::from_millis(15_000),
            retry_request_delay: Duration::from_millis(250),
            client: ClientIdentity::default(),
            sync_full_history: false,
            sync_history_messages: false,
            mark_online_on_connect: true,
            fire_init_queries: true,
            emit_own_events: false,
            high_quality_link_previews: false,
            transport_log_level: LevelFilter::OFF,
        }
    }
}

impl SocketConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout: millis_or(&lookup, ENV_CONNECT_TIMEOUT, defaults.connect_timeout),
            default_query_timeout: millis_or(
                &lookup,
                ENV_QUERY_TIMEOUT,
                defaults.default_query_timeout,
            ),
            qr_timeout: millis_or(&lookup, ENV_QR_TIMEOUT, defaults.qr_timeout),
            keep_alive_interval: millis_or(&lookup, ENV_KEEPALIVE, defaults.keep_alive_interval),
            retry_request_delay: millis_or(&lookup, ENV_RETRY_DELAY, defaults.retry_request_delay),
            client: ClientIdentity::from_lookup(&lookup),
            ..defaults
        }
    }
}

/// Timing constants of the interactive login flow.
///
/// Production code uses [`LoginTimings::default`]; the fields are public so
/// tests can run the same state machine on a compressed clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginTimings {
    /// How long `start_login` waits for the first QR code.
    pub qr_wait: Duration,
    /// Reported expiry window of an attempt (not enforced).
    pub attempt_ttl: Duration,
    /// Pause between tearing down a socket on restart-required and rebuilding it.
    pub restart_delay: Duration,
    /// Fallback tick for `wait_for_login`.
    pub poll_interval: Duration,
    /// `wait_for_login` timeout when the caller gives none.
    pub default_wait: Duration,
    /// Floor applied to caller-supplied wait timeouts.
    pub min_wait: Duration,
}

impl Default for LoginTimings {
    fn default() -> Self {
        Self {
            qr_wait: Duration::from_secs(60),
            attempt_ttl: Duration::from_secs(60),
            restart_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            default_wait: Duration::from_secs(180),
            min_wait: Duration::from_secs(1),
        }
    }
}

/// Top-level configuration for a session host process.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Parent directory of per-account credential directories.
    pub credentials_root: PathBuf,
    /// Pre-multi-account credential directory, used by the default account when set.
    pub legacy_credentials_dir: Option<PathBuf>,
    pub socket: SocketConfig,
    pub login: LoginTimings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_root: default_credentials_root(),
            legacy_credentials_dir: None,
            socket: SocketConfig::default(),
            login: LoginTimings::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let credentials_root = lookup(ENV_CREDENTIALS_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_credentials_root);
        let legacy_credentials_dir = lookup(ENV_LEGACY_CREDENTIALS_DIR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            credentials_root,
            legacy_credentials_dir,
            socket: SocketConfig::from_lookup(&lookup),
            login: LoginTimings::default(),
        }
    }
}

fn default_credentials_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".wa-gateway")
        .join("credentials")
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid duration override");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_socket_defaults() {
        let cfg = SocketConfig::from_lookup(|_| None);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(20));
        assert_eq!(cfg.default_query_timeout, Duration::from_secs(60));
        assert_eq!(cfg.qr_timeout, Duration::from_secs(60));
        assert_eq!(cfg.keep_alive_interval, Duration::from_secs(15));
        assert_eq!(cfg.retry_request_delay, Duration::from_millis(250));
        assert_eq!(cfg.client, ClientIdentity::default());
        assert!(!cfg.sync_full_history);
        assert!(!cfg.sync_history_messages);
        assert_eq!(cfg.transport_log_level, LevelFilter::OFF);
    }

    #[test]
    fn test_socket_overrides() {
        let cfg = SocketConfig::from_lookup(lookup_from(&[
            (ENV_CONNECT_TIMEOUT, "5000"),
            (ENV_KEEPALIVE, " 30000 "),
            (ENV_RETRY_DELAY, "not-a-number"),
        ]));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.keep_alive_interval, Duration::from_secs(30));
        // Invalid values fall back to the default
        assert_eq!(cfg.retry_request_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_client_identity_override_fills_browser_defaults() {
        let cfg = SocketConfig::from_lookup(lookup_from(&[(ENV_BROWSER_OS, "Linux")]));
        assert_eq!(
            cfg.client,
            ClientIdentity {
                os: "Linux".into(),
                browser: "Chrome".into(),
                version: "121.0.6167.85".into(),
            }
        );
    }

    #[test]
    fn test_session_config_dirs() {
        let cfg = SessionConfig::from_lookup(lookup_from(&[
            (ENV_CREDENTIALS_DIR, "/var/lib/wa/creds"),
            (ENV_LEGACY_CREDENTIALS_DIR, "/var/lib/wa/legacy"),
        ]));
        assert_eq!(cfg.credentials_root, PathBuf::from("/var/lib/wa/creds"));
        assert_eq!(cfg.legacy_credentials_dir, Some(PathBuf::from("/var/lib/wa/legacy")));
        assert_eq!(cfg.login, LoginTimings::default());
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var(ENV_QR_TIMEOUT, "45000");
        let cfg = SocketConfig::from_env();
        std::env::remove_var(ENV_QR_TIMEOUT);
        assert_eq!(cfg.qr_timeout, Duration::from_secs(45));
    }
}
