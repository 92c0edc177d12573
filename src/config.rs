//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Outbound dispatcher retry policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of send attempts (including the first one).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the backoff delay (before jitter).
    pub max_delay: Duration,
    /// Per-attempt timeout; an attempt exceeding it is a transient failure.
    pub send_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// HTTP messaging transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub auth_token: SecretString,
    /// Sender number or alphanumeric id, if the provider needs one.
    pub from: Option<String>,
}

/// External result sink (admin API) settings.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub url: String,
    pub auth_token: Option<SecretString>,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP port for the inbound webhook.
    pub port: u16,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Optional operator-supplied instrument catalogue (JSON).
    pub instruments_path: Option<PathBuf>,
    /// How long a seen message id stays in the gateway dedupe cache.
    pub dedupe_ttl: Duration,
    /// Maximum number of entries in the dedupe cache.
    pub dedupe_capacity: usize,
    pub dispatch: DispatchConfig,
    /// None = replies are printed to stderr.
    pub transport: Option<TransportConfig>,
    /// None = results stay in the local results table.
    pub sink: Option<SinkConfig>,
    /// Interval of the background result handoff retry.
    pub handoff_interval: Duration,
    /// Failed handoff attempts before every retry logs at error level.
    pub handoff_escalate_after: u32,
    /// Sessions untouched for this long are re-armed to idle. None = never.
    pub session_idle_timeout: Option<Duration>,
    /// Optional directory for daily rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/sms-screener.db"),
            instruments_path: None,
            dedupe_ttl: Duration::from_secs(86_400), // 24 hours
            dedupe_capacity: 100_000,
            dispatch: DispatchConfig::default(),
            transport: None,
            sink: None,
            handoff_interval: Duration::from_secs(30),
            handoff_escalate_after: 5,
            session_idle_timeout: None,
            log_dir: None,
        }
    }
}

impl ServiceConfig {
    /// Build the configuration from `SCREENER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let transport = match get("SCREENER_TRANSPORT_URL") {
            Some(url) => {
                let token = get("SCREENER_TRANSPORT_TOKEN").ok_or_else(|| {
                    ConfigError::MissingRequired {
                        key: "SCREENER_TRANSPORT_TOKEN".into(),
                        hint: "Set it to the messaging provider API token.".into(),
                    }
                })?;
                Some(TransportConfig {
                    url,
                    auth_token: SecretString::from(token),
                    from: get("SCREENER_TRANSPORT_FROM"),
                })
            }
            None => None,
        };

        let sink = get("SCREENER_SINK_URL").map(|url| SinkConfig {
            url,
            auth_token: get("SCREENER_SINK_TOKEN").map(SecretString::from),
        });

        let dispatch = DispatchConfig {
            max_attempts: parse_or("SCREENER_SEND_ATTEMPTS", get("SCREENER_SEND_ATTEMPTS"), defaults.dispatch.max_attempts)?,
            base_delay: parse_or("SCREENER_SEND_BASE_DELAY_MS", get("SCREENER_SEND_BASE_DELAY_MS"), None)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch.base_delay),
            max_delay: parse_or("SCREENER_SEND_MAX_DELAY_MS", get("SCREENER_SEND_MAX_DELAY_MS"), None)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch.max_delay),
            send_timeout: parse_or("SCREENER_SEND_TIMEOUT_SECS", get("SCREENER_SEND_TIMEOUT_SECS"), None)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.dispatch.send_timeout),
        };
        if dispatch.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SCREENER_SEND_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            port: parse_or("SCREENER_PORT", get("SCREENER_PORT"), defaults.port)?,
            db_path: get("SCREENER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            instruments_path: get("SCREENER_INSTRUMENTS").map(PathBuf::from),
            dedupe_ttl: parse_or("SCREENER_DEDUPE_TTL_SECS", get("SCREENER_DEDUPE_TTL_SECS"), None)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedupe_ttl),
            dedupe_capacity: parse_or(
                "SCREENER_DEDUPE_CAPACITY",
                get("SCREENER_DEDUPE_CAPACITY"),
                defaults.dedupe_capacity,
            )?,
            dispatch,
            transport,
            sink,
            handoff_interval: parse_or(
                "SCREENER_HANDOFF_INTERVAL_SECS",
                get("SCREENER_HANDOFF_INTERVAL_SECS"),
                None,
            )?
            .map(Duration::from_secs)
            .unwrap_or(defaults.handoff_interval),
            handoff_escalate_after: parse_or(
                "SCREENER_HANDOFF_ESCALATE_AFTER",
                get("SCREENER_HANDOFF_ESCALATE_AFTER"),
                defaults.handoff_escalate_after,
            )?,
            session_idle_timeout: parse_or(
                "SCREENER_SESSION_IDLE_SECS",
                get("SCREENER_SESSION_IDLE_SECS"),
                None,
            )?
            .map(Duration::from_secs),
            log_dir: get("SCREENER_LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Parse `value` if present, otherwise fall back to `default`.
///
/// `T` may itself be an `Option<_>` target via the blanket impl below, so
/// "absent" and "present but unparseable" stay distinguishable.
fn parse_or<T: ParseValue>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(raw) => T::parse_value(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse {raw:?}"),
        }),
        None => Ok(default),
    }
}

trait ParseValue: Sized {
    fn parse_value(raw: &str) -> Option<Self>;
}

macro_rules! parse_value_from_str {
    ($($t:ty),*) => {
        $(impl ParseValue for $t {
            fn parse_value(raw: &str) -> Option<Self> {
                <$t as FromStr>::from_str(raw).ok()
            }
        })*
    };
}

parse_value_from_str!(u16, u32, u64, usize);

impl<T: ParseValue> ParseValue for Option<T> {
    fn parse_value(raw: &str) -> Option<Self> {
        T::parse_value(raw).map(Some)
    }
}
