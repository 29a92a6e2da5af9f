use derive_more::FromStr;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr, path::PathBuf, str::FromStr as _, time::Duration};
use thiserror::Error;
use url::Url;

/// Environment variables override file values under this prefix, e.g.
/// `MAIL_PORT=8080` or `MAIL_DMARC_ENFORCEMENT=strict`.
const ENV_PREFIX: &str = "MAIL_";

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {key}: {value}")]
    EnvOverride { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromStr, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Simple,
    /// Reserved: parsed and accepted, but currently runs the same HTTP
    /// listener as `simple`.
    Socket,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, FromStr, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmarcEnforcement {
    Strict,
    #[default]
    Normal,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(skip)]
    pub cert_path: Option<PathBuf>,
    #[garde(skip)]
    pub key_path: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enabled: false,
            cert_path: None,
            key_path: None,
        }
    }
}

/// STARTTLS broker, only relevant when this process (not Postfix)
/// terminates port-25 traffic.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SmtpBrokerConfig {
    #[garde(skip)]
    pub enabled: bool,
    #[garde(skip)]
    pub listen_addr: SocketAddr,
    #[garde(skip)]
    pub upstream_addr: Option<SocketAddr>,
    #[garde(skip)]
    pub require_tls: bool,
    #[garde(range(min = 1, max = 60))]
    pub handshake_timeout_secs: u64,
}

impl Default for SmtpBrokerConfig {
    fn default() -> Self {
        SmtpBrokerConfig {
            enabled: false,
            listen_addr: "0.0.0.0:2525".parse().expect("valid default addr"),
            upstream_addr: None,
            require_tls: true,
            handshake_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ControlConfig {
    #[garde(range(min = 1))]
    pub max_per_ip: usize,
    #[garde(range(min = 1))]
    pub max_total: usize,
    #[garde(range(min = 1))]
    pub ban_threshold: u32,
    #[garde(range(min = 1))]
    pub ban_duration_secs: u64,
    /// Global throttle: tokens per second plus burst capacity.
    #[garde(skip)]
    pub global_rate: f64,
    #[garde(range(min = 1))]
    pub global_burst: u32,
    /// Per-IP throttle, buckets created lazily.
    #[garde(skip)]
    pub per_ip_rate: f64,
    #[garde(range(min = 1))]
    pub per_ip_burst: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            max_per_ip: 10,
            max_total: 100,
            ban_threshold: 5,
            ban_duration_secs: 3600,
            global_rate: 100.0,
            global_burst: 200,
            per_ip_rate: 10.0,
            per_ip_burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[garde(range(min = 1))]
    pub port: u16,
    #[garde(range(min = 1))]
    pub metrics_port: u16,
    #[garde(length(min = 1), pattern(r"^/"))]
    pub metrics_path: String,
    #[garde(skip)]
    pub mode: Mode,
    #[garde(skip)]
    pub data_dir: PathBuf,
    #[garde(length(min = 16))]
    pub bearer_token: String,
    #[garde(pattern(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)+$"))]
    pub primary_domain: String,
    #[garde(pattern(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)+$"))]
    pub mail_hostname: String,
    /// Optional downstream webhook, notified best-effort after persist.
    #[garde(custom(http_url))]
    pub api_endpoint: Option<Url>,
    #[garde(range(max = 10_000))]
    pub rate_limit_per_minute: u32,
    #[garde(range(min = 1))]
    pub rate_limit_burst: u32,
    #[garde(range(min = 1))]
    pub max_message_size: usize,
    #[garde(range(min = 1))]
    pub read_timeout: u64,
    #[garde(range(min = 1))]
    pub write_timeout: u64,
    #[garde(range(min = 1))]
    pub idle_timeout: u64,
    #[garde(range(min = 1))]
    pub handler_timeout: u64,
    #[garde(range(min = 1))]
    pub max_connections: usize,
    #[garde(skip)]
    pub max_idle_conns: usize,
    #[garde(skip)]
    pub spf_enabled: bool,
    #[garde(skip)]
    pub dkim_enabled: bool,
    #[garde(skip)]
    pub dmarc_enabled: bool,
    #[garde(skip)]
    pub dmarc_enforcement: DmarcEnforcement,
    #[garde(length(min = 1))]
    pub dkim_selector: String,
    #[garde(skip)]
    pub dkim_private_key_path: Option<PathBuf>,
    #[garde(skip)]
    pub dns_servers: Vec<SocketAddr>,
    #[garde(dive)]
    pub tls: TlsConfig,
    #[garde(dive)]
    pub smtp: SmtpBrokerConfig,
    #[garde(dive)]
    pub control: ControlConfig,
}

fn http_url(value: &Option<Url>, _ctx: &()) -> garde::Result {
    match value {
        Some(url) if url.scheme() != "http" && url.scheme() != "https" => Err(
            garde::Error::new(format!("unsupported scheme `{}`", url.scheme())),
        ),
        _ => Ok(()),
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 3000,
            metrics_port: 9090,
            metrics_path: "/metrics".to_string(),
            mode: Mode::Simple,
            data_dir: PathBuf::from("/var/lib/mailgate"),
            bearer_token: String::new(),
            primary_domain: "example.com".to_string(),
            mail_hostname: "mail.example.com".to_string(),
            api_endpoint: None,
            rate_limit_per_minute: 60,
            rate_limit_burst: 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_timeout: 30,
            write_timeout: 30,
            idle_timeout: 120,
            handler_timeout: 25,
            max_connections: 1000,
            max_idle_conns: 100,
            spf_enabled: true,
            dkim_enabled: true,
            dmarc_enabled: true,
            dmarc_enforcement: DmarcEnforcement::Normal,
            dkim_selector: "default".to_string(),
            dkim_private_key_path: None,
            dns_servers: Vec::new(),
            tls: TlsConfig::default(),
            smtp: SmtpBrokerConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&std::path::Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_yaml::from_str(&raw)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.check()?;
        Ok(config)
    }

    /// Schema validation plus the cross-field rules garde cannot express.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;

        if self.handler_timeout >= self.read_timeout {
            return Err(ConfigError::Invalid(format!(
                "handler_timeout ({}) must be shorter than read_timeout ({})",
                self.handler_timeout, self.read_timeout
            )));
        }
        if !self.data_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "data_dir must be absolute, got {}",
                self.data_dir.display()
            )));
        }
        for system in ["/bin", "/boot", "/etc", "/proc", "/sys", "/usr"] {
            if self.data_dir.starts_with(system) {
                return Err(ConfigError::Invalid(format!(
                    "data_dir must not live under {system}"
                )));
            }
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(ConfigError::Invalid(
                "tls.enabled requires tls.cert_path and tls.key_path".to_string(),
            ));
        }
        if self.smtp.enabled && self.smtp.upstream_addr.is_none() {
            return Err(ConfigError::Invalid(
                "smtp.enabled requires smtp.upstream_addr".to_string(),
            ));
        }
        if self.smtp.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(ConfigError::Invalid(
                "smtp.enabled requires tls.cert_path and tls.key_path for STARTTLS".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn set<T>(field: &mut T, key: &str) -> Result<(), ConfigError>
        where
            T: std::str::FromStr,
        {
            let key = format!("{ENV_PREFIX}{key}");
            match env::var(&key) {
                Ok(value) => {
                    *field = value
                        .parse()
                        .map_err(|_| ConfigError::EnvOverride { key, value })?;
                    Ok(())
                }
                Err(_) => Ok(()),
            }
        }

        set(&mut self.port, "PORT")?;
        set(&mut self.metrics_port, "METRICS_PORT")?;
        set(&mut self.metrics_path, "METRICS_PATH")?;
        set(&mut self.mode, "MODE")?;
        set(&mut self.bearer_token, "BEARER_TOKEN")?;
        set(&mut self.primary_domain, "PRIMARY_DOMAIN")?;
        set(&mut self.mail_hostname, "MAIL_HOSTNAME")?;
        set(&mut self.rate_limit_per_minute, "RATE_LIMIT_PER_MINUTE")?;
        set(&mut self.rate_limit_burst, "RATE_LIMIT_BURST")?;
        set(&mut self.max_message_size, "MAX_MESSAGE_SIZE")?;
        set(&mut self.read_timeout, "READ_TIMEOUT")?;
        set(&mut self.write_timeout, "WRITE_TIMEOUT")?;
        set(&mut self.idle_timeout, "IDLE_TIMEOUT")?;
        set(&mut self.handler_timeout, "HANDLER_TIMEOUT")?;
        set(&mut self.max_connections, "MAX_CONNECTIONS")?;
        set(&mut self.max_idle_conns, "MAX_IDLE_CONNS")?;
        set(&mut self.spf_enabled, "SPF_ENABLED")?;
        set(&mut self.dkim_enabled, "DKIM_ENABLED")?;
        set(&mut self.dmarc_enabled, "DMARC_ENABLED")?;
        set(&mut self.dmarc_enforcement, "DMARC_ENFORCEMENT")?;
        set(&mut self.dkim_selector, "DKIM_SELECTOR")?;

        if let Ok(value) = env::var(format!("{ENV_PREFIX}DATA_DIR")) {
            self.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = env::var(format!("{ENV_PREFIX}DKIM_PRIVATE_KEY_PATH")) {
            self.dkim_private_key_path = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var(format!("{ENV_PREFIX}API_ENDPOINT")) {
            let url = Url::from_str(&value).map_err(|_| ConfigError::EnvOverride {
                key: format!("{ENV_PREFIX}API_ENDPOINT"),
                value,
            })?;
            self.api_endpoint = Some(url);
        }
        Ok(())
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid() -> Config {
        Config {
            bearer_token: "0123456789abcdef".to_string(),
            data_dir: PathBuf::from("/var/lib/mailgate"),
            ..Config::default()
        }
    }

    #[test]
    fn default_config_needs_a_bearer_token() {
        let err = Config::default().check().unwrap_err();
        assert!(err.to_string().contains("bearer_token"));
    }

    #[test]
    fn valid_config_passes() {
        valid().check().unwrap();
    }

    #[test]
    fn handler_timeout_must_undercut_read_timeout() {
        let config = Config {
            handler_timeout: 30,
            read_timeout: 30,
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn system_data_dir_is_rejected() {
        let config = Config {
            data_dir: PathBuf::from("/etc/mailgate"),
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn rate_limit_range_is_enforced() {
        let config = Config {
            rate_limit_per_minute: 10_001,
            ..valid()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn yaml_round_trip_preserves_non_defaults() {
        let config = Config {
            port: 8080,
            dmarc_enforcement: DmarcEnforcement::Strict,
            rate_limit_per_minute: 120,
            ..valid()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let reloaded: Config = serde_yaml::from_str(&yaml).unwrap();
        reloaded.check().unwrap();
        assert_eq!(reloaded.port, 8080);
        assert_eq!(reloaded.dmarc_enforcement, DmarcEnforcement::Strict);
        assert_eq!(reloaded.rate_limit_per_minute, 120);
    }

    #[test]
    fn mode_parses_from_env_style_strings() {
        assert_eq!("simple".parse::<Mode>().unwrap(), Mode::Simple);
        assert_eq!("socket".parse::<Mode>().unwrap(), Mode::Socket);
        assert_eq!(
            "strict".parse::<DmarcEnforcement>().unwrap(),
            DmarcEnforcement::Strict
        );
    }

    #[test]
    fn api_endpoint_scheme_is_checked() {
        let config = Config {
            api_endpoint: Some(Url::from_str("ftp://example.com/hook").unwrap()),
            ..valid()
        };
        assert!(config.check().is_err());
    }
}
