use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::access::Precedence;
use common::crypto::PublicKey;
use common::query::DispatcherConfig;

/// A signing authority the pod trusts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Issuer name credentials carry
    pub name: String,
    /// Hex public key of the authority. Unset means no credential from this
    ///  issuer is trusted, except for the pod authority which defaults to
    ///  the owner's own key.
    #[serde(default)]
    pub key: Option<String>,
}

impl AuthorityConfig {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key: None,
        }
    }

    pub fn public_key(&self) -> Result<Option<PublicKey>, ConfigError> {
        self.key
            .as_deref()
            .map(|hex| {
                PublicKey::from_hex(hex)
                    .map_err(|e| ConfigError::InvalidKey(self.name.clone(), e.to_string()))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Authorities {
    pub pod: AuthorityConfig,
    pub service: AuthorityConfig,
    pub network: AuthorityConfig,
}

impl Default for Authorities {
    fn default() -> Self {
        Self {
            pod: AuthorityConfig::named("pod"),
            service: AuthorityConfig::named("service"),
            network: AuthorityConfig::named("network"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // peer configuration
    /// address for our pod to listen on,
    ///  if not set then an ephemeral port will be used
    pub peer_listen_addr: Option<SocketAddr>,
    /// on system file path to our secret key (PEM),
    ///  if not set then a new secret will be generated
    pub key_path: Option<PathBuf>,
    /// path to this pod's network membership credential (JSON),
    ///  presented to other pods with every request
    pub credential_path: Option<PathBuf>,

    // data store configuration
    /// a path to a sqlite database, if not set then an
    ///  in-memory database will be used
    pub sqlite_path: Option<PathBuf>,

    // policy configuration
    /// service contracts (JSON) published at startup and on reload
    pub contract_paths: Vec<PathBuf>,
    pub precedence: Precedence,

    // query configuration
    /// budget for each request forwarded to another pod
    pub remote_timeout_ms: u64,
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// how far a signed request's timestamp may drift from our clock
    ///  before it is refused as stale
    pub request_window_secs: u64,
    /// how often expired entries are purged, zero disables purging
    pub purge_interval_secs: u64,

    // misc
    pub log_level: String,

    /// trusted signing authorities
    pub authorities: Authorities,
}

impl Default for Config {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            peer_listen_addr: None,
            key_path: None,
            credential_path: None,
            sqlite_path: None,
            contract_paths: Vec::new(),
            precedence: Precedence::default(),
            remote_timeout_ms: dispatcher.remote_timeout.as_millis() as u64,
            default_page_size: dispatcher.default_page_size,
            max_page_size: dispatcher.max_page_size,
            request_window_secs: dispatcher.request_window.as_secs(),
            purge_interval_secs: 60,
            log_level: "info".to_string(),
            authorities: Authorities::default(),
        }
    }
}

impl Config {
    /// Load a TOML config file over the defaults
    ///
    /// Keys missing from the file keep their default value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_toml = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&config_toml)?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn dispatcher(&self) -> Result<DispatcherConfig, ConfigError> {
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(ConfigError::InvalidPageSize {
                default: self.default_page_size,
                max: self.max_page_size,
            });
        }
        Ok(DispatcherConfig {
            remote_timeout: Duration::from_millis(self.remote_timeout_ms),
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
            request_window: Duration::from_secs(self.request_window_secs),
            ..DispatcherConfig::default()
        })
    }

    pub fn purge_interval(&self) -> Option<Duration> {
        (self.purge_interval_secs > 0).then(|| Duration::from_secs(self.purge_interval_secs))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("invalid key for authority {0}: {1}")]
    InvalidKey(String, String),
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),
    #[error("default page size {default} must be within 1..={max}")]
    InvalidPageSize { default: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use common::crypto::SecretKey;

    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let network_key = SecretKey::generate().public();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            sqlite_path = "/var/lib/podnet/pod.sqlite"
            precedence = "network_first"
            remote_timeout_ms = 1500
            request_window_secs = 30

            [authorities.network]
            name = "social-network"
            key = "{}"
            "#,
            network_key.to_hex()
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(
            config.sqlite_path,
            Some(PathBuf::from("/var/lib/podnet/pod.sqlite"))
        );
        assert_eq!(config.precedence, Precedence::NetworkFirst);
        assert_eq!(config.authorities.network.name, "social-network");
        assert_eq!(
            config.authorities.network.public_key().unwrap(),
            Some(network_key)
        );
        assert_eq!(config.authorities.pod, AuthorityConfig::named("pod"));
        assert_eq!(config.max_page_size, 100);

        let dispatcher = config.dispatcher().unwrap();
        assert_eq!(dispatcher.remote_timeout, Duration::from_millis(1500));
        assert_eq!(dispatcher.request_window, Duration::from_secs(30));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config {
            contract_paths: vec![PathBuf::from("contracts/social.json")],
            ..Config::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();
        assert_eq!(Config::load(file.path()).unwrap(), config);
    }

    #[test]
    fn test_invalid_values() {
        let config = Config {
            log_level: "loud".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.log_level(),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        let config = Config {
            default_page_size: 500,
            ..Config::default()
        };
        assert!(matches!(
            config.dispatcher(),
            Err(ConfigError::InvalidPageSize { .. })
        ));

        let mut authority = AuthorityConfig::named("network");
        authority.key = Some("zz".to_string());
        assert!(authority.public_key().is_err());
    }
}
