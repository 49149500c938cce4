//! # Hub Server Configuration
//!
//! Settings are layered, lowest priority first:
//!
//! 1. built-in defaults,
//! 2. a JSON file (`--config-path`, else `server_hub.conf` in the working
//!    directory or the user config directory), camelCase keys,
//! 3. environment variables and command-line flags (parsed by `clap`).
//!
//! Every layer is a [`ServerConfig`] with optional fields. Higher layers
//! override lower ones field by field, and the merged result is validated
//! into a [`Settings`].

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::{HubConfig, Overflow, QueueBound, DEFAULT_OUTBOX_CAPACITY};
use crate::protocol::PRESENCE_LABEL;

const DEFAULT_CONFIG_FILE: &str = "server_hub.conf";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`ServerConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// One configuration layer. Also the command-line interface.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Realtime chat broadcast hub", version)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    #[clap(long, env = "HUB_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "HUB_BIND_ADDRESS", help = "Address to bind the listener to.")]
    pub bind_address: Option<IpAddr>,

    #[clap(long, env = "HUB_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[clap(
        long,
        env = "HUB_ALLOWED_ORIGINS",
        value_delimiter = ',',
        help = "Comma-separated list of origins allowed by CORS. Use * to mirror any origin."
    )]
    pub allowed_origins: Option<Vec<String>>,

    #[clap(long, env = "HUB_QUEUE_CAPACITY", help = "Bound the broadcast queue to this many messages. Unbounded if unset.")]
    pub queue_capacity: Option<usize>,

    #[clap(long, env = "HUB_QUEUE_OVERFLOW", value_enum, help = "What a bounded broadcast queue does when full.")]
    pub queue_overflow: Option<Overflow>,

    #[clap(long, env = "HUB_OUTBOX_CAPACITY", help = "Frames a client may lag behind before it is disconnected.")]
    pub outbox_capacity: Option<usize>,

    #[clap(long, env = "HUB_PRESENCE_LABEL", help = "Label carried by presence messages.")]
    pub presence_label: Option<String>,

    #[clap(long, env = "HUB_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "HUB_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error). RUST_LOG takes precedence.")]
    pub log_level: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,

    #[clap(long, env = "HUB_SHUTDOWN_GRACE_SECS", help = "Seconds to let in-flight requests finish on shutdown.")]
    pub shutdown_grace_secs: Option<u64>,
}

impl ServerConfig {
    /// The built-in defaults layer.
    pub fn defaults() -> Self {
        ServerConfig {
            port: Some(8080),
            bind_address: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            allowed_origins: Some(vec![
                "http://localhost:5500".to_string(),
                "http://127.0.0.1:5500".to_string(),
            ]),
            queue_overflow: Some(Overflow::Block),
            outbox_capacity: Some(DEFAULT_OUTBOX_CAPACITY),
            presence_label: Some(PRESENCE_LABEL.to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            shutdown_grace_secs: Some(10),
            ..Default::default()
        }
    }

    /// Reads one layer from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merges two layers; `other` overrides `self` wherever it has a value.
    pub fn merge(self, other: ServerConfig) -> ServerConfig {
        ServerConfig {
            port: other.port.or(self.port),
            bind_address: other.bind_address.or(self.bind_address),
            config_path: other.config_path.or(self.config_path),
            allowed_origins: other.allowed_origins.or(self.allowed_origins),
            queue_capacity: other.queue_capacity.or(self.queue_capacity),
            queue_overflow: other.queue_overflow.or(self.queue_overflow),
            outbox_capacity: other.outbox_capacity.or(self.outbox_capacity),
            presence_label: other.presence_label.or(self.presence_label),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
            shutdown_grace_secs: other.shutdown_grace_secs.or(self.shutdown_grace_secs),
        }
    }

    /// Validates the merged layers into concrete settings.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let queue = match self.queue_capacity {
            None => QueueBound::Unbounded,
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: "queueCapacity",
                    reason: "must be greater than zero".to_string(),
                })
            }
            Some(capacity) => QueueBound::Bounded {
                capacity,
                overflow: self.queue_overflow.unwrap_or_default(),
            },
        };

        let outbox_capacity = self.outbox_capacity.unwrap_or(DEFAULT_OUTBOX_CAPACITY);
        if outbox_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "outboxCapacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        let tls = match (self.tls_cert_path, self.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid {
                    key: "tlsCertPath/tlsKeyPath",
                    reason: "both or neither must be set".to_string(),
                })
            }
        };

        let bind_address = self.bind_address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Ok(Settings {
            addr: SocketAddr::new(bind_address, self.port.unwrap_or(8080)),
            allowed_origins: self.allowed_origins.unwrap_or_default(),
            hub: HubConfig {
                queue,
                outbox_capacity,
                presence_label: self
                    .presence_label
                    .unwrap_or_else(|| PRESENCE_LABEL.to_string()),
            },
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            tls,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs.unwrap_or(10)),
        })
    }
}

/// Certificate and key for serving TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

/// Fully resolved configuration for the hub server.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Listening address.
    pub addr: SocketAddr,
    /// Origins allowed by the CORS layer.
    pub allowed_origins: Vec<String>,
    /// Hub tunables.
    pub hub: HubConfig,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Serve TLS when set.
    pub tls: Option<TlsPaths>,
    /// How long in-flight requests get on shutdown.
    pub shutdown_grace: Duration,
}

/// `server_hub.conf` in the working directory, else the same name under the
/// user's config directory (`~/.config/server_hub/` on Linux).
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("server_hub").join(DEFAULT_CONFIG_FILE))
        .filter(|path| path.exists())
        .unwrap_or(local)
}

/// Builds settings from defaults, the config file and the already-parsed
/// command line (`cli`, which includes environment variables).
///
/// An unreadable or malformed file is logged and skipped; invalid values
/// are an error.
pub fn load_config(cli: ServerConfig) -> Result<Settings, ConfigError> {
    let config_file_path = cli.config_path.clone().unwrap_or_else(default_config_path);

    let mut current = ServerConfig::defaults();

    if config_file_path.exists() {
        match ServerConfig::from_file(&config_file_path) {
            Ok(file_config) => current = current.merge(file_config),
            Err(e) => warn!(error = %e, "Falling back to other configuration sources."),
        }
    } else {
        info!(
            path = %config_file_path.display(),
            "Config file not found. Using defaults and environment/CLI variables."
        );
    }

    current.merge(cli).resolve()
}
