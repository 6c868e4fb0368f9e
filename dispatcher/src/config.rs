use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Largest object a single backend PUT may carry (5 GiB + 2 bytes).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024 + 2;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("merge_separator must be exactly one character, got {0:?}")]
    InvalidSeparator(String),

    #[error("client_chunk_size cannot be 0")]
    ZeroChunkSize,

    #[error("segment_size cannot be 0")]
    ZeroSegmentSize,

    #[error("segment_size ({segment_size}) exceeds max_file_size ({max_file_size})")]
    SegmentTooLarge { segment_size: u64, max_file_size: u64 },

    #[error("response_retry.attempts cannot be 0")]
    ZeroRetryAttempts,
}

/// Dispatcher configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Client-facing listener
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// Host name advertised in rewritten storage URLs. Defaults to the listener host.
    #[serde(default)]
    pub public_addr: Option<String>,
    /// Serve clients over https when set
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// CA bundle used to verify https backends
    #[serde(default)]
    pub backend_ca_file: Option<PathBuf>,
    /// Relay rule file mapping location prefixes to clusters
    pub relay_rule: PathBuf,
    #[serde(default = "default_min_reload_interval_ms")]
    pub min_reload_interval_ms: u64,
    /// Joins a container prefix and a container name in merged locations
    #[serde(default = "default_merge_separator")]
    pub merge_separator: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub response_retry: ResponseRetry,
    #[serde(default = "default_client_chunk_size")]
    pub client_chunk_size: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Objects at least this large are copied across clusters as segments.
    /// Defaults to `max_file_size`.
    #[serde(default)]
    pub segment_size: Option<u64>,
}

fn default_min_reload_interval_ms() -> u64 {
    1000
}

fn default_merge_separator() -> String {
    ":".to_string()
}

fn default_client_chunk_size() -> usize {
    65536
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.merge_separator.chars().count() != 1 {
            return Err(ValidationError::InvalidSeparator(
                self.merge_separator.clone(),
            ));
        }
        if self.client_chunk_size == 0 {
            return Err(ValidationError::ZeroChunkSize);
        }
        let segment_size = self.segment_size();
        if segment_size == 0 {
            return Err(ValidationError::ZeroSegmentSize);
        }
        if segment_size > self.max_file_size {
            return Err(ValidationError::SegmentTooLarge {
                segment_size,
                max_file_size: self.max_file_size,
            });
        }
        if self.response_retry.attempts == 0 {
            return Err(ValidationError::ZeroRetryAttempts);
        }
        Ok(())
    }

    /// The separator character. Only meaningful once `validate` passed.
    pub fn separator(&self) -> char {
        self.merge_separator.chars().next().unwrap_or(':')
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size.unwrap_or(self.max_file_size)
    }

    pub fn public_host(&self) -> &str {
        self.public_addr.as_deref().unwrap_or(&self.listener.host)
    }

    pub fn min_reload_interval(&self) -> Duration {
        Duration::from_millis(self.min_reload_interval_ms)
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    /// TCP connect (and TLS handshake) to a backend
    pub connect_ms: u64,
    /// Waiting for `100 Continue`
    pub expect_secs: u64,
    /// Waiting for the next chunk from the client, or from a streamed backend response
    pub client_secs: u64,
    /// Backend response head and per-chunk writes to the backend
    pub node_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect_ms: 500,
            expect_secs: 10,
            client_secs: 60,
            node_secs: 10,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn expect(&self) -> Duration {
        Duration::from_secs(self.expect_secs)
    }

    pub fn client(&self) -> Duration {
        Duration::from_secs(self.client_secs)
    }

    pub fn node(&self) -> Duration {
        Duration::from_secs(self.node_secs)
    }
}

/// Retries of the response read that follows a streamed upload
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResponseRetry {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ResponseRetry {
    fn default() -> Self {
        ResponseRetry {
            attempts: 10,
            backoff_ms: 100,
        }
    }
}

impl ResponseRetry {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
