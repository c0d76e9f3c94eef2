//! Error types shared by the integrations.

use thiserror::Error;

/// Failures of a single scanner invocation.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The scanner ran but reported an error on stderr or exited non-zero.
    #[error("{0}")]
    Scanner(String),

    #[error("nmap program was not found in path")]
    NotInstalled,

    #[error("timeout from nmap process after {0}s")]
    Timeout(u64),

    #[error("failed to parse scan output: {0}")]
    Parse(String),

    #[error("scan worker failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the Ombi API.
#[derive(Debug, Error)]
pub enum OmbiError {
    #[error("Ombi request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Ombi returned HTTP {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid Ombi response for {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },
}

/// Device automation condition errors.
#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("unknown condition type: {0}")]
    InvalidType(String),

    #[error("invalid condition config: {0}")]
    InvalidConfig(String),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("no device condition platform for domain {0}")]
    UnknownDomain(String),
}

impl From<serde_json::Error> for ConditionError {
    fn from(e: serde_json::Error) -> Self {
        ConditionError::InvalidConfig(e.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {field} for registration {entry_id}: {message}")]
    Invalid {
        entry_id: String,
        field: &'static str,
        message: String,
    },
}

/// Entity registry storage errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
