use std::env;
use std::fmt;
use std::path::PathBuf;

use ulid::Ulid;

/// Server settings, read from `CARHIRE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between automatic compactions.
    pub compact_threshold: u64,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
    /// Id for the admin created on first start. Random when unset.
    pub admin_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    TlsHalfConfigured,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "{var}: cannot parse {value:?}"),
            ConfigError::TlsHalfConfigured => {
                write!(f, "both CARHIRE_TLS_CERT and CARHIRE_TLS_KEY must be set, or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls = match (get("CARHIRE_TLS_CERT"), get("CARHIRE_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsHalfConfigured),
        };
        Ok(Self {
            bind: get("CARHIRE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "CARHIRE_PORT")?.unwrap_or(5433),
            data_dir: get("CARHIRE_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("CARHIRE_PASSWORD").unwrap_or_else(|| "carhire".into()),
            max_connections: parsed(&get, "CARHIRE_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&get, "CARHIRE_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls,
            metrics_port: parsed(&get, "CARHIRE_METRICS_PORT")?,
            admin_id: parsed(&get, "CARHIRE_ADMIN_ID")?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("carhire.wal")
    }
}

fn parsed<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
