//! Dashboard server configuration from `BONDBOARD_*` environment variables.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_DASHBOARD_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_TABLE: &str = "instruments";
pub const DEFAULT_DEMO_FEED_MS: u64 = 1_500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Demo,
    Sqlite { path: PathBuf },
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Demo => "demo",
            Self::Sqlite { .. } => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub source: SourceKind,
    pub table: String,
    /// Interval of the synthetic demo feed; `0` turns it off.
    pub demo_feed_interval_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid BONDBOARD_DASHBOARD_ADDR {0:?}")]
    InvalidAddr(String),
    #[error("unknown BONDBOARD_SOURCE {0:?}; expected demo or sqlite")]
    UnknownSource(String),
    #[error("BONDBOARD_SOURCE=sqlite requires BONDBOARD_SQLITE_PATH")]
    MissingSqlitePath,
    #[error("invalid BONDBOARD_DEMO_FEED_MS {0:?}")]
    InvalidFeedInterval(String),
}

pub fn server_config_from_env() -> Result<ServerConfig, ConfigError> {
    let addr_raw =
        non_empty_var("BONDBOARD_DASHBOARD_ADDR").unwrap_or_else(|| DEFAULT_DASHBOARD_ADDR.into());
    let bind_addr: SocketAddr = addr_raw
        .parse()
        .map_err(|_| ConfigError::InvalidAddr(addr_raw.clone()))?;

    let source = match non_empty_var("BONDBOARD_SOURCE") {
        None => SourceKind::Demo,
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "demo" => SourceKind::Demo,
            "sqlite" => SourceKind::Sqlite {
                path: non_empty_var("BONDBOARD_SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok_or(ConfigError::MissingSqlitePath)?,
            },
            _ => return Err(ConfigError::UnknownSource(raw)),
        },
    };

    let table = non_empty_var("BONDBOARD_TABLE").unwrap_or_else(|| DEFAULT_TABLE.into());

    let demo_feed_interval_ms = match non_empty_var("BONDBOARD_DEMO_FEED_MS") {
        None => DEFAULT_DEMO_FEED_MS,
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidFeedInterval(raw))?,
    };

    Ok(ServerConfig {
        bind_addr,
        source,
        table,
        demo_feed_interval_ms,
    })
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
