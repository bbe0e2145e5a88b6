//! Error types shared across the daemon

use std::io;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `/proc` itself could not be listed; per-process failures never surface here.
    #[error("Failed to enumerate processes under {path}: {source}")]
    Enumerate {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("A rule for process '{0}' already exists")]
    DuplicateRule(String),

    #[error("No rule with id {0}")]
    UnknownRule(Uuid),

    #[error("No config path configured")]
    NoConfigPath,

    #[error("Monitor task is no longer running")]
    MonitorGone,
}

pub type Result<T> = std::result::Result<T, Error>;
