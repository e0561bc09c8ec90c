//! Error types for zone orchestration.

use std::path::PathBuf;

/// All errors that can occur while bootstrapping or running a zone.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file unreadable: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // Identity Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Region is not configured: {0}")]
    UnknownRegion(String),

    #[error("Port overflow: base port {base_port} + index {index}")]
    PortOverflow { base_port: u16, index: usize },

    #[error("A zone context is already active in this process")]
    DuplicateZone,

    // ─────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Record store error: {context}: {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to spawn zone for {region}: {source}")]
    Spawn {
        region: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Redirect rejected: {0}")]
    RedirectRejected(String),
}

impl ZoneError {
    pub(crate) fn store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        ZoneError::Store {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ZoneError>;
