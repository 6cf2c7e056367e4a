// SPDX-License-Identifier: GPL-3.0-only
//! Error types for the controller
//!
//! Hardware faults never show up here: backends count them and report a
//! boolean. These errors are reserved for rejected mutations and for
//! configuration or persistence problems.

use thiserror::Error;

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// A lower/upper bound pair was rejected because `min >= max`
    #[error("Invalid range for {what} on display {serial}: min {min} must be below max {max}")]
    InvalidRange {
        serial: String,
        what: &'static str,
        min: u16,
        max: u16,
    },

    /// Attempted to disable the only enabled control channel
    #[error("Cannot disable {channel} on display {serial}: at least one control must stay enabled")]
    LastControl { serial: String, channel: String },

    /// Display not found in the registry
    #[error("Display {0} not found")]
    DisplayNotFound(String),

    /// Persisted record could not be read or written
    #[error("Store error for key {key}: {reason}")]
    Store { key: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// D-Bus error (for the COSMIC settings daemon source)
    #[cfg(feature = "brightness-sync-daemon")]
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    /// HTTP request to a relay or sensor failed
    #[error("HTTP error for {url}: {reason}")]
    Http { url: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// Result type alias for AppError
pub type Result<T> = std::result::Result<T, AppError>;
