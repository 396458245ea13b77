//! Error types for rust_local_nav

use thiserror::Error;

use crate::mission_planning::NavStateKind;

/// Main error type for the navigation core
#[derive(Error, Debug)]
pub enum NavError {
    /// Route rejected at assignment time
    #[error("Invalid route: {0}")]
    InvalidRoute(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration could not be read or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transition outside the navigation transition table
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: NavStateKind, to: NavStateKind },

    /// Sensor input that cannot be used this tick
    #[error("Malformed input: {0}")]
    MalformedInput(String),
}

impl From<toml::de::Error> for NavError {
    fn from(e: toml::de::Error) -> Self {
        NavError::Config(e.to_string())
    }
}

/// Result type alias for navigation operations
pub type NavResult<T> = Result<T, NavError>;
