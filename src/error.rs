//! Crate-wide error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error wrapping the failure domains the daemon touches.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Broker(#[from] lapin::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Environment configuration failures. Surfaced at startup, never at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required env {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid {
        key: &'static str,
        message: String,
    },
}
