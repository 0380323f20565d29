//! Typed error taxonomy for the engine's subsystems.
//!
//! Each subsystem gets its own `thiserror` enum with an `anyhow::Error`
//! catch-all, and a classification method (`is_transient`, `is_fatal`) that
//! drives retry and exit-code decisions. [`EngineError`] composes them for
//! `main` to match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TicketClientError {
    #[error("transient tracker error: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("body update conflict for {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TicketClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor binary not found at {0}")]
    BinaryMissing(String),

    #[error("executor exited with transient failure (exit code {0})")]
    TransientExit(i32),

    #[error("executor exited with non-zero status: {0}")]
    NonZeroExit(i32),

    #[error("executor timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("executor idle for longer than {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("executor action was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientExit(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BinaryMissing(_))
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git command failed: {0}")]
    GitCommand(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("action for {0} dropped: an action is already in flight")]
    AlreadyInFlight(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key: {0}")]
    MissingKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("credential token carries broader scopes than required: {0}")]
    ExcessiveScope(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dotenv(#[from] dotenvy::Error),
}

/// Top-level error composed for `main` to pick an exit code from.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TicketClient(#[from] TicketClientError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// True for configuration/credential errors that should stop the daemon
    /// from starting at all.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::TicketClient(e) => e.is_fatal(),
            _ => false,
        }
    }
}
