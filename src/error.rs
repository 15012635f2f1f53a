//! Semantic error taxonomy for the debug engine.
//!
//! Every failure the engine can surface to a caller has a variant here.
//! Failures inside a command worker are never propagated as errors -- they
//! are captured onto the command record so result readers return normally.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An id or command text at the API boundary was empty.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted after the engine was shut down.
    #[error("engine is closed")]
    EngineClosed,

    /// Session creation would exceed the configured maximum.
    #[error("session limit reached ({active}/{max} active). Close a session first.")]
    AtCapacity { active: usize, max: usize },

    /// The dump file does not exist.
    #[error("dump file not found: {0}")]
    DumpNotFound(PathBuf),

    /// The dump file exists but could not be opened for reading.
    #[error("dump file not readable: {path}: {reason}")]
    DumpUnreadable { path: PathBuf, reason: String },

    /// No debugger executable could be located.
    #[error("debugger executable '{0}' not found in any configured location")]
    ToolNotFound(String),

    /// Lookup of a session id failed.
    #[error("no session with id '{0}'")]
    UnknownSession(String),

    /// Lookup of a command id failed.
    #[error("no command with id '{0}'")]
    UnknownCommand(String),

    /// Enqueue would exceed the queue's soft capacity.
    #[error("command queue full ({pending}/{capacity} pending)")]
    QueueFull { pending: usize, capacity: usize },

    /// The debugger process never became ready.
    #[error("debugger startup failed: {0}")]
    StartupFailed(String),

    /// Configuration rejected at load time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Shorthand used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
