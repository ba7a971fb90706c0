//! Error types for the port-forward rule engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("forward table is full")]
    TableFull,
    #[error("unknown rule id {0}")]
    UnknownRule(u32),
    #[error("engine is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed config at line {line}: {reason}")]
    Config { line: usize, reason: String },
}

pub type Result<T> = std::result::Result<T, ForwardError>;
