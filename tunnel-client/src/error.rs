//! Error types for the tunnel client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] tunnel_protocol::ProtocolError),
    #[error("server rejected CONNECT: {0}")]
    Rejected(String),
    #[error("unexpected message while awaiting {expected}: got {got:?}")]
    UnexpectedMessage {
        expected: &'static str,
        got: tunnel_protocol::MsgType,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
