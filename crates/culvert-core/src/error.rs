use crate::protocol::MsgType;
use thiserror::Error;

/// Errors produced by the culvert protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error in {msg_type} payload: {detail}")]
    Codec { msg_type: String, detail: String },

    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedType { expected: MsgType, got: MsgType },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    Closed,

    #[error("domain already registered: {0}")]
    DomainInUse(String),

    #[error("registration rejected: {code} - {message}")]
    Rejected { code: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
