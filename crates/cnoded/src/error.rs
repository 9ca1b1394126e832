use cnode_common::frame::FrameError;
use thiserror::Error;

/// Errors that can occur during node operation.
#[derive(Error, Debug)]
pub enum NodeError {
    /// No handler is registered under this function name.
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    /// The peer closed its side of the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// A reply could not be written without blocking.
    #[error("send buffer full")]
    SendBufferFull,
    /// Framing or frame body error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// The configuration is out of bounds.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
