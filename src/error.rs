use thiserror::Error;

use crate::pool::Role;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed client frame. Fatal to the client connection: RESP has no
    /// way to resynchronize a desynchronized stream.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No healthy connection for the requested role within the acquire
    /// timeout. Surfaced to the client as a RESP error; the client
    /// connection stays open.
    #[error("no healthy {0} backend available")]
    BackendUnavailable(Role),

    /// A backend returned a malformed or unexpected frame. The connection
    /// is invalidated and redialed.
    #[error("backend protocol error: {0}")]
    BackendProtocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
