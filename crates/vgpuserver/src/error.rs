use std::io;

use vrend::RenderError;

/// A failure that ends a connection.
///
/// Requests that fail inside the renderer with a recoverable status are logged
/// and answered normally; only these errors tear the client down.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("socket i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed in the middle of a request")]
    ShortRead,
    #[error("opcode {0} sent before CREATE_RENDERER")]
    NotInitialized(u32),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("command batch of {words} words exceeds the limit of {max}")]
    BatchTooLarge { words: usize, max: usize },
    #[error("fence ids exhausted")]
    FenceIdsExhausted,
    #[error("request failed with status {0}")]
    Status(i32),
    #[error("failed to create renderer: {0}")]
    Renderer(#[source] RenderError),
}

impl ProtocolError {
    /// Negative errno reported for a renderer failure.
    pub fn status(err: &RenderError) -> Self {
        ProtocolError::Status(-err.errno())
    }
}

impl From<nix::Error> for ProtocolError {
    fn from(err: nix::Error) -> Self {
        ProtocolError::Status(-(err as i32))
    }
}
