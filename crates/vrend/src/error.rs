use std::fmt;

pub const EIO: i32 = 5;
pub const ESRCH: i32 = 3;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;

/// Failure of a single renderer operation.
///
/// Every variant maps onto a positive errno so the transport can report it as a
/// status word without knowing anything about the renderer internals.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("handle {0} is zero or already in use")]
    DuplicateHandle(u32),
    #[error("no {kind} with handle {handle}")]
    NotFound { kind: &'static str, handle: u32 },
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("transfer outside of backing storage: {0}")]
    Fault(String),
    #[error("graphics driver failure: {0}")]
    Driver(String),
}

impl RenderError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(kind: &'static str, handle: u32) -> Self {
        Self::NotFound { kind, handle }
    }

    pub fn errno(&self) -> i32 {
        match self {
            RenderError::InvalidArgument(_) => EINVAL,
            RenderError::DuplicateHandle(_) => EEXIST,
            RenderError::NotFound { .. } => ESRCH,
            RenderError::OutOfMemory(_) => ENOMEM,
            RenderError::Fault(_) => EFAULT,
            RenderError::Driver(_) => EIO,
        }
    }

    /// Whether the failure stops the rest of a command batch.
    pub fn aborts_batch(&self) -> bool {
        matches!(
            self,
            RenderError::InvalidArgument(_)
                | RenderError::OutOfMemory(_)
                | RenderError::DuplicateHandle(_)
                | RenderError::NotFound { .. }
                | RenderError::Fault(_)
        )
    }
}

pub type Result<T, E = RenderError> = std::result::Result<T, E>;

/// Error latched on a context when a sub-command names state it cannot use.
///
/// Once recorded the context renders nothing further and refuses new batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("illegal shader {0}")]
    IllegalShader(u32),
    #[error("illegal handle {0}")]
    IllegalHandle(u32),
    #[error("illegal resource {0}")]
    IllegalResource(u32),
    #[error("illegal surface {0}")]
    IllegalSurface(u32),
    #[error("illegal vertex format {0}")]
    IllegalVertexFormat(u32),
    #[error("illegal command buffer")]
    IllegalCmdBuffer,
    #[error("illegal sampler view {0}")]
    IllegalSamplerView(u32),
    #[error("illegal sampler state {0}")]
    IllegalSamplerState(u32),
    #[error("illegal format {0}")]
    IllegalFormat(u32),
    #[error("illegal shader type {0}")]
    IllegalShaderType(u32),
    #[error("program link failure")]
    LinkFailure,
}

/// Identifies what a [`ContextError`] was raised against, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextErrorReport {
    pub ctx_id: u32,
    pub error: ContextError,
}

impl fmt::Display for ContextErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context {}: {}", self.ctx_id, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_matches_kind() {
        assert_eq!(RenderError::invalid("x").errno(), EINVAL);
        assert_eq!(RenderError::DuplicateHandle(4).errno(), EEXIST);
        assert_eq!(RenderError::not_found("resource", 9).errno(), ESRCH);
        assert_eq!(RenderError::Driver("lost".into()).errno(), EIO);
    }

    #[test]
    fn driver_errors_do_not_abort_batches() {
        assert!(!RenderError::Driver("link".into()).aborts_batch());
        assert!(RenderError::OutOfMemory("scratch".into()).aborts_batch());
    }
}
