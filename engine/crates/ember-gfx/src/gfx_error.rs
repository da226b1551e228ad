use thiserror::Error;

pub type GfxResult<T> = Result<T, GfxError>;

/// GFX 层的错误
///
/// 只有 [`GfxError::is_recoverable`] 为 true 的错误可以触发上层的故障恢复。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GfxError {
    #[error("device removed: {0}")]
    DeviceRemoved(String),

    #[error("out of {0} memory")]
    OutOfMemory(&'static str),

    #[error("invalid {kind} handle")]
    InvalidHandle { kind: &'static str },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("surface error: {0}")]
    Surface(String),

    #[error("timed out waiting for fence value {value}")]
    Timeout { value: u64 },

    #[error("backend error: {0}")]
    Backend(String),
}

impl GfxError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GfxError::DeviceRemoved(_)
                | GfxError::OutOfMemory(_)
                | GfxError::InvalidArgument(_)
                | GfxError::Timeout { .. }
                | GfxError::Surface(_)
        )
    }

    #[inline]
    pub fn invalid_handle(kind: &'static str) -> Self {
        GfxError::InvalidHandle { kind }
    }
}
