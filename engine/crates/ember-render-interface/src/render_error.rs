use ember_gfx::gfx_error::GfxError;
use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

/// 渲染层的错误
///
/// - 可恢复的错误会被渲染循环捕获，并通过完整的设备重建恢复
/// - 不可恢复的错误直接结束渲染会话
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Gfx(#[from] GfxError),

    #[error("out of descriptor heap space in {heap} heap (capacity {capacity})")]
    HeapExhausted { heap: &'static str, capacity: usize },

    #[error("failed to load asset {name}: {reason}")]
    Asset { name: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("render context has no live {0}")]
    NotLive(&'static str),

    #[error("render graph is already being reconfigured")]
    Reentrant,

    #[error("failed to apply {change} (reverted: {reverted}): {source}")]
    RebuildFailed {
        change: String,
        reverted: bool,
        #[source]
        source: Box<RenderError>,
    },

    #[error("render fault limit of {limit} reached after {faults} faults: {source}")]
    FaultLimitExceeded {
        faults: u32,
        limit: u32,
        #[source]
        source: Box<RenderError>,
    },
}

impl RenderError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            RenderError::Gfx(e) => e.is_recoverable(),
            RenderError::HeapExhausted { .. }
            | RenderError::Asset { .. }
            | RenderError::Validation(_)
            | RenderError::NotLive(_) => true,
            RenderError::RebuildFailed { reverted, .. } => *reverted,
            RenderError::Reentrant | RenderError::FaultLimitExceeded { .. } => false,
        }
    }

    pub fn asset(name: impl Into<String>, reason: impl ToString) -> Self {
        RenderError::Asset {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        assert!(RenderError::HeapExhausted { heap: "srv", capacity: 4 }.is_recoverable());
        assert!(RenderError::from(GfxError::DeviceRemoved("hung".to_string())).is_recoverable());
        assert!(!RenderError::from(GfxError::Unsupported("mesh shaders".to_string())).is_recoverable());
        assert!(!RenderError::Reentrant.is_recoverable());

        let terminal = RenderError::FaultLimitExceeded {
            faults: 3,
            limit: 3,
            source: Box::new(RenderError::Validation("bad".to_string())),
        };
        assert!(!terminal.is_recoverable());

        let reverted = RenderError::RebuildFailed {
            change: "display size".to_string(),
            reverted: true,
            source: Box::new(RenderError::HeapExhausted { heap: "rtv", capacity: 1 }),
        };
        assert!(reverted.is_recoverable());
    }
}
