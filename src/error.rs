use crate::config::PlanningMode;
use crate::core::StreamContext;
use thiserror::Error;

/// 规划期致命错误：整次规划中止，并带上出错的谓词片段
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("query depth {depth} exceeds threshold {max}: {node}")]
    DepthThresholdExceeded {
        depth: usize,
        max: usize,
        node: String,
    },

    #[error("node has more than one child: {node}")]
    MoreThanOneChild { node: String },

    #[error("node is not supported in {mode} planning: {node}")]
    Unsupported { mode: PlanningMode, node: String },

    #[error("child stream is {context} without data: {node}")]
    EmptyRangeStream {
        context: StreamContext,
        node: String,
    },

    #[error("value threshold exceeded on an index-only field with no evaluation path: {node}")]
    ExpandQueryTermSystemLimits { node: String },

    #[error("stream initializer failed for {node}: {reason}")]
    Initializer { node: String, reason: String },

    #[error("lookup pool unavailable: {0}")]
    Pool(String),

    #[error("invalid date {value:?}: {reason}")]
    InvalidDate { value: String, reason: String },
}

impl PlanError {
    /// 稳定的错误码
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::DepthThresholdExceeded { .. } => "QUERY_DEPTH_THRESHOLD_EXCEEDED",
            PlanError::MoreThanOneChild { .. } => "MORE_THAN_ONE_CHILD",
            PlanError::Unsupported { .. } => "UNSUPPORTED_NODE",
            PlanError::EmptyRangeStream { .. } => "EMPTY_RANGE_STREAM",
            PlanError::ExpandQueryTermSystemLimits { .. } => "EXPAND_QUERY_TERM_SYSTEM_LIMITS",
            PlanError::Initializer { .. } => "STREAM_INITIALIZER_FAILED",
            PlanError::Pool(_) => "LOOKUP_POOL_UNAVAILABLE",
            PlanError::InvalidDate { .. } => "INVALID_DATE",
        }
    }

    /// 导致错误的谓词片段（如果有）
    pub fn fragment(&self) -> Option<&str> {
        match self {
            PlanError::DepthThresholdExceeded { node, .. }
            | PlanError::MoreThanOneChild { node }
            | PlanError::Unsupported { node, .. }
            | PlanError::EmptyRangeStream { node, .. }
            | PlanError::ExpandQueryTermSystemLimits { node }
            | PlanError::Initializer { node, .. } => Some(node),
            PlanError::Pool(_) | PlanError::InvalidDate { .. } => None,
        }
    }
}
