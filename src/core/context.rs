use serde::{Deserialize, Serialize};
use std::fmt;

/// 流当前状态的成因（不只是有没有数据）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamContext {
    Initialized,
    Present,
    Absent,
    Variable,
    NoOp,
    DelayedField,
    Unindexed,
    UnknownField,
    ExceededTermThreshold,
    ExceededValueThreshold,
    Ignored,
}

impl StreamContext {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamContext::Initialized => "INITIALIZED",
            StreamContext::Present => "PRESENT",
            StreamContext::Absent => "ABSENT",
            StreamContext::Variable => "VARIABLE",
            StreamContext::NoOp => "NO_OP",
            StreamContext::DelayedField => "DELAYED_FIELD",
            StreamContext::Unindexed => "UNINDEXED",
            StreamContext::UnknownField => "UNKNOWN_FIELD",
            StreamContext::ExceededTermThreshold => "EXCEEDED_TERM_THRESHOLD",
            StreamContext::ExceededValueThreshold => "EXCEEDED_VALUE_THRESHOLD",
            StreamContext::Ignored => "IGNORED",
        }
    }

    /// 没有数据时，节点仍以延迟谓词的身份参与合并
    pub fn contributes_delayed(self) -> bool {
        matches!(
            self,
            StreamContext::DelayedField
                | StreamContext::Unindexed
                | StreamContext::UnknownField
                | StreamContext::ExceededTermThreshold
                | StreamContext::Ignored
        )
    }
}

impl fmt::Display for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
