use crate::core::StreamContext;
use std::fmt;

/// 一次规划的统计：各类叶子流的数量与初始化任务数
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlanStats {
    /// 真正打开了索引扫描的等值叶子
    pub leaf_scanners: u64,
    pub delayed: u64,
    pub unindexed: u64,
    pub unknown_field: u64,
    /// 被短路为无数据的叶子（_ANYFIELD_、FALSE 等）
    pub no_data: u64,
    pub exceeded_term_threshold: u64,
    pub exceeded_value_threshold: u64,
    pub ignored: u64,
    pub intersections: u64,
    pub unions: u64,
    /// 提交到查找池的初始化任务
    pub initializer_tasks: u64,
}

impl PlanStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按叶子的上下文计数
    pub fn record_leaf(&mut self, context: StreamContext) {
        match context {
            StreamContext::Initialized | StreamContext::Present => self.leaf_scanners += 1,
            StreamContext::DelayedField => self.delayed += 1,
            StreamContext::Unindexed => self.unindexed += 1,
            StreamContext::UnknownField => self.unknown_field += 1,
            StreamContext::Absent => self.no_data += 1,
            StreamContext::ExceededTermThreshold => self.exceeded_term_threshold += 1,
            StreamContext::ExceededValueThreshold => self.exceeded_value_threshold += 1,
            StreamContext::Ignored => self.ignored += 1,
            StreamContext::Variable | StreamContext::NoOp => {}
        }
    }

    pub fn leaves(&self) -> u64 {
        self.leaf_scanners
            + self.delayed
            + self.unindexed
            + self.unknown_field
            + self.no_data
            + self.exceeded_term_threshold
            + self.exceeded_value_threshold
            + self.ignored
    }
}

impl fmt::Display for PlanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           gindex-lookup Plan Report              ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Leaves:         {:>10}                       ║", self.leaves())?;
        writeln!(f, "║   scanners:     {:>10}                       ║", self.leaf_scanners)?;
        writeln!(f, "║   delayed:      {:>10}                       ║", self.delayed)?;
        writeln!(f, "║   unindexed:    {:>10}                       ║", self.unindexed)?;
        writeln!(f, "║   unknown:      {:>10}                       ║", self.unknown_field)?;
        writeln!(f, "║   no data:      {:>10}                       ║", self.no_data)?;
        writeln!(f, "║   term limit:   {:>10}                       ║", self.exceeded_term_threshold)?;
        writeln!(f, "║   value limit:  {:>10}                       ║", self.exceeded_value_threshold)?;
        writeln!(f, "║   ignored:      {:>10}                       ║", self.ignored)?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Composites:                                      ║")?;
        writeln!(f, "║   intersections:{:>10}                       ║", self.intersections)?;
        writeln!(f, "║   unions:       {:>10}                       ║", self.unions)?;
        writeln!(f, "║   initializers: {:>10}                       ║", self.initializer_tasks)?;
        write!(f, "╚══════════════════════════════════════════════════╝")
    }
}
