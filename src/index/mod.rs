pub mod arena;
pub mod entry_parser;
pub mod initializer;
pub mod intersection;
pub mod scanner;
pub mod union;

use crate::core::{IndexInfo, QueryNode, StreamContext};

/// 流上的一个元素：分区键与该分区的命中描述
pub type Tuple = (String, IndexInfo);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Scanner,
    Intersection,
    Union,
}

/// 可 seek 的有序分区流。
///
/// ## 契约（重要）
/// - 连续 `next()` 的 key 单调不减；`peek()` 幂等且不前进。
/// - `seek(target)` 前进到第一个 `>= target` 的 key（day 命中 target 所在 day 也算）；
///   只向前，target 落在当前位置之前时原地返回。
/// - `context()` 在构造时确定；唯一允许的变化是初始化器把 `Initialized` 提升为 `Present`。
pub trait IndexStream: Send {
    fn context(&self) -> StreamContext;

    /// 多行调试树，每层缩进两个空格
    fn context_debug(&self) -> String;

    fn current_node(&self) -> &QueryNode;

    fn kind(&self) -> StreamKind;

    fn has_next(&mut self) -> bool {
        self.peek().is_some()
    }

    fn peek(&mut self) -> Option<&Tuple>;

    fn next(&mut self) -> Option<Tuple>;

    /// 父 Intersection 要求在 `hint` 处给出结果时调用；默认等同 `next()`
    fn next_hint(&mut self, hint: &str) -> Option<Tuple> {
        let _ = hint;
        self.next()
    }

    fn seek(&mut self, target: &str) -> Option<String>;

    fn promote_present(&mut self) {}
}

/// 复合流的调试树
pub(crate) fn debug_tree(header: String, children: &[String]) -> String {
    let mut out = header;
    for child in children {
        for line in child.lines() {
            out.push_str("\n  ");
            out.push_str(line);
        }
    }
    out
}

pub use arena::{StreamArena, StreamId, StreamIds};
pub use entry_parser::EntryParser;
pub use initializer::{initialize_streams, StreamInitializer};
pub use intersection::{Intersection, IntersectionBuilder};
pub use scanner::{IndexScan, ScannerStream, TupleList, TupleSource};
pub use union::{Union, UnionBuilder};
