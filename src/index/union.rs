use super::arena::{StreamArena, StreamId};
use super::initializer::StreamInitializer;
use super::{debug_tree, IndexStream, StreamKind, Tuple};
use crate::core::key::{is_day, is_full_shard, matches, reached};
use crate::core::{IndexInfo, QueryNode, StreamContext, WorkerPool};
use crate::error::PlanError;
use std::collections::BTreeMap;

/// 队列键：peek 到的分区键加一个插入序号（同键的子流并存）
type QueueKey = (String, u64);

/// N 元 OR：按 key 做 k 路归并，同一 key（或 day 覆盖的 shard）上的结果求并。
///
/// 没有数据的延迟类子流在整个生命周期里都挂在每个结果上。
pub struct Union {
    children: BTreeMap<QueueKey, Box<dyn IndexStream>>,
    seq: u64,
    delayed: Vec<QueryNode>,
    context: StreamContext,
    node: QueryNode,
    next: Option<Tuple>,
    child_debug: Vec<String>,
}

impl Union {
    pub fn new(streams: Vec<Box<dyn IndexStream>>) -> Self {
        let mut union = Self {
            children: BTreeMap::new(),
            seq: 0,
            delayed: Vec::new(),
            context: StreamContext::Absent,
            node: QueryNode::False,
            next: None,
            child_debug: Vec::new(),
        };

        let mut nodes = Vec::new();
        let mut unindexed_delayed = false;
        for mut stream in streams {
            let context = stream.context();
            if context == StreamContext::NoOp {
                continue;
            }
            nodes.push(stream.current_node().clone());
            union.child_debug.push(stream.context_debug());

            if stream.has_next() {
                union.requeue(stream);
            } else if context.contributes_delayed() {
                unindexed_delayed |= context == StreamContext::Unindexed;
                union.delayed.push(stream.current_node().clone());
            } else {
                tracing::trace!("Union drops empty child {}: {}", context, stream.current_node());
            }
        }

        if !nodes.is_empty() {
            union.node = QueryNode::or_unwrapped(nodes).flatten();
        }
        union.context = match (union.children.is_empty(), union.delayed.is_empty()) {
            (true, true) => StreamContext::Absent,
            (false, false) => StreamContext::Variable,
            (false, true) => StreamContext::Present,
            (true, false) if unindexed_delayed => StreamContext::Unindexed,
            (true, false) => StreamContext::DelayedField,
        };
        union.next = union.advance();

        tracing::debug!(
            "Union of {} live children is {} with {} delayed nodes",
            union.children.len(),
            union.context,
            union.delayed.len()
        );
        union
    }

    pub fn delayed(&self) -> &[QueryNode] {
        &self.delayed
    }

    /// 有数据的子流按新的 peek key 放回队列，耗尽的丢弃
    fn requeue(&mut self, mut stream: Box<dyn IndexStream>) {
        if let Some(key) = stream.peek().map(|(key, _)| key.clone()) {
            self.seq += 1;
            self.children.insert((key, self.seq), stream);
        }
    }

    fn advance(&mut self) -> Option<Tuple> {
        let (_, mut first) = self.children.pop_first()?;
        let (key, mut acc) = first.next()?;
        self.requeue(first);

        loop {
            let absorbs = match self.children.first_key_value() {
                Some(((next, _), _)) => *next == key || (is_day(&key) && matches(&key, next)),
                None => false,
            };
            if !absorbs {
                break;
            }
            let Some((_, mut child)) = self.children.pop_first() else {
                break;
            };
            if let Some((_, info)) = child.next() {
                acc = acc.union(&info, &[]);
            }
            self.requeue(child);
        }

        Some((key, acc.union_delayed(&self.delayed)))
    }

    fn report_at(&mut self, target: &str) -> Option<String> {
        let (key, _) = self.next.as_mut()?;
        if is_day(key) && is_full_shard(target) && matches(key, target) {
            *key = target.to_string();
        }
        Some(key.clone())
    }

    fn delayed_node(&self) -> Option<QueryNode> {
        if self.delayed.is_empty() {
            return None;
        }
        Some(QueryNode::or_unwrapped(self.delayed.iter().cloned()).flatten())
    }
}

impl IndexStream for Union {
    fn context(&self) -> StreamContext {
        self.context
    }

    fn context_debug(&self) -> String {
        debug_tree(format!("Union({}): {}", self.context, self.node), &self.child_debug)
    }

    fn current_node(&self) -> &QueryNode {
        &self.node
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Union
    }

    fn peek(&mut self) -> Option<&Tuple> {
        self.next.as_ref()
    }

    fn next(&mut self) -> Option<Tuple> {
        let out = self.next.take();
        if out.is_some() {
            self.next = self.advance();
        }
        out
    }

    /// `hint` 早于下一个自然 key 且有延迟节点时，在 `hint` 处给出只带延迟谓词的无界结果（不消费）
    fn next_hint(&mut self, hint: &str) -> Option<Tuple> {
        let before_next = self.next.as_ref().map_or(true, |(key, _)| hint < key.as_str());
        if before_next {
            if let Some(node) = self.delayed_node() {
                tracing::trace!("Union fabricates delayed result at {}", hint);
                return Some((hint.to_string(), IndexInfo::unbounded().with_node(node)));
            }
        }
        self.next()
    }

    /// 覆盖完整 shard 目标的 day 结果一律以目标 shard 报出，
    /// 无论它来自缓冲还是来自子流的 seek；其余结果保持原 key。
    fn seek(&mut self, target: &str) -> Option<String> {
        if let Some((key, info)) = self.next.take() {
            if reached(&key, target) {
                self.next = Some((key, info));
                return self.report_at(target);
            }
        }

        for ((key, seq), mut child) in std::mem::take(&mut self.children) {
            if key.as_str() >= target {
                self.children.insert((key, seq), child);
                continue;
            }
            if let Some(found) = child.seek(target) {
                self.children.insert((found, seq), child);
            }
        }

        self.next = self.advance();
        self.report_at(target)
    }
}

/// OR 节点的构建器
#[derive(Default)]
pub struct UnionBuilder {
    arena: StreamArena,
}

impl UnionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_child(&mut self, id: StreamId, stream: Box<dyn IndexStream>) -> bool {
        self.arena.add_child(id, stream)
    }

    pub fn add_pending(&mut self, todo: Vec<StreamInitializer>) {
        self.arena.add_pending(todo);
    }

    /// 吸收嵌套 OR 的子流
    pub fn consume(&mut self, other: UnionBuilder) {
        self.arena.consume(other.arena);
    }

    pub fn size(&self) -> usize {
        self.arena.size()
    }

    pub fn build(self, pool: &WorkerPool) -> Result<Union, PlanError> {
        let children = self.arena.resolve(pool)?;
        Ok(Union::new(children))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Combinator, IndexMatch};
    use crate::index::{ScannerStream, StreamIds, TupleList};

    fn leaf(field: &str, tuples: Vec<(String, IndexInfo)>) -> Box<dyn IndexStream> {
        Box::new(ScannerStream::with_data(TupleList::new(tuples), QueryNode::eq_term(field, "1")))
    }

    fn day_leaf(field: &str, days: &[&str]) -> Box<dyn IndexStream> {
        let node = QueryNode::eq_term(field, "1");
        let tuples = days
            .iter()
            .map(|d| (d.to_string(), IndexInfo::unbounded().apply_node(node.clone())))
            .collect();
        leaf(field, tuples)
    }

    /// 每天 20 个 shard，按字符串顺序排列
    fn shard_leaf(field: &str, days: &[&str]) -> Box<dyn IndexStream> {
        let node = QueryNode::eq_term(field, "1");
        let mut keys: Vec<String> = days
            .iter()
            .flat_map(|d| (0..20).map(move |i| format!("{}_{}", d, i)))
            .collect();
        keys.sort();
        let tuples = keys
            .into_iter()
            .map(|k| (k, IndexInfo::unbounded().apply_node(node.clone())))
            .collect();
        leaf(field, tuples)
    }

    fn union_of_days() -> Union {
        Union::new(vec![
            day_leaf("A", &["20190301", "20190303", "20190309"]),
            day_leaf("B", &["20190302", "20190307", "20190308"]),
        ])
    }

    fn union_of_shards() -> Union {
        Union::new(vec![
            shard_leaf("A", &["20190301", "20190303", "20190309"]),
            shard_leaf("B", &["20190302", "20190307", "20190308"]),
        ])
    }

    fn exact(field: &str, uids: &[&str]) -> IndexInfo {
        IndexInfo::from_uids(uids.iter().copied()).apply_node(QueryNode::eq_term(field, "1"))
    }

    fn drain_keys(stream: &mut dyn IndexStream) -> Vec<String> {
        std::iter::from_fn(|| stream.next()).map(|t| t.0).collect()
    }

    #[test]
    fn merges_uids_of_one_shard() {
        let a = leaf("A", vec![("20190314_0".to_string(), exact("A", &["doc1", "doc2"]))]);
        let b = leaf("B", vec![("20190314_0".to_string(), exact("B", &["doc2", "doc3"]))]);
        let mut union = Union::new(vec![a, b]);
        assert_eq!(union.context(), StreamContext::Present);

        let (key, info) = union.next().unwrap();
        assert_eq!(key, "20190314_0");
        let uids: Vec<&str> = info.uids().iter().map(IndexMatch::uid).collect();
        assert_eq!(uids, vec!["doc1", "doc2", "doc3"]);
        let doc2 = info.uids().iter().find(|m| m.uid() == "doc2").unwrap();
        assert_eq!(doc2.fragments().len(), 2);
        assert_eq!(doc2.combinator(), Combinator::Or);
        assert!(union.next().is_none());
    }

    #[test]
    fn day_absorbs_shards_of_that_day() {
        let day = day_leaf("A", &["20190301", "20190302"]);
        let shards = leaf(
            "B",
            vec![
                ("20190301_0".to_string(), exact("B", &["doc1"])),
                ("20190301_7".to_string(), exact("B", &["doc2"])),
                ("20190302_1".to_string(), exact("B", &["doc3"])),
                ("20190303_1".to_string(), exact("B", &["doc4"])),
            ],
        );
        let mut union = Union::new(vec![day, shards]);
        let (key, info) = union.next().unwrap();
        assert_eq!(key, "20190301");
        assert!(info.is_unbounded());
        assert_eq!(info.node().map(|n| n.to_string()).as_deref(), Some("(A == '1' || B == '1')"));
        assert_eq!(drain_keys(&mut union), vec!["20190302", "20190303_1"]);
    }

    #[test]
    fn seek_over_days() {
        let cases: &[(&str, Option<&str>)] = &[
            ("20190301_", Some("20190301")),
            ("20190301_0", Some("20190301_0")),
            ("20190303_3", Some("20190303_3")),
            ("20190305_0", Some("20190307")),
            ("20190309_9", Some("20190309_9")),
            ("20190310", None),
            ("20190310_", None),
            ("20190310_0", None),
        ];
        for (target, expected) in cases {
            let mut union = union_of_days();
            assert_eq!(union.seek(target).as_deref(), *expected, "seek {}", target);
            if expected.is_none() {
                assert!(!union.has_next());
                assert!(union.next().is_none());
            }
        }
    }

    #[test]
    fn day_covering_shard_target_reports_the_shard_then_moves_on() {
        // 缓冲中的 day
        let mut union = union_of_days();
        assert_eq!(union.seek("20190301_0").as_deref(), Some("20190301_0"));
        assert_eq!(drain_keys(&mut union), vec!["20190301_0", "20190302", "20190303", "20190307", "20190308", "20190309"]);

        // 子流 seek 得到的 day
        let mut union = union_of_days();
        assert_eq!(union.seek("20190303_3").as_deref(), Some("20190303_3"));
        assert_eq!(drain_keys(&mut union), vec!["20190303_3", "20190307", "20190308", "20190309"]);
    }

    #[test]
    fn seek_over_shards() {
        let cases: &[(&str, Option<&str>)] = &[
            ("20190202", Some("20190301_0")),
            ("20190202_", Some("20190301_0")),
            ("20190202_0", Some("20190301_0")),
            ("20190301", Some("20190301_0")),
            ("20190301_", Some("20190301_0")),
            ("20190301_0", Some("20190301_0")),
            ("20190303", Some("20190303_0")),
            ("20190303_", Some("20190303_0")),
            ("20190303_3", Some("20190303_3")),
            ("20190305", Some("20190307_0")),
            ("20190305_", Some("20190307_0")),
            ("20190305_0", Some("20190307_0")),
            ("20190309", Some("20190309_0")),
            ("20190309_", Some("20190309_0")),
            ("20190309_9", Some("20190309_9")),
            ("20190310", None),
            ("20190310_", None),
            ("20190309_99", None),
        ];
        for (target, expected) in cases {
            let mut union = union_of_shards();
            assert_eq!(union.seek(target).as_deref(), *expected, "seek {}", target);
        }
    }

    #[test]
    fn successive_seeks_walk_forward() {
        let mut union = union_of_shards();
        assert_eq!(union.seek("20190302_5").as_deref(), Some("20190302_5"));
        assert_eq!(union.next().map(|t| t.0).as_deref(), Some("20190302_5"));
        assert_eq!(union.next().map(|t| t.0).as_deref(), Some("20190302_6"));
        assert_eq!(union.seek("20190308_19").as_deref(), Some("20190308_19"));
        assert_eq!(union.seek("20190301").as_deref(), Some("20190308_19"));
        assert_eq!(union.seek("20190309_99"), None);
    }

    #[test]
    fn delayed_children_ride_on_every_result() {
        let live = day_leaf("A", &["20190301", "20190302"]);
        let delayed: Box<dyn IndexStream> = Box::new(ScannerStream::delayed_expression(QueryNode::eq_term("C", "3")));
        let mut union = Union::new(vec![live, delayed]);
        assert_eq!(union.context(), StreamContext::Variable);
        assert_eq!(union.delayed().len(), 1);

        for (key, info) in std::iter::from_fn(|| union.next()) {
            let rendered = info.node().map(|n| n.to_string()).unwrap_or_default();
            assert_eq!(rendered, "(A == '1' || C == '3')", "at {}", key);
        }
    }

    #[test]
    fn exact_results_keep_uids_with_delayed_fragments() {
        let live = leaf("A", vec![("20190301_0".to_string(), exact("A", &["doc1"]))]);
        let delayed: Box<dyn IndexStream> = Box::new(ScannerStream::unindexed(QueryNode::eq_term("C", "3")));
        let mut union = Union::new(vec![live, delayed]);
        let (_, info) = union.next().unwrap();
        assert_eq!(info.count(), 1);
        let doc = info.uids().iter().next().unwrap();
        assert!(doc.fragments().contains(&QueryNode::eq_term("C", "3")));
    }

    #[test]
    fn hint_before_next_key_fabricates_delayed_result() {
        let live = day_leaf("A", &["20190305"]);
        let delayed: Box<dyn IndexStream> = Box::new(ScannerStream::delayed_expression(QueryNode::eq_term("C", "3")));
        let mut union = Union::new(vec![live, delayed]);

        let (key, info) = union.next_hint("20190301_2").unwrap();
        assert_eq!(key, "20190301_2");
        assert!(info.is_unbounded());
        assert_eq!(info.node(), Some(&QueryNode::eq_term("C", "3")));
        // 未消费自然结果
        assert_eq!(union.peek().map(|t| t.0.clone()).as_deref(), Some("20190305"));

        let (key, _) = union.next_hint("20190305").unwrap();
        assert_eq!(key, "20190305");
        assert!(!union.has_next());
    }

    #[test]
    fn hint_without_delayed_nodes_is_plain_next() {
        let mut union = union_of_days();
        let (key, _) = union.next_hint("20190201").unwrap();
        assert_eq!(key, "20190301");
    }

    #[test]
    fn context_rules() {
        let absent: Box<dyn IndexStream> = Box::new(ScannerStream::no_data(QueryNode::eq_term("A", "1")));
        let no_op: Box<dyn IndexStream> = Box::new(ScannerStream::no_op(QueryNode::eq_term("B", "1")));
        let union = Union::new(vec![absent, no_op]);
        assert_eq!(union.context(), StreamContext::Absent);
        assert_eq!(union.current_node().to_string(), "A == '1'");

        let a: Box<dyn IndexStream> = Box::new(ScannerStream::unindexed(QueryNode::eq_term("A", "1")));
        let b: Box<dyn IndexStream> = Box::new(ScannerStream::delayed_expression(QueryNode::eq_term("B", "1")));
        assert_eq!(Union::new(vec![a, b]).context(), StreamContext::Unindexed);

        let a: Box<dyn IndexStream> = Box::new(ScannerStream::unknown_field(QueryNode::eq_term("A", "1")));
        let b: Box<dyn IndexStream> = Box::new(ScannerStream::ignored(QueryNode::eq_term("B", "1")));
        assert_eq!(Union::new(vec![a, b]).context(), StreamContext::DelayedField);

        let live = day_leaf("A", &["20190301"]);
        let absent: Box<dyn IndexStream> = Box::new(ScannerStream::no_data(QueryNode::eq_term("B", "1")));
        assert_eq!(Union::new(vec![live, absent]).context(), StreamContext::Present);
    }

    #[test]
    fn debug_tree_lists_children() {
        let union = union_of_days();
        let debug = union.context_debug();
        let lines: Vec<&str> = debug.lines().collect();
        assert_eq!(lines[0], "Union(PRESENT): (A == '1' || B == '1')");
        assert_eq!(lines[1], "  ScannerStream(PRESENT): A == '1'");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn builder_consumes_nested_or() {
        let ids = StreamIds::new();
        let pool = WorkerPool::new(2, std::time::Duration::from_millis(1)).unwrap();

        let mut inner = UnionBuilder::new();
        inner.add_child(ids.next_id(), day_leaf("B", &["20190302"]));
        let mut outer = UnionBuilder::new();
        outer.add_pending(vec![StreamInitializer::new(ids.next_id(), day_leaf("A", &["20190301"]))]);
        outer.consume(inner);
        assert_eq!(outer.size(), 2);

        let mut union = outer.build(&pool).unwrap();
        assert_eq!(drain_keys(&mut union), vec!["20190301", "20190302"]);
    }
}
