use crate::core::index_match::{Combinator, IndexMatch};
use crate::core::intersector::UidIntersector;
use crate::core::node::{dedupe_prefer_deferred, QueryNode};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// 计数哨兵：基数未知（人为制造的 day/shard 区间，或被剪枝的计数）
pub const UNBOUNDED: i64 = -1;

/// 某个分区上的命中描述。
///
/// 三种形态：
/// - `count == uids.len()`：精确的 UID 集合（onlyEvents）
/// - `count >= 0 && uids.is_empty()`：高基数分区，只剩计数
/// - `count == -1`：无界区间
///
/// 合并算子总是返回新值，调用方只允许替换顶层谓词。
#[derive(Clone, Debug, Default)]
pub struct IndexInfo {
    count: i64,
    uids: BTreeSet<IndexMatch>,
    node: Option<QueryNode>,
    field_counts: BTreeMap<String, i64>,
    term_counts: BTreeMap<String, i64>,
}

impl IndexInfo {
    /// 精确但为空
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_count(count: i64) -> Self {
        Self {
            count,
            ..Self::default()
        }
    }

    pub fn unbounded() -> Self {
        Self::from_count(UNBOUNDED)
    }

    pub fn from_uids<I, S>(uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_matches(uids.into_iter().map(IndexMatch::new))
    }

    pub fn from_matches<I: IntoIterator<Item = IndexMatch>>(matches: I) -> Self {
        let uids: BTreeSet<IndexMatch> = matches.into_iter().collect();
        Self {
            count: uids.len() as i64,
            uids,
            ..Self::default()
        }
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn uids(&self) -> &BTreeSet<IndexMatch> {
        &self.uids
    }

    pub fn node(&self) -> Option<&QueryNode> {
        self.node.as_ref()
    }

    pub fn field_counts(&self) -> &BTreeMap<String, i64> {
        &self.field_counts
    }

    pub fn term_counts(&self) -> &BTreeMap<String, i64> {
        &self.term_counts
    }

    pub fn is_unbounded(&self) -> bool {
        self.count == UNBOUNDED
    }

    pub fn only_events(&self) -> bool {
        self.count >= 0 && self.count as usize == self.uids.len()
    }

    /// 替换顶层谓词
    pub fn with_node(mut self, node: QueryNode) -> Self {
        self.node = Some(node);
        self
    }

    /// 设置顶层谓词并把它追加到每个 UID 的片段中
    pub fn apply_node(self, node: QueryNode) -> Self {
        let uids = self.uids.iter().map(|m| m.with_added(node.clone())).collect();
        Self {
            uids,
            node: Some(node),
            ..self
        }
    }

    pub fn with_field_count(mut self, field: &str, count: i64) -> Self {
        self.field_counts.insert(field.to_string(), count);
        self
    }

    pub fn with_term_count(mut self, term: &str, count: i64) -> Self {
        self.term_counts.insert(term.to_string(), count);
        self
    }

    /// 并集。任一侧无界时退化为只合并谓词；两侧都是精确集合时按 uid 归并片段；
    /// 其余情况计数相加并丢弃 UID。
    pub fn union(&self, other: &IndexInfo, delayed: &[QueryNode]) -> IndexInfo {
        let node = union_node(self.node.as_ref(), other.node.as_ref(), delayed);

        let (count, uids) = if self.is_unbounded() || other.is_unbounded() {
            (UNBOUNDED, BTreeSet::new())
        } else if self.only_events() && other.only_events() {
            let mut ids: BTreeMap<&str, BTreeSet<QueryNode>> = BTreeMap::new();
            for m in self.uids.iter().chain(other.uids.iter()) {
                let nodes = ids.entry(m.uid()).or_default();
                if let Some(n) = m.node() {
                    nodes.insert(n);
                }
            }
            let uids: BTreeSet<IndexMatch> = ids
                .into_iter()
                .map(|(uid, mut nodes)| {
                    nodes.extend(delayed.iter().cloned());
                    IndexMatch::with_fragments(nodes, uid, Combinator::Or)
                })
                .collect();
            (uids.len() as i64, uids)
        } else {
            (self.count + other.count, BTreeSet::new())
        };

        IndexInfo {
            count,
            uids,
            node,
            field_counts: sum_counts(&self.field_counts, &other.field_counts),
            term_counts: sum_counts(&self.term_counts, &other.term_counts),
        }
    }

    /// 只把延迟节点并入（没有第二个 IndexInfo 参与时使用）
    pub fn union_delayed(&self, delayed: &[QueryNode]) -> IndexInfo {
        if delayed.is_empty() {
            return self.clone();
        }
        self.union(&IndexInfo::empty(), delayed)
    }

    /// 交集。两侧精确时交给 `intersector`；两侧无界时保持无界；
    /// 其余情况取两侧非负计数中较小者，丢弃 UID。
    pub fn intersect(
        &self,
        other: &IndexInfo,
        delayed: &[QueryNode],
        intersector: &dyn UidIntersector,
    ) -> IndexInfo {
        let (count, uids) = if self.is_unbounded() && other.is_unbounded() {
            (UNBOUNDED, BTreeSet::new())
        } else if self.only_events() && other.only_events() {
            let uids = intersector.intersect(&self.uids, &other.uids, delayed);
            (uids.len() as i64, uids)
        } else {
            (bounded_min(self.count, other.count), BTreeSet::new())
        };

        let nodes = self
            .node
            .iter()
            .chain(other.node.iter())
            .chain(delayed.iter())
            .cloned();

        IndexInfo {
            count,
            uids,
            node: and_node(nodes),
            field_counts: min_counts(&self.field_counts, &other.field_counts),
            term_counts: min_counts(&self.term_counts, &other.term_counts),
        }
    }

    /// 只与延迟节点求交：每个 UID 的片段与延迟节点 AND。
    ///
    /// 非精确集合时返回 `None`，调用方不能据此声称有进展。
    pub fn intersect_delayed(&self, delayed: &[QueryNode]) -> Option<IndexInfo> {
        if !self.only_events() || self.is_unbounded() {
            return None;
        }
        let uids = self
            .uids
            .iter()
            .map(|m| match m.node() {
                Some(n) => {
                    let mut fragments: BTreeSet<QueryNode> = delayed.iter().cloned().collect();
                    fragments.insert(n);
                    IndexMatch::with_fragments(fragments, m.uid(), Combinator::And)
                }
                None => m.clone(),
            })
            .collect();
        let nodes = self.node.iter().chain(delayed.iter()).cloned();
        Some(IndexInfo {
            count: self.count,
            uids,
            node: and_node(nodes),
            field_counts: self.field_counts.clone(),
            term_counts: self.term_counts.clone(),
        })
    }
}

fn bounded_min(a: i64, b: i64) -> i64 {
    match (a < 0, b < 0) {
        (true, true) => UNBOUNDED,
        (true, false) => b,
        (false, true) => a,
        (false, false) => a.min(b),
    }
}

/// 顶层析取项去重后拼成 OR；未标记的 OR 节点拆开一层
fn union_node(a: Option<&QueryNode>, b: Option<&QueryNode>, delayed: &[QueryNode]) -> Option<QueryNode> {
    let mut disjuncts = Vec::new();
    for node in a.into_iter().chain(b) {
        match node {
            QueryNode::Or { children } => disjuncts.extend(children.iter().cloned()),
            other => disjuncts.push(other.clone()),
        }
    }
    disjuncts.extend(delayed.iter().cloned());
    let nodes = dedupe_prefer_deferred(disjuncts);
    if nodes.is_empty() {
        return None;
    }
    Some(QueryNode::or_unwrapped(nodes).flatten())
}

pub(crate) fn and_node<I: IntoIterator<Item = QueryNode>>(nodes: I) -> Option<QueryNode> {
    let nodes = dedupe_prefer_deferred(nodes);
    if nodes.is_empty() {
        return None;
    }
    Some(QueryNode::and(nodes).flatten())
}

fn sum_counts(a: &BTreeMap<String, i64>, b: &BTreeMap<String, i64>) -> BTreeMap<String, i64> {
    let mut out = a.clone();
    for (k, v) in b {
        *out.entry(k.clone()).or_insert(0) += v;
    }
    out
}

fn min_counts(a: &BTreeMap<String, i64>, b: &BTreeMap<String, i64>) -> BTreeMap<String, i64> {
    let mut out = a.clone();
    for (k, v) in b {
        out.entry(k.clone())
            .and_modify(|cur| *cur = bounded_min(*cur, *v))
            .or_insert(*v);
    }
    out
}

impl PartialEq for IndexInfo {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count && self.uids == other.uids
    }
}

impl Eq for IndexInfo {}

impl fmt::Display for IndexInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ \"count\": {} - {} }}", self.count, self.uids.len())
    }
}
