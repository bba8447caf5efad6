use crate::core::index_match::{Combinator, IndexMatch};
use crate::core::node::QueryNode;
use std::collections::{BTreeMap, BTreeSet};

/// 两个精确 UID 集合求交的策略
pub trait UidIntersector: Send + Sync {
    fn intersect(
        &self,
        left: &BTreeSet<IndexMatch>,
        right: &BTreeSet<IndexMatch>,
        delayed: &[QueryNode],
    ) -> BTreeSet<IndexMatch>;
}

/// 默认策略：只保留两侧都出现的 UID，片段与延迟节点 AND 组合
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultUidIntersector;

impl UidIntersector for DefaultUidIntersector {
    fn intersect(
        &self,
        left: &BTreeSet<IndexMatch>,
        right: &BTreeSet<IndexMatch>,
        delayed: &[QueryNode],
    ) -> BTreeSet<IndexMatch> {
        let mut out = BTreeSet::new();
        for m in left {
            if let Some(other) = right.get(m) {
                out.insert(IndexMatch::with_fragments(
                    fragments_of(m, other, delayed),
                    m.uid(),
                    Combinator::And,
                ));
            }
        }
        out
    }
}

/// 层级文档（`doc1` 是 `doc1.1` 的祖先）的求交策略。
///
/// 一侧的祖先与另一侧的后代在祖先 uid 上相交；结果按谓词签名分组，
/// 同组内祖先与后代同时存在时只保留祖先。
#[derive(Clone, Copy, Debug, Default)]
pub struct AncestorUidIntersector;

impl UidIntersector for AncestorUidIntersector {
    fn intersect(
        &self,
        left: &BTreeSet<IndexMatch>,
        right: &BTreeSet<IndexMatch>,
        delayed: &[QueryNode],
    ) -> BTreeSet<IndexMatch> {
        let mut merged: BTreeMap<String, BTreeSet<QueryNode>> = BTreeMap::new();
        let mut pair = |uid: &str, a: &IndexMatch, b: &IndexMatch| {
            merged
                .entry(uid.to_string())
                .or_default()
                .extend(fragments_of(a, b, delayed));
        };

        for m in left {
            if let Some(other) = right.get(m) {
                pair(m.uid(), m, other);
            }
            for other in descendants(right, m.uid()) {
                pair(m.uid(), m, other);
            }
            for ancestor in ancestors(m.uid()) {
                if let Some(other) = right.get(&IndexMatch::new(ancestor)) {
                    pair(ancestor, m, other);
                }
            }
        }

        let matches = merged
            .into_iter()
            .map(|(uid, fragments)| IndexMatch::with_fragments(fragments, uid, Combinator::And))
            .collect();
        dedupe_ancestors(matches)
    }
}

/// 同一谓词签名下，祖先存在时去掉它的所有后代
pub fn dedupe_ancestors(matches: BTreeSet<IndexMatch>) -> BTreeSet<IndexMatch> {
    let mut groups: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for m in &matches {
        let signature = m.node().map(|n| n.to_string()).unwrap_or_default();
        groups.entry(signature).or_default().insert(m.uid().to_string());
    }

    matches
        .into_iter()
        .filter(|m| {
            let signature = m.node().map(|n| n.to_string()).unwrap_or_default();
            let Some(group) = groups.get(&signature) else {
                return true;
            };
            !ancestors(m.uid()).any(|a| group.contains(a))
        })
        .collect()
}

pub fn is_ancestor(ancestor: &str, uid: &str) -> bool {
    uid.len() > ancestor.len()
        && uid.starts_with(ancestor)
        && uid.as_bytes()[ancestor.len()] == b'.'
}

/// `a.b.c` 的祖先：`a.b`、`a`
fn ancestors(uid: &str) -> impl Iterator<Item = &str> {
    uid.char_indices()
        .filter(|(_, c)| *c == '.')
        .map(move |(i, _)| &uid[..i])
}

/// `uid.` 开头的所有元素落在 [`uid.`, `uid/`) 区间内
fn descendants<'a>(set: &'a BTreeSet<IndexMatch>, uid: &str) -> impl Iterator<Item = &'a IndexMatch> {
    let lo = IndexMatch::new(format!("{}.", uid));
    let hi = IndexMatch::new(format!("{}/", uid));
    set.range(lo..hi)
}

fn fragments_of(a: &IndexMatch, b: &IndexMatch, delayed: &[QueryNode]) -> BTreeSet<QueryNode> {
    let mut fragments: BTreeSet<QueryNode> = delayed.iter().cloned().collect();
    fragments.extend(a.node());
    fragments.extend(b.node());
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(node: &QueryNode, uids: &[&str]) -> BTreeSet<IndexMatch> {
        uids.iter()
            .map(|u| IndexMatch::with_node(*u, node.clone()))
            .collect()
    }

    fn uids(set: &BTreeSet<IndexMatch>) -> Vec<&str> {
        set.iter().map(IndexMatch::uid).collect()
    }

    #[test]
    fn default_drops_one_sided_uids() {
        let a = QueryNode::eq_term("A", "1");
        let b = QueryNode::eq_term("B", "2");
        let delayed = QueryNode::eq_term("D", "3");
        let out = DefaultUidIntersector.intersect(
            &matches(&a, &["uidA", "uidB", "uidC"]),
            &matches(&b, &["uidB", "uidC", "uidD"]),
            std::slice::from_ref(&delayed),
        );
        assert_eq!(uids(&out), vec!["uidB", "uidC"]);
        for m in &out {
            assert_eq!(m.fragments().len(), 3);
            assert!(m.fragments().contains(&delayed));
        }
    }

    #[test]
    fn ancestry_detection() {
        assert!(is_ancestor("doc1", "doc1.1"));
        assert!(is_ancestor("doc1", "doc1.1.4"));
        assert!(!is_ancestor("doc1", "doc10"));
        assert!(!is_ancestor("doc1", "doc1"));
        assert_eq!(ancestors("a.b.c").collect::<Vec<_>>(), vec!["a", "a.b"]);
    }

    #[test]
    fn dedupe_keeps_the_ancestor_only() {
        let node = QueryNode::eq_term("A", "1");
        let set = matches(&node, &["doc1", "doc1.1"]);
        let out = dedupe_ancestors(set);
        assert_eq!(uids(&out), vec!["doc1"]);
    }

    #[test]
    fn dedupe_respects_signatures() {
        let mut set = matches(&QueryNode::eq_term("A", "1"), &["doc1"]);
        set.extend(matches(&QueryNode::eq_term("B", "2"), &["doc1.1"]));
        assert_eq!(dedupe_ancestors(set).len(), 2);
    }

    #[test]
    fn ancestor_intersection_collapses_onto_ancestor() {
        let a = QueryNode::eq_term("A", "1");
        let b = QueryNode::eq_term("B", "2");
        let out = AncestorUidIntersector.intersect(
            &matches(&a, &["doc1", "doc1.1", "doc2"]),
            &matches(&b, &["doc1.1", "doc3.2"]),
            &[],
        );
        assert_eq!(uids(&out), vec!["doc1"]);
        let only = out.iter().next().expect("doc1");
        assert!(only.fragments().contains(&a));
        assert!(only.fragments().contains(&b));
    }

    #[test]
    fn ancestor_on_right_side_matches_left_descendant() {
        let a = QueryNode::eq_term("A", "1");
        let b = QueryNode::eq_term("B", "2");
        let out = AncestorUidIntersector.intersect(
            &matches(&a, &["doc4.2.1"]),
            &matches(&b, &["doc4"]),
            &[],
        );
        assert_eq!(uids(&out), vec!["doc4"]);
    }
}
