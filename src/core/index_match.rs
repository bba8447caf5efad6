use crate::core::node::QueryNode;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// 片段之间的组合方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Combinator {
    And,
    Or,
}

/// 一个 UID 以及命中它的谓词片段。
///
/// 排序与相等只看 `uid`：有序容器里同 uid 的匹配会合并，
/// 后续合并步骤据此把片段聚到同一个 uid 上。
#[derive(Clone, Debug)]
pub struct IndexMatch {
    uid: String,
    fragments: BTreeSet<QueryNode>,
    combinator: Combinator,
}

impl IndexMatch {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            fragments: BTreeSet::new(),
            combinator: Combinator::Or,
        }
    }

    pub fn with_node(uid: impl Into<String>, node: QueryNode) -> Self {
        let mut fragments = BTreeSet::new();
        fragments.insert(node);
        Self {
            uid: uid.into(),
            fragments,
            combinator: Combinator::Or,
        }
    }

    pub fn with_fragments(
        fragments: BTreeSet<QueryNode>,
        uid: impl Into<String>,
        combinator: Combinator,
    ) -> Self {
        Self {
            uid: uid.into(),
            fragments,
            combinator,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn fragments(&self) -> &BTreeSet<QueryNode> {
        &self.fragments
    }

    pub fn combinator(&self) -> Combinator {
        self.combinator
    }

    /// 追加一个片段，返回新值
    pub fn with_added(&self, node: QueryNode) -> Self {
        let mut fragments = self.fragments.clone();
        fragments.insert(node);
        Self {
            uid: self.uid.clone(),
            fragments,
            combinator: self.combinator,
        }
    }

    /// 片段按组合方式拼成的谓词
    pub fn node(&self) -> Option<QueryNode> {
        match self.fragments.len() {
            0 => None,
            1 => self.fragments.iter().next().cloned(),
            _ => {
                let children = self.fragments.iter().cloned();
                let node = match self.combinator {
                    Combinator::And => QueryNode::and(children),
                    Combinator::Or => QueryNode::or(children),
                };
                Some(node.flatten())
            }
        }
    }
}

impl PartialEq for IndexMatch {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for IndexMatch {}

impl PartialOrd for IndexMatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexMatch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.uid.cmp(&other.uid)
    }
}

impl fmt::Display for IndexMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            Some(node) => write!(f, "{} - {}", self.uid, node),
            None => write!(f, "{}", self.uid),
        }
    }
}
