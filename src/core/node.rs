use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 任意字段（未展开的 _ANYFIELD_）
pub const ANY_FIELD: &str = "_ANYFIELD_";
/// 无字段
pub const NO_FIELD: &str = "_NOFIELD_";
/// 数据类型伪字段，不能走全局索引
pub const DEFAULT_DATATYPE_FIELD: &str = "EVENT_DATATYPE";
/// shard/day 提示赋值的变量名
pub const SHARD_DAY_HINT: &str = "SHARDS_AND_DAYS";

/// 叶子比较运算
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Er,
    Nr,
}

impl TermOp {
    fn symbol(self) -> &'static str {
        match self {
            TermOp::Eq => "==",
            TermOp::Ne => "!=",
            TermOp::Lt => "<",
            TermOp::Gt => ">",
            TermOp::Le => "<=",
            TermOp::Ge => ">=",
            TermOp::Er => "=~",
            TermOp::Nr => "!~",
        }
    }
}

/// 查询属性标记（包在源节点外层）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Delayed,
    EvalOnly,
    ExceededTermThreshold,
    ExceededValueThreshold,
    IndexHole,
    BoundedRange,
}

impl MarkerKind {
    pub fn label(self) -> &'static str {
        match self {
            MarkerKind::Delayed => "_Delayed_",
            MarkerKind::EvalOnly => "_Eval_",
            MarkerKind::ExceededTermThreshold => "_Term_",
            MarkerKind::ExceededValueThreshold => "_Value_",
            MarkerKind::IndexHole => "_Hole_",
            MarkerKind::BoundedRange => "_Bounded_",
        }
    }

    /// 延迟 / 阈值 / 索引空洞：求值推迟到主表扫描
    pub fn defers_evaluation(self) -> bool {
        matches!(
            self,
            MarkerKind::Delayed
                | MarkerKind::ExceededTermThreshold
                | MarkerKind::ExceededValueThreshold
                | MarkerKind::IndexHole
        )
    }
}

/// 已解析的谓词树（封闭节点集合）
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryNode {
    And {
        children: Vec<QueryNode>,
    },
    Or {
        children: Vec<QueryNode>,
    },
    Not {
        child: Box<QueryNode>,
    },
    Term {
        op: TermOp,
        field: String,
        value: Option<String>,
    },
    Function {
        namespace: String,
        name: String,
        #[serde(default)]
        args: Vec<String>,
    },
    True,
    False,
    /// 括号 / 脚本包装：只允许一个子节点
    Group {
        children: Vec<QueryNode>,
    },
    Marker {
        kind: MarkerKind,
        source: Box<QueryNode>,
    },
    Assignment {
        name: String,
        value: String,
    },
}

impl QueryNode {
    pub fn eq_term(field: &str, value: &str) -> Self {
        Self::term(TermOp::Eq, field, value)
    }

    pub fn term(op: TermOp, field: &str, value: &str) -> Self {
        QueryNode::Term {
            op,
            field: field.to_string(),
            value: Some(value.to_string()),
        }
    }

    /// AND 构造：单个子节点直接返回
    pub fn and<I: IntoIterator<Item = QueryNode>>(nodes: I) -> Self {
        let mut children: Vec<QueryNode> = nodes.into_iter().collect();
        if children.len() == 1 {
            return children.remove(0);
        }
        QueryNode::And { children }
    }

    pub fn or<I: IntoIterator<Item = QueryNode>>(nodes: I) -> Self {
        let mut children: Vec<QueryNode> = nodes.into_iter().collect();
        if children.len() == 1 {
            return children.remove(0);
        }
        QueryNode::Or { children }
    }

    /// OR 构造，同时把子 OR 拆开一层，避免重复 union 时层层嵌套
    pub fn or_unwrapped<I: IntoIterator<Item = QueryNode>>(nodes: I) -> Self {
        let mut children = Vec::new();
        for node in nodes {
            match node {
                QueryNode::Or { children: inner } => children.extend(inner),
                other => children.push(other),
            }
        }
        Self::or(children)
    }

    pub fn wrap(kind: MarkerKind, node: QueryNode) -> Self {
        QueryNode::Marker {
            kind,
            source: Box::new(node),
        }
    }

    pub fn not(node: QueryNode) -> Self {
        QueryNode::Not {
            child: Box::new(node),
        }
    }

    pub fn children(&self) -> &[QueryNode] {
        match self {
            QueryNode::And { children } | QueryNode::Or { children } | QueryNode::Group { children } => {
                children
            }
            QueryNode::Not { child } => std::slice::from_ref(child.as_ref()),
            QueryNode::Marker { source, .. } => std::slice::from_ref(source.as_ref()),
            _ => &[],
        }
    }

    /// `field op literal` 形式的叶子
    pub fn is_leaf_field_value(&self) -> bool {
        matches!(self, QueryNode::Term { .. })
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            QueryNode::Term { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn marker_kind(&self) -> Option<MarkerKind> {
        match self {
            QueryNode::Marker { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_delayed(&self) -> bool {
        self.marker_kind() == Some(MarkerKind::Delayed)
    }

    pub fn is_index_hole(&self) -> bool {
        self.marker_kind() == Some(MarkerKind::IndexHole)
    }

    pub fn is_exceeded_term_threshold(&self) -> bool {
        self.marker_kind() == Some(MarkerKind::ExceededTermThreshold)
    }

    pub fn is_exceeded_value_threshold(&self) -> bool {
        self.marker_kind() == Some(MarkerKind::ExceededValueThreshold)
    }

    /// 已被延迟 / 阈值 / 索引空洞标记包裹
    pub fn defers_evaluation(&self) -> bool {
        self.marker_kind().map_or(false, MarkerKind::defers_evaluation)
    }

    /// 剥掉所有外层标记，返回源节点
    pub fn unwrap_marker(&self) -> &QueryNode {
        let mut node = self;
        while let QueryNode::Marker { source, .. } = node {
            node = source;
        }
        node
    }

    /// 源节点签名的 xxh3 哈希（用于合并时去重）
    pub fn source_hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.unwrap_marker().to_string().as_bytes())
    }

    /// 树深度，叶子为 1
    pub fn depth(&self) -> usize {
        1 + self.children().iter().map(QueryNode::depth).max().unwrap_or(0)
    }

    /// 收集树中出现的所有字段名
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Some(field) = self.field() {
            out.push(field);
        }
        for child in self.children() {
            child.collect_fields(out);
        }
    }

    /// 合并同类嵌套的 AND/OR，并折叠单子节点的 AND/OR
    pub fn flatten(self) -> QueryNode {
        match self {
            QueryNode::And { children } => {
                let mut flat = Vec::with_capacity(children.len());
                for child in children {
                    match child.flatten() {
                        QueryNode::And { children: inner } => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                QueryNode::and(flat)
            }
            QueryNode::Or { children } => {
                let mut flat = Vec::with_capacity(children.len());
                for child in children {
                    match child.flatten() {
                        QueryNode::Or { children: inner } => flat.extend(inner),
                        other => flat.push(other),
                    }
                }
                QueryNode::or(flat)
            }
            QueryNode::Not { child } => QueryNode::not(child.flatten()),
            QueryNode::Group { children } => QueryNode::Group {
                children: children.into_iter().map(QueryNode::flatten).collect(),
            },
            QueryNode::Marker { kind, source } => QueryNode::wrap(kind, source.flatten()),
            other => other,
        }
    }
}

/// 按源节点签名去重；同一签名出现多次时优先保留带延迟标记的版本。
pub fn dedupe_prefer_deferred<I: IntoIterator<Item = QueryNode>>(nodes: I) -> Vec<QueryNode> {
    let mut by_source: BTreeMap<u64, QueryNode> = BTreeMap::new();
    for node in nodes {
        let hash = node.source_hash();
        match by_source.get(&hash) {
            Some(existing) if existing.defers_evaluation() || !node.defers_evaluation() => {}
            _ => {
                by_source.insert(hash, node);
            }
        }
    }
    let mut out: Vec<QueryNode> = by_source.into_values().collect();
    out.sort();
    out
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[QueryNode], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            write!(f, " {} ", sep)?;
        }
        write!(f, "{}", child)?;
    }
    write!(f, ")")
}

impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryNode::And { children } => write_joined(f, children, "&&"),
            QueryNode::Or { children } => write_joined(f, children, "||"),
            QueryNode::Not { child } => write!(f, "!({})", child),
            QueryNode::Term { op, field, value } => match value {
                Some(v) => write!(f, "{} {} '{}'", field, op.symbol(), v),
                None => write!(f, "{} {} null", field, op.symbol()),
            },
            QueryNode::Function {
                namespace,
                name,
                args,
            } => write!(f, "{}:{}({})", namespace, name, args.join(", ")),
            QueryNode::True => write!(f, "true"),
            QueryNode::False => write!(f, "false"),
            QueryNode::Group { children } => write_joined(f, children, ";"),
            QueryNode::Marker { kind, source } => {
                write!(f, "(({} = true) && ({}))", kind.label(), source)
            }
            QueryNode::Assignment { name, value } => write!(f, "({} = '{}')", name, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_renders_jexl_like_text() {
        let node = QueryNode::and(vec![
            QueryNode::eq_term("FOO", "bar"),
            QueryNode::wrap(MarkerKind::Delayed, QueryNode::eq_term("BAZ", "qux")),
        ]);
        assert_eq!(
            node.to_string(),
            "(FOO == 'bar' && ((_Delayed_ = true) && (BAZ == 'qux')))"
        );
    }

    #[test]
    fn flatten_merges_nested_same_kind() {
        let node = QueryNode::And {
            children: vec![
                QueryNode::eq_term("A", "1"),
                QueryNode::And {
                    children: vec![QueryNode::eq_term("B", "2"), QueryNode::eq_term("C", "3")],
                },
                QueryNode::Or {
                    children: vec![QueryNode::eq_term("D", "4")],
                },
            ],
        }
        .flatten();
        assert_eq!(node.children().len(), 4);
        assert_eq!(node.to_string(), "(A == '1' && B == '2' && C == '3' && D == '4')");
    }

    #[test]
    fn or_unwrapped_splices_one_level() {
        let inner = QueryNode::or(vec![QueryNode::eq_term("A", "1"), QueryNode::eq_term("B", "2")]);
        let node = QueryNode::or_unwrapped(vec![inner, QueryNode::eq_term("C", "3")]);
        assert_eq!(node.children().len(), 3);
    }

    #[test]
    fn unwrap_marker_reaches_source() {
        let source = QueryNode::eq_term("A", "1");
        let node = QueryNode::wrap(
            MarkerKind::Delayed,
            QueryNode::wrap(MarkerKind::IndexHole, source.clone()),
        );
        assert!(node.is_delayed());
        assert!(node.defers_evaluation());
        assert_eq!(node.unwrap_marker(), &source);
        assert_eq!(node.source_hash(), source.source_hash());
    }

    #[test]
    fn dedupe_keeps_deferred_version() {
        let plain = QueryNode::eq_term("A", "1");
        let delayed = QueryNode::wrap(MarkerKind::Delayed, plain.clone());
        let out = dedupe_prefer_deferred(vec![plain.clone(), delayed.clone(), QueryNode::eq_term("B", "2")]);
        assert_eq!(out.len(), 2);
        assert!(out.contains(&delayed));
        assert!(!out.contains(&plain));
    }

    #[test]
    fn depth_and_fields() {
        let node = QueryNode::and(vec![
            QueryNode::eq_term("A", "1"),
            QueryNode::or(vec![QueryNode::eq_term("B", "2"), QueryNode::not(QueryNode::eq_term("C", "3"))]),
        ]);
        assert_eq!(node.depth(), 4);
        assert_eq!(node.fields(), vec!["A", "B", "C"]);
    }

    #[test]
    fn nodes_round_trip_through_json() {
        let json = r#"{"type":"and","children":[
            {"type":"term","op":"eq","field":"A","value":"1"},
            {"type":"marker","kind":"exceeded_value_threshold","source":{"type":"term","op":"er","field":"B","value":"x.*"}}
        ]}"#;
        let node: QueryNode = serde_json::from_str(json).expect("parse");
        assert_eq!(node.children().len(), 2);
        assert!(node.children()[1].is_exceeded_value_threshold());
    }
}
