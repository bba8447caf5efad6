use super::Tuple;
use crate::core::key::{day_of, is_day};
use crate::core::{IndexInfo, MarkerKind, QueryNode, UNBOUNDED};
use crate::storage::codec::{self, HitRecord, UidList};
use crate::storage::IndexKey;

/// 把一条原始索引条目解码成分区元组，并决定挂到每个匹配上的谓词。
///
/// day 级条目且没有 UID 明细时，谓词要包一层 `Delayed`，推迟到主表扫描时求值；
/// 以下两种情况例外，原样挂上：
/// - 节点已经带有延迟 / 阈值 / 索引空洞 / EvalOnly 标记
/// - 字段是 index-only（只能通过索引求值）
#[derive(Clone, Debug)]
pub struct EntryParser {
    node: QueryNode,
    field: String,
    term: String,
    signature: String,
    index_only: bool,
}

impl EntryParser {
    pub fn new(node: QueryNode, field: &str, term: &str, index_only: bool) -> Self {
        let signature = node.unwrap_marker().to_string();
        Self {
            node,
            field: field.to_string(),
            term: term.to_string(),
            signature,
            index_only,
        }
    }

    pub fn parse(&self, key: &IndexKey, value: &[u8]) -> Vec<Tuple> {
        let record = match codec::decode(value) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    "Dropping index entry {}:{} at {}: {}",
                    self.field,
                    self.term,
                    key.partition(),
                    e
                );
                return Vec::new();
            }
        };

        let partition = key.partition();
        match record {
            HitRecord::Uids(list) => vec![self.tuple(partition, list)],
            HitRecord::Condensed(condensed) if condensed.per_shard.is_empty() => {
                vec![self.tuple(partition, UidList::pruned(condensed.day_level_count))]
            }
            HitRecord::Condensed(condensed) => {
                let day = day_of(partition);
                condensed
                    .per_shard
                    .into_iter()
                    .filter(|(shard, _)| {
                        let same_day = day_of(shard) == day;
                        if !same_day {
                            tracing::warn!("Condensed shard {} does not belong to day {}", shard, day);
                        }
                        same_day
                    })
                    .map(|(shard, list)| self.tuple(&shard, list))
                    .collect()
            }
        }
    }

    fn tuple(&self, partition: &str, list: UidList) -> Tuple {
        let info = if list.count == UNBOUNDED {
            IndexInfo::unbounded()
        } else if list.pruned || list.uids.is_empty() {
            IndexInfo::from_count(list.count)
        } else {
            IndexInfo::from_uids(list.uids)
        };

        let node = if is_day(partition) && info.uids().is_empty() {
            self.day_node()
        } else {
            self.node.clone()
        };

        let count = info.count();
        let info = info
            .apply_node(node)
            .with_field_count(&self.field, count)
            .with_term_count(&self.signature, count);
        (partition.to_string(), info)
    }

    fn day_node(&self) -> QueryNode {
        let marked = self.node.defers_evaluation()
            || self.node.marker_kind() == Some(MarkerKind::EvalOnly);
        if marked || self.index_only {
            self.node.clone()
        } else {
            QueryNode::wrap(MarkerKind::Delayed, self.node.clone())
        }
    }
}
