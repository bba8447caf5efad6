//! 全局索引 value 的 wire format。
//!
//! 两种记录共用一个枚举标签：
//! - `Uids`：普通命中列表 `{count, pruned, uids}`
//! - `Condensed`：服务端按 day 聚合后的 `{per_shard, day_level_count}`
//!
//! 编码使用 bincode `DefaultOptions`（varint、小端、序列带长度前缀、拒绝尾随字节）。

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidList {
    /// 精确计数；-1 表示无界
    pub count: i64,
    /// 服务端超过阈值后丢弃了 UID，只剩计数
    pub pruned: bool,
    pub uids: Vec<String>,
}

impl UidList {
    pub fn exact<I, S>(uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let uids: Vec<String> = uids.into_iter().map(Into::into).collect();
        Self {
            count: uids.len() as i64,
            pruned: false,
            uids,
        }
    }

    pub fn pruned(count: i64) -> Self {
        Self {
            count,
            pruned: true,
            uids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CondensedUids {
    pub per_shard: BTreeMap<String, UidList>,
    pub day_level_count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitRecord {
    Uids(UidList),
    Condensed(CondensedUids),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty hit record")]
    Empty,
    #[error("malformed hit record: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("invalid count {0}")]
    InvalidCount(i64),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
}

pub fn encode(record: &HitRecord) -> Result<Vec<u8>, DecodeError> {
    Ok(options().serialize(record)?)
}

pub fn decode(bytes: &[u8]) -> Result<HitRecord, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let record: HitRecord = options().deserialize(bytes)?;
    let counts: Vec<i64> = match &record {
        HitRecord::Uids(list) => vec![list.count],
        HitRecord::Condensed(c) => std::iter::once(c.day_level_count)
            .chain(c.per_shard.values().map(|l| l.count))
            .collect(),
    };
    if let Some(bad) = counts.into_iter().find(|c| *c < -1) {
        return Err(DecodeError::InvalidCount(bad));
    }
    Ok(record)
}
