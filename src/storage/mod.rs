pub mod codec;
pub mod memory;

pub use codec::{CondensedUids, DecodeError, HitRecord, UidList};
pub use memory::{MemoryIndex, MemorySource};

/// qualifier 内 partition 与 datatype 之间的分隔符
pub const QUALIFIER_SEPARATOR: char = '\0';

/// 全局索引的一条 key：`row = term`、`family = field`、`qualifier = "partition\0datatype"`。
///
/// 排序按 (row, family, qualifier) 的字典序，与底层有序 KV 一致。
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexKey {
    pub row: String,
    pub family: String,
    pub qualifier: String,
}

impl IndexKey {
    pub fn new(term: &str, field: &str, partition: &str, datatype: &str) -> Self {
        Self {
            row: term.to_string(),
            family: field.to_string(),
            qualifier: format!("{}{}{}", partition, QUALIFIER_SEPARATOR, datatype),
        }
    }

    /// 只有 qualifier 前缀（用作区间边界）
    pub fn bound(term: &str, field: &str, qualifier: &str) -> Self {
        Self {
            row: term.to_string(),
            family: field.to_string(),
            qualifier: qualifier.to_string(),
        }
    }

    pub fn partition(&self) -> &str {
        match self.qualifier.find(QUALIFIER_SEPARATOR) {
            Some(i) => &self.qualifier[..i],
            None => &self.qualifier,
        }
    }

    pub fn datatype(&self) -> &str {
        match self.qualifier.find(QUALIFIER_SEPARATOR) {
            Some(i) => &self.qualifier[i + QUALIFIER_SEPARATOR.len_utf8()..],
            None => "",
        }
    }
}

/// 扫描区间；`end` 总是开区间
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRange {
    pub start: IndexKey,
    pub start_inclusive: bool,
    pub end: IndexKey,
}

impl ScanRange {
    pub fn new(start: IndexKey, start_inclusive: bool, end: IndexKey) -> Self {
        Self {
            start,
            start_inclusive,
            end,
        }
    }

    /// 开区间起点转成紧随其后的闭区间起点
    pub fn skip_key(self) -> Self {
        if self.start_inclusive {
            return self;
        }
        let mut start = self.start;
        start.qualifier.push(QUALIFIER_SEPARATOR);
        Self {
            start,
            start_inclusive: true,
            end: self.end,
        }
    }

    pub fn contains(&self, key: &IndexKey) -> bool {
        let after_start = if self.start_inclusive {
            key >= &self.start
        } else {
            key > &self.start
        };
        after_start && key < &self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// 有序原始条目源（底层 range-scan 客户端）
pub trait EntrySource: Send {
    /// 重新定位；之前未读完的条目被丢弃
    fn seek(&mut self, range: &ScanRange);

    fn next_entry(&mut self) -> Option<(IndexKey, Vec<u8>)>;
}

/// 按 (field, term) 打开条目源的工厂
pub trait IndexReader: Send + Sync {
    fn open(&self, field: &str, term: &str) -> Box<dyn EntrySource>;
}
