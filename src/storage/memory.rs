use super::codec::{self, HitRecord, UidList};
use super::{EntrySource, IndexKey, IndexReader, ScanRange};
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

/// 内存中的全局索引（测试与 CLI 使用）
#[derive(Clone, Debug, Default)]
pub struct MemoryIndex {
    entries: Arc<BTreeMap<IndexKey, Vec<u8>>>,
}

/// fixture 行：`{term, field, shard, datatype, uids, count?, pruned?}`
#[derive(Debug, Deserialize)]
struct FixtureRow {
    term: String,
    field: String,
    shard: String,
    #[serde(default = "default_datatype")]
    datatype: String,
    #[serde(default)]
    uids: Vec<String>,
    count: Option<i64>,
    #[serde(default)]
    pruned: bool,
}

fn default_datatype() -> String {
    "default".to_string()
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_raw(&mut self, key: IndexKey, value: Vec<u8>) {
        Arc::make_mut(&mut self.entries).insert(key, value);
    }

    pub fn insert(
        &mut self,
        term: &str,
        field: &str,
        partition: &str,
        datatype: &str,
        record: &HitRecord,
    ) -> Result<(), codec::DecodeError> {
        let value = codec::encode(record)?;
        self.insert_raw(IndexKey::new(term, field, partition, datatype), value);
        Ok(())
    }

    /// 精确 UID 列表的简写
    pub fn insert_uids(
        &mut self,
        term: &str,
        field: &str,
        partition: &str,
        uids: &[&str],
    ) -> Result<(), codec::DecodeError> {
        let record = HitRecord::Uids(UidList::exact(uids.iter().copied()));
        self.insert(term, field, partition, "default", &record)
    }

    pub fn load_json_lines(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read index fixture {}", path.display()))?;
        Self::from_json_lines(&raw)
    }

    pub fn from_json_lines(raw: &str) -> anyhow::Result<Self> {
        let mut index = MemoryIndex::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let row: FixtureRow = serde_json::from_str(line)
                .with_context(|| format!("invalid fixture row at line {}", lineno + 1))?;
            let list = if row.pruned {
                UidList::pruned(row.count.unwrap_or(row.uids.len() as i64))
            } else {
                let count = row.count.unwrap_or(row.uids.len() as i64);
                UidList {
                    count,
                    pruned: false,
                    uids: row.uids,
                }
            };
            index.insert(
                &row.term,
                &row.field,
                &row.shard,
                &row.datatype,
                &HitRecord::Uids(list),
            )?;
        }
        tracing::debug!("Loaded {} index entries from fixture", index.len());
        Ok(index)
    }
}

impl IndexReader for MemoryIndex {
    fn open(&self, field: &str, term: &str) -> Box<dyn EntrySource> {
        Box::new(MemorySource {
            entries: Arc::clone(&self.entries),
            row: term.to_string(),
            family: field.to_string(),
            lower: None,
            end: None,
        })
    }
}

/// 单个 (term, field) 上的游标；seek 前不产出任何条目
pub struct MemorySource {
    entries: Arc<BTreeMap<IndexKey, Vec<u8>>>,
    row: String,
    family: String,
    lower: Option<Bound<IndexKey>>,
    end: Option<IndexKey>,
}

impl EntrySource for MemorySource {
    fn seek(&mut self, range: &ScanRange) {
        self.lower = Some(if range.start_inclusive {
            Bound::Included(range.start.clone())
        } else {
            Bound::Excluded(range.start.clone())
        });
        self.end = Some(range.end.clone());
    }

    fn next_entry(&mut self) -> Option<(IndexKey, Vec<u8>)> {
        let lower = self.lower.take()?;
        let end = self.end.clone()?;
        let empty = match &lower {
            Bound::Included(start) => start >= &end,
            Bound::Excluded(start) => start >= &end,
            Bound::Unbounded => false,
        };
        if empty {
            return None;
        }
        let (key, value) = self
            .entries
            .range((lower, Bound::Excluded(end)))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))?;
        if key.row != self.row || key.family != self.family {
            return None;
        }
        self.lower = Some(Bound::Excluded(key.clone()));
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut dyn EntrySource) -> Vec<String> {
        std::iter::from_fn(|| source.next_entry())
            .map(|(k, _)| k.partition().to_string())
            .collect()
    }

    fn sample() -> MemoryIndex {
        let mut index = MemoryIndex::new();
        for shard in ["20190301_0", "20190301_1", "20190302", "20190303_0"] {
            index.insert_uids("red", "COLOR", shard, &["doc1"]).unwrap();
        }
        index.insert_uids("blue", "COLOR", "20190301_0", &["doc2"]).unwrap();
        index
    }

    #[test]
    fn scans_one_term_in_key_order() {
        let index = sample();
        let mut source = index.open("COLOR", "red");
        assert!(source.next_entry().is_none());

        source.seek(&ScanRange::new(
            IndexKey::bound("red", "COLOR", "20190301"),
            true,
            IndexKey::bound("red", "COLOR", "20190302_\u{10FFFF}"),
        ));
        assert_eq!(drain(source.as_mut()), vec!["20190301_0", "20190301_1", "20190302"]);
    }

    #[test]
    fn exclusive_start_skips_the_last_key() {
        let index = sample();
        let mut source = index.open("COLOR", "red");
        source.seek(&ScanRange::new(
            IndexKey::new("red", "COLOR", "20190301_0", "default"),
            false,
            IndexKey::bound("red", "COLOR", "20190399"),
        ));
        assert_eq!(drain(source.as_mut()), vec!["20190301_1", "20190302", "20190303_0"]);
    }

    #[test]
    fn json_fixture_rows() {
        let raw = r#"
# comment
{"term":"red","field":"COLOR","shard":"20190301_0","uids":["doc1","doc2"]}
{"term":"red","field":"COLOR","shard":"20190302","count":9000,"pruned":true}
"#;
        let index = MemoryIndex::from_json_lines(raw).unwrap();
        assert_eq!(index.len(), 2);

        let value = index
            .entries
            .get(&IndexKey::new("red", "COLOR", "20190302", "default"))
            .unwrap();
        assert_eq!(
            codec::decode(value).unwrap(),
            HitRecord::Uids(UidList::pruned(9000))
        );
        assert!(MemoryIndex::from_json_lines("{not json}").is_err());
    }
}
