use crate::core::{AncestorUidIntersector, DefaultUidIntersector, UidIntersector};
use crate::error::PlanError;
use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 分区键里 day 的格式
pub const DAY_FORMAT: &str = "%Y%m%d";

/// 规划模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    #[default]
    Full,
    /// 只允许 AND/OR 与等值叶子
    EqualitiesOnly,
}

impl fmt::Display for PlanningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanningMode::Full => f.write_str("full"),
            PlanningMode::EqualitiesOnly => f.write_str("equalities_only"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntersectorKind {
    #[default]
    Default,
    Ancestor,
}

impl IntersectorKind {
    pub fn build(self) -> Arc<dyn UidIntersector> {
        match self {
            IntersectorKind::Default => Arc::new(DefaultUidIntersector),
            IntersectorKind::Ancestor => Arc::new(AncestorUidIntersector),
        }
    }
}

/// 表/列元数据（预先计算好的字段集合）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMetadata {
    pub indexed: BTreeSet<String>,
    pub index_only: BTreeSet<String>,
    /// 存在于数据中但未必建了索引的字段
    pub known: BTreeSet<String>,
}

impl FieldMetadata {
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexed.contains(field) || self.index_only.contains(field)
    }

    pub fn is_index_only(&self, field: &str) -> bool {
        self.index_only.contains(field)
    }

    pub fn is_known(&self, field: &str) -> bool {
        self.known.contains(field) || self.is_indexed(field)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    pub num_index_lookup_threads: usize,
    pub max_depth_threshold: usize,
    pub begin_date: String,
    pub end_date: String,
    pub max_index_batch_size: usize,
    pub can_handle_exceeded_value_threshold: bool,
    pub planning_mode: PlanningMode,
    pub poll_interval_ms: u64,
    pub uid_intersector: IntersectorKind,
    /// 只保留这些 datatype 的索引条目；为空表示不过滤
    pub datatypes: BTreeSet<String>,
    pub fields: FieldMetadata,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            num_index_lookup_threads: 8,
            max_depth_threshold: 256,
            begin_date: "20000101".to_string(),
            end_date: "20991231".to_string(),
            max_index_batch_size: 1000,
            can_handle_exceeded_value_threshold: true,
            planning_mode: PlanningMode::Full,
            poll_interval_ms: 1,
            uid_intersector: IntersectorKind::Default,
            datatypes: BTreeSet::new(),
            fields: FieldMetadata::default(),
        }
    }
}

impl LookupConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: LookupConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let begin = parse_day(&self.begin_date)?;
        let end = parse_day(&self.end_date)?;
        anyhow::ensure!(
            begin <= end,
            "begin_date {} is after end_date {}",
            self.begin_date,
            self.end_date
        );
        anyhow::ensure!(self.max_index_batch_size > 0, "max_index_batch_size must be positive");
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        anyhow::ensure!(self.max_depth_threshold > 0, "max_depth_threshold must be positive");
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// 解析 YYYYMMDD
pub fn parse_day(value: &str) -> Result<NaiveDate, PlanError> {
    NaiveDate::parse_from_str(value, DAY_FORMAT).map_err(|e| PlanError::InvalidDate {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("gindex-lookup-config-{}-{}", tag, nanos))
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let dir = unique_tmp_dir("partial");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lookup.toml");
        std::fs::write(
            &path,
            r#"
num_index_lookup_threads = 4
begin_date = "20190301"
end_date = "20190310"
planning_mode = "equalities_only"
uid_intersector = "ancestor"
datatypes = ["csv", "json"]

[fields]
indexed = ["COLOR", "SHAPE"]
index_only = ["BODY"]
known = ["SIZE"]
"#,
        )
        .unwrap();

        let config = LookupConfig::load(&path).unwrap();
        assert_eq!(config.num_index_lookup_threads, 4);
        assert_eq!(config.planning_mode, PlanningMode::EqualitiesOnly);
        assert_eq!(config.uid_intersector, IntersectorKind::Ancestor);
        assert_eq!(config.max_index_batch_size, 1000);
        assert_eq!(config.datatypes.len(), 2);
        assert!(config.datatypes.contains("csv"));
        assert!(config.fields.is_indexed("BODY"));
        assert!(config.fields.is_index_only("BODY"));
        assert!(config.fields.is_known("SIZE"));
        assert!(!config.fields.is_indexed("SIZE"));
        assert!(!config.fields.is_known("WEIGHT"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_inverted_or_malformed_dates() {
        let config = LookupConfig {
            begin_date: "20190310".to_string(),
            end_date: "20190301".to_string(),
            ..LookupConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LookupConfig {
            begin_date: "2019-03-01".to_string(),
            ..LookupConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(LookupConfig::default().validate().is_ok());
    }

    #[test]
    fn parse_day_reports_invalid_date() {
        let err = parse_day("20190230").unwrap_err();
        assert_eq!(err.code(), "INVALID_DATE");
        assert_eq!(
            parse_day("20190228").unwrap(),
            NaiveDate::from_ymd_opt(2019, 2, 28).unwrap()
        );
    }
}
