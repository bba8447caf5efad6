//! 分区键规则：`YYYYMMDD`（day）与 `YYYYMMDD_N`（shard）。
//!
//! 所有比较都是按字节的字典序；shard 后缀按字符串比较而不是整数，
//! 所以 `20190314_19` 排在 `20190314_2` 之前。

/// day 与 shard 之间的分隔符
pub const SHARD_SEPARATOR: char = '_';

/// day 前缀长度（YYYYMMDD）
pub const DAY_LEN: usize = 8;

pub fn is_day(key: &str) -> bool {
    !key.contains(SHARD_SEPARATOR)
}

pub fn is_shard(key: &str) -> bool {
    !is_day(key)
}

/// 带编号的 shard（`20190301_` 这种只有分隔符的不算）
pub fn is_full_shard(key: &str) -> bool {
    key.find(SHARD_SEPARATOR)
        .map_or(false, |i| i + SHARD_SEPARATOR.len_utf8() < key.len())
}

pub fn less_than(a: &str, b: &str) -> bool {
    a.as_bytes() < b.as_bytes()
}

pub fn greater_than_or_equal(a: &str, b: &str) -> bool {
    a.as_bytes() >= b.as_bytes()
}

/// 非对称匹配：等长时要求相等；不等长时较短者必须是 day 且是较长者的前缀。
pub fn matches(a: &str, b: &str) -> bool {
    if a.len() == b.len() {
        return a == b;
    }
    let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
    is_day(short) && long.starts_with(short)
}

/// shard 或 day 所属的 day
pub fn day_of(key: &str) -> &str {
    match key.find(SHARD_SEPARATOR) {
        Some(i) => &key[..i],
        None => key,
    }
}

/// `key` 已经位于 `target` 或其之后（day 命中 target 所在的 day 也算）
pub fn reached(key: &str, target: &str) -> bool {
    greater_than_or_equal(key, target) || (is_day(key) && matches(key, target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_suffix_is_compared_as_string() {
        assert!(less_than("20190314_19", "20190314_2"));
        assert!(!less_than("20190314_2", "20190314_19"));
        assert!(less_than("20190314", "20190314_0"));
        assert!(greater_than_or_equal("20190314_2", "20190314_19"));
    }

    #[test]
    fn day_and_shard_detection() {
        assert!(is_day("20190314"));
        assert!(!is_shard("20190314"));
        assert!(is_shard("20190314_0"));
        assert_eq!(day_of("20190314_11"), "20190314");
        assert_eq!(day_of("20190314"), "20190314");
        assert!(is_full_shard("20190314_0"));
        assert!(!is_full_shard("20190314_"));
        assert!(!is_full_shard("20190314"));
    }

    #[test]
    fn matching_is_asymmetric_on_granularity() {
        assert!(matches("20190101", "20190101_3"));
        assert!(matches("20190101_3", "20190101"));
        assert!(matches("20190101_3", "20190101_3"));
        assert!(!matches("20190101_3", "20190101_4"));
        assert!(!matches("20190102", "20190101_3"));
        // 不等长但较短者不是 day
        assert!(!matches("20190101_1", "20190101_10"));
        assert!(!matches("20190101", "20190102"));
    }

    #[test]
    fn reached_accepts_matching_day() {
        assert!(reached("20190303", "20190303_3"));
        assert!(reached("20190303_4", "20190303_3"));
        assert!(!reached("20190303_2", "20190303_3"));
        assert!(!reached("20190302", "20190303_3"));
    }
}
