use super::entry_parser::EntryParser;
use super::{IndexStream, StreamKind, Tuple};
use crate::core::key::{day_of, reached};
use crate::core::{IndexInfo, QueryNode, StreamContext};
use crate::storage::{EntrySource, IndexKey, ScanRange};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// 叶子流的数据来源
pub trait TupleSource: Send {
    fn next_tuple(&mut self) -> Option<Tuple>;

    /// 定位到 `target` 附近；之后产出的 key 仍需调用方按 `reached` 过滤
    fn seek(&mut self, target: &str);
}

/// 内存中的有序元组列表（提示列表、全字段扫描列表、测试）
#[derive(Debug, Default)]
pub struct TupleList {
    tuples: VecDeque<Tuple>,
}

impl TupleList {
    pub fn new<I: IntoIterator<Item = Tuple>>(tuples: I) -> Self {
        Self {
            tuples: tuples.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl TupleSource for TupleList {
    fn next_tuple(&mut self) -> Option<Tuple> {
        self.tuples.pop_front()
    }

    fn seek(&mut self, target: &str) {
        while let Some((key, _)) = self.tuples.front() {
            if reached(key, target) {
                break;
            }
            self.tuples.pop_front();
        }
    }
}

/// 全局索引上的分批扫描。
///
/// 每批最多读 `batch_size` 条，下一批从上一批最后一个 key 之后重新 seek。
/// 同一天的条目一次性读入，同分区（不同 datatype）的结果用 union 合并。
/// 设置了 datatype 白名单时，其他 datatype 的条目直接跳过。
pub struct IndexScan {
    source: Box<dyn EntrySource>,
    parser: EntryParser,
    datatypes: BTreeSet<String>,
    range: ScanRange,
    batch_size: usize,
    read_in_batch: usize,
    last_key: Option<IndexKey>,
    lookahead: Option<(IndexKey, Vec<u8>)>,
    buffer: VecDeque<Tuple>,
    loaded_day: Option<String>,
    exhausted: bool,
}

impl IndexScan {
    pub fn new(
        mut source: Box<dyn EntrySource>,
        parser: EntryParser,
        range: ScanRange,
        batch_size: usize,
    ) -> Self {
        source.seek(&range);
        Self {
            source,
            parser,
            datatypes: BTreeSet::new(),
            range,
            batch_size: batch_size.max(1),
            read_in_batch: 0,
            last_key: None,
            lookahead: None,
            buffer: VecDeque::new(),
            loaded_day: None,
            exhausted: false,
        }
    }

    pub fn with_datatypes(mut self, datatypes: BTreeSet<String>) -> Self {
        self.datatypes = datatypes;
        self
    }

    fn pull_entry(&mut self) -> Option<(IndexKey, Vec<u8>)> {
        if let Some(entry) = self.lookahead.take() {
            return Some(entry);
        }
        if self.exhausted {
            return None;
        }
        if self.read_in_batch >= self.batch_size {
            if let Some(last) = &self.last_key {
                let resume = ScanRange::new(last.clone(), false, self.range.end.clone()).skip_key();
                tracing::trace!("Resuming index scan after {:?}", last);
                self.source.seek(&resume);
            }
            self.read_in_batch = 0;
        }
        match self.source.next_entry() {
            Some(entry) => {
                self.read_in_batch += 1;
                self.last_key = Some(entry.0.clone());
                Some(entry)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    /// 读入下一天的全部条目；源耗尽时返回 false
    fn fill_day(&mut self) -> bool {
        let Some(first) = self.pull_entry() else {
            return false;
        };
        let day = day_of(first.0.partition()).to_string();
        let mut by_key: BTreeMap<String, IndexInfo> = BTreeMap::new();
        self.absorb(&first, &mut by_key);

        while let Some(entry) = self.pull_entry() {
            if day_of(entry.0.partition()) != day {
                self.lookahead = Some(entry);
                break;
            }
            self.absorb(&entry, &mut by_key);
        }

        self.loaded_day = Some(day);
        self.buffer.extend(by_key);
        true
    }

    fn absorb(&self, entry: &(IndexKey, Vec<u8>), by_key: &mut BTreeMap<String, IndexInfo>) {
        if !self.datatypes.is_empty() && !self.datatypes.contains(entry.0.datatype()) {
            tracing::trace!("Skipping {} entry at {}", entry.0.datatype(), entry.0.partition());
            return;
        }
        for (key, info) in self.parser.parse(&entry.0, &entry.1) {
            let merged = match by_key.remove(&key) {
                Some(existing) => existing.union(&info, &[]),
                None => info,
            };
            by_key.insert(key, merged);
        }
    }
}

impl TupleSource for IndexScan {
    fn next_tuple(&mut self) -> Option<Tuple> {
        while self.buffer.is_empty() {
            if !self.fill_day() {
                return None;
            }
        }
        self.buffer.pop_front()
    }

    fn seek(&mut self, target: &str) {
        while let Some((key, _)) = self.buffer.front() {
            if reached(key, target) {
                return;
            }
            self.buffer.pop_front();
        }

        let target_day = day_of(target);
        let beyond_loaded = self
            .loaded_day
            .as_deref()
            .map_or(true, |loaded| target_day > loaded);
        if !beyond_loaded {
            return;
        }

        let start = IndexKey::bound(&self.range.start.row, &self.range.start.family, target_day);
        if start <= self.range.start {
            return;
        }
        tracing::trace!("Re-seeking index scan {} to day {}", self.range.start.row, target_day);
        self.lookahead = None;
        self.exhausted = false;
        self.read_in_batch = 0;
        self.source.seek(&ScanRange::new(start, true, self.range.end.clone()));
    }
}

/// 叶子流：包装一个元组源，或只携带上下文的空流
pub struct ScannerStream {
    source: Box<dyn TupleSource>,
    buffered: Option<Tuple>,
    context: StreamContext,
    node: QueryNode,
    child_debug: Option<String>,
}

impl ScannerStream {
    fn build(source: Box<dyn TupleSource>, context: StreamContext, node: QueryNode) -> Self {
        Self {
            source,
            buffered: None,
            context,
            node,
            child_debug: None,
        }
    }

    fn empty(context: StreamContext, node: QueryNode) -> Self {
        Self::build(Box::new(TupleList::empty()), context, node)
    }

    /// 尚未确认是否有数据（由初始化器提升）
    pub fn initialized<S: TupleSource + 'static>(source: S, node: QueryNode) -> Self {
        Self::build(Box::new(source), StreamContext::Initialized, node)
    }

    pub fn with_data<S: TupleSource + 'static>(source: S, node: QueryNode) -> Self {
        Self::build(Box::new(source), StreamContext::Present, node)
    }

    pub fn variable<S: TupleSource + 'static>(source: S, node: QueryNode) -> Self {
        Self::build(Box::new(source), StreamContext::Variable, node)
    }

    pub fn exceeded_value_threshold<S: TupleSource + 'static>(source: S, node: QueryNode) -> Self {
        Self::build(Box::new(source), StreamContext::ExceededValueThreshold, node)
    }

    pub fn no_data(node: QueryNode) -> Self {
        Self::empty(StreamContext::Absent, node)
    }

    pub fn no_op(node: QueryNode) -> Self {
        Self::empty(StreamContext::NoOp, node)
    }

    pub fn unindexed(node: QueryNode) -> Self {
        Self::empty(StreamContext::Unindexed, node)
    }

    pub fn unknown_field(node: QueryNode) -> Self {
        Self::empty(StreamContext::UnknownField, node)
    }

    pub fn delayed_expression(node: QueryNode) -> Self {
        Self::empty(StreamContext::DelayedField, node)
    }

    pub fn exceeded_term_threshold(node: QueryNode) -> Self {
        Self::empty(StreamContext::ExceededTermThreshold, node)
    }

    pub fn ignored(node: QueryNode) -> Self {
        Self::empty(StreamContext::Ignored, node)
    }

    /// 附上被包装的复合流的调试树
    pub fn with_child_debug(mut self, debug: String) -> Self {
        self.child_debug = Some(debug);
        self
    }
}

impl IndexStream for ScannerStream {
    fn context(&self) -> StreamContext {
        self.context
    }

    fn context_debug(&self) -> String {
        let header = format!("ScannerStream({}): {}", self.context, self.node);
        match &self.child_debug {
            Some(child) => super::debug_tree(header, std::slice::from_ref(child)),
            None => header,
        }
    }

    fn current_node(&self) -> &QueryNode {
        &self.node
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Scanner
    }

    fn peek(&mut self) -> Option<&Tuple> {
        if self.buffered.is_none() {
            self.buffered = self.source.next_tuple();
        }
        self.buffered.as_ref()
    }

    fn next(&mut self) -> Option<Tuple> {
        self.peek();
        self.buffered.take()
    }

    fn seek(&mut self, target: &str) -> Option<String> {
        if let Some((key, _)) = self.peek() {
            if reached(key, target) {
                return Some(key.clone());
            }
        }
        self.buffered = None;
        self.source.seek(target);
        while let Some(tuple) = self.source.next_tuple() {
            if reached(&tuple.0, target) {
                let key = tuple.0.clone();
                self.buffered = Some(tuple);
                return Some(key);
            }
        }
        None
    }

    fn promote_present(&mut self) {
        if self.context == StreamContext::Initialized {
            self.context = StreamContext::Present;
        }
    }
}
