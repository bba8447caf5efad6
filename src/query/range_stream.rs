use crate::config::{parse_day, LookupConfig, PlanningMode, DAY_FORMAT};
use crate::core::node::{ANY_FIELD, DEFAULT_DATATYPE_FIELD, NO_FIELD, SHARD_DAY_HINT};
use crate::core::{IndexInfo, MarkerKind, QueryNode, StreamContext, TermOp, UidIntersector, WorkerPool};
use crate::error::PlanError;
use crate::index::{
    initialize_streams, EntryParser, IndexScan, IndexStream, IntersectionBuilder, ScannerStream, StreamIds,
    StreamInitializer, StreamKind, Tuple, TupleList, UnionBuilder,
};
use crate::stats::PlanStats;
use crate::storage::{IndexKey, IndexReader, ScanRange};
use std::sync::Arc;

/// 访问子节点时父节点的构建器（同类嵌套直接并入父构建器）
enum Parent<'a> {
    Root,
    And(&'a mut IntersectionBuilder),
    Or(&'a mut UnionBuilder),
}

/// 查询规划器：把谓词树翻译成一棵索引流，根流按分区键升序产出结果。
///
/// 持有查找池；`into_results` 之后池即关闭（`WorkerPool` 的 Drop 也会关闭它）。
pub struct RangeStream {
    config: LookupConfig,
    reader: Arc<dyn IndexReader>,
    intersector: Arc<dyn UidIntersector>,
    pool: WorkerPool,
    ids: StreamIds,
    stats: PlanStats,
    root: Option<Box<dyn IndexStream>>,
    context: StreamContext,
}

impl RangeStream {
    pub fn new(
        config: LookupConfig,
        reader: Arc<dyn IndexReader>,
        intersector: Arc<dyn UidIntersector>,
    ) -> Result<Self, PlanError> {
        let pool = WorkerPool::new(config.num_index_lookup_threads, config.poll_interval())?;
        tracing::debug!("Index lookup pool started with {} threads", pool.threads());
        Ok(Self {
            config,
            reader,
            intersector,
            pool,
            ids: StreamIds::new(),
            stats: PlanStats::new(),
            root: None,
            context: StreamContext::Initialized,
        })
    }

    pub fn context(&self) -> StreamContext {
        self.context
    }

    pub fn stats(&self) -> &PlanStats {
        &self.stats
    }

    pub fn stream_plan(&mut self, query: &QueryNode) -> Result<StreamContext, PlanError> {
        let node = query.clone().flatten();

        let depth = node.depth();
        if depth > self.config.max_depth_threshold {
            return Err(PlanError::DepthThresholdExceeded {
                depth,
                max: self.config.max_depth_threshold,
                node: node.to_string(),
            });
        }
        if self.config.planning_mode == PlanningMode::EqualitiesOnly {
            check_equalities(&node)?;
        }
        tracing::trace!("Planning {}", node);

        let root = match self.visit(&node, Parent::Root)? {
            Some(stream) => stream,
            // 形如 ("foo") 的奇怪查询
            None => Box::new(ScannerStream::unindexed(node)),
        };
        self.context = root.context();

        tracing::debug!("Query returned a stream with a context of {}", self.context);
        if tracing::enabled!(tracing::Level::DEBUG) {
            for line in root.context_debug().lines() {
                tracing::debug!("{}", line);
            }
        }
        self.root = Some(root);
        Ok(self.context)
    }

    /// 交出根流的结果迭代器，之后关闭查找池
    pub fn into_results(mut self) -> Result<LookupResults, PlanError> {
        let outcome = self.resolve_root();
        self.pool.shutdown();
        outcome
    }

    fn resolve_root(&mut self) -> Result<LookupResults, PlanError> {
        let Some(mut root) = self.root.take() else {
            return Ok(LookupResults::empty(self.context, None));
        };

        if root.context() == StreamContext::Initialized {
            let todo = vec![StreamInitializer::new(self.ids.next_id(), root)];
            self.stats.initializer_tasks += 1;
            root = match initialize_streams(todo, &self.pool)?.pop() {
                Some((_, stream)) => stream,
                None => return Err(PlanError::Pool("root initializer was abandoned".to_string())),
            };
        }

        let node = root.current_node().clone();
        self.context = match root.context() {
            StreamContext::Variable if root.kind() == StreamKind::Union => {
                tracing::debug!("Variable union at the root has no usable ranges: {}", node);
                return Ok(LookupResults::empty(StreamContext::Absent, Some(node)));
            }
            StreamContext::Variable => StreamContext::Present,
            other => other,
        };

        tracing::debug!("Query resolved to a stream with a context of {}", self.context);
        Ok(LookupResults {
            context: self.context,
            node: Some(node),
            stream: Some(root),
        })
    }

    fn visit(&mut self, node: &QueryNode, parent: Parent<'_>) -> Result<Option<Box<dyn IndexStream>>, PlanError> {
        let stream = match node {
            QueryNode::And { .. } => return self.visit_and(node, parent).map(Some),
            QueryNode::Or { .. } => return self.visit_or(node, parent).map(Some),
            QueryNode::Group { children } => {
                return match children.as_slice() {
                    [] => Ok(None),
                    [child] => self.visit(child, parent),
                    _ => Err(PlanError::MoreThanOneChild { node: node.to_string() }),
                };
            }
            QueryNode::Term { op, field, value } => self.visit_term(node, *op, field, value.as_deref()),
            QueryNode::Marker { kind, .. } => self.visit_marker(node, *kind)?,
            QueryNode::Assignment { name, value } => {
                if name != SHARD_DAY_HINT {
                    return Ok(None);
                }
                shards_and_days(node, value)
            }
            QueryNode::Not { .. } | QueryNode::Function { .. } | QueryNode::True => {
                ScannerStream::delayed_expression(node.clone())
            }
            QueryNode::False => ScannerStream::no_data(node.clone()),
        };

        self.stats.record_leaf(stream.context());
        Ok(Some(Box::new(stream)))
    }

    fn visit_and(&mut self, node: &QueryNode, parent: Parent<'_>) -> Result<Box<dyn IndexStream>, PlanError> {
        let mut builder = IntersectionBuilder::new(Arc::clone(&self.intersector));
        let mut todo = Vec::new();
        for child in node.children() {
            if let Some(stream) = self.visit(child, Parent::And(&mut builder))? {
                if stream.context() != StreamContext::NoOp {
                    todo.push(StreamInitializer::new(self.ids.next_id(), stream));
                }
            }
        }
        self.stats.initializer_tasks += todo.len() as u64;
        builder.add_pending(todo);

        if let Parent::And(outer) = parent {
            tracing::debug!("Propagating AND children up to parent: {}", node);
            outer.consume(builder);
            return Ok(Box::new(ScannerStream::no_op(node.clone())));
        }
        if builder.size() == 0 {
            return Ok(Box::new(ScannerStream::unindexed(node.clone())));
        }

        let intersection = builder.build(&self.pool)?;
        self.stats.intersections += 1;
        Ok(wrap_composite(intersection))
    }

    fn visit_or(&mut self, node: &QueryNode, parent: Parent<'_>) -> Result<Box<dyn IndexStream>, PlanError> {
        let mut builder = UnionBuilder::new();
        let mut todo = Vec::new();
        for child in node.children() {
            if let Some(stream) = self.visit(child, Parent::Or(&mut builder))? {
                if stream.context() != StreamContext::NoOp {
                    todo.push(StreamInitializer::new(self.ids.next_id(), stream));
                }
            }
        }
        self.stats.initializer_tasks += todo.len() as u64;
        builder.add_pending(todo);

        if let Parent::Or(outer) = parent {
            tracing::debug!("Propagating OR children up to parent: {}", node);
            outer.consume(builder);
            return Ok(Box::new(ScannerStream::no_op(node.clone())));
        }
        if builder.size() == 0 {
            return Ok(Box::new(ScannerStream::unindexed(node.clone())));
        }

        let union = builder.build(&self.pool)?;
        self.stats.unions += 1;
        Ok(wrap_composite(union))
    }

    fn visit_term(&self, node: &QueryNode, op: TermOp, field: &str, value: Option<&str>) -> ScannerStream {
        let node = node.clone();
        let unfielded = field == ANY_FIELD || field == NO_FIELD;
        match op {
            TermOp::Eq => {
                if unfielded {
                    return ScannerStream::no_data(node);
                }
                let Some(value) = value else {
                    return ScannerStream::unindexed(node);
                };
                if field == DEFAULT_DATATYPE_FIELD {
                    return ScannerStream::unindexed(node);
                }
                if !self.config.fields.is_indexed(field) {
                    return self.not_indexed(node, field, value);
                }
                tracing::debug!("{} is indexed, scanning for {}", field, value);
                let parser = EntryParser::new(node.clone(), field, value, self.config.fields.is_index_only(field));
                let range = range_for_term(value, field, &self.config.begin_date, &self.config.end_date);
                let scan = IndexScan::new(
                    self.reader.open(field, value),
                    parser,
                    range,
                    self.config.max_index_batch_size,
                )
                .with_datatypes(self.config.datatypes.clone());
                ScannerStream::initialized(scan, node)
            }
            TermOp::Ne | TermOp::Nr => ScannerStream::delayed_expression(node),
            TermOp::Lt | TermOp::Gt | TermOp::Le | TermOp::Ge => {
                if unfielded {
                    ScannerStream::no_data(node)
                } else if !self.config.fields.is_indexed(field) {
                    ScannerStream::unindexed(node)
                } else {
                    ScannerStream::delayed_expression(node)
                }
            }
            TermOp::Er => {
                if field == DEFAULT_DATATYPE_FIELD {
                    ScannerStream::unindexed(node)
                } else if unfielded {
                    ScannerStream::no_data(node)
                } else if !self.config.fields.is_indexed(field) {
                    self.not_indexed(node, field, value.unwrap_or_default())
                } else {
                    // 已索引的正则应在规划前展开，这里不再有数据
                    ScannerStream::no_data(node)
                }
            }
        }
    }

    fn not_indexed(&self, node: QueryNode, field: &str, value: &str) -> ScannerStream {
        if self.config.fields.is_known(field) {
            tracing::debug!("{{\"{}\": \"{}\"}} is not indexed", field, value);
            ScannerStream::unindexed(node)
        } else {
            tracing::debug!("{{\"{}\": \"{}\"}} is not an observed field", field, value);
            ScannerStream::unknown_field(node)
        }
    }

    fn visit_marker(&self, node: &QueryNode, kind: MarkerKind) -> Result<ScannerStream, PlanError> {
        let stream = match kind {
            MarkerKind::ExceededTermThreshold => ScannerStream::exceeded_term_threshold(node.clone()),
            MarkerKind::ExceededValueThreshold => {
                let index_only = node.fields().iter().any(|f| self.config.fields.is_index_only(f));
                if index_only && !self.config.can_handle_exceeded_value_threshold {
                    return Err(PlanError::ExpandQueryTermSystemLimits { node: node.to_string() });
                }
                tracing::debug!("{} requires a full field index scan", node.unwrap_marker());
                ScannerStream::exceeded_value_threshold(self.full_field_index_scan_list(node)?, node.clone())
            }
            MarkerKind::Delayed | MarkerKind::EvalOnly | MarkerKind::IndexHole | MarkerKind::BoundedRange => {
                ScannerStream::ignored(node.clone())
            }
        };
        Ok(stream)
    }

    /// 查询日期范围内每天一个无界 day 元组
    fn full_field_index_scan_list(&self, node: &QueryNode) -> Result<TupleList, PlanError> {
        let end = parse_day(&self.config.end_date)?;
        let mut day = parse_day(&self.config.begin_date)?;
        let mut tuples = Vec::new();
        while day <= end {
            let info = IndexInfo::unbounded().apply_node(node.clone());
            tuples.push((day.format(DAY_FORMAT).to_string(), info));
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        Ok(TupleList::new(tuples))
    }
}

/// 复合流按上下文换成对应的空叶子（保留调试树），其余原样返回
fn wrap_composite<S: IndexStream + 'static>(stream: S) -> Box<dyn IndexStream> {
    let node = stream.current_node().clone();
    let leaf = match stream.context() {
        StreamContext::Absent => ScannerStream::no_data(node),
        StreamContext::Ignored => ScannerStream::ignored(node),
        StreamContext::DelayedField => ScannerStream::delayed_expression(node),
        StreamContext::Unindexed => ScannerStream::unindexed(node),
        StreamContext::UnknownField | StreamContext::Initialized => ScannerStream::unknown_field(node),
        _ => return Box::new(stream),
    };
    Box::new(leaf.with_child_debug(stream.context_debug()))
}

/// `SHARDS_AND_DAYS = 'a,b,c'` 提示：每个 shard/day 一个无界元组
fn shards_and_days(node: &QueryNode, value: &str) -> ScannerStream {
    let mut keys: Vec<&str> = value.split(',').map(str::trim).filter(|k| !k.is_empty()).collect();
    if keys.is_empty() {
        return ScannerStream::no_data(node.clone());
    }
    keys.sort_unstable();
    keys.dedup();
    let tuples = keys.into_iter().map(|key| {
        let hint = QueryNode::Assignment {
            name: SHARD_DAY_HINT.to_string(),
            value: key.to_string(),
        };
        (key.to_string(), IndexInfo::unbounded().with_node(hint))
    });
    ScannerStream::with_data(TupleList::new(tuples), node.clone())
}

/// 只允许 AND/OR/括号/标记与等值叶子
fn check_equalities(node: &QueryNode) -> Result<(), PlanError> {
    match node {
        QueryNode::And { .. } | QueryNode::Or { .. } | QueryNode::Group { .. } | QueryNode::Marker { .. } => {
            node.children().iter().try_for_each(check_equalities)
        }
        QueryNode::Term { op: TermOp::Eq, .. } | QueryNode::Assignment { .. } => Ok(()),
        _ => Err(PlanError::Unsupported {
            mode: PlanningMode::EqualitiesOnly,
            node: node.to_string(),
        }),
    }
}

/// 单个 term 在日期范围内的索引扫描区间：`[begin, end_\u{10FFFF})`
pub fn range_for_term(term: &str, field: &str, begin: &str, end: &str) -> ScanRange {
    ScanRange::new(
        IndexKey::bound(term, field, begin),
        true,
        IndexKey::bound(term, field, &format!("{}_{}", end, char::MAX)),
    )
}

/// 规划结果：按分区键升序的 (分区, 命中) 序列
pub struct LookupResults {
    context: StreamContext,
    node: Option<QueryNode>,
    stream: Option<Box<dyn IndexStream>>,
}

impl LookupResults {
    fn empty(context: StreamContext, node: Option<QueryNode>) -> Self {
        Self {
            context,
            node,
            stream: None,
        }
    }

    pub fn context(&self) -> StreamContext {
        self.context
    }

    pub fn node(&self) -> Option<&QueryNode> {
        self.node.as_ref()
    }
}

impl Iterator for LookupResults {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        self.stream.as_mut()?.next()
    }
}
