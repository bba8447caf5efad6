use super::arena::{StreamArena, StreamId};
use super::initializer::StreamInitializer;
use super::{debug_tree, IndexStream, StreamKind, Tuple};
use crate::core::index_info::and_node;
use crate::core::key::{is_day, is_full_shard, is_shard, matches, reached};
use crate::core::{IndexInfo, QueryNode, StreamContext, UidIntersector, WorkerPool};
use crate::error::PlanError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 工作集中的一个子流；`hinted` 是父节点要求子 Union 在某个 key 上给出的占位结果
struct Slot {
    stream: Box<dyn IndexStream>,
    hinted: Option<Tuple>,
}

impl Slot {
    fn new(stream: Box<dyn IndexStream>) -> Self {
        Self { stream, hinted: None }
    }

    fn info(&mut self) -> Option<IndexInfo> {
        match &self.hinted {
            Some((_, info)) => Some(info.clone()),
            None => self.stream.peek().map(|(_, info)| info.clone()),
        }
    }

    /// 只有带延迟分支的 Union 能在任意 key 上给出占位结果
    fn accepts_hint(&self) -> bool {
        self.stream.kind() == StreamKind::Union && self.stream.context() == StreamContext::Variable
    }

    fn natural_key(&mut self) -> Option<String> {
        self.stream.peek().map(|(key, _)| key.clone())
    }
}

type WorkingSet = BTreeMap<String, Vec<Slot>>;

/// N 元 AND：所有子流同步前进到同一个 key，在该 key 上对 IndexInfo 求交。
///
/// 没有数据但带延迟语义的子流（未索引、延迟表达式、未知字段等）不会让交集变空，
/// 它们的谓词作为延迟节点挂到每个结果上。
pub struct Intersection {
    children: WorkingSet,
    delayed: Vec<QueryNode>,
    context: StreamContext,
    node: QueryNode,
    next: Option<Tuple>,
    intersector: Arc<dyn UidIntersector>,
    child_debug: Vec<String>,
}

impl Intersection {
    pub fn new(
        streams: Vec<Box<dyn IndexStream>>,
        intersector: Arc<dyn UidIntersector>,
    ) -> Result<Self, PlanError> {
        let mut children: WorkingSet = BTreeMap::new();
        let mut delayed = Vec::new();
        let mut contexts = Vec::new();
        let mut nodes = Vec::new();
        let mut child_debug = Vec::new();
        let mut absent = false;
        let mut variable_child = false;

        for mut stream in streams {
            let context = stream.context();
            if context == StreamContext::NoOp {
                continue;
            }
            contexts.push(context);
            nodes.push(stream.current_node().clone());
            child_debug.push(stream.context_debug());

            if stream.has_next() {
                variable_child |= context == StreamContext::Variable;
                if let Some(key) = stream.peek().map(|(key, _)| key.clone()) {
                    children.entry(key).or_default().push(Slot::new(stream));
                }
            } else if context.contributes_delayed() {
                delayed.push(stream.current_node().clone());
            } else if matches!(
                context,
                StreamContext::Absent | StreamContext::ExceededValueThreshold | StreamContext::Initialized
            ) {
                absent = true;
            } else {
                return Err(PlanError::EmptyRangeStream {
                    context,
                    node: stream.current_node().to_string(),
                });
            }
        }

        let node = and_node(nodes).unwrap_or(QueryNode::True);
        let all = |c: StreamContext| !contexts.is_empty() && contexts.iter().all(|x| *x == c);

        let mut intersection = Self {
            children,
            delayed,
            context: StreamContext::Absent,
            node,
            next: None,
            intersector,
            child_debug,
        };

        intersection.context = if contexts.is_empty() || absent {
            intersection.children.clear();
            StreamContext::Absent
        } else if all(StreamContext::DelayedField) {
            StreamContext::DelayedField
        } else if all(StreamContext::Unindexed) {
            StreamContext::Unindexed
        } else if all(StreamContext::Ignored) {
            StreamContext::Ignored
        } else if all(StreamContext::ExceededTermThreshold) {
            StreamContext::ExceededTermThreshold
        } else if all(StreamContext::ExceededValueThreshold) {
            intersection.next = intersection.advance();
            StreamContext::ExceededValueThreshold
        } else if intersection.children.is_empty() {
            // 只剩延迟节点
            StreamContext::DelayedField
        } else {
            intersection.next = intersection.advance();
            match intersection.next {
                None => StreamContext::Absent,
                Some(_) if !intersection.delayed.is_empty() || variable_child => StreamContext::Variable,
                Some(_) => StreamContext::Present,
            }
        };

        tracing::debug!(
            "Intersection of {} children is {} with {} delayed nodes",
            contexts.len(),
            intersection.context,
            intersection.delayed.len()
        );
        Ok(intersection)
    }

    pub fn delayed(&self) -> &[QueryNode] {
        &self.delayed
    }

    fn advance(&mut self) -> Option<Tuple> {
        loop {
            if self.children.is_empty() {
                return None;
            }
            if self.children.len() > 1 {
                self.pivot();
                continue;
            }

            let (key, mut slots) = self.children.pop_first()?;
            let merged = self.merge(&mut slots);
            self.next_all(&key, slots);
            if let Some(info) = merged {
                if info.count() != 0 {
                    tracing::trace!("Intersection emits {} {}", key, info);
                    return Some((key, info));
                }
                tracing::trace!("Intersection at {} is empty, advancing", key);
            }
        }
    }

    /// 把所有落后的子流 seek 到当前最大 key；任何子流耗尽则整个交集结束
    fn pivot(&mut self) {
        let Some(max) = self.children.keys().next_back().cloned() else {
            return;
        };
        let mut next: WorkingSet = BTreeMap::new();

        for (key, slots) in std::mem::take(&mut self.children) {
            for mut slot in slots {
                if key == max {
                    next.entry(key.clone()).or_default().push(slot);
                    continue;
                }
                slot.hinted = None;
                match slot.stream.seek(&max) {
                    Some(found) if found == max || (is_day(&found) && matches(&found, &max)) => {
                        next.entry(max.clone()).or_default().push(slot);
                    }
                    Some(found) if !slot.accepts_hint() => {
                        next.entry(found).or_default().push(slot);
                    }
                    None if !slot.accepts_hint() => {
                        tracing::trace!("Intersection child exhausted seeking {}", max);
                        self.children.clear();
                        return;
                    }
                    _ => match slot.stream.next_hint(&max) {
                        Some(tuple) => {
                            let at = tuple.0.clone();
                            slot.hinted = Some(tuple);
                            next.entry(at).or_default().push(slot);
                        }
                        None => {
                            self.children.clear();
                            return;
                        }
                    },
                }
            }
        }
        self.children = next;
    }

    /// 发出 `key` 之后推进参与的子流。
    ///
    /// 停在 day 上的子流只有在同组还有子流真正落在这个 shard 上时才原地保留；
    /// seek 把整组 day 映射到 shard 时，这一天已经发出，必须整体越过。
    fn next_all(&mut self, key: &str, mut slots: Vec<Slot>) {
        let anchored = slots
            .iter_mut()
            .any(|slot| slot.hinted.is_some() || slot.natural_key().as_deref() == Some(key));
        for mut slot in slots {
            if slot.hinted.take().is_none() {
                let parked_on_day = slot.natural_key().map_or(false, |k| is_day(&k));
                if !(anchored && is_shard(key) && parked_on_day) {
                    slot.stream.next();
                }
            }
            match slot.natural_key() {
                Some(at) => self.children.entry(at).or_default().push(slot),
                None => {
                    self.children.clear();
                    return;
                }
            }
        }
    }

    /// 同一 key 上的所有子结果求交。
    ///
    /// 至少有一个有界结果时，无界结果只贡献谓词（按延迟节点处理），
    /// 这样 day 级占位不会冲掉 shard 上的 UID 明细。
    fn merge(&self, slots: &mut [Slot]) -> Option<IndexInfo> {
        let mut bounded = Vec::new();
        let mut unbounded = Vec::new();
        for slot in slots.iter_mut() {
            let info = slot.info()?;
            if info.is_unbounded() {
                unbounded.push(info);
            } else {
                bounded.push(info);
            }
        }

        let mut delayed = self.delayed.clone();
        let base = if bounded.is_empty() {
            unbounded
        } else {
            delayed.extend(unbounded.iter().filter_map(|i| i.node().cloned()));
            bounded
        };

        let mut infos = base.into_iter();
        let mut merged = infos.next()?;
        let mut folded = false;
        for info in infos {
            merged = merged.intersect(&info, &delayed, self.intersector.as_ref());
            folded = true;
        }

        if !folded && !delayed.is_empty() {
            merged = match merged.intersect_delayed(&delayed) {
                Some(info) => info,
                None => {
                    let nodes = merged.node().cloned().into_iter().chain(delayed.iter().cloned());
                    match and_node(nodes) {
                        Some(node) => merged.with_node(node),
                        None => merged,
                    }
                }
            };
        }
        Some(merged)
    }
}

impl IndexStream for Intersection {
    fn context(&self) -> StreamContext {
        self.context
    }

    fn context_debug(&self) -> String {
        debug_tree(format!("Intersection({}): {}", self.context, self.node), &self.child_debug)
    }

    fn current_node(&self) -> &QueryNode {
        &self.node
    }

    fn kind(&self) -> StreamKind {
        StreamKind::Intersection
    }

    fn peek(&mut self) -> Option<&Tuple> {
        self.next.as_ref()
    }

    fn next(&mut self) -> Option<Tuple> {
        let out = self.next.take();
        if out.is_some() {
            self.next = self.advance();
        }
        out
    }

    fn seek(&mut self, target: &str) -> Option<String> {
        if let Some((key, info)) = self.next.take() {
            if is_day(&key) && is_full_shard(target) && matches(&key, target) {
                self.next = Some((target.to_string(), info));
                return Some(target.to_string());
            }
            if reached(&key, target) {
                self.next = Some((key.clone(), info));
                return Some(key);
            }
        }

        let mut next: WorkingSet = BTreeMap::new();
        for (key, slots) in std::mem::take(&mut self.children) {
            for mut slot in slots {
                if slot.hinted.is_some() && key.as_str() >= target {
                    next.entry(key.clone()).or_default().push(slot);
                    continue;
                }
                slot.hinted = None;
                match slot.stream.seek(target) {
                    Some(found) if is_day(&found) && is_full_shard(target) && matches(&found, target) => {
                        next.entry(target.to_string()).or_default().push(slot);
                    }
                    Some(found) => next.entry(found).or_default().push(slot),
                    None if slot.accepts_hint() => match slot.stream.next_hint(target) {
                        Some(tuple) => {
                            let at = tuple.0.clone();
                            slot.hinted = Some(tuple);
                            next.entry(at).or_default().push(slot);
                        }
                        None => return None,
                    },
                    None => return None,
                }
            }
        }

        self.children = next;
        self.next = self.advance();
        self.next.as_ref().map(|(key, _)| key.clone())
    }
}

/// AND 节点的构建器
pub struct IntersectionBuilder {
    arena: StreamArena,
    intersector: Arc<dyn UidIntersector>,
}

impl IntersectionBuilder {
    pub fn new(intersector: Arc<dyn UidIntersector>) -> Self {
        Self {
            arena: StreamArena::new(),
            intersector,
        }
    }

    pub fn add_child(&mut self, id: StreamId, stream: Box<dyn IndexStream>) -> bool {
        self.arena.add_child(id, stream)
    }

    pub fn add_pending(&mut self, todo: Vec<StreamInitializer>) {
        self.arena.add_pending(todo);
    }

    /// 吸收嵌套 AND 的子流
    pub fn consume(&mut self, other: IntersectionBuilder) {
        self.arena.consume(other.arena);
    }

    pub fn size(&self) -> usize {
        self.arena.size()
    }

    pub fn build(self, pool: &WorkerPool) -> Result<Intersection, PlanError> {
        let children = self.arena.resolve(pool)?;
        Intersection::new(children, self.intersector)
    }
}
