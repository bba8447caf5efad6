use super::initializer::{initialize_streams, StreamInitializer};
use super::IndexStream;
use crate::core::WorkerPool;
use crate::error::PlanError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 流的身份：由 `StreamIds` 单调分配，用于构建器内去重
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct StreamIds {
    next: AtomicU64,
}

impl StreamIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> StreamId {
        StreamId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// 构建器持有的子流集合：已就绪的流与待初始化的任务
#[derive(Default)]
pub struct StreamArena {
    ready: BTreeMap<StreamId, Box<dyn IndexStream>>,
    pending: Vec<StreamInitializer>,
    seen: BTreeSet<StreamId>,
}

impl StreamArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一个 id 只接受一次
    pub fn add_child(&mut self, id: StreamId, stream: Box<dyn IndexStream>) -> bool {
        if !self.seen.insert(id) {
            tracing::debug!("Stream {} already added, ignoring", id);
            return false;
        }
        self.ready.insert(id, stream);
        true
    }

    pub fn add_pending(&mut self, todo: Vec<StreamInitializer>) {
        for init in todo {
            if self.seen.insert(init.id()) {
                self.pending.push(init);
            } else {
                tracing::debug!("Initializer {} already added, ignoring", init.id());
            }
        }
    }

    /// 吸收同类型子构建器的全部子流
    pub fn consume(&mut self, other: StreamArena) {
        for (id, stream) in other.ready {
            self.add_child(id, stream);
        }
        self.add_pending(other.pending);
    }

    pub fn size(&self) -> usize {
        self.ready.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 在池上跑完待初始化任务，按 id 顺序返回全部子流
    pub fn resolve(self, pool: &WorkerPool) -> Result<Vec<Box<dyn IndexStream>>, PlanError> {
        let mut ready = self.ready;
        if !self.pending.is_empty() {
            for (id, stream) in initialize_streams(self.pending, pool)? {
                ready.insert(id, stream);
            }
        }
        Ok(ready.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QueryNode;
    use crate::index::ScannerStream;

    fn leaf(field: &str) -> Box<dyn IndexStream> {
        Box::new(ScannerStream::delayed_expression(QueryNode::eq_term(field, "1")))
    }

    #[test]
    fn ids_are_monotonic() {
        let ids = StreamIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(a < b);
        assert_eq!(b.raw(), a.raw() + 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let ids = StreamIds::new();
        let id = ids.next_id();
        let mut arena = StreamArena::new();
        assert!(arena.add_child(id, leaf("A")));
        assert!(!arena.add_child(id, leaf("B")));
        arena.add_pending(vec![StreamInitializer::new(id, leaf("C"))]);
        assert_eq!(arena.size(), 1);
    }

    #[test]
    fn consume_moves_everything() {
        let ids = StreamIds::new();
        let mut parent = StreamArena::new();
        parent.add_child(ids.next_id(), leaf("A"));

        let mut child = StreamArena::new();
        child.add_child(ids.next_id(), leaf("B"));
        child.add_pending(vec![StreamInitializer::new(ids.next_id(), leaf("C"))]);

        parent.consume(child);
        assert_eq!(parent.size(), 3);

        let pool = WorkerPool::new(2, std::time::Duration::from_millis(1)).unwrap();
        let streams = parent.resolve(&pool).unwrap();
        let fields: Vec<String> = streams.iter().map(|s| s.current_node().to_string()).collect();
        assert_eq!(fields, vec!["A == '1'", "B == '1'", "C == '1'"]);
    }
}
