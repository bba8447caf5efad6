use super::arena::StreamId;
use super::scanner::ScannerStream;
use super::IndexStream;
use crate::core::{StreamContext, WorkerPool};
use crate::error::PlanError;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 单次任务：确认一个刚建好的流是否有数据
pub struct StreamInitializer {
    id: StreamId,
    stream: Box<dyn IndexStream>,
}

impl StreamInitializer {
    pub fn new(id: StreamId, stream: Box<dyn IndexStream>) -> Self {
        Self { id, stream }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// `Initialized` 且有数据 -> 提升为 `Present`；没有数据 -> 换成空流；其余原样返回
    pub fn call(self) -> Box<dyn IndexStream> {
        let mut stream = self.stream;
        if stream.context() != StreamContext::Initialized {
            return stream;
        }
        if stream.has_next() {
            stream.promote_present();
            stream
        } else {
            tracing::debug!("Stream {} has no data: {}", self.id, stream.current_node());
            Box::new(ScannerStream::no_data(stream.current_node().clone()))
        }
    }
}

struct Waiting {
    id: StreamId,
    node: String,
    rx: Receiver<Result<Box<dyn IndexStream>, String>>,
    cancelled: Arc<AtomicBool>,
}

/// 在池上并发初始化一组兄弟流，全部返回（或池被关闭）后才交给父节点。
///
/// 任一任务失败时，等所有兄弟都有了结果再报告第一个错误。
/// 池在等待期间被关闭时，剩余任务标记为取消并放弃等待。
pub fn initialize_streams(
    todo: Vec<StreamInitializer>,
    pool: &WorkerPool,
) -> Result<Vec<(StreamId, Box<dyn IndexStream>)>, PlanError> {
    let mut waiting = Vec::with_capacity(todo.len());
    for init in todo {
        let (tx, rx) = channel::bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let id = init.id();
        let node = init.stream.current_node().to_string();

        pool.spawn(move || {
            if flag.load(Ordering::Acquire) {
                return;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| init.call()));
            let _ = tx.send(outcome.map_err(panic_message));
        })?;

        waiting.push(Waiting {
            id,
            node,
            rx,
            cancelled,
        });
    }

    let mut done = Vec::with_capacity(waiting.len());
    let mut first_error: Option<PlanError> = None;
    for task in waiting {
        loop {
            match task.rx.recv_timeout(pool.poll_interval()) {
                Ok(Ok(stream)) => {
                    done.push((task.id, stream));
                    break;
                }
                Ok(Err(reason)) => {
                    first_error.get_or_insert(PlanError::Initializer {
                        node: task.node.clone(),
                        reason,
                    });
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if pool.is_shutdown() {
                        task.cancelled.store(true, Ordering::Release);
                        tracing::warn!("Cancelled initializer {} after pool shutdown: {}", task.id, task.node);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    if pool.is_shutdown() {
                        tracing::warn!("Initializer {} abandoned by pool shutdown: {}", task.id, task.node);
                    } else {
                        first_error.get_or_insert(PlanError::Initializer {
                            node: task.node.clone(),
                            reason: "task finished without a result".to_string(),
                        });
                    }
                    break;
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(done),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "initializer panicked".to_string()
    }
}
