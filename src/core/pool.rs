use crate::error::PlanError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// 兄弟流初始化使用的有界线程池。
///
/// 规模在 `[max(max/2, 1), max(max, 1)]` 之间，按 CPU 数取值。
/// 由规划器持有，整棵流树建好后立即关闭，且只关闭一次。
pub struct WorkerPool {
    inner: Mutex<Option<rayon::ThreadPool>>,
    shutdown: AtomicBool,
    threads: usize,
    submitted: AtomicUsize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(max_threads: usize, poll_interval: Duration) -> Result<Self, PlanError> {
        let threads = Self::target_threads(max_threads, num_cpus::get());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("index-lookup-{}", i))
            .build()
            .map_err(|e| PlanError::Pool(e.to_string()))?;
        tracing::debug!("Lookup pool started with {} threads (max {})", threads, max_threads);
        Ok(Self {
            inner: Mutex::new(Some(pool)),
            shutdown: AtomicBool::new(false),
            threads,
            submitted: AtomicUsize::new(0),
            poll_interval,
        })
    }

    /// 下限为上限的一半，两者都至少为 1
    pub fn target_threads(max_threads: usize, cpus: usize) -> usize {
        let max = max_threads.max(1);
        let min = (max / 2).max(1);
        cpus.clamp(min, max)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// 等待方轮询结果的间隔
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// 提交任务；池已关闭时返回错误
    pub fn spawn<F>(&self, task: F) -> Result<(), PlanError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(pool) if !self.is_shutdown() => {
                self.submitted.fetch_add(1, Ordering::Relaxed);
                pool.spawn(task);
                Ok(())
            }
            _ => Err(PlanError::Pool("lookup pool is shut down".to_string())),
        }
    }

    /// 幂等关闭；已排队的任务仍会执行，但等待方不再等待
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.inner.lock().take();
        drop(pool);
        tracing::debug!(
            "Lookup pool shut down after {} submitted tasks",
            self.submitted()
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
