//! Fixed-size pool draining a FIFO of jobs, with batch completion tracking.
//!
//! The orchestrator schedules one job per agent each iteration and then waits for the
//! whole batch. Jobs are futures; each of the N workers runs at most one at a time, so
//! no more than N jobs are ever in flight.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
}

struct PoolState {
    queue: VecDeque<Job>,
    running: usize,
    accepting: bool,
}

struct Shared {
    state: StdMutex<PoolState>,
    work_ready: Notify,
    batch_done: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    num_workers: usize,
}

impl WorkerPool {
    /// Start `num_workers` workers on the current tokio runtime.
    ///
    /// # Panics
    /// Panics if `num_workers` is zero.
    pub fn new(num_workers: usize) -> Self {
        assert!(num_workers > 0, "worker pool needs at least one worker");

        let shared = Arc::new(Shared {
            state: StdMutex::new(PoolState {
                queue: VecDeque::new(),
                running: 0,
                accepting: true,
            }),
            work_ready: Notify::new(),
            batch_done: Notify::new(),
        });

        let workers = (0..num_workers)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&shared))))
            .collect();

        tracing::debug!(num_workers, "Worker pool started");
        Self {
            shared,
            workers,
            num_workers,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn running_count(&self) -> usize {
        self.shared.lock().running
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Append a job and wake one idle worker.
    pub fn schedule<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if !state.accepting {
                return Err(PoolError::ShutDown);
            }
            state.queue.push_back(Box::pin(job));
        }
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Wait until the queue is empty and no job is running.
    pub async fn wait_for_batch_done(&self) {
        loop {
            let notified = self.shared.batch_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.lock();
                if state.queue.is_empty() && state.running == 0 {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting work, drop jobs that have not started and join the workers.
    ///
    /// Jobs already running are allowed to finish.
    pub async fn shutdown(&mut self) {
        let discarded = {
            let mut state = self.shared.lock();
            state.accepting = false;
            let discarded = state.queue.len();
            state.queue.clear();
            discarded
        };
        if discarded > 0 {
            tracing::warn!(discarded, "Discarded jobs that never started");
        }
        self.shared.work_ready.notify_waiters();

        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Pool worker terminated abnormally");
            }
        }
        // jobs were discarded, so batch waiters must not hang
        self.shared.batch_done.notify_waiters();
        tracing::debug!("Worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let outstanding = {
            let state = self.shared.lock();
            state.queue.len() + state.running
        };
        {
            let mut state = self.shared.lock();
            state.accepting = false;
            state.queue.clear();
        }
        for worker in &self.workers {
            worker.abort();
        }
        if outstanding > 0 && !std::thread::panicking() {
            panic!("WorkerPool dropped with {outstanding} outstanding jobs");
        }
    }
}

async fn worker_loop(id: usize, shared: Arc<Shared>) {
    loop {
        let job = {
            let notified = shared.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = shared.lock();
                if !state.accepting {
                    break;
                }
                let job = state.queue.pop_front();
                if job.is_some() {
                    state.running += 1;
                }
                job
            };
            match next {
                Some(job) => job,
                None => {
                    notified.await;
                    continue;
                }
            }
        };

        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            tracing::error!(worker = id, "Pool job panicked");
        }

        let batch_done = {
            let mut state = shared.lock();
            state.running -= 1;
            state.queue.is_empty() && state.running == 0
        };
        if batch_done {
            shared.batch_done.notify_waiters();
        }
    }
    tracing::trace!(worker = id, "Pool worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_worker_count() {
        let pool = WorkerPool::new(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let completed = Arc::clone(&completed);
            pool.schedule(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.wait_for_batch_done().await;

        assert_eq!(completed.load(Ordering::SeqCst), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.running_count(), 0);
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    async fn empty_batch_is_done_immediately() {
        let pool = WorkerPool::new(2);
        tokio::time::timeout(Duration::from_millis(100), pool.wait_for_batch_done())
            .await
            .expect("empty batch should complete");
    }

    #[tokio::test]
    async fn consecutive_batches() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for batch in 1..=3 {
            for _ in 0..4 {
                let counter = Arc::clone(&counter);
                pool.schedule(async move {
                    tokio::task::yield_now().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
            pool.wait_for_batch_done().await;
            assert_eq!(counter.load(Ordering::SeqCst), batch * 4);
            assert_eq!(pool.running_count(), 0);
        }
    }

    #[tokio::test]
    async fn panicking_job_does_not_stall_batch() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.schedule(async { panic!("job failure") }).unwrap();
        let c = Arc::clone(&counter);
        pool.schedule(async move {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.wait_for_batch_done().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.running_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let mut pool = WorkerPool::new(2);
        pool.shutdown().await;

        let err = pool.schedule(async {}).unwrap_err();
        assert!(matches!(err, PoolError::ShutDown));
    }

    #[tokio::test]
    async fn shutdown_lets_running_job_finish() {
        let mut pool = WorkerPool::new(1);
        let finished = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&finished);
        pool.schedule(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            f.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let f = Arc::clone(&finished);
        pool.schedule(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            f.fetch_add(100, Ordering::SeqCst);
        })
        .unwrap();

        // let the first job start
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(pool.pending_count(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "outstanding jobs")]
    async fn drop_with_outstanding_work_panics() {
        let pool = WorkerPool::new(1);
        pool.schedule(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .unwrap();
        drop(pool);
    }
}
