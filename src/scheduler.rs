//! Partitioned concurrency scheduler.
//!
//! Units of work sharing a partition key (an aggregate's stream id) execute
//! strictly one at a time, in submission order; distinct keys run in
//! parallel up to a concurrency ceiling. Each active key owns a FIFO queue
//! drained by a single worker task, which holds one pool slot for the whole
//! drain to amortize scheduling overhead.
//!
//! Admission control caps total outstanding work (running + queued):
//! `submit` suspends the caller when the cap is reached and resumes as
//! capacity frees. This is the system's sole backpressure point; nothing
//! ever blocks on an individual partition's queue depth.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, oneshot};
use uuid::Uuid;

use crate::error::ScheduleError;

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently executing partition workers.
    pub max_concurrency: usize,
    /// Additional outstanding units admitted beyond the running ones.
    /// Submission past `max_concurrency + max_queue_depth` suspends the
    /// submitter.
    pub max_queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            max_queue_depth: 1024,
        }
    }
}

/// A queued unit of work. The future settles its own reply channel.
type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Partition {
    /// Work waiting behind the unit the drain worker is running.
    queue: VecDeque<Job>,
}

struct SchedulerInner {
    /// Caps total outstanding work; permits are held from admission until
    /// the unit finishes.
    admission: Arc<Semaphore>,
    /// Caps concurrently running bounded drain workers.
    pool: Arc<Semaphore>,
    /// Presence of a key means a drain worker is active for it.
    partitions: Mutex<HashMap<Uuid, Partition>>,
    closed: AtomicBool,
}

/// Awaitable completion of a submitted unit of work.
///
/// Dropping the handle abandons the result; the unit itself still runs to
/// completion (the scheduler offers no mid-flight cancellation).
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, ScheduleError>>,
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").finish_non_exhaustive()
    }
}

impl<T> JobHandle<T> {
    /// Wait for the unit to finish and return its output.
    ///
    /// # Errors
    ///
    /// * [`ScheduleError::Panicked`] - the unit panicked; the panic was
    ///   captured and its partition kept draining.
    /// * [`ScheduleError::Shutdown`] - the scheduler was torn down before
    ///   the unit produced a result.
    pub async fn join(self) -> Result<T, ScheduleError> {
        self.rx.await.map_err(|_| ScheduleError::Shutdown)?
    }
}

/// Bounded-concurrency scheduler serializing work per partition key.
///
/// `Clone` is cheap; clones share all scheduler state.
#[derive(Clone)]
pub struct PartitionedScheduler {
    inner: Arc<SchedulerInner>,
}

impl PartitionedScheduler {
    /// Build a scheduler with the given limits.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                admission: Arc::new(Semaphore::new(
                    config.max_concurrency + config.max_queue_depth,
                )),
                pool: Arc::new(Semaphore::new(config.max_concurrency)),
                partitions: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Submit a unit of work for a partition key.
    ///
    /// Suspends the caller only when total outstanding work is at the cap
    /// (global backpressure), never on the key's own queue depth.
    ///
    /// # Errors
    ///
    /// [`ScheduleError::Shutdown`] when the scheduler has been closed.
    pub async fn submit<F, T>(&self, key: Uuid, work: F) -> Result<JobHandle<T>, ScheduleError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_inner(key, work, true).await
    }

    /// Submit a long-running unit that must not occupy the bounded pool.
    ///
    /// When this submission starts a new drain for its key, the drain
    /// worker runs without taking a pool slot, so the unit cannot starve
    /// ordinary work. Work queued behind an already-active drain inherits
    /// that drain's worker; serialization within the key always holds.
    pub async fn submit_long_running<F, T>(
        &self,
        key: Uuid,
        work: F,
    ) -> Result<JobHandle<T>, ScheduleError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_inner(key, work, false).await
    }

    async fn submit_inner<F, T>(
        &self,
        key: Uuid,
        work: F,
        bounded: bool,
    ) -> Result<JobHandle<T>, ScheduleError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ScheduleError::Shutdown);
        }

        // Backpressure: wait for an outstanding-work slot.
        let permit = self
            .inner
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScheduleError::Shutdown)?;

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // A panic is captured and rethrown to the observer; the next
            // queued unit for this key still runs.
            let outcome = std::panic::AssertUnwindSafe(work)
                .catch_unwind()
                .await
                .map_err(|payload| ScheduleError::Panicked(describe_panic(payload.as_ref())));
            // The observer may have abandoned the handle; that is fine.
            let _ = tx.send(outcome);
            drop(permit);
        });

        let first = {
            let mut partitions = self.inner.partitions.lock();
            match partitions.get_mut(&key) {
                Some(partition) => {
                    // A worker is draining this key: append without
                    // blocking the submitter.
                    partition.queue.push_back(job);
                    None
                }
                None => {
                    partitions.insert(
                        key,
                        Partition {
                            queue: VecDeque::new(),
                        },
                    );
                    Some(job)
                }
            }
        };

        if let Some(job) = first {
            self.spawn_drain(key, job, bounded);
        }

        Ok(JobHandle { rx })
    }

    /// Start a worker that runs `first` and then drains the key's queue.
    fn spawn_drain(&self, key: Uuid, first: Job, bounded: bool) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // One pool slot is held for the whole drain; dedicated
            // (long-running) drains skip the pool entirely.
            let _slot = if bounded {
                inner.pool.clone().acquire_owned().await.ok()
            } else {
                None
            };

            let mut job = first;
            loop {
                job.await;
                let next = {
                    let mut partitions = inner.partitions.lock();
                    match partitions.get_mut(&key).and_then(|p| p.queue.pop_front()) {
                        Some(next) => Some(next),
                        None => {
                            // Queue drained: clear the active marker so the
                            // table only tracks live keys.
                            partitions.remove(&key);
                            None
                        }
                    }
                };
                match next {
                    Some(next) => job = next,
                    None => break,
                }
            }
        });
    }

    /// Stop admitting work. Already-admitted units keep running.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.admission.close();
    }

    /// Remaining admission capacity (outstanding-work slots).
    pub fn available_capacity(&self) -> usize {
        self.inner.admission.available_permits()
    }
}

fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use super::*;

    fn scheduler(max_concurrency: usize, max_queue_depth: usize) -> PartitionedScheduler {
        PartitionedScheduler::new(SchedulerConfig {
            max_concurrency,
            max_queue_depth,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_runs_in_submission_order_without_overlap() {
        let sched = scheduler(8, 64);
        let key = Uuid::new_v4();
        let order = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for index in 0..10usize {
            let order = Arc::clone(&order);
            let active = Arc::clone(&active);
            let handle = sched
                .submit(key, async move {
                    let concurrent = active.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(concurrent, 0, "units for one key must not overlap");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    order.lock().push(index);
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .expect("submit");
            handles.push(handle);
        }
        for handle in handles {
            handle.join().await.expect("join");
        }

        let observed = order.lock().clone();
        assert_eq!(observed, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_keys_overlap_in_time() {
        let sched = scheduler(4, 16);
        let slow_started = Arc::new(tokio::sync::Notify::new());

        let notify = Arc::clone(&slow_started);
        let slow = sched
            .submit(Uuid::new_v4(), async move {
                notify.notify_one();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Instant::now()
            })
            .await
            .expect("submit slow");

        slow_started.notified().await;
        let fast = sched
            .submit(Uuid::new_v4(), async { Instant::now() })
            .await
            .expect("submit fast");

        let fast_done = fast.join().await.expect("fast join");
        let slow_done = slow.join().await.expect("slow join");
        assert!(
            fast_done < slow_done,
            "a different key must not wait for the slow unit"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submission_blocks_at_the_outstanding_cap() {
        let sched = scheduler(1, 1);
        let key_a = Uuid::new_v4();
        let release = Arc::new(tokio::sync::Notify::new());

        let gate = Arc::clone(&release);
        let running = sched
            .submit(key_a, async move {
                gate.notified().await;
            })
            .await
            .expect("first submit");
        let queued = sched
            .submit(key_a, async {})
            .await
            .expect("second submit fills the queue slot");

        assert_eq!(sched.available_capacity(), 0);

        // Third submission exceeds running + queued and must suspend.
        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            sched.submit(Uuid::new_v4(), async {}),
        )
        .await;
        assert!(attempt.is_err(), "submit should block under backpressure");

        release.notify_one();
        running.join().await.expect("running join");
        queued.join().await.expect("queued join");

        // Capacity freed: submission proceeds again.
        let handle = sched
            .submit(Uuid::new_v4(), async { 7 })
            .await
            .expect("submit after drain");
        assert_eq!(handle.join().await.expect("join"), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn panic_is_surfaced_and_does_not_poison_the_partition() {
        let sched = scheduler(4, 16);
        let key = Uuid::new_v4();

        let exploding = sched
            .submit(key, async {
                panic!("boom in unit of work");
            })
            .await
            .expect("submit");
        let surviving = sched.submit(key, async { 42 }).await.expect("submit");

        let err = exploding.join().await.expect_err("panic should surface");
        match err {
            ScheduleError::Panicked(msg) => assert!(msg.contains("boom")),
            other => panic!("expected Panicked, got: {other}"),
        }

        assert_eq!(
            surviving.join().await.expect("next unit still runs"),
            42,
            "the queue must keep draining after a panic"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn long_running_units_do_not_starve_the_pool() {
        // Pool of one: a long-running unit on the bounded pool would block
        // everything else.
        let sched = scheduler(1, 16);
        let release = Arc::new(tokio::sync::Notify::new());

        let gate = Arc::clone(&release);
        let long = sched
            .submit_long_running(Uuid::new_v4(), async move {
                gate.notified().await;
            })
            .await
            .expect("submit long-running");

        // An ordinary unit still gets the single pool slot.
        let ordinary = sched.submit(Uuid::new_v4(), async { 1 }).await.expect("submit");
        let value = tokio::time::timeout(Duration::from_millis(200), ordinary.join())
            .await
            .expect("ordinary unit must not be starved")
            .expect("join");
        assert_eq!(value, 1);

        release.notify_one();
        long.join().await.expect("long join");
    }

    #[tokio::test]
    async fn close_rejects_new_submissions() {
        let sched = scheduler(2, 2);
        sched.close();

        let err = sched
            .submit(Uuid::new_v4(), async {})
            .await
            .expect_err("closed scheduler must reject work");
        assert!(matches!(err, ScheduleError::Shutdown));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn partition_table_empties_when_idle() {
        let sched = scheduler(4, 16);
        let key = Uuid::new_v4();

        let handle = sched.submit(key, async {}).await.expect("submit");
        handle.join().await.expect("join");

        // The drain worker removes the key after the queue empties.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sched.inner.partitions.lock().is_empty());
    }
}
