//! Priority admission scheduling for outbound requests.
//!
//! The queue bounds two things: how many requests may execute at once
//! (`max_concurrent`) and how many may wait for a slot (`max_queue_size`).
//! Admission order is strict: highest priority first, ties broken by
//! arrival. Completion order is whatever the network makes of it.
//!
//! Tasks waiting in the backlog can be cancelled without ever touching the
//! executor; running tasks are cancelled cooperatively through their
//! [`CancelToken`], with the runner racing the token against the in-flight
//! execution so callers always settle.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::middleware::HandlerFuture;
use crate::sync::mutex_lock;

const COMPONENT: &str = "queue";

/// The downstream invoked once a task is admitted — in the orchestrator,
/// the middleware engine.
pub type Executor = Arc<dyn Fn(Arc<Request>, CancelToken) -> HandlerFuture + Send + Sync>;

/// Construction-time queue limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum simultaneously running tasks.
    pub max_concurrent: usize,
    /// Maximum tasks waiting for a slot; submissions beyond it are rejected.
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 100,
        }
    }
}

/// Partial update applied by [`AdmissionQueue::update_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfigUpdate {
    /// New concurrency limit; raising it starts waiting tasks immediately.
    pub max_concurrent: Option<usize>,
    /// New backlog bound; shrinking it only affects future submissions.
    pub max_queue_size: Option<usize>,
}

/// A point-in-time snapshot of queue occupancy and limits.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Tasks waiting for a slot.
    pub pending: usize,
    /// Tasks currently executing.
    pub running: usize,
    /// Configured concurrency limit.
    pub max_concurrent: usize,
    /// Configured backlog bound.
    pub max_queue_size: usize,
}

// Max-heap key: highest priority first, then earliest arrival. The sequence
// doubles as the task id, so equal keys cannot exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AdmissionKey {
    priority: i32,
    seq: u64,
}

impl Ord for AdmissionKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for AdmissionKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct WaitingTask {
    request: Arc<Request>,
    tx: oneshot::Sender<Result<Response>>,
    cancel: CancelToken,
    enqueued_at: Instant,
}

struct RunningTask {
    request_id: String,
    cancel: CancelToken,
}

struct QueueState {
    waiting: HashMap<u64, WaitingTask>,
    // Admission index; entries whose task left `waiting` are skipped on pop.
    order: BinaryHeap<AdmissionKey>,
    running: HashMap<u64, RunningTask>,
    max_concurrent: usize,
    max_queue_size: usize,
    next_seq: u64,
}

/// The priority admission scheduler.
///
/// Cloning is cheap and shares the same queue.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    executor: Executor,
}

// Releases a running slot even if the executor panics, and kicks the
// scheduler so the freed slot is reused.
struct SlotGuard {
    inner: Arc<QueueInner>,
    task_id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut state = mutex_lock(&self.inner.state, COMPONENT, "release_slot");
            state.running.remove(&self.task_id);
        }
        self.inner.schedule();
    }
}

impl AdmissionQueue {
    /// Creates a queue with the given limits around `executor`.
    pub fn new(config: QueueConfig, executor: Executor) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    waiting: HashMap::new(),
                    order: BinaryHeap::new(),
                    running: HashMap::new(),
                    max_concurrent: config.max_concurrent.max(1),
                    max_queue_size: config.max_queue_size,
                    next_seq: 0,
                }),
                executor,
            }),
        }
    }

    /// Submits a request for admission and awaits its settlement.
    ///
    /// Rejects immediately with [`Error::Capacity`] when the backlog is
    /// full. Otherwise the task waits its turn; the returned future resolves
    /// with the executor's outcome, or [`Error::Cancelled`] if the task is
    /// cancelled first.
    pub async fn submit(&self, request: Arc<Request>, cancel: CancelToken) -> Result<Response> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = mutex_lock(&self.inner.state, COMPONENT, "submit");
            if state.waiting.len() >= state.max_queue_size {
                debug!(
                    id = %request.request_id,
                    waiting = state.waiting.len(),
                    limit = state.max_queue_size,
                    "submission rejected, backlog full"
                );
                return Err(Error::Capacity {
                    waiting: state.waiting.len(),
                    limit: state.max_queue_size,
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.order.push(AdmissionKey {
                priority: request.priority,
                seq,
            });
            state.waiting.insert(
                seq,
                WaitingTask {
                    request,
                    tx,
                    cancel,
                    enqueued_at: Instant::now(),
                },
            );
        }
        self.inner.schedule();
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Cancels every task belonging to `request_id`.
    ///
    /// Waiting tasks settle as [`Error::Cancelled`] without the executor
    /// ever running; running tasks have their token cancelled and settle
    /// once the runner observes it. Returns `true` if anything matched.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let mut settled = Vec::new();
        let mut matched = false;
        {
            let mut state = mutex_lock(&self.inner.state, COMPONENT, "cancel_request");
            let waiting_ids: Vec<u64> = state
                .waiting
                .iter()
                .filter(|(_, task)| task.request.request_id == request_id)
                .map(|(id, _)| *id)
                .collect();
            for id in waiting_ids {
                if let Some(task) = state.waiting.remove(&id) {
                    task.cancel.cancel();
                    settled.push(task.tx);
                }
            }
            for task in state.running.values() {
                if task.request_id == request_id {
                    task.cancel.cancel();
                    matched = true;
                }
            }
        }
        matched |= !settled.is_empty();
        for tx in settled {
            let _ = tx.send(Err(Error::Cancelled));
        }
        if matched {
            debug!(id = %request_id, "request cancelled");
        }
        matched
    }

    /// Cancels everything — the whole backlog and every running task.
    pub fn cancel_all(&self) {
        let mut settled = Vec::new();
        {
            let mut state = mutex_lock(&self.inner.state, COMPONENT, "cancel_all");
            for (_, task) in state.waiting.drain() {
                task.cancel.cancel();
                settled.push(task.tx);
            }
            state.order.clear();
            for task in state.running.values() {
                task.cancel.cancel();
            }
        }
        debug!(count = settled.len(), "backlog cancelled");
        for tx in settled {
            let _ = tx.send(Err(Error::Cancelled));
        }
    }

    /// Applies new limits and immediately re-runs the scheduling rule.
    pub fn update_config(&self, update: QueueConfigUpdate) {
        {
            let mut state = mutex_lock(&self.inner.state, COMPONENT, "update_config");
            if let Some(max_concurrent) = update.max_concurrent {
                state.max_concurrent = max_concurrent.max(1);
            }
            if let Some(max_queue_size) = update.max_queue_size {
                state.max_queue_size = max_queue_size;
            }
            debug!(
                max_concurrent = state.max_concurrent,
                max_queue_size = state.max_queue_size,
                "queue limits updated"
            );
        }
        self.inner.schedule();
    }

    /// Current occupancy and limits.
    pub fn stats(&self) -> QueueStats {
        let state = mutex_lock(&self.inner.state, COMPONENT, "stats");
        QueueStats {
            pending: state.waiting.len(),
            running: state.running.len(),
            max_concurrent: state.max_concurrent,
            max_queue_size: state.max_queue_size,
        }
    }
}

impl QueueInner {
    // The scheduling rule: admit the best waiting task while slots are free.
    fn schedule(self: &Arc<Self>) {
        loop {
            let admitted = {
                let mut state = mutex_lock(&self.state, COMPONENT, "schedule");
                if state.running.len() >= state.max_concurrent {
                    return;
                }
                let task = loop {
                    match state.order.pop() {
                        Some(key) => {
                            // Cancelled-while-waiting tasks leave stale keys.
                            if let Some(task) = state.waiting.remove(&key.seq) {
                                break Some((key.seq, task));
                            }
                        }
                        None => break None,
                    }
                };
                match task {
                    Some((task_id, task)) => {
                        state.running.insert(
                            task_id,
                            RunningTask {
                                request_id: task.request.request_id.clone(),
                                cancel: task.cancel.clone(),
                            },
                        );
                        Some((task_id, task))
                    }
                    None => None,
                }
            };

            let Some((task_id, task)) = admitted else {
                return;
            };
            debug!(
                id = %task.request.request_id,
                priority = task.request.priority,
                waited = ?task.enqueued_at.elapsed(),
                "task admitted"
            );

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let _slot = SlotGuard {
                    inner: inner.clone(),
                    task_id,
                };
                let execution = (inner.executor)(task.request, task.cancel.clone());
                let result = tokio::select! {
                    _ = task.cancel.cancelled() => Err(Error::Cancelled),
                    outcome = execution => outcome,
                };
                let _ = task.tx.send(result);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::Notify;

    use super::*;

    const BLOCKER: &str = "blocker";

    struct Recorder {
        started: Mutex<Vec<i32>>,
        gate: Notify,
        calls: AtomicU32,
    }

    // Executor that parks tasks named "blocker" on the gate and records the
    // priority of everything else at execution start.
    fn recording_executor(recorder: Arc<Recorder>) -> Executor {
        Arc::new(move |request, _cancel| {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.calls.fetch_add(1, Ordering::SeqCst);
                if request.request_id == BLOCKER {
                    recorder.gate.notified().await;
                } else {
                    recorder.started.lock().unwrap().push(request.priority);
                }
                Ok(Response::new(200))
            })
        })
    }

    fn queue(max_concurrent: usize, max_queue_size: usize, recorder: Arc<Recorder>) -> AdmissionQueue {
        AdmissionQueue::new(
            QueueConfig {
                max_concurrent,
                max_queue_size,
            },
            recording_executor(recorder),
        )
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            started: Mutex::new(Vec::new()),
            gate: Notify::new(),
            calls: AtomicU32::new(0),
        })
    }

    async fn wait_for_running(queue: &AdmissionQueue, expected: usize) {
        for _ in 0..100 {
            if queue.stats().running == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("never reached {expected} running tasks");
    }

    fn submit(queue: &AdmissionQueue, request: Request) -> tokio::task::JoinHandle<Result<Response>> {
        let queue = queue.clone();
        tokio::spawn(async move { queue.submit(Arc::new(request), CancelToken::new()).await })
    }

    #[tokio::test]
    async fn admission_follows_priority_with_stable_ties() {
        let recorder = recorder();
        let queue = queue(1, 10, recorder.clone());

        let blocker = submit(
            &queue,
            Request::get("https://example.com/slow").request_id(BLOCKER),
        );
        wait_for_running(&queue, 1).await;

        let mut handles = Vec::new();
        for priority in [1, 10, 5] {
            handles.push(submit(
                &queue,
                Request::get("https://example.com/task").priority(priority),
            ));
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.stats().pending, 3);

        recorder.gate.notify_one();
        for handle in handles {
            handle.await.expect("join").expect("task result");
        }
        blocker.await.expect("join").expect("blocker result");

        assert_eq!(*recorder.started.lock().unwrap(), [10, 5, 1]);
    }

    #[tokio::test]
    async fn backlog_overflow_is_rejected_immediately() {
        let recorder = recorder();
        let queue = queue(1, 1, recorder.clone());

        let blocker = submit(
            &queue,
            Request::get("https://example.com/slow").request_id(BLOCKER),
        );
        wait_for_running(&queue, 1).await;

        let waiting = submit(&queue, Request::get("https://example.com/a"));
        tokio::task::yield_now().await;
        assert_eq!(queue.stats().pending, 1);

        let rejected = queue
            .submit(
                Arc::new(Request::get("https://example.com/b")),
                CancelToken::new(),
            )
            .await;
        assert!(matches!(
            rejected,
            Err(Error::Capacity { waiting: 1, limit: 1 })
        ));

        recorder.gate.notify_one();
        waiting.await.expect("join").expect("backlog task runs");
        blocker.await.expect("join").expect("blocker result");
    }

    #[tokio::test]
    async fn cancelling_a_waiting_task_never_executes_it() {
        let recorder = recorder();
        let queue = queue(1, 10, recorder.clone());

        let blocker = submit(
            &queue,
            Request::get("https://example.com/slow").request_id(BLOCKER),
        );
        wait_for_running(&queue, 1).await;

        let victim = submit(
            &queue,
            Request::get("https://example.com/victim").request_id("victim"),
        );
        tokio::task::yield_now().await;

        assert!(queue.cancel_request("victim"));
        let outcome = victim.await.expect("join");
        assert!(matches!(outcome, Err(Error::Cancelled)));

        recorder.gate.notify_one();
        blocker.await.expect("join").expect("blocker result");
        // Only the blocker ever reached the executor.
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelling_a_running_task_settles_it() {
        let recorder = recorder();
        let queue = queue(1, 10, recorder.clone());

        let blocker = submit(
            &queue,
            Request::get("https://example.com/slow").request_id(BLOCKER),
        );
        wait_for_running(&queue, 1).await;

        assert!(queue.cancel_request(BLOCKER));
        let outcome = blocker.await.expect("join");
        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert_eq!(queue.stats().running, 0);
    }

    #[tokio::test]
    async fn raising_concurrency_starts_waiting_tasks() {
        let recorder = recorder();
        let queue = queue(1, 10, recorder.clone());

        let first = submit(
            &queue,
            Request::get("https://example.com/one").request_id(BLOCKER),
        );
        wait_for_running(&queue, 1).await;
        let second = submit(
            &queue,
            Request::get("https://example.com/two").request_id(BLOCKER),
        );
        tokio::task::yield_now().await;
        assert_eq!(queue.stats().pending, 1);

        queue.update_config(QueueConfigUpdate {
            max_concurrent: Some(2),
            max_queue_size: None,
        });
        wait_for_running(&queue, 2).await;

        // Let both runners reach the gate before releasing them.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        recorder.gate.notify_one();
        recorder.gate.notify_one();
        first.await.expect("join").expect("first result");
        second.await.expect("join").expect("second result");
    }

    #[tokio::test]
    async fn cancel_all_clears_everything() {
        let recorder = recorder();
        let queue = queue(1, 10, recorder.clone());

        let running = submit(
            &queue,
            Request::get("https://example.com/run").request_id(BLOCKER),
        );
        wait_for_running(&queue, 1).await;
        let waiting = submit(&queue, Request::get("https://example.com/wait"));
        tokio::task::yield_now().await;

        queue.cancel_all();
        assert!(matches!(
            running.await.expect("join"),
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            waiting.await.expect("join"),
            Err(Error::Cancelled)
        ));

        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.running, 0);
    }
}
