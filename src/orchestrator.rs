//! Crawl/task orchestrator
//!
//! Owns a bounded pool of browser sessions, a FIFO work queue with
//! backpressure, duplicate-submission skipping through the membership
//! filter, a fixed-delay retry policy, and cooperative idle detection.
//! Completion is pure worklist exhaustion: no crawl depth, no deadline.

use crate::engine::ResponsePipeline;
use crate::error::{LynkeusError, Result};
use crate::session::{self, Navigation, SessionDriver, SessionFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

/// Tuning knobs for one orchestrator instance
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum concurrently running sessions
    pub max_concurrency: usize,
    /// Work queue capacity; a full queue blocks `submit`
    pub queue_capacity: usize,
    /// How many times a failed task is re-queued before giving up
    pub retry_limit: u32,
    /// Fixed delay between a failure and its re-queue
    pub retry_delay: Duration,
    /// Per-navigation timeout; a hung navigation becomes a retryable failure
    pub navigation_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_capacity: 256,
            retry_limit: 3,
            retry_delay: Duration::from_millis(1000),
            navigation_timeout: Duration::from_secs(60),
        }
    }
}

/// A task that exhausted its retries, reported on the error channel
#[derive(Debug)]
pub struct TaskFailure {
    pub url: String,
    pub attempts: u32,
    pub error: LynkeusError,
}

/// Explicit per-task states; retry is a transition back to the queue, not
/// a recursive re-invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Queued,
    Running,
    Retrying,
    Success,
    Failed,
}

fn transition(url: &str, from: TaskState, to: TaskState) {
    debug!("Task {url}: {from:?} -> {to:?}");
}

#[derive(Clone)]
struct Task {
    url: String,
    navigation: Navigation,
    attempt: u32,
    /// Whether the task's own document has already been evaluated; carried
    /// across retries so a retried navigation cannot duplicate verdicts
    main_evaluated: bool,
}

impl Task {
    fn new(url: String, navigation: Navigation) -> Self {
        Self {
            url,
            navigation,
            attempt: 0,
            main_evaluated: false,
        }
    }

    fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self
    }
}

struct Inner {
    config: OrchestratorConfig,
    factory: Arc<dyn SessionFactory>,
    pipeline: Arc<ResponsePipeline>,
    permits: Arc<Semaphore>,
    idle_sessions: Mutex<Vec<Arc<dyn SessionDriver>>>,
    all_sessions: Mutex<Vec<Arc<dyn SessionDriver>>>,
    queue_tx: mpsc::Sender<Task>,
    pending: watch::Sender<usize>,
    failures: mpsc::UnboundedSender<TaskFailure>,
    shutdown: AtomicBool,
    workers: Mutex<JoinSet<()>>,
}

impl Inner {
    fn pending_inc(&self) {
        self.pending.send_modify(|count| *count += 1);
    }

    fn pending_dec(&self) {
        self.pending.send_modify(|count| *count = count.saturating_sub(1));
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    async fn acquire_session(&self) -> Result<Arc<dyn SessionDriver>> {
        if let Some(session) = self.idle_sessions.lock().await.pop() {
            return Ok(session);
        }
        let session = self.factory.create().await?;
        self.all_sessions.lock().await.push(Arc::clone(&session));
        Ok(session)
    }

    async fn release_session(&self, session: Arc<dyn SessionDriver>) {
        if self.is_shut_down() {
            return;
        }
        self.idle_sessions.lock().await.push(session);
    }
}

/// Drives queued targets through pooled sessions until the worklist is
/// exhausted
pub struct Orchestrator {
    inner: Arc<Inner>,
    pending_rx: watch::Receiver<usize>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Builds the orchestrator and starts its dispatcher. The returned
    /// receiver is the error channel for permanently failed tasks.
    pub fn new(
        config: OrchestratorConfig,
        factory: Arc<dyn SessionFactory>,
        pipeline: Arc<ResponsePipeline>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskFailure>) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (pending_tx, pending_rx) = watch::channel(0usize);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
            factory,
            pipeline,
            idle_sessions: Mutex::new(Vec::new()),
            all_sessions: Mutex::new(Vec::new()),
            queue_tx,
            pending: pending_tx,
            failures: failure_tx,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(JoinSet::new()),
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&inner), queue_rx));

        (
            Self {
                inner,
                pending_rx,
                dispatcher: std::sync::Mutex::new(Some(dispatcher)),
            },
            failure_rx,
        )
    }

    /// Queues a target, blocking while the queue is full. A target the
    /// membership filter has already seen is skipped silently - a filter
    /// false positive permanently drops that URL for this job.
    pub async fn submit(&self, url: impl Into<String>, navigation: Navigation) -> Result<()> {
        let url = url.into();
        if self.inner.is_shut_down() {
            return Err(LynkeusError::ShutDown);
        }
        let permit = self
            .inner
            .queue_tx
            .reserve()
            .await
            .map_err(|_| LynkeusError::ShutDown)?;
        if !self.inner.pipeline.claim(&url) {
            debug!("Skipping duplicate submission: {url}");
            return Ok(());
        }
        debug!("Queued {url}");
        self.inner.pending_inc();
        permit.send(Task::new(url, navigation));
        Ok(())
    }

    /// Non-blocking variant of `submit`; fails with `QueueFull` instead of
    /// waiting for capacity.
    pub fn try_submit(&self, url: impl Into<String>, navigation: Navigation) -> Result<()> {
        let url = url.into();
        if self.inner.is_shut_down() {
            return Err(LynkeusError::ShutDown);
        }
        let permit = match self.inner.queue_tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Full(())) => return Err(LynkeusError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(())) => return Err(LynkeusError::ShutDown),
        };
        if !self.inner.pipeline.claim(&url) {
            debug!("Skipping duplicate submission: {url}");
            return Ok(());
        }
        self.inner.pending_inc();
        permit.send(Task::new(url, navigation));
        Ok(())
    }

    /// Number of tasks queued or in flight
    pub fn pending(&self) -> usize {
        *self.pending_rx.borrow()
    }

    /// Suspends until the queue is empty and no task is executing.
    /// Retrying tasks still count as pending, so this really is worklist
    /// exhaustion.
    pub async fn await_idle(&self) {
        let mut pending = self.pending_rx.clone();
        loop {
            if *pending.borrow_and_update() == 0 {
                return;
            }
            if pending.changed().await.is_err() {
                return;
            }
        }
    }

    /// Tears down every pooled session and cancels in-flight work.
    /// Idempotent; safe to call after idle.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let dispatcher = match self.dispatcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = dispatcher {
            handle.abort();
        }

        {
            let mut workers = self.inner.workers.lock().await;
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        self.inner.idle_sessions.lock().await.clear();
        let sessions: Vec<_> = self.inner.all_sessions.lock().await.drain(..).collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                warn!("Session close failed during shutdown: {e}");
            }
        }

        // Unblock any idle waiter; cancelled work will never report back
        self.inner.pending.send_replace(0);
        debug!("Orchestrator shut down");
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut queue_rx: mpsc::Receiver<Task>) {
    while let Some(task) = queue_rx.recv().await {
        if inner.is_shut_down() {
            inner.pending_dec();
            continue;
        }

        // Reap finished workers so the join set stays small
        {
            let mut workers = inner.workers.lock().await;
            while workers.try_join_next().is_some() {}
        }

        let permit = match Arc::clone(&inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                inner.pending_dec();
                continue;
            }
        };

        let worker_inner = Arc::clone(&inner);
        inner
            .workers
            .lock()
            .await
            .spawn(async move { run_task(worker_inner, task, permit).await });
    }
}

async fn run_task(inner: Arc<Inner>, mut task: Task, _permit: OwnedSemaphorePermit) {
    transition(&task.url, TaskState::Queued, TaskState::Running);

    let result = match inner.acquire_session().await {
        Ok(session) => {
            let outcome = execute(&inner, &mut task, session.as_ref()).await;
            inner.release_session(session).await;
            outcome
        }
        Err(e) => Err(e),
    };

    finish_attempt(inner, task, result).await;
}

/// Runs one navigation attempt, draining observed responses through the
/// pipeline. Verdict recording happens-before the attempt completes.
async fn execute(inner: &Inner, task: &mut Task, session: &dyn SessionDriver) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let timeout = inner.config.navigation_timeout;

    let drive = async {
        let result =
            tokio::time::timeout(timeout, session::drive(session, &task.navigation, &events_tx))
                .await;
        drop(events_tx);
        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(LynkeusError::NavigationTimeout(timeout.as_secs())),
        }
    };

    let task_url = task.url.clone();
    let already_evaluated = task.main_evaluated;
    let drain = async {
        let mut main_evaluated = already_evaluated;
        while let Some(response) = events_rx.recv().await {
            if inner.pipeline.process(&task_url, main_evaluated, response) {
                main_evaluated = true;
            }
        }
        main_evaluated
    };

    let (nav_result, main_evaluated) = tokio::join!(drive, drain);
    task.main_evaluated = main_evaluated;
    nav_result
}

async fn finish_attempt(inner: Arc<Inner>, task: Task, result: Result<()>) {
    match result {
        Ok(()) => {
            transition(&task.url, TaskState::Running, TaskState::Success);
            inner.pending_dec();
        }
        Err(error) if task.attempt < inner.config.retry_limit && !inner.is_shut_down() => {
            transition(&task.url, TaskState::Running, TaskState::Retrying);
            warn!(
                "Task {} attempt {} failed: {error}; retrying in {:?}",
                task.url,
                task.attempt + 1,
                inner.config.retry_delay
            );
            let requeue_inner = Arc::clone(&inner);
            let next = task.next_attempt();
            tokio::spawn(async move {
                tokio::time::sleep(requeue_inner.config.retry_delay).await;
                transition(&next.url, TaskState::Retrying, TaskState::Queued);
                if requeue_inner.queue_tx.send(next).await.is_err() {
                    // Queue closed by shutdown; the task will never run
                    requeue_inner.pending_dec();
                }
            });
        }
        Err(error) => {
            transition(&task.url, TaskState::Running, TaskState::Failed);
            error!(
                "Task {} permanently failed after {} attempts: {error}",
                task.url,
                task.attempt + 1
            );
            let _ = inner.failures.send(TaskFailure {
                url: task.url,
                attempts: task.attempt + 1,
                error,
            });
            inner.pending_dec();
        }
    }
}
