//! Self-healing worker pool
//!
//! A fixed number of workers pull items from one shared queue. Each item is
//! run on its own task so a panic while processing it is caught at the join
//! point; the worker then reports the fault and exits, and the supervisor
//! starts a replacement under the same worker id. Shutdown cancels the
//! workers and waits until every one of them has returned.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors returned to callers of the pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,
}

/// Outcome reported to the pool's error notifier
#[derive(Debug)]
pub enum Failure<E> {
    /// The routine returned an error for one item
    Error(E),
    /// The routine panicked; the worker was replaced
    Fault { worker: usize, message: String },
}

type Routine<T, E> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;
type Notifier<E> = Arc<dyn Fn(Failure<E>) + Send + Sync>;

struct Job<T> {
    item: T,
    accepted: oneshot::Sender<()>,
}

/// How a worker task ended
enum WorkerExit {
    Stopped,
    Faulted(String),
}

#[derive(Debug, Default)]
struct PoolCounters {
    active: AtomicUsize,
    respawns: AtomicU64,
}

/// Everything a worker needs, shared by all workers of a pool
struct WorkerContext<T, E> {
    queue: Arc<Mutex<mpsc::Receiver<Job<T>>>>,
    routine: Routine<T, E>,
    notifier: Notifier<E>,
    shutdown: CancellationToken,
    counters: Arc<PoolCounters>,
}

impl<T, E> Clone for WorkerContext<T, E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            routine: self.routine.clone(),
            notifier: self.notifier.clone(),
            shutdown: self.shutdown.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<T, E> WorkerContext<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    async fn run(self, worker: usize) -> WorkerExit {
        debug!(worker, "Worker started");
        loop {
            let job = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return WorkerExit::Stopped,
                    job = queue.recv() => job,
                }
            };

            let Some(job) = job else {
                return WorkerExit::Stopped;
            };
            let _ = job.accepted.send(());

            match tokio::spawn((self.routine)(job.item)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => (self.notifier)(Failure::Error(err)),
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        panic_message(join_err.into_panic().as_ref())
                    } else {
                        join_err.to_string()
                    };
                    return WorkerExit::Faulted(message);
                }
            }
        }
    }

    fn spawn(&self, workers: &mut JoinSet<(usize, WorkerExit)>, worker: usize) {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        let ctx = self.clone();
        workers.spawn(async move {
            // A panic in the notifier lands here rather than in the routine task
            let exit = AssertUnwindSafe(ctx.run(worker))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| WorkerExit::Faulted(panic_message(payload.as_ref())));
            (worker, exit)
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => s.to_string(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Box<Any>".to_string(),
        },
    }
}

/// Restarts faulted workers until the pool shuts down, then waits for the rest
async fn supervise<T, E>(ctx: WorkerContext<T, E>, mut workers: JoinSet<(usize, WorkerExit)>)
where
    T: Send + 'static,
    E: Send + 'static,
{
    while let Some(joined) = workers.join_next().await {
        ctx.counters.active.fetch_sub(1, Ordering::SeqCst);

        let (worker, message) = match joined {
            Ok((worker, WorkerExit::Stopped)) => {
                debug!(worker, "Worker stopped");
                continue;
            }
            Ok((worker, WorkerExit::Faulted(message))) => (worker, message),
            Err(err) => {
                warn!(error = %err, "Worker task aborted");
                continue;
            }
        };

        (ctx.notifier)(Failure::Fault {
            worker,
            message: message.clone(),
        });

        if ctx.shutdown.is_cancelled() {
            continue;
        }

        ctx.spawn(&mut workers, worker);
        ctx.counters.respawns.fetch_add(1, Ordering::SeqCst);
        warn!(worker, fault = %message, "Worker died, spawned another one in place");
    }
}

/// Fixed-size pool of supervised workers
pub struct WorkerPool<T, E> {
    size: usize,
    queue: mpsc::Sender<Job<T>>,
    receiver: Arc<Mutex<mpsc::Receiver<Job<T>>>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
    _error: std::marker::PhantomData<fn() -> E>,
}

impl<T, E> WorkerPool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start `size` workers running `routine`; failures go to `on_error`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut, N>(size: usize, routine: F, on_error: N) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        N: Fn(Failure<E>) + Send + Sync + 'static,
    {
        let size = size.max(1);
        let (queue, receiver) = mpsc::channel(1);
        let receiver = Arc::new(Mutex::new(receiver));
        let shutdown = CancellationToken::new();
        let counters = Arc::new(PoolCounters::default());

        let routine: Routine<T, E> = Arc::new(move |item| routine(item).boxed());
        let ctx = WorkerContext {
            queue: receiver.clone(),
            routine,
            notifier: Arc::new(on_error),
            shutdown: shutdown.clone(),
            counters: counters.clone(),
        };

        let mut workers = JoinSet::new();
        for worker in 0..size {
            ctx.spawn(&mut workers, worker);
        }
        let supervisor = tokio::spawn(supervise(ctx, workers));

        info!(workers = size, "Worker pool started");

        Self {
            size,
            queue,
            receiver,
            shutdown,
            supervisor: Mutex::new(Some(supervisor)),
            counters,
            _error: std::marker::PhantomData,
        }
    }

    /// Hand `item` to a worker, waiting until one accepts it.
    ///
    /// Returns once the item is picked up, not when it has been processed.
    pub async fn submit(&self, item: T) -> Result<(), PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::Closed);
        }

        let (accepted, ack) = oneshot::channel();
        self.queue
            .send(Job { item, accepted })
            .await
            .map_err(|_| PoolError::Closed)?;
        ack.await.map_err(|_| PoolError::Closed)
    }

    /// Stop all workers and wait until each has exited.
    ///
    /// Queued items that no worker picked up are dropped. Calling this more
    /// than once is harmless.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let supervisor = self.supervisor.lock().await.take();
        let Some(supervisor) = supervisor else {
            return;
        };
        if let Err(err) = supervisor.await {
            warn!(error = %err, "Worker pool supervisor failed");
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut dropped = 0usize;
        while receiver.try_recv().is_ok() {
            dropped += 1;
        }

        info!(
            workers = self.size,
            dropped_items = dropped,
            respawns = self.respawns(),
            "Worker pool shut down"
        );
    }

    /// Configured number of workers
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently alive
    pub fn active_workers(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Replacement workers started after faults
    pub fn respawns(&self) -> u64 {
        self.counters.respawns.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
