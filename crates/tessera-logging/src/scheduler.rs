//! Batching scheduler
//!
//! Producers push records into an unbounded channel; one dedicated worker
//! thread drains it into batches and hands each batch to the resilient
//! writer. Records the writer cannot deliver go to the fallback store.
//!
//! ```text
//! submit ──▶ [channel] ──▶ worker buffer ──size/timeout──▶ ResilientWriter ──▶ primary
//!                                                              │ failure
//!                                                              ▼
//!                                                        FallbackStore
//! ```
//!
//! The worker owns a current-thread tokio runtime, so retry backoff sleeps
//! there and never on a producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tessera_core::{StorageRecord, diagnostic};
use tessera_storage::{FallbackStore, ResilientWriter};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

const WORKER_THREAD_NAME: &str = "tessera-batch-worker";

/// Waits at least this long are treated as having no deadline
const UNBOUNDED_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// `now + timeout`, or `None` when the wait is effectively unbounded
fn deadline_after(timeout: Duration) -> Option<std::time::Instant> {
    if timeout >= UNBOUNDED_WAIT {
        return None;
    }
    std::time::Instant::now().checked_add(timeout)
}

/// Counters describing what the worker has done
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Flushes triggered by reaching `batch_size`
    pub size_flushes: u64,
    /// Flushes triggered by `batch_timeout`
    pub timeout_flushes: u64,
    /// Flushes requested through `flush()` or an immediate write
    pub explicit_flushes: u64,
    /// Records written through the unbatched path
    pub immediate_writes: u64,
    /// Records accepted by the primary sink
    pub records_written: u64,
    /// Records diverted to the fallback store
    pub records_fallback: u64,
    /// Records neither the primary nor the fallback accepted
    pub records_lost: u64,
    /// Records discarded because the shutdown deadline passed
    pub dropped_at_shutdown: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timeout,
    Explicit,
}

enum Command {
    Record(StorageRecord),
    Immediate(StorageRecord),
    Flush(Arc<Completion>),
    Shutdown {
        deadline: Option<std::time::Instant>,
        done: Arc<Completion>,
    },
}

/// One-shot signal a producer can block on
#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    signal: Condvar,
}

impl Completion {
    fn complete(&self) {
        *self.done.lock() = true;
        self.signal.notify_all();
    }

    /// Block until completed or `timeout` elapses
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut done = self.done.lock();
        while !*done {
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                None => self.signal.wait(&mut done),
            }
        }
        true
    }
}

struct Shared {
    /// Records accepted but not yet attempted
    queue_depth: AtomicUsize,
    stopped: AtomicBool,
    stats: Mutex<SchedulerStats>,
}

/// Background batch worker
///
/// Constructed and started by [`BatchScheduler::spawn`]; callers only ever
/// hold the returned [`SchedulerHandle`].
pub struct BatchScheduler {
    batch_size: usize,
    batch_timeout: Duration,
    writer: Arc<ResilientWriter>,
    fallback: Arc<FallbackStore>,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Command>,
    buffer: Vec<StorageRecord>,
}

impl BatchScheduler {
    /// Start the worker thread
    pub fn spawn(
        config: &PipelineConfig,
        writer: Arc<ResilientWriter>,
        fallback: Arc<FallbackStore>,
    ) -> Result<SchedulerHandle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(PipelineError::WorkerSpawn)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queue_depth: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            stats: Mutex::new(SchedulerStats::default()),
        });
        let batch_size = config.batch_size.max(1);
        let worker = BatchScheduler {
            batch_size,
            batch_timeout: config.batch_timeout().min(UNBOUNDED_WAIT),
            writer,
            fallback: Arc::clone(&fallback),
            shared: Arc::clone(&shared),
            rx,
            buffer: Vec::with_capacity(batch_size),
        };

        let thread = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(worker.run()))
            .map_err(PipelineError::WorkerSpawn)?;

        info!(
            batch_size,
            batch_timeout_ms = config.batch_timeout_ms,
            "Batch worker started"
        );

        Ok(SchedulerHandle {
            tx,
            shared,
            fallback,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    async fn run(mut self) {
        let mut last_flush = Instant::now();
        loop {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                _ = tokio::time::sleep_until(last_flush + self.batch_timeout) => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushTrigger::Timeout).await;
                    }
                    last_flush = Instant::now();
                    continue;
                }
            };

            match command {
                Some(Command::Record(record)) => {
                    self.buffer.push(record);
                    if self.buffer.len() >= self.batch_size {
                        self.flush(FlushTrigger::Size).await;
                        last_flush = Instant::now();
                    }
                }
                Some(Command::Immediate(record)) => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushTrigger::Explicit).await;
                        last_flush = Instant::now();
                    }
                    self.write_immediate(record).await;
                }
                Some(Command::Flush(completion)) => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushTrigger::Explicit).await;
                        last_flush = Instant::now();
                    }
                    completion.complete();
                }
                Some(Command::Shutdown { deadline, done }) => {
                    self.drain(deadline).await;
                    done.complete();
                    break;
                }
                // Every handle is gone; nobody can observe a deadline
                None => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushTrigger::Explicit).await;
                    }
                    break;
                }
            }
        }
        debug!("Batch worker exiting");
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        {
            let mut stats = self.shared.stats.lock();
            match trigger {
                FlushTrigger::Size => stats.size_flushes += 1,
                FlushTrigger::Timeout => stats.timeout_flushes += 1,
                FlushTrigger::Explicit => stats.explicit_flushes += 1,
            }
        }

        let outcome = self.writer.write_batch(&batch).await;
        debug!(
            ?trigger,
            size = batch.len(),
            written = outcome.written,
            failed = outcome.failed.len(),
            "Batch flushed"
        );

        self.shared.stats.lock().records_written += outcome.written as u64;
        for (record, error) in &outcome.failed {
            debug!(record_id = %record.id, %error, "Diverting record to fallback");
            self.divert(record);
        }
        self.shared.queue_depth.fetch_sub(batch.len(), Ordering::SeqCst);
    }

    async fn write_immediate(&mut self, record: StorageRecord) {
        let result = self.writer.write(&record).await;
        self.shared.stats.lock().immediate_writes += 1;
        match result {
            Ok(()) => self.shared.stats.lock().records_written += 1,
            Err(error) => {
                debug!(record_id = %record.id, %error, "Immediate write failed");
                self.divert(&record);
            }
        }
        self.shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn divert(&self, record: &StorageRecord) {
        let stored = self.fallback.store(record);
        let mut stats = self.shared.stats.lock();
        if stored {
            stats.records_fallback += 1;
        } else {
            stats.records_lost += 1;
        }
    }

    /// Write everything still pending, record by record, until `deadline`
    async fn drain(&mut self, deadline: Option<std::time::Instant>) {
        self.rx.close();

        let mut pending = std::mem::take(&mut self.buffer);
        let mut waiters = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            match command {
                Command::Record(record) | Command::Immediate(record) => pending.push(record),
                Command::Flush(completion) => waiters.push(completion),
                Command::Shutdown { done, .. } => waiters.push(done),
            }
        }

        let total = pending.len();
        let deadline = deadline.map(Instant::from_std);
        let mut attempted = 0;
        for record in &pending {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
            attempted += 1;
            let written = match deadline {
                Some(deadline) => matches!(
                    tokio::time::timeout_at(deadline, self.writer.write(record)).await,
                    Ok(Ok(()))
                ),
                None => self.writer.write(record).await.is_ok(),
            };
            if written {
                self.shared.stats.lock().records_written += 1;
            } else {
                // Failed, or still retrying when the deadline hit
                self.divert(record);
            }
        }

        let dropped = total - attempted;
        self.shared.stats.lock().dropped_at_shutdown += dropped as u64;
        self.shared.queue_depth.fetch_sub(total, Ordering::SeqCst);
        if dropped > 0 {
            warn!(dropped, "Shutdown deadline passed with records pending");
        }
        info!(drained = attempted, "Batch worker drained");

        for waiter in waiters {
            waiter.complete();
        }
    }
}

/// Cloneable producer-side handle to a running [`BatchScheduler`]
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    fallback: Arc<FallbackStore>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Queue a record for batched writing
    ///
    /// Never blocks beyond channel insertion. Once the scheduler has
    /// stopped the record goes straight to the fallback store.
    pub fn submit(&self, record: StorageRecord) {
        self.send(Command::Record, record);
    }

    /// Queue a record to be written alone, ahead of the next batch boundary
    ///
    /// Records submitted earlier are flushed first, so ordering holds.
    pub fn submit_immediate(&self, record: StorageRecord) {
        self.send(Command::Immediate, record);
    }

    fn send(&self, wrap: fn(StorageRecord) -> Command, record: StorageRecord) {
        if self.shared.stopped.load(Ordering::SeqCst) {
            self.bypass(&record);
            return;
        }
        self.shared.queue_depth.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(command)) = self.tx.send(wrap(record)) {
            self.shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
            if let Command::Record(record) | Command::Immediate(record) = command {
                self.bypass(&record);
            }
        }
    }

    fn bypass(&self, record: &StorageRecord) {
        let stored = self.fallback.store(record);
        let mut stats = self.shared.stats.lock();
        if stored {
            stats.records_fallback += 1;
        } else {
            stats.records_lost += 1;
        }
    }

    /// Block until everything submitted before this call has been attempted
    ///
    /// Returns false if `timeout` elapsed first; the flush may still
    /// complete later.
    pub fn flush(&self, timeout: Duration) -> bool {
        if !self.is_running() {
            return self.queue_depth() == 0;
        }
        let completion = Arc::new(Completion::default());
        if self.tx.send(Command::Flush(Arc::clone(&completion))).is_err() {
            return self.queue_depth() == 0;
        }
        completion.wait(timeout)
    }

    /// Drain the queue within `deadline`, then stop the worker
    ///
    /// Records not attempted by the deadline are discarded and counted in
    /// [`SchedulerStats::dropped_at_shutdown`]. Calling this twice is a
    /// no-op the second time.
    pub fn stop(&self, deadline: Duration) -> SchedulerStats {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return self.stats();
        }

        let done = Arc::new(Completion::default());
        let command = Command::Shutdown {
            deadline: deadline_after(deadline),
            done: Arc::clone(&done),
        };
        // Allow the in-flight write to observe the deadline and return
        let finished = self.tx.send(command).is_ok()
            && done.wait(deadline.saturating_add(Duration::from_secs(1)));

        if finished {
            if let Some(thread) = self.thread.lock().take()
                && thread.join().is_err()
            {
                diagnostic::report("scheduler", "batch worker panicked during shutdown");
            }
        } else {
            diagnostic::report("scheduler", "batch worker did not stop before its deadline");
        }

        let stats = self.stats();
        info!(
            written = stats.records_written,
            fallback = stats.records_fallback,
            dropped = stats.dropped_at_shutdown,
            "Batch worker stopped"
        );
        stats
    }

    /// Records accepted but not yet attempted
    pub fn queue_depth(&self) -> usize {
        self.shared.queue_depth.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("running", &self.is_running())
            .field("queue_depth", &self.queue_depth())
            .finish()
    }
}
