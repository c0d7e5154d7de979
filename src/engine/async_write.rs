//! Async write layer
//!
//! Hands mutations to a single background writer through a bounded queue.
//!
//! ## Responsibilities
//! - Return from `put/update/delete` once the mutation is queued; block only
//!   while the queue is full
//! - Serve reads of queued-but-unapplied records from a pending overlay
//! - Apply mutations to the inner engine in the order they were issued
//! - `commit` waits until everything queued before it is applied and the
//!   inner commit has finished
//! - Checkpoint a non-transactional inner engine when the queue goes idle
//!
//! ```text
//!  callers ──▶ [ bounded queue ] ──▶ writer thread ──▶ inner engine
//!     │                                   │
//!     └──── pending overlay ◀─── remove once applied
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{AtlasError, Result};
use crate::RecId;

use super::Engine;

/// Work item for the writer thread
enum Command {
    Write { recid: RecId, data: Bytes, seq: u64 },
    Restore { recid: RecId, data: Bytes, seq: u64 },
    Delete { recid: RecId, seq: u64 },
    Commit { ack: Sender<Result<()>> },
    Rollback { ack: Sender<Result<()>> },
    Compact { ack: Sender<Result<()>> },
    Shutdown,
}

/// State shared between callers and the writer thread
struct Shared {
    inner: Arc<dyn Engine>,
    /// recid → (sequence, bytes or `None` for a queued delete)
    pending: Mutex<HashMap<RecId, (u64, Option<Bytes>)>>,
    /// First error hit by the writer since the last commit
    failure: Mutex<Option<AtlasError>>,
}

impl Shared {
    /// Drop the overlay entry unless a newer mutation replaced it
    fn settle(&self, recid: RecId, seq: u64) {
        let mut pending = self.pending.lock();
        if let Some((current, _)) = pending.get(&recid) {
            if *current == seq {
                pending.remove(&recid);
            }
        }
    }

    fn record_failure(&self, e: AtlasError) {
        error!(error = %e, "Async write failed");
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(e);
        }
    }
}

/// Background write-behind layer
///
/// ## Concurrency
/// - `order`: Mutex held from overlay insert to queue send, so overlay
///   sequence and queue order agree. The writer never takes it.
/// - `shared.pending` / `shared.failure`: short critical sections only.
pub struct AsyncWriteEngine {
    shared: Arc<Shared>,
    sender: Sender<Command>,
    order: Mutex<()>,
    seq: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    done: Receiver<()>,
    close_timeout: Duration,
    closed: AtomicBool,
}

impl AsyncWriteEngine {
    /// Start the writer thread over `inner`
    pub fn new(
        inner: Arc<dyn Engine>,
        queue_size: usize,
        flush_interval: Duration,
        close_timeout: Duration,
    ) -> Result<Self> {
        if queue_size == 0 {
            return Err(AtlasError::InvalidArgument(
                "async queue size must be at least 1".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            inner,
            pending: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
        });
        let (sender, receiver) = channel::bounded(queue_size);
        let (done_tx, done_rx) = channel::bounded(1);

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("atlasdb-writer".to_string())
            .spawn(move || {
                Self::run(worker_shared, receiver, flush_interval);
                let _ = done_tx.send(());
            })?;

        debug!(queue_size, "Async writer started");

        Ok(Self {
            shared,
            sender,
            order: Mutex::new(()),
            seq: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
            done: done_rx,
            close_timeout,
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Writer Thread
    // =========================================================================

    fn run(shared: Arc<Shared>, receiver: Receiver<Command>, flush_interval: Duration) {
        let mut unflushed = false;

        loop {
            let command = match receiver.recv_timeout(flush_interval) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    if unflushed && !shared.inner.can_rollback() {
                        match shared.inner.commit() {
                            Ok(()) => trace!("Idle checkpoint"),
                            Err(e) => shared.record_failure(e),
                        }
                        unflushed = false;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            match command {
                Command::Write { recid, data, seq } => {
                    if let Err(e) = shared.inner.update(recid, &data) {
                        shared.record_failure(e);
                    }
                    shared.settle(recid, seq);
                    unflushed = true;
                }
                Command::Restore { recid, data, seq } => {
                    if let Err(e) = shared.inner.restore(recid, &data) {
                        shared.record_failure(e);
                    }
                    shared.settle(recid, seq);
                    unflushed = true;
                }
                Command::Delete { recid, seq } => {
                    if let Err(e) = shared.inner.delete(recid) {
                        shared.record_failure(e);
                    }
                    shared.settle(recid, seq);
                    unflushed = true;
                }
                Command::Commit { ack } => {
                    let failed = shared.failure.lock().take();
                    let result = match failed {
                        // A transactional group with a failed member is
                        // dropped as a whole
                        Some(e) if shared.inner.can_rollback() => {
                            warn!(error = %e, "Rolling back group with failed async write");
                            if let Err(re) = shared.inner.rollback() {
                                error!(error = %re, "Rollback after async failure failed");
                            }
                            Err(e)
                        }
                        Some(e) => shared.inner.commit().and(Err(e)),
                        None => shared.inner.commit(),
                    };
                    unflushed = false;
                    let _ = ack.send(result);
                }
                Command::Rollback { ack } => {
                    let _ = ack.send(shared.inner.rollback());
                }
                Command::Compact { ack } => {
                    let _ = ack.send(shared.inner.compact());
                }
                Command::Shutdown => break,
            }
        }
        debug!("Async writer stopped");
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AtlasError::Closed);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| AtlasError::Storage("async writer has stopped".to_string()))
    }

    /// Publish `value` in the overlay and queue the matching command
    fn enqueue(&self, recid: RecId, value: Option<Bytes>, restore: bool) -> Result<()> {
        let _order = self.order.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.shared
            .pending
            .lock()
            .insert(recid, (seq, value.clone()));

        let command = match (value, restore) {
            (Some(data), false) => Command::Write { recid, data, seq },
            (Some(data), true) => Command::Restore { recid, data, seq },
            (None, _) => Command::Delete { recid, seq },
        };
        if let Err(e) = self.send(command) {
            self.shared.settle(recid, seq);
            return Err(e);
        }
        Ok(())
    }

    /// Queue a command carrying an ack channel and wait for its result
    fn round_trip(&self, make: impl FnOnce(Sender<Result<()>>) -> Command) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        {
            let _order = self.order.lock();
            self.send(make(ack_tx))?;
        }
        ack_rx
            .recv()
            .map_err(|_| AtlasError::Storage("async writer has stopped".to_string()))?
    }

    /// Overlay view of `recid`: `Some(Some(bytes))` queued write,
    /// `Some(None)` queued delete, `None` not pending
    fn pending(&self, recid: RecId) -> Option<Option<Bytes>> {
        self.shared
            .pending
            .lock()
            .get(&recid)
            .map(|(_, value)| value.clone())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Mutations queued but not yet applied
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl Engine for AsyncWriteEngine {
    fn preallocate(&self) -> Result<RecId> {
        self.check_open()?;
        self.shared.inner.preallocate()
    }

    fn put(&self, data: &[u8]) -> Result<RecId> {
        self.check_open()?;
        let recid = self.shared.inner.preallocate()?;
        self.enqueue(recid, Some(Bytes::copy_from_slice(data)), false)?;
        Ok(recid)
    }

    fn get(&self, recid: RecId) -> Result<Bytes> {
        self.check_open()?;
        match self.pending(recid) {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(AtlasError::RecordNotFound(recid)),
            None => self.shared.inner.get(recid),
        }
    }

    fn update(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if !self.contains(recid)? {
            return Err(AtlasError::RecordNotFound(recid));
        }
        self.enqueue(recid, Some(Bytes::copy_from_slice(data)), false)
    }

    fn delete(&self, recid: RecId) -> Result<()> {
        self.check_open()?;
        if !self.contains(recid)? {
            return Err(AtlasError::RecordNotFound(recid));
        }
        self.enqueue(recid, None, false)
    }

    fn restore(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if recid == 0 {
            return Err(AtlasError::InvalidArgument("record id 0 is never valid".to_string()));
        }
        self.enqueue(recid, Some(Bytes::copy_from_slice(data)), true)
    }

    fn contains(&self, recid: RecId) -> Result<bool> {
        self.check_open()?;
        match self.pending(recid) {
            Some(value) => Ok(value.is_some()),
            None => self.shared.inner.contains(recid),
        }
    }

    fn recids(&self) -> Result<Vec<RecId>> {
        self.check_open()?;
        let overlay: Vec<(RecId, bool)> = self
            .shared
            .pending
            .lock()
            .iter()
            .map(|(recid, (_, value))| (*recid, value.is_some()))
            .collect();
        let mut ids: BTreeSet<RecId> = self.shared.inner.recids()?.into_iter().collect();
        for (recid, live) in overlay {
            if live {
                ids.insert(recid);
            } else {
                ids.remove(&recid);
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Blocks until every earlier mutation is applied and the inner
    /// engine has committed. A writer error since the last commit fails the
    /// commit; with a transactional inner engine the group is rolled back.
    fn commit(&self) -> Result<()> {
        self.check_open()?;
        self.round_trip(|ack| Command::Commit { ack })
    }

    fn rollback(&self) -> Result<()> {
        self.check_open()?;
        let result = self.round_trip(|ack| Command::Rollback { ack });
        // Errors of discarded writes no longer matter
        self.shared.failure.lock().take();
        result
    }

    fn compact(&self) -> Result<()> {
        self.check_open()?;
        self.round_trip(|ack| Command::Compact { ack })
    }

    /// Drain the queue, waiting at most `close_timeout`, then close the
    /// inner engine. A writer that misses the deadline is detached.
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let _order = self.order.lock();
            if self.sender.send(Command::Shutdown).is_err() {
                debug!("Async writer already gone at close");
            }
        }

        match self.done.recv_timeout(self.close_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.worker.lock().take() {
                    if handle.join().is_err() {
                        error!("Async writer panicked");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    pending = self.pending_count(),
                    "Async writer did not drain in time; detaching"
                );
                self.worker.lock().take();
            }
        }

        if let Some(e) = self.shared.failure.lock().take() {
            warn!(error = %e, "Unreported async write failure at close");
        }
        self.shared.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn can_rollback(&self) -> bool {
        self.shared.inner.can_rollback()
    }
}
