//! Transaction layer
//!
//! Buffers every mutation since the last commit and makes the whole group
//! durable at once through the WAL.
//!
//! ## Commit Protocol
//! ```text
//!   OPEN ──commit──▶ COMMIT_REQUESTED ──WAL synced──▶ DURABLE
//!     │                     │                           │
//!     │              (log failure)                 apply to store
//!  rollback                 ▼                      store.commit()
//!     ▼                 DISCARDED                  WAL truncate
//!  ROLLBACK_REQUESTED ──▶ DISCARDED
//! ```
//! The WAL receives one `Write`/`Delete` per touched record, then a single
//! `Commit` marker, then an fsync. Replay only applies groups that end in a
//! marker, so a crash before DURABLE leaves no trace.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::WalSyncStrategy;
use crate::error::{AtlasError, Result};
use crate::failpoint;
use crate::wal::{Operation, WalEntry, WalRecovery, WalWriter};
use crate::RecId;

use super::Engine;

/// Lifecycle of the current transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting mutations
    Open,
    /// Commit started, WAL not yet synced
    CommitRequested,
    /// WAL synced; the group survives a crash
    Durable,
    /// Rollback started
    RollbackRequested,
    /// The group was dropped and will never be applied
    Discarded,
}

#[derive(Debug, Clone)]
enum Pending {
    Write(Bytes),
    Deleted,
}

struct TxInner {
    dirty: BTreeMap<RecId, Pending>,
    /// Ids preallocated from the store during this transaction
    allocated: BTreeSet<RecId>,
    state: TxState,
    tx_id: u64,
}

impl TxInner {
    /// A durable group whose apply step failed must be finished first
    fn check_writable(&self) -> Result<()> {
        if self.state == TxState::Durable && !self.dirty.is_empty() {
            return Err(AtlasError::Storage(
                "previous commit is durable but not applied; call commit again".to_string(),
            ));
        }
        Ok(())
    }

    fn begin_mutation(&mut self) -> Result<()> {
        self.check_writable()?;
        self.state = TxState::Open;
        Ok(())
    }
}

/// Buffered transactions with WAL-backed commit
///
/// ## Concurrency
/// - `tx`: RwLock. Reads share it; mutations, commit and rollback hold it
///   exclusively, so no reader observes a half-applied commit.
/// - `wal`: Mutex, only taken while `tx` is held for writing.
pub struct TxEngine {
    inner: Arc<dyn Engine>,
    tx: RwLock<TxInner>,
    wal: Option<Mutex<WalWriter>>,
    wal_path: Option<PathBuf>,
    closed: AtomicBool,
    delete_files_after_close: bool,
}

impl TxEngine {
    /// Wrap `inner`, replaying any committed groups left in the WAL
    ///
    /// On startup:
    /// 1. Recover the WAL (drop a torn or corrupt tail)
    /// 2. Apply every group terminated by a `Commit` marker
    /// 3. Commit the store and truncate the WAL
    ///
    /// Without a WAL path the layer still buffers and rolls back, but a
    /// commit is only as durable as `inner.commit()`.
    pub fn open(
        inner: Arc<dyn Engine>,
        wal_path: Option<&Path>,
        sync_strategy: WalSyncStrategy,
        delete_files_after_close: bool,
    ) -> Result<Self> {
        let mut next_tx_id = 1;

        let wal = match wal_path {
            Some(path) => {
                if path.exists() {
                    let (entries, result) = WalRecovery::recover(path)?;
                    if result.entries_corrupted > 0 {
                        warn!(
                            path = %path.display(),
                            last_lsn = result.last_lsn,
                            "WAL replay stops at corrupt entry"
                        );
                    }
                    let (applied, last_tx) = Self::replay(inner.as_ref(), entries)?;
                    if applied > 0 {
                        inner.commit()?;
                        info!(transactions = applied, "Replayed committed transactions from WAL");
                    }
                    next_tx_id = last_tx + 1;
                }

                let mut writer = WalWriter::open(path, sync_strategy)?;
                writer.truncate()?;
                Some(Mutex::new(writer))
            }
            None => None,
        };

        Ok(Self {
            inner,
            tx: RwLock::new(TxInner {
                dirty: BTreeMap::new(),
                allocated: BTreeSet::new(),
                state: TxState::Open,
                tx_id: next_tx_id,
            }),
            wal,
            wal_path: wal_path.map(Path::to_path_buf),
            closed: AtomicBool::new(false),
            delete_files_after_close,
        })
    }

    /// Apply terminated groups; returns (groups applied, last tx id seen)
    fn replay(inner: &dyn Engine, entries: Vec<WalEntry>) -> Result<(usize, u64)> {
        let mut group: Vec<Operation> = Vec::new();
        let mut applied = 0;
        let mut last_tx = 0;

        for entry in entries {
            match entry.operation {
                Operation::Commit { tx_id } => {
                    for op in group.drain(..) {
                        Self::redo(inner, op)?;
                    }
                    applied += 1;
                    last_tx = tx_id;
                }
                op => group.push(op),
            }
        }

        if !group.is_empty() {
            warn!(
                operations = group.len(),
                "Discarding WAL operations without a commit marker"
            );
        }
        Ok((applied, last_tx))
    }

    fn redo(inner: &dyn Engine, op: Operation) -> Result<()> {
        match op {
            Operation::Write { recid, value } => inner.restore(recid, &value),
            Operation::Delete { recid } => match inner.delete(recid) {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            },
            Operation::Commit { .. } => Ok(()),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AtlasError::Closed);
        }
        Ok(())
    }

    /// Whether `recid` exists as seen from inside the transaction
    fn visible(&self, tx: &TxInner, recid: RecId) -> Result<bool> {
        match tx.dirty.get(&recid) {
            Some(Pending::Write(_)) => Ok(true),
            Some(Pending::Deleted) => Ok(false),
            None => self.inner.contains(recid),
        }
    }

    /// Reserve an id below that no pending restore already targets
    fn alloc_recid(&self, tx: &mut TxInner) -> Result<RecId> {
        let mut skipped = Vec::new();
        let recid = loop {
            let recid = self.inner.preallocate()?;
            if tx.dirty.contains_key(&recid) {
                skipped.push(recid);
            } else {
                break recid;
            }
        };
        for id in skipped {
            self.inner.delete(id)?;
        }
        tx.allocated.insert(recid);
        Ok(recid)
    }

    /// Log the group, marker last, and sync
    fn log_group(wal: &mut WalWriter, tx: &TxInner) -> Result<()> {
        for (recid, pending) in &tx.dirty {
            let op = match pending {
                Pending::Write(data) => Operation::Write {
                    recid: *recid,
                    value: data.to_vec(),
                },
                Pending::Deleted => Operation::Delete { recid: *recid },
            };
            wal.append(op)?;
        }
        wal.append(Operation::Commit { tx_id: tx.tx_id })?;
        wal.sync()
    }

    /// Push a durable group into the store. Safe to repeat.
    fn apply(&self, tx: &TxInner) -> Result<()> {
        for (recid, pending) in &tx.dirty {
            match pending {
                Pending::Write(data) => self.inner.restore(*recid, data)?,
                Pending::Deleted => match self.inner.delete(*recid) {
                    Err(e) if e.is_not_found() => {}
                    other => other?,
                },
            }
        }
        self.inner.commit()
    }

    /// Drop the group and hand reserved ids back to the store
    fn discard(&self, tx: &mut TxInner) {
        for recid in std::mem::take(&mut tx.allocated) {
            if let Err(e) = self.inner.delete(recid) {
                if !e.is_not_found() {
                    warn!(recid, error = %e, "Failed to release preallocated record");
                }
            }
        }
        tx.dirty.clear();
        tx.state = TxState::Discarded;
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// State of the current (or most recently finished) transaction
    pub fn state(&self) -> TxState {
        self.tx.read().state
    }

    /// Number of records touched since the last commit
    pub fn pending_count(&self) -> usize {
        self.tx.read().dirty.len()
    }

    pub fn wal_path(&self) -> Option<&Path> {
        self.wal_path.as_deref()
    }
}

impl Engine for TxEngine {
    fn preallocate(&self) -> Result<RecId> {
        self.check_open()?;
        let mut tx = self.tx.write();
        tx.begin_mutation()?;
        let recid = self.alloc_recid(&mut tx)?;
        tx.dirty.insert(recid, Pending::Write(Bytes::new()));
        Ok(recid)
    }

    fn put(&self, data: &[u8]) -> Result<RecId> {
        self.check_open()?;
        let mut tx = self.tx.write();
        tx.begin_mutation()?;
        let recid = self.alloc_recid(&mut tx)?;
        tx.dirty
            .insert(recid, Pending::Write(Bytes::copy_from_slice(data)));
        Ok(recid)
    }

    fn get(&self, recid: RecId) -> Result<Bytes> {
        self.check_open()?;
        let tx = self.tx.read();
        match tx.dirty.get(&recid) {
            Some(Pending::Write(data)) => Ok(data.clone()),
            Some(Pending::Deleted) => Err(AtlasError::RecordNotFound(recid)),
            None => self.inner.get(recid),
        }
    }

    fn update(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut tx = self.tx.write();
        tx.begin_mutation()?;
        if !self.visible(&tx, recid)? {
            return Err(AtlasError::RecordNotFound(recid));
        }
        tx.dirty
            .insert(recid, Pending::Write(Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn delete(&self, recid: RecId) -> Result<()> {
        self.check_open()?;
        let mut tx = self.tx.write();
        tx.begin_mutation()?;
        if !self.visible(&tx, recid)? {
            return Err(AtlasError::RecordNotFound(recid));
        }
        tx.dirty.insert(recid, Pending::Deleted);
        Ok(())
    }

    fn restore(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if recid == 0 {
            return Err(AtlasError::InvalidArgument("record id 0 is never valid".to_string()));
        }
        let mut tx = self.tx.write();
        tx.begin_mutation()?;
        tx.dirty
            .insert(recid, Pending::Write(Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn contains(&self, recid: RecId) -> Result<bool> {
        self.check_open()?;
        let tx = self.tx.read();
        self.visible(&tx, recid)
    }

    fn recids(&self) -> Result<Vec<RecId>> {
        self.check_open()?;
        let tx = self.tx.read();
        let mut ids: BTreeSet<RecId> = self.inner.recids()?.into_iter().collect();
        for (recid, pending) in &tx.dirty {
            match pending {
                Pending::Write(_) => ids.insert(*recid),
                Pending::Deleted => ids.remove(recid),
            };
        }
        Ok(ids.into_iter().collect())
    }

    fn commit(&self) -> Result<()> {
        self.check_open()?;
        let mut tx = self.tx.write();

        let retry = tx.state == TxState::Durable && !tx.dirty.is_empty();
        if !retry {
            if tx.dirty.is_empty() {
                return self.inner.commit();
            }

            tx.state = TxState::CommitRequested;
            if let Some(wal) = &self.wal {
                let mut wal = wal.lock();
                if let Err(e) = Self::log_group(&mut wal, &tx) {
                    error!(tx_id = tx.tx_id, error = %e, "WAL write failed, transaction discarded");
                    if let Err(te) = wal.truncate() {
                        error!(error = %te, "Failed to truncate WAL after aborted commit");
                    }
                    self.discard(&mut tx);
                    return Err(e);
                }
            }
            tx.state = TxState::Durable;
        }

        failpoint::maybe_fail("tx.after_wal_sync")?;

        // From here on the group is in the WAL; an apply failure leaves it
        // there for replay and the next commit retries.
        if let Err(e) = self.apply(&tx) {
            error!(tx_id = tx.tx_id, error = %e, "Applying durable transaction failed");
            return Err(e);
        }
        if let Some(wal) = &self.wal {
            wal.lock().truncate()?;
        }

        debug!(tx_id = tx.tx_id, records = tx.dirty.len(), "Transaction committed");
        tx.dirty.clear();
        tx.allocated.clear();
        tx.tx_id += 1;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.check_open()?;
        let mut tx = self.tx.write();
        tx.check_writable()?;
        tx.state = TxState::RollbackRequested;
        let discarded = tx.dirty.len();
        self.discard(&mut tx);
        debug!(tx_id = tx.tx_id, records = discarded, "Transaction rolled back");
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        self.check_open()?;
        let _tx = self.tx.write();
        self.inner.compact()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut tx = self.tx.write();
        if !tx.dirty.is_empty() && tx.state != TxState::Durable {
            warn!(records = tx.dirty.len(), "Closing with uncommitted changes; discarding");
            self.discard(&mut tx);
        }
        self.inner.close()?;

        if self.delete_files_after_close {
            if let Some(path) = &self.wal_path {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to delete WAL");
                }
            }
        }
        debug!("Transaction layer closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn can_rollback(&self) -> bool {
        true
    }
}
