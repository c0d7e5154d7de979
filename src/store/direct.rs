//! Direct store
//!
//! Update-in-place record store over an index volume and a physical volume.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::failpoint;
use crate::{RecId, CATALOG_RECID};

use super::free_space::FreeSpace;
use super::volume::{FileVolume, HeapVolume, Volume};
use super::slot_size;

// =============================================================================
// Format Constants
// =============================================================================

const MAGIC: &[u8; 4] = b"ATDB";
const VERSION: u16 = 1;
const INDEX_HEADER_SIZE: u64 = 32;
const INDEX_ENTRY_SIZE: u64 = 16;

const FLAG_FREE: u32 = 0;
const FLAG_LIVE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    offset: u64,
    len: u32,
    flags: u32,
}

impl IndexEntry {
    const FREE: IndexEntry = IndexEntry {
        offset: 0,
        len: 0,
        flags: FLAG_FREE,
    };

    fn is_live(&self) -> bool {
        self.flags == FLAG_LIVE
    }

    fn slot(&self) -> u64 {
        slot_size(self.len as u64)
    }

    fn encode(&self) -> [u8; INDEX_ENTRY_SIZE as usize] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE as usize];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Self {
        let mut offset = [0u8; 8];
        let mut len = [0u8; 4];
        let mut flags = [0u8; 4];
        offset.copy_from_slice(&buf[0..8]);
        len.copy_from_slice(&buf[8..12]);
        flags.copy_from_slice(&buf[12..16]);
        Self {
            offset: u64::from_le_bytes(offset),
            len: u32::from_le_bytes(len),
            flags: u32::from_le_bytes(flags),
        }
    }
}

/// Mutable allocator and index state, guarded by the store's lock
struct StoreState {
    /// `entries[recid - 1]`
    entries: Vec<IndexEntry>,
    /// Freed ids, reused lowest first
    free_recids: BTreeSet<RecId>,
    /// Preallocated ids not yet written
    reserved: HashSet<RecId>,
    free_space: FreeSpace,
    /// High-water mark of the physical volume
    phys_end: u64,
}

impl StoreState {
    fn entry(&self, recid: RecId) -> Option<&IndexEntry> {
        if recid == 0 {
            return None;
        }
        self.entries.get((recid - 1) as usize)
    }

    fn max_recid(&self) -> RecId {
        self.entries.len() as RecId
    }

    /// Take a free id or grow the index by one
    fn alloc_recid(&mut self) -> (RecId, bool) {
        if let Some(recid) = self.free_recids.pop_first() {
            return (recid, false);
        }
        self.entries.push(IndexEntry::FREE);
        (self.entries.len() as RecId, true)
    }

    /// Find `len` bytes of physical space
    fn alloc_region(&mut self, len: u64) -> u64 {
        let size = slot_size(len);
        if size == 0 {
            return 0;
        }
        if let Some(offset) = self.free_space.take(size) {
            return offset;
        }
        let offset = self.phys_end;
        self.phys_end += size;
        offset
    }

    fn release_region(&mut self, entry: &IndexEntry) {
        if entry.is_live() {
            self.free_space.release(entry.offset, entry.slot());
        }
    }
}

/// Update-in-place record store
///
/// ## Concurrency
/// - `state`: RwLock. Reads hold the shared lock across the volume read so
///   they never observe a record mid-write; mutations and compaction hold
///   it exclusively.
/// - Volumes synchronize their own I/O.
pub struct Store {
    state: RwLock<StoreState>,
    index: Box<dyn Volume>,
    phys: Box<dyn Volume>,
    closed: AtomicBool,
    delete_files_after_close: bool,
}

impl Store {
    /// Create an in-memory store
    pub fn heap() -> Result<Self> {
        Self::open_volumes(Box::new(HeapVolume::new()), Box::new(HeapVolume::new()), false)
    }

    /// Open or create a file-backed store.
    ///
    /// Record data goes to `path`, the index to `{path}.idx`.
    pub fn open_file(path: &Path, delete_files_after_close: bool) -> Result<Self> {
        let phys = FileVolume::open(path)?;
        let index = FileVolume::open(&Self::index_path(path))?;
        Self::open_volumes(Box::new(index), Box::new(phys), delete_files_after_close)
    }

    /// Index file location for a data file
    pub fn index_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".idx");
        PathBuf::from(name)
    }

    /// Open over arbitrary volumes. An empty index volume is initialized.
    pub fn open_volumes(
        index: Box<dyn Volume>,
        phys: Box<dyn Volume>,
        delete_files_after_close: bool,
    ) -> Result<Self> {
        let state = if index.is_empty() {
            Self::init_volumes(index.as_ref())?
        } else {
            Self::load_state(index.as_ref(), phys.as_ref())?
        };

        info!(
            records = state.entries.iter().filter(|e| e.is_live()).count(),
            max_recid = state.max_recid(),
            phys_end = state.phys_end,
            "Store opened"
        );

        Ok(Self {
            state: RwLock::new(state),
            index,
            phys,
            closed: AtomicBool::new(false),
            delete_files_after_close,
        })
    }

    /// Write a fresh header with the catalog slot reserved as an empty
    /// live record
    fn init_volumes(index: &dyn Volume) -> Result<StoreState> {
        let catalog = IndexEntry {
            offset: 0,
            len: 0,
            flags: FLAG_LIVE,
        };
        let state = StoreState {
            entries: vec![catalog],
            free_recids: BTreeSet::new(),
            reserved: HashSet::new(),
            free_space: FreeSpace::new(),
            phys_end: 0,
        };
        debug_assert_eq!(state.max_recid(), CATALOG_RECID);
        Self::write_header_to(index, state.max_recid(), state.phys_end)?;
        index.write_at(Self::entry_offset(CATALOG_RECID), &catalog.encode())?;
        index.sync()?;
        Ok(state)
    }

    /// Rebuild in-memory state from an existing index
    fn load_state(index: &dyn Volume, phys: &dyn Volume) -> Result<StoreState> {
        let mut header = [0u8; INDEX_HEADER_SIZE as usize];
        index.read_at(0, &mut header)?;

        if &header[0..4] != MAGIC {
            return Err(AtlasError::Corruption(format!(
                "Invalid store magic: expected ATDB, got {:?}",
                &header[0..4]
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(AtlasError::Corruption(format!(
                "Unsupported store version: {}",
                version
            )));
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&header[8..16]);
        let max_recid = u64::from_le_bytes(word);
        word.copy_from_slice(&header[16..24]);
        let phys_end = u64::from_le_bytes(word);

        let table_len = max_recid * INDEX_ENTRY_SIZE;
        if INDEX_HEADER_SIZE + table_len > index.len() {
            return Err(AtlasError::Corruption(format!(
                "Index truncated: header claims {} records, file has {} bytes",
                max_recid,
                index.len()
            )));
        }
        if phys_end > phys.len() {
            warn!(
                phys_end,
                phys_len = phys.len(),
                "Physical volume shorter than recorded high-water mark"
            );
        }

        let mut table = vec![0u8; table_len as usize];
        index.read_at(INDEX_HEADER_SIZE, &mut table)?;

        let mut entries = Vec::with_capacity(max_recid as usize);
        let mut free_recids = BTreeSet::new();
        for (i, chunk) in table.chunks_exact(INDEX_ENTRY_SIZE as usize).enumerate() {
            let entry = IndexEntry::decode(chunk);
            if !entry.is_live() {
                free_recids.insert(i as RecId + 1);
            }
            entries.push(entry);
        }

        // Free space = gaps between live slots
        let mut live: Vec<(u64, u64)> = entries
            .iter()
            .filter(|e| e.is_live() && e.len > 0)
            .map(|e| (e.offset, e.slot()))
            .collect();
        live.sort_unstable();

        let mut free_space = FreeSpace::new();
        let mut cursor = 0u64;
        for (offset, size) in live {
            if offset < cursor {
                return Err(AtlasError::Corruption(format!(
                    "Overlapping records at offset {}",
                    offset
                )));
            }
            free_space.release(cursor, offset - cursor);
            cursor = offset + size;
        }
        if cursor > phys_end {
            return Err(AtlasError::Corruption(format!(
                "Record extends to {} past high-water mark {}",
                cursor, phys_end
            )));
        }
        free_space.release(cursor, phys_end - cursor);

        Ok(StoreState {
            entries,
            free_recids,
            reserved: HashSet::new(),
            free_space,
            phys_end,
        })
    }

    // =========================================================================
    // Index I/O
    // =========================================================================

    fn entry_offset(recid: RecId) -> u64 {
        INDEX_HEADER_SIZE + (recid - 1) * INDEX_ENTRY_SIZE
    }

    fn write_header_to(index: &dyn Volume, max_recid: RecId, phys_end: u64) -> Result<()> {
        let mut header = [0u8; INDEX_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&max_recid.to_le_bytes());
        header[16..24].copy_from_slice(&phys_end.to_le_bytes());
        index.write_at(0, &header)
    }

    fn write_header(&self, state: &StoreState) -> Result<()> {
        Self::write_header_to(self.index.as_ref(), state.max_recid(), state.phys_end)
    }

    fn write_entry(&self, recid: RecId, entry: &IndexEntry) -> Result<()> {
        self.index.write_at(Self::entry_offset(recid), &entry.encode())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AtlasError::Closed);
        }
        Ok(())
    }

    // =========================================================================
    // Record Writes
    // =========================================================================
    //
    // The index on disk only ever points at complete bytes, and in-memory
    // state changes only after every volume write has succeeded. A failed
    // write leaves the previous value and the allocator as they were.

    /// Write `data` under an id the caller has already claimed (live,
    /// reserved or freshly allocated). `grew` is set when the id lies past
    /// the maximum recorded in the index header.
    fn write_record(
        &self,
        state: &mut StoreState,
        recid: RecId,
        data: &[u8],
        grew: bool,
    ) -> Result<()> {
        let old = state.entries[(recid - 1) as usize];
        let len = data.len() as u64;
        if len > u32::MAX as u64 {
            return Err(AtlasError::InvalidArgument(format!(
                "record of {} bytes exceeds 4 GiB",
                len
            )));
        }

        if old.is_live() && old.len > 0 && len > 0 && slot_size(len) <= old.slot() {
            return self.overwrite_in_place(state, recid, old, data);
        }

        let phys_end_before = state.phys_end;
        let offset = state.alloc_region(len);
        let entry = IndexEntry {
            offset,
            len: len as u32,
            flags: FLAG_LIVE,
        };

        if let Err(e) = self.persist_relocated(state, recid, &entry, data, grew, phys_end_before) {
            if len > 0 {
                if offset >= phys_end_before {
                    state.phys_end = phys_end_before;
                } else {
                    state.free_space.release(offset, slot_size(len));
                }
            }
            return Err(e);
        }

        state.release_region(&old);
        state.entries[(recid - 1) as usize] = entry;
        state.reserved.remove(&recid);
        Ok(())
    }

    /// Bytes first, then the index. A grown id gets its entry before the
    /// header makes it visible; an existing id sees the header's new
    /// high-water mark before its entry points past the old one.
    fn persist_relocated(
        &self,
        state: &StoreState,
        recid: RecId,
        entry: &IndexEntry,
        data: &[u8],
        grew: bool,
        phys_end_before: u64,
    ) -> Result<()> {
        if !data.is_empty() {
            self.phys.write_at(entry.offset, data)?;
        }
        if grew {
            self.write_entry(recid, entry)?;
            return self.write_header(state);
        }
        if state.phys_end != phys_end_before {
            self.write_header(state)?;
        }
        self.write_entry(recid, entry)
    }

    /// Rewrite a record inside its current slot. The old bytes are kept so
    /// they can be put back if the write or the entry update fails.
    fn overwrite_in_place(
        &self,
        state: &mut StoreState,
        recid: RecId,
        old: IndexEntry,
        data: &[u8],
    ) -> Result<()> {
        let entry = IndexEntry {
            len: data.len() as u32,
            ..old
        };
        let mut previous = vec![0u8; old.len as usize];
        self.phys.read_at(old.offset, &mut previous)?;

        let written = self.phys.write_at(old.offset, data).and_then(|()| {
            if entry == old {
                Ok(())
            } else {
                self.write_entry(recid, &entry)
            }
        });
        if let Err(e) = written {
            if let Err(undo) = self.phys.write_at(old.offset, &previous) {
                warn!(recid, error = %undo, "Failed to put back record after write error");
            }
            return Err(e);
        }

        state.entries[(recid - 1) as usize] = entry;
        Ok(())
    }

    /// Point each record at `base` plus its offset in the compacted image,
    /// one entry at a time
    fn repoint(
        &self,
        state: &mut StoreState,
        layout: &[(RecId, IndexEntry, u64)],
        base: u64,
    ) -> Result<()> {
        for (recid, entry, at) in layout {
            let moved = IndexEntry {
                offset: base + at,
                ..*entry
            };
            self.write_entry(*recid, &moved)?;
            state.entries[(*recid - 1) as usize] = moved;
        }
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Bytes occupied by the index and physical volumes
    pub fn size(&self) -> u64 {
        self.index.len() + self.phys.len()
    }

    /// Bytes currently reusable in the free-space index
    pub fn free_bytes(&self) -> u64 {
        self.state.read().free_space.total()
    }

    /// Number of live records
    pub fn record_count(&self) -> usize {
        self.state.read().entries.iter().filter(|e| e.is_live()).count()
    }

    /// Highest record id ever allocated
    pub fn max_recid(&self) -> RecId {
        self.state.read().max_recid()
    }
}

impl Engine for Store {
    fn preallocate(&self) -> Result<RecId> {
        self.check_open()?;
        let mut state = self.state.write();
        let (recid, grew) = state.alloc_recid();
        if grew {
            let persisted = self
                .write_entry(recid, &IndexEntry::FREE)
                .and_then(|()| self.write_header(&state));
            if let Err(e) = persisted {
                state.entries.pop();
                return Err(e);
            }
        }
        state.reserved.insert(recid);
        Ok(recid)
    }

    fn put(&self, data: &[u8]) -> Result<RecId> {
        self.check_open()?;
        let mut state = self.state.write();
        let (recid, grew) = state.alloc_recid();
        if let Err(e) = self.write_record(&mut state, recid, data, grew) {
            // A grown slot is not visible in the index header; drop it again
            if grew {
                state.entries.pop();
            } else {
                state.free_recids.insert(recid);
            }
            return Err(e);
        }
        Ok(recid)
    }

    fn get(&self, recid: RecId) -> Result<Bytes> {
        self.check_open()?;
        let state = self.state.read();
        if state.reserved.contains(&recid) {
            return Ok(Bytes::new());
        }
        let entry = match state.entry(recid) {
            Some(e) if e.is_live() => *e,
            _ => return Err(AtlasError::RecordNotFound(recid)),
        };
        if entry.len == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; entry.len as usize];
        self.phys.read_at(entry.offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn update(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        let known = state.reserved.contains(&recid)
            || state.entry(recid).map(|e| e.is_live()).unwrap_or(false);
        if !known {
            return Err(AtlasError::RecordNotFound(recid));
        }
        self.write_record(&mut state, recid, data, false)
    }

    fn delete(&self, recid: RecId) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        if state.reserved.remove(&recid) {
            state.free_recids.insert(recid);
            return Ok(());
        }
        let entry = match state.entry(recid) {
            Some(e) if e.is_live() => *e,
            _ => return Err(AtlasError::RecordNotFound(recid)),
        };
        self.write_entry(recid, &IndexEntry::FREE)?;
        state.release_region(&entry);
        state.entries[(recid - 1) as usize] = IndexEntry::FREE;
        state.free_recids.insert(recid);
        Ok(())
    }

    fn restore(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if recid == 0 {
            return Err(AtlasError::InvalidArgument("record id 0 is never valid".to_string()));
        }
        let mut state = self.state.write();
        let max_before = state.max_recid();
        let grew = recid > max_before;
        if grew {
            // Ids skipped over become free; their entries stay invisible
            // until the header is rewritten
            for gap in max_before + 1..recid {
                self.write_entry(gap, &IndexEntry::FREE)?;
            }
            state.entries.resize(recid as usize, IndexEntry::FREE);
        }
        let was_free = state.free_recids.remove(&recid);

        if let Err(e) = self.write_record(&mut state, recid, data, grew) {
            if grew {
                state.entries.truncate(max_before as usize);
            }
            if was_free {
                state.free_recids.insert(recid);
            }
            return Err(e);
        }
        if grew {
            state.free_recids.extend(max_before + 1..recid);
        }
        Ok(())
    }

    fn contains(&self, recid: RecId) -> Result<bool> {
        self.check_open()?;
        let state = self.state.read();
        Ok(state.reserved.contains(&recid)
            || state.entry(recid).map(|e| e.is_live()).unwrap_or(false))
    }

    fn recids(&self) -> Result<Vec<RecId>> {
        self.check_open()?;
        let state = self.state.read();
        Ok(state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_live())
            .map(|(i, _)| i as RecId + 1)
            .collect())
    }

    fn commit(&self) -> Result<()> {
        self.check_open()?;
        let _state = self.state.read();
        self.phys.sync()?;
        self.index.sync()?;
        debug!("Store synced");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.check_open()?;
        Err(AtlasError::Unsupported(
            "rollback requires the transaction layer".to_string(),
        ))
    }

    /// Rewrite live records contiguously from offset 0, keeping their ids.
    ///
    /// Done in two moves so the index on disk always points at complete
    /// bytes. Live records are copied past the high-water mark and the index
    /// is switched over to the copy; the copy is then written at offset 0 and
    /// the index switched again. The volume is truncated last. Holds the
    /// exclusive lock throughout.
    fn compact(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        let before = state.phys_end;

        let mut live: Vec<(RecId, IndexEntry)> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_live() && e.len > 0)
            .map(|(i, e)| (i as RecId + 1, *e))
            .collect();
        live.sort_unstable_by_key(|(_, e)| e.offset);

        // (recid, current entry, offset in the compacted image)
        let mut layout = Vec::with_capacity(live.len());
        let mut total = 0u64;
        for (recid, entry) in live {
            layout.push((recid, entry, total));
            total += entry.slot();
        }

        let mut image = vec![0u8; total as usize];
        for (_, entry, at) in &layout {
            let start = *at as usize;
            self.phys
                .read_at(entry.offset, &mut image[start..start + entry.len as usize])?;
        }

        // Move 1: past the high-water mark. The header covers the copy
        // before any entry points into it.
        self.phys.write_at(before, &image)?;
        self.phys.sync()?;
        state.phys_end = before + total;
        self.write_header(&state)?;
        self.repoint(&mut state, &layout, before)?;
        self.index.sync()?;

        // Nothing references [0, before) any more
        state.free_space.clear();
        failpoint::maybe_fail("store.compact.between_moves")?;

        // Move 2: down to offset 0
        self.phys.write_at(0, &image)?;
        self.phys.sync()?;
        self.repoint(&mut state, &layout, 0)?;
        self.index.sync()?;

        state.phys_end = total;
        self.write_header(&state)?;
        self.index.sync()?;
        self.phys.truncate(total)?;
        self.phys.sync()?;

        info!(
            records = layout.len(),
            before_bytes = before,
            after_bytes = total,
            "Store compacted"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _state = self.state.write();
        self.phys.close()?;
        self.index.close()?;

        if self.delete_files_after_close {
            for path in [self.phys.path(), self.index.path()].into_iter().flatten() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "Failed to delete store file");
                }
            }
        }
        debug!("Store closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn can_rollback(&self) -> bool {
        false
    }
}
