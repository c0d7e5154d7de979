//! Append-only store
//!
//! Every mutation is appended to the newest segment; nothing is overwritten.
//!
//! ## Segment Record Format
//! ```text
//! ┌──────────┬────────────┬──────────┬─────────────────┐
//! │ CRC (4)  │ Recid (8)  │ Len (4)  │ Data (Len)      │
//! └──────────┴────────────┴──────────┴─────────────────┘
//! ```
//! - CRC32 covers recid, len and data
//! - Len = u32::MAX marks a tombstone (no data bytes)
//!
//! The index (recid → newest location) lives in memory and is rebuilt on
//! open by replaying segments oldest → newest. Compaction writes the live
//! records into new, higher-numbered segments before removing the old ones,
//! so a replay after an interrupted compaction still yields the same state.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::{AtlasError, Result};
use crate::{RecId, CATALOG_RECID};

use super::volume::{FileVolume, Volume};

/// Record header: CRC (4) + Recid (8) + Len (4) = 16 bytes
const RECORD_HEADER_SIZE: u64 = 16;

/// Sentinel length marking a deleted record
const TOMBSTONE_MARKER: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Location {
    segment: u64,
    /// Offset of the record header
    offset: u64,
    len: u32,
}

struct AppendState {
    /// recid → location of its newest version
    index: BTreeMap<RecId, Location>,
    free_recids: BTreeSet<RecId>,
    reserved: HashSet<RecId>,
    max_recid: RecId,
    /// Open segments by id, oldest first
    segments: BTreeMap<u64, FileVolume>,
    active: u64,
}

impl AppendState {
    fn alloc_recid(&mut self) -> RecId {
        if let Some(recid) = self.free_recids.pop_first() {
            return recid;
        }
        self.max_recid += 1;
        self.max_recid
    }

    fn active_segment(&self) -> Result<&FileVolume> {
        self.segments
            .get(&self.active)
            .ok_or_else(|| AtlasError::Storage(format!("active segment {} missing", self.active)))
    }
}

/// Append-only, segment-based record store
///
/// ## Concurrency
/// - `state`: RwLock, shared for reads, exclusive for appends and compaction
pub struct AppendStore {
    dir: PathBuf,
    state: RwLock<AppendState>,
    segment_size: u64,
    closed: AtomicBool,
    delete_files_after_close: bool,
}

impl AppendStore {
    /// Open or create an append-only store in `dir`
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Discover existing segment files
    /// 3. Replay them in id order to rebuild the index
    /// 4. Truncate a torn tail in the newest segment
    pub fn open(dir: &Path, segment_size: u64, delete_files_after_close: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut segment_ids: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_path = entry.path();
            if file_path.is_file() {
                if let Some(id) = Self::parse_segment_id(&file_path) {
                    segment_ids.push(id);
                }
            }
        }
        segment_ids.sort_unstable();

        let mut state = AppendState {
            index: BTreeMap::new(),
            free_recids: BTreeSet::new(),
            reserved: HashSet::new(),
            max_recid: 0,
            segments: BTreeMap::new(),
            active: 0,
        };

        let fresh = segment_ids.is_empty();
        if fresh {
            segment_ids.push(1);
        }

        let newest = segment_ids.last().copied().unwrap_or(1);
        for id in &segment_ids {
            let volume = FileVolume::open(&Self::segment_path(dir, *id))?;
            Self::replay_segment(&mut state, *id, &volume, *id == newest)?;
            state.segments.insert(*id, volume);
        }
        state.active = newest;

        for recid in 1..=state.max_recid {
            if !state.index.contains_key(&recid) {
                state.free_recids.insert(recid);
            }
        }

        let store = Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            segment_size: segment_size.max(RECORD_HEADER_SIZE),
            closed: AtomicBool::new(false),
            delete_files_after_close,
        };

        if fresh {
            // Reserve the catalog slot as an empty record
            let mut state = store.state.write();
            state.max_recid = CATALOG_RECID;
            store.append(&mut state, CATALOG_RECID, Some(&[]))?;
            state.active_segment()?.sync()?;
        }

        {
            let state = store.state.read();
            info!(
                dir = %store.dir.display(),
                segments = state.segments.len(),
                records = state.index.len(),
                "Append store opened"
            );
        }
        Ok(store)
    }

    /// Rebuild index entries from one segment
    fn replay_segment(
        state: &mut AppendState,
        segment: u64,
        volume: &FileVolume,
        is_newest: bool,
    ) -> Result<()> {
        let len = volume.len();
        let mut data = vec![0u8; len as usize];
        volume.read_at(0, &mut data)?;

        let mut pos = 0usize;
        while pos < data.len() {
            match Self::parse_record(&data[pos..]) {
                Some((recid, record_len, consumed)) => {
                    if record_len == TOMBSTONE_MARKER {
                        state.index.remove(&recid);
                    } else {
                        state.index.insert(
                            recid,
                            Location {
                                segment,
                                offset: pos as u64,
                                len: record_len,
                            },
                        );
                    }
                    state.max_recid = state.max_recid.max(recid);
                    pos += consumed;
                }
                None if is_newest => {
                    warn!(
                        segment,
                        offset = pos,
                        dropped_bytes = data.len() - pos,
                        "Truncating torn tail of newest segment"
                    );
                    volume.truncate(pos as u64)?;
                    volume.sync()?;
                    break;
                }
                None => {
                    return Err(AtlasError::Corruption(format!(
                        "bad record in sealed segment {} at offset {}",
                        segment, pos
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse one record; `None` when truncated or failing the CRC check.
    /// Returns (recid, len field, bytes consumed).
    fn parse_record(buf: &[u8]) -> Option<(RecId, u32, usize)> {
        if buf.len() < RECORD_HEADER_SIZE as usize {
            return None;
        }
        let crc = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        let recid = u64::from_le_bytes(buf[4..12].try_into().ok()?);
        let len = u32::from_le_bytes(buf[12..16].try_into().ok()?);

        let data_len = if len == TOMBSTONE_MARKER { 0 } else { len as usize };
        let end = RECORD_HEADER_SIZE as usize + data_len;
        if buf.len() < end || recid == 0 {
            return None;
        }
        if crc32fast::hash(&buf[4..end]) != crc {
            return None;
        }
        Some((recid, len, end))
    }

    fn encode_record(recid: RecId, data: Option<&[u8]>) -> Vec<u8> {
        let payload = data.unwrap_or(&[]);
        let len = match data {
            Some(d) => d.len() as u32,
            None => TOMBSTONE_MARKER,
        };
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&recid.to_le_bytes());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        let crc = crc32fast::hash(&buf[4..]);
        buf[0..4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Append a version (or tombstone) of `recid` and point the index at it
    fn append(&self, state: &mut AppendState, recid: RecId, data: Option<&[u8]>) -> Result<()> {
        if let Some(d) = data {
            if d.len() as u64 >= TOMBSTONE_MARKER as u64 {
                return Err(AtlasError::InvalidArgument(format!(
                    "record of {} bytes exceeds 4 GiB",
                    d.len()
                )));
            }
        }

        self.maybe_roll(state)?;
        let record = Self::encode_record(recid, data);
        let segment = state.active;
        let volume = state.active_segment()?;
        let offset = volume.len();
        volume.write_at(offset, &record)?;

        match data {
            Some(d) => {
                state.index.insert(
                    recid,
                    Location {
                        segment,
                        offset,
                        len: d.len() as u32,
                    },
                );
            }
            None => {
                state.index.remove(&recid);
            }
        }
        state.reserved.remove(&recid);
        Ok(())
    }

    /// Seal the active segment and start a new one once it is full
    fn maybe_roll(&self, state: &mut AppendState) -> Result<()> {
        let active = state.active_segment()?;
        if active.len() < self.segment_size {
            return Ok(());
        }
        active.sync()?;
        let next = state.active + 1;
        let volume = FileVolume::open(&Self::segment_path(&self.dir, next))?;
        state.segments.insert(next, volume);
        state.active = next;
        debug!(segment = next, "Rolled to new segment");
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AtlasError::Closed);
        }
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Total bytes across all segments
    pub fn size(&self) -> u64 {
        self.state.read().segments.values().map(|v| v.len()).sum()
    }

    /// Number of segment files
    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Directory holding the segments
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Segment path given a directory and ID
    fn segment_path(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("segment_{:06}.log", id))
    }

    /// Parse segment ID from filename
    /// "segment_000042.log" → Some(42)
    fn parse_segment_id(path: &Path) -> Option<u64> {
        if path.extension()? != "log" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        let id_str = name.strip_prefix("segment_")?;
        id_str.parse().ok()
    }
}

impl Engine for AppendStore {
    fn preallocate(&self) -> Result<RecId> {
        self.check_open()?;
        let mut state = self.state.write();
        let recid = state.alloc_recid();
        state.reserved.insert(recid);
        Ok(recid)
    }

    fn put(&self, data: &[u8]) -> Result<RecId> {
        self.check_open()?;
        let mut state = self.state.write();
        let recid = state.alloc_recid();
        if let Err(e) = self.append(&mut state, recid, Some(data)) {
            state.free_recids.insert(recid);
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
        let location = state
            .index
            .get(&recid)
            .copied()
            .ok_or(AtlasError::RecordNotFound(recid))?;
        if location.len == 0 {
            return Ok(Bytes::new());
        }
        let volume = state
            .segments
            .get(&location.segment)
            .ok_or_else(|| AtlasError::Storage(format!("segment {} missing", location.segment)))?;
        let mut buf = vec![0u8; location.len as usize];
        volume.read_at(location.offset + RECORD_HEADER_SIZE, &mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn update(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        if !state.index.contains_key(&recid) && !state.reserved.contains(&recid) {
            return Err(AtlasError::RecordNotFound(recid));
        }
        self.append(&mut state, recid, Some(data))
    }

    fn delete(&self, recid: RecId) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        if state.reserved.remove(&recid) {
            state.free_recids.insert(recid);
            return Ok(());
        }
        if !state.index.contains_key(&recid) {
            return Err(AtlasError::RecordNotFound(recid));
        }
        self.append(&mut state, recid, None)?;
        state.free_recids.insert(recid);
        Ok(())
    }

    fn restore(&self, recid: RecId, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if recid == 0 {
            return Err(AtlasError::InvalidArgument("record id 0 is never valid".to_string()));
        }
        let mut state = self.state.write();
        while state.max_recid < recid {
            state.max_recid += 1;
            let grown = state.max_recid;
            if grown != recid {
                state.free_recids.insert(grown);
            }
        }
        state.free_recids.remove(&recid);
        self.append(&mut state, recid, Some(data))
    }

    fn contains(&self, recid: RecId) -> Result<bool> {
        self.check_open()?;
        let state = self.state.read();
        Ok(state.index.contains_key(&recid) || state.reserved.contains(&recid))
    }

    fn recids(&self) -> Result<Vec<RecId>> {
        self.check_open()?;
        Ok(self.state.read().index.keys().copied().collect())
    }

    fn commit(&self) -> Result<()> {
        self.check_open()?;
        let state = self.state.read();
        state.active_segment()?.sync()?;
        debug!(segment = state.active, "Append store synced");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.check_open()?;
        Err(AtlasError::Unsupported(
            "rollback requires the transaction layer".to_string(),
        ))
    }

    /// Copy live records into fresh segments, then drop the old ones
    fn compact(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.write();
        let old_ids: Vec<u64> = state.segments.keys().copied().collect();
        let live: Vec<(RecId, Location)> = state.index.iter().map(|(r, l)| (*r, *l)).collect();

        let mut records = Vec::with_capacity(live.len());
        for (recid, location) in &live {
            let volume = state.segments.get(&location.segment).ok_or_else(|| {
                AtlasError::Storage(format!("segment {} missing", location.segment))
            })?;
            let mut buf = vec![0u8; location.len as usize];
            volume.read_at(location.offset + RECORD_HEADER_SIZE, &mut buf)?;
            records.push((*recid, buf));
        }

        // Start the rewrite in a brand new segment
        let first_new = state.active + 1;
        let volume = FileVolume::open(&Self::segment_path(&self.dir, first_new))?;
        state.segments.insert(first_new, volume);
        state.active = first_new;

        for (recid, data) in &records {
            self.append(&mut state, *recid, Some(data))?;
        }
        for volume in state.segments.range(first_new..).map(|(_, v)| v) {
            volume.sync()?;
        }

        for id in &old_ids {
            if let Some(volume) = state.segments.remove(id) {
                volume.close()?;
                if let Some(path) = volume.path() {
                    fs::remove_file(path)?;
                }
            }
        }

        info!(
            records = records.len(),
            removed_segments = old_ids.len(),
            "Append store compacted"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let state = self.state.write();
        for volume in state.segments.values() {
            volume.close()?;
            if self.delete_files_after_close {
                if let Some(path) = volume.path() {
                    if let Err(e) = fs::remove_file(path) {
                        warn!(path = %path.display(), error = %e, "Failed to delete segment");
                    }
                }
            }
        }
        debug!(dir = %self.dir.display(), "Append store closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn can_rollback(&self) -> bool {
        false
    }
}
