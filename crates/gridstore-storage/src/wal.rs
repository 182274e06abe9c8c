//! Write-Ahead Log
//!
//! Append-only log of page deltas, checkpoint markers and cache lifecycle
//! records with:
//! - Gap-free LSNs assigned under the writer lock (file order is LSN order)
//! - CRC32C checksums over each record header and over the whole record
//! - Lazy, restartable replay from any LSN
//! - Segment files rotated at checkpoints; whole segments older than a
//!   checkpoint are deleted (or archived)
//!
//! Segments are named `wal-<first LSN>.log` and hold consecutive LSNs.
//! Record format:
//! ```text
//! +--------+------+--------+------------+---------+--------+
//! | Magic  | LSN  | Length | Header CRC | Payload | CRC32C |
//! | 4B     | 8B   | 4B     | 4B         | var     | 4B     |
//! +--------+------+--------+------------+---------+--------+
//! ```
//! The length is only trusted once the header CRC matches. A record cut
//! short by a crash can only be the last one of the last segment; it is
//! discarded when the log is opened. A damaged record with data after it is
//! corruption.

use crate::registry::CacheDescriptor;
use gridstore_common::codec::{checksum, read_u32, read_u64};
use gridstore_common::config::{Durability, WalConfig};
use gridstore_common::{CacheId, Error, Lsn, PageId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// WAL record magic number
const WAL_MAGIC: u32 = 0x4757_414C; // "GWAL"

/// Record header size (magic + lsn + length + header crc)
const RECORD_HEADER_SIZE: usize = 20;

/// Header bytes covered by the header CRC
const HEADER_CRC_OFFSET: usize = 16;

/// Record trailer size (crc)
const RECORD_TRAILER_SIZE: usize = 4;

/// Largest payload accepted when reading
const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

/// Physical change to one page: `bytes` written at `offset`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDelta {
    pub page: PageId,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Logged operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalPayload {
    /// Deltas of one mutation batch of a cache
    PageUpdate {
        cache_id: CacheId,
        deltas: Vec<PageDelta>,
    },
    /// Start of a checkpoint; its LSN is the checkpoint marker
    CheckpointBegin,
    /// Every page dirtied before `begin` is in the page store
    CheckpointEnd { begin: Lsn },
    CacheCreate { descriptor: CacheDescriptor },
    CacheDestroy { cache_id: CacheId },
}

impl WalPayload {
    /// Short name for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PageUpdate { .. } => "page-update",
            Self::CheckpointBegin => "checkpoint-begin",
            Self::CheckpointEnd { .. } => "checkpoint-end",
            Self::CacheCreate { .. } => "cache-create",
            Self::CacheDestroy { .. } => "cache-destroy",
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn from_bytes(lsn: Lsn, data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| Error::corrupt_log(lsn, format!("undecodable payload: {e}")))
    }
}

/// A decoded WAL record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    /// Log Sequence Number
    pub lsn: Lsn,
    pub payload: WalPayload,
}

/// Serialize one frame
fn encode_frame(lsn: Lsn, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + data.len() + RECORD_TRAILER_SIZE);
    buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    let header_crc = checksum(&buf);
    buf.extend_from_slice(&header_crc.to_le_bytes());
    buf.extend_from_slice(data);

    // CRC over everything except the CRC itself
    let crc = checksum(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn segment_name(start: Lsn) -> String {
    format!("{SEGMENT_PREFIX}{start:020}{SEGMENT_SUFFIX}")
}

fn parse_segment_name(name: &str) -> Option<Lsn> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
        .filter(|&start| start > 0)
}

/// Start LSNs of the segments in `dir`, ascending
fn list_segments(dir: &Path) -> Result<Vec<Lsn>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io("failed to list WAL directory", e))?;
    let mut starts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("failed to list WAL directory", e))?;
        if let Some(start) = entry.file_name().to_str().and_then(parse_segment_name) {
            starts.push(start);
        }
    }
    starts.sort_unstable();
    Ok(starts)
}

/// Open (or create) a segment positioned at its end
fn open_segment(path: &Path) -> Result<File> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::io("failed to open WAL segment", e))?;
    file.seek(SeekFrom::End(0))
        .map_err(|e| Error::io("failed to seek WAL segment", e))?;
    Ok(file)
}

/// Scan one segment: (records, end of the last intact record, file length)
fn scan_segment(path: &Path, start: Lsn) -> Result<(u64, u64, u64)> {
    let Some(mut frames) = FrameReader::open(path)? else {
        return Ok((0, 0, 0));
    };

    let mut records = 0u64;
    while let Some((lsn, data)) = frames.next_frame()? {
        let expected = start + records;
        if lsn != expected {
            return Err(Error::corrupt_log(
                lsn,
                format!("sequence gap, expected LSN {expected}"),
            ));
        }
        WalPayload::from_bytes(lsn, &data)?;
        records += 1;
    }
    Ok((records, frames.valid_end(), frames.len))
}

/// Flush directory metadata so a rename survives a crash
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| Error::io("directory sync failed", e))
}

/// One segment file
#[derive(Clone, Debug)]
struct Segment {
    /// LSN of its first record
    start: Lsn,
    path: PathBuf,
    bytes: u64,
    records: u64,
}

struct WalWriter {
    file: BufWriter<File>,
    next_lsn: Lsn,
    /// Segment being appended to
    segment: Segment,
}

/// Write-Ahead Log of one node
pub struct Wal {
    dir: PathBuf,
    /// Serialized append path
    writer: Mutex<WalWriter>,
    /// Closed segments, oldest first. Taken after `writer` when both are held.
    segments: Mutex<Vec<Segment>>,
    /// Last assigned LSN
    current: AtomicU64,
    /// LSN of the first record in the log (0 when empty)
    first: AtomicU64,
    /// Total size of all segments
    size: AtomicU64,
    config: WalConfig,
    durability: Durability,
}

impl Wal {
    /// Open (or create) the log in `dir`
    ///
    /// A torn record at the end of the last segment is cut off. Any other
    /// damage, including a gap between segments, is reported as `CorruptLog`.
    pub fn open(dir: impl AsRef<Path>, config: &WalConfig, durability: Durability) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| Error::io("failed to create WAL directory", e))?;

        let starts = list_segments(dir)?;
        let mut segments = Vec::with_capacity(starts.len());
        let mut first = 0;
        let mut size = 0;
        let mut expected: Option<Lsn> = None;
        for (i, &start) in starts.iter().enumerate() {
            if let Some(expected) = expected
                && start != expected
            {
                return Err(Error::corrupt_log(
                    start,
                    format!("segment follows a gap, expected LSN {expected}"),
                ));
            }

            let path = dir.join(segment_name(start));
            let (records, valid_end, len) = scan_segment(&path, start)?;
            if valid_end < len {
                if i + 1 < starts.len() {
                    return Err(Error::corrupt_log(
                        start + records,
                        "damaged record inside a closed segment",
                    ));
                }
                warn!(
                    "Discarding {} bytes of torn WAL tail after LSN {}",
                    len - valid_end,
                    start + records - 1
                );
                OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .and_then(|file| {
                        file.set_len(valid_end)?;
                        file.sync_all()
                    })
                    .map_err(|e| Error::io("failed to truncate torn WAL tail", e))?;
            }

            if records > 0 && first == 0 {
                first = start;
            }
            expected = Some(start + records);
            size += valid_end;
            segments.push(Segment {
                start,
                path,
                bytes: valid_end,
                records,
            });
        }

        let active = match segments.pop() {
            Some(segment) => segment,
            None => Segment {
                start: 1,
                path: dir.join(segment_name(1)),
                bytes: 0,
                records: 0,
            },
        };
        let file = open_segment(&active.path)?;
        if starts.is_empty() && durability.sync() {
            sync_dir(dir)?;
        }

        let next_lsn = active.start + active.records;
        info!(
            "Opened WAL {:?}: {} segments, LSN {}..={}, {} bytes",
            dir,
            segments.len() + 1,
            first,
            next_lsn - 1,
            size
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            writer: Mutex::new(WalWriter {
                file: BufWriter::with_capacity(config.write_buffer_size, file),
                next_lsn,
                segment: active,
            }),
            segments: Mutex::new(segments),
            current: AtomicU64::new(next_lsn - 1),
            first: AtomicU64::new(first),
            size: AtomicU64::new(size),
            config: config.clone(),
            durability,
        })
    }

    /// Append a record; returns its LSN
    ///
    /// With full durability the record is on stable storage when this
    /// returns. A failure leaves the outcome unknown and must be treated as
    /// fatal by the caller.
    pub fn append(&self, payload: &WalPayload) -> Result<Lsn> {
        let data = payload.to_bytes()?;

        let mut writer = self.writer.lock();
        let lsn = writer.next_lsn;
        let bytes = encode_frame(lsn, &data);

        writer
            .file
            .write_all(&bytes)
            .map_err(|e| Error::io("WAL write failed", e))?;
        writer
            .file
            .flush()
            .map_err(|e| Error::io("WAL flush failed", e))?;
        if self.durability.sync() {
            writer
                .file
                .get_ref()
                .sync_data()
                .map_err(|e| Error::io("WAL sync failed", e))?;
        }

        writer.next_lsn = lsn + 1;
        writer.segment.records += 1;
        writer.segment.bytes += bytes.len() as u64;
        self.current.store(lsn, Ordering::Release);
        let _ = self
            .first
            .compare_exchange(0, lsn, Ordering::AcqRel, Ordering::Acquire);
        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);

        debug!("WAL append {} at LSN {}", payload.kind(), lsn);
        Ok(lsn)
    }

    /// Force buffered records to stable storage
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .file
            .flush()
            .map_err(|e| Error::io("WAL flush failed", e))?;
        writer
            .file
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io("WAL sync failed", e))
    }

    /// Close the active segment and start a new one at the next LSN
    ///
    /// Does nothing while the active segment is empty. The closed segment is
    /// synced whatever the durability mode, so only the last segment can ever
    /// end in a torn record.
    pub fn rotate(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.segment.records == 0 {
            return Ok(());
        }
        writer
            .file
            .flush()
            .map_err(|e| Error::io("WAL flush failed", e))?;
        writer
            .file
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io("WAL sync failed", e))?;

        let start = writer.next_lsn;
        let path = self.dir.join(segment_name(start));
        let file = open_segment(&path)?;
        if self.durability.sync() {
            sync_dir(&self.dir)?;
        }

        let segment = Segment {
            start,
            path,
            bytes: 0,
            records: 0,
        };
        let closed = std::mem::replace(&mut writer.segment, segment);
        writer.file = BufWriter::with_capacity(self.config.write_buffer_size, file);
        debug!(
            "WAL segment {}..{} closed, next starts at LSN {}",
            closed.start, start, start
        );
        self.segments.lock().push(closed);
        Ok(())
    }

    /// Records with LSN `>= from`, in order
    ///
    /// The sequence ends at the end of the log as of this call; re-issue
    /// from the next LSN to continue. Fails with `CorruptLog` if records at
    /// or after `from` were already truncated away.
    pub fn read_from(&self, from: Lsn) -> Result<WalIterator> {
        // Segment files are opened under the locks so a concurrent
        // truncation cannot remove them in between
        let writer = self.writer.lock();
        let segments = self.segments.lock();
        let all: Vec<&Segment> = segments.iter().chain([&writer.segment]).collect();

        let oldest = all.first().map_or(1, |s| s.start);
        if oldest > from.max(1) {
            return Err(Error::corrupt_log(
                from,
                format!("log starts at LSN {oldest}"),
            ));
        }

        let mut frames = VecDeque::with_capacity(all.len());
        for (i, segment) in all.iter().enumerate() {
            // Skip segments that end before `from`
            if all.get(i + 1).is_some_and(|next| next.start <= from) {
                continue;
            }
            if let Some(reader) = FrameReader::open(&segment.path)? {
                frames.push_back(reader);
            }
        }

        Ok(WalIterator {
            frames,
            from,
            last: None,
            done: false,
        })
    }

    /// Drop the closed segments that only hold records with LSN `< lsn`
    ///
    /// Called after a checkpoint whose marker is `lsn` became durable; the
    /// checkpoint rotates the log first, so every record before the marker
    /// sits in a closed segment. When an archive directory is configured
    /// the segments are moved there instead of being deleted. Appends are
    /// blocked only while the segment list is split. Returns the number of
    /// records removed.
    pub fn truncate_before(&self, lsn: Lsn) -> Result<u64> {
        let dropped: Vec<Segment> = {
            let writer = self.writer.lock();
            let mut segments = self.segments.lock();
            let mut count = 0;
            while count < segments.len() {
                let next_start = segments
                    .get(count + 1)
                    .map_or(writer.segment.start, |s| s.start);
                if next_start > lsn {
                    break;
                }
                count += 1;
            }
            let dropped: Vec<Segment> = segments.drain(..count).collect();
            if !dropped.is_empty() {
                let oldest = segments.first().map_or(writer.segment.start, |s| s.start);
                self.first.store(oldest, Ordering::Release);
            }
            dropped
        };
        if dropped.is_empty() {
            return Ok(0);
        }

        let mut removed = 0u64;
        for (i, segment) in dropped.iter().enumerate() {
            if let Err(e) = self.retire(segment) {
                // Oldest first, so what is left on disk stays contiguous
                let mut segments = self.segments.lock();
                segments.splice(0..0, dropped[i..].iter().cloned());
                self.first.store(segment.start, Ordering::Release);
                return Err(e);
            }
            removed += segment.records;
            self.size.fetch_sub(segment.bytes, Ordering::Relaxed);
        }
        if self.durability.sync() {
            sync_dir(&self.dir)?;
        }

        debug!(
            "Dropped {} WAL segments ({} records) before LSN {}",
            dropped.len(),
            removed,
            lsn
        );
        Ok(removed)
    }

    /// Delete a closed segment, or move it into the archive directory
    fn retire(&self, segment: &Segment) -> Result<()> {
        let Some(archive) = &self.config.archive_dir else {
            return fs::remove_file(&segment.path)
                .map_err(|e| Error::io("failed to delete WAL segment", e));
        };

        fs::create_dir_all(archive)
            .map_err(|e| Error::io("failed to create WAL archive directory", e))?;
        let target = archive.join(segment_name(segment.start));
        if fs::rename(&segment.path, &target).is_err() {
            // Archive on another filesystem
            fs::copy(&segment.path, &target)
                .and_then(|_| fs::remove_file(&segment.path))
                .map_err(|e| Error::io("failed to archive WAL segment", e))?;
        }
        if self.durability.sync() {
            sync_dir(archive)?;
        }
        Ok(())
    }

    /// Last assigned LSN (0 when nothing was ever logged)
    #[must_use]
    pub fn current_lsn(&self) -> Lsn {
        self.current.load(Ordering::Acquire)
    }

    /// LSN of the oldest record still in the log (0 when empty)
    #[must_use]
    pub fn first_lsn(&self) -> Lsn {
        self.first.load(Ordering::Acquire)
    }

    /// Current log size in bytes, all segments included
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the log outgrew its configured size
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.size() > self.config.max_size_bytes
    }

    /// Number of segment files, the active one included
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.lock().len() + 1
    }

    /// Directory holding the segments
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Reads raw frames up to the file length observed at open time
struct FrameReader {
    reader: BufReader<File>,
    pos: u64,
    len: u64,
}

impl FrameReader {
    fn open(path: &Path) -> Result<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("failed to open WAL for reading", e)),
        };
        let len = file
            .metadata()
            .map_err(|e| Error::io("failed to stat WAL", e))?
            .len();
        Ok(Some(Self {
            reader: BufReader::with_capacity(64 * 1024, file),
            pos: 0,
            len,
        }))
    }

    /// Offset just past the last frame returned
    const fn valid_end(&self) -> u64 {
        self.pos
    }

    /// Next intact frame; `None` at end of file or at a torn tail
    fn next_frame(&mut self) -> Result<Option<(Lsn, Vec<u8>)>> {
        let remaining = self.len - self.pos;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < (RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE) as u64 {
            return self.torn_or_corrupt(0, "truncated record header");
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.reader
            .read_exact(&mut header)
            .map_err(|e| Error::io("WAL read failed", e))?;

        let magic = read_u32(&header, 0).unwrap_or_default();
        let lsn = read_u64(&header, 4).unwrap_or_default();
        let data_len = read_u32(&header, 12).unwrap_or_default() as usize;
        let header_crc = read_u32(&header, HEADER_CRC_OFFSET).unwrap_or_default();

        if magic != WAL_MAGIC {
            return self.torn_or_corrupt(lsn, "invalid record magic");
        }
        if checksum(&header[..HEADER_CRC_OFFSET]) != header_crc {
            return self.torn_or_corrupt(lsn, "record header CRC mismatch");
        }

        // The length is trustworthy from here on
        if data_len > MAX_PAYLOAD_SIZE {
            return Err(Error::corrupt_log(
                lsn,
                format!("record length {data_len} out of range"),
            ));
        }
        let frame_size = (RECORD_HEADER_SIZE + data_len + RECORD_TRAILER_SIZE) as u64;
        if frame_size > remaining {
            // Intact header whose record runs past the end of the file
            return Ok(None);
        }

        let mut body = vec![0u8; data_len + RECORD_TRAILER_SIZE];
        self.reader
            .read_exact(&mut body)
            .map_err(|e| Error::io("WAL read failed", e))?;
        let stored_crc = read_u32(&body, data_len).unwrap_or_default();
        body.truncate(data_len);

        let mut crc = crc32c::crc32c(&header);
        crc = crc32c::crc32c_append(crc, &body);
        if crc != stored_crc {
            if self.pos + frame_size == self.len {
                return Ok(None);
            }
            return Err(Error::corrupt_log(lsn, "record CRC mismatch"));
        }

        self.pos += frame_size;
        Ok(Some((lsn, body)))
    }

    /// A bad record is a torn tail only if nothing but zeroes follows it
    fn torn_or_corrupt(&mut self, lsn: Lsn, reason: &str) -> Result<Option<(Lsn, Vec<u8>)>> {
        let mut rest = Vec::new();
        self.reader
            .seek(SeekFrom::Start(self.pos))
            .and_then(|_| self.reader.read_to_end(&mut rest))
            .map_err(|e| Error::io("WAL read failed", e))?;

        let tail_len = rest.len() as u64;
        let header_only = tail_len < (RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE) as u64;
        if header_only || rest.iter().all(|b| *b == 0) {
            Ok(None)
        } else {
            Err(Error::corrupt_log(lsn, reason))
        }
    }
}

/// Lazy iterator over decoded WAL records
pub struct WalIterator {
    frames: VecDeque<FrameReader>,
    from: Lsn,
    last: Option<Lsn>,
    done: bool,
}

impl WalIterator {
    /// LSN of the last record read (including skipped ones)
    #[must_use]
    pub const fn last_lsn(&self) -> Option<Lsn> {
        self.last
    }

    fn step(&mut self) -> Result<Option<WalRecord>> {
        while let Some(frames) = self.frames.front_mut() {
            let Some((lsn, data)) = frames.next_frame()? else {
                self.frames.pop_front();
                continue;
            };
            if let Some(last) = self.last
                && lsn != last + 1
            {
                return Err(Error::corrupt_log(
                    lsn,
                    format!("sequence gap after LSN {last}"),
                ));
            }
            self.last = Some(lsn);
            if lsn < self.from {
                continue;
            }
            let payload = WalPayload::from_bytes(lsn, &data)?;
            return Ok(Some(WalRecord { lsn, payload }));
        }
        Ok(None)
    }
}

impl Iterator for WalIterator {
    type Item = Result<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridstore_affinity::AffinityFunction;
    use gridstore_common::{AtomicityMode, WriteSyncMode};
    use tempfile::tempdir;

    fn config() -> WalConfig {
        WalConfig::default()
    }

    fn update(n: u8) -> WalPayload {
        WalPayload::PageUpdate {
            cache_id: CacheId::new(1),
            deltas: vec![PageDelta {
                page: PageId::new(CacheId::new(1), 0, 0),
                offset: u32::from(n),
                bytes: vec![n; 4],
            }],
        }
    }

    fn collect(wal: &Wal, from: Lsn) -> Vec<WalRecord> {
        wal.read_from(from)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn first_segment(dir: &Path) -> PathBuf {
        dir.join(segment_name(1))
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();

        assert_eq!(wal.append(&update(1)).unwrap(), 1);
        assert_eq!(wal.append(&WalPayload::CheckpointBegin).unwrap(), 2);
        assert_eq!(wal.append(&update(3)).unwrap(), 3);

        let records = collect(&wal, 1);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].payload, WalPayload::CheckpointBegin);
        assert_eq!(records[2].payload, update(3));

        let tail = collect(&wal, 3);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].lsn, 3);
    }

    #[test]
    fn test_reopen_continues_lsn() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
            for n in 0..5 {
                wal.append(&update(n)).unwrap();
            }
        }
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        assert_eq!(wal.current_lsn(), 5);
        assert_eq!(wal.first_lsn(), 1);
        assert_eq!(wal.append(&update(9)).unwrap(), 6);
    }

    #[test]
    fn test_torn_tail_discarded() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
            wal.append(&update(1)).unwrap();
            wal.append(&update(2)).unwrap();
        }

        // Cut the last record in half
        let path = first_segment(dir.path());
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 7).unwrap();
        drop(file);

        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        assert_eq!(wal.current_lsn(), 1);
        assert_eq!(collect(&wal, 1).len(), 1);
        assert_eq!(wal.append(&update(3)).unwrap(), 2);
        assert_eq!(collect(&wal, 1).len(), 2);
    }

    #[test]
    fn test_corruption_in_middle_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
            for n in 0..3 {
                wal.append(&update(n)).unwrap();
            }
        }

        // Flip a payload byte of the first record
        let path = first_segment(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        bytes[RECORD_HEADER_SIZE + 2] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = Wal::open(dir.path(), &config(), Durability::Full)
            .err()
            .unwrap();
        assert!(matches!(err, Error::CorruptLog { lsn: 1, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_damaged_length_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
            for n in 0..3 {
                wal.append(&update(n)).unwrap();
            }
        }

        // High byte of the first record's length: it now points far past
        // the end of the file
        let path = first_segment(dir.path());
        let mut bytes = fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[15] = 0x7F;
        fs::write(&path, &bytes).unwrap();

        let err = Wal::open(dir.path(), &config(), Durability::Full)
            .err()
            .unwrap();
        assert!(matches!(err, Error::CorruptLog { lsn: 1, .. }));

        // Nothing was cut off
        assert_eq!(fs::metadata(&path).unwrap().len(), len as u64);
    }

    #[test]
    fn test_torn_header_discarded() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
            wal.append(&update(1)).unwrap();
        }

        // A second record that got no further than part of its header
        let path = first_segment(dir.path());
        let data = update(2).to_bytes().unwrap();
        let frame = encode_frame(2, &data);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..RECORD_HEADER_SIZE - 6]).unwrap();
        drop(file);

        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        assert_eq!(wal.current_lsn(), 1);
        assert_eq!(wal.append(&update(2)).unwrap(), 2);
    }

    #[test]
    fn test_sequence_gap_detected() {
        let dir = tempdir().unwrap();
        let data = WalPayload::CheckpointBegin.to_bytes().unwrap();
        let mut bytes = encode_frame(1, &data);
        bytes.extend(encode_frame(3, &data));
        fs::write(first_segment(dir.path()), bytes).unwrap();

        let err = Wal::open(dir.path(), &config(), Durability::Full)
            .err()
            .unwrap();
        assert!(matches!(err, Error::CorruptLog { lsn: 3, .. }));
    }

    #[test]
    fn test_missing_segment_detected() {
        let dir = tempdir().unwrap();
        {
            let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
            for n in 0..3 {
                wal.append(&update(n)).unwrap();
                wal.rotate().unwrap();
            }
            wal.append(&update(3)).unwrap();
        }
        fs::remove_file(dir.path().join(segment_name(2))).unwrap();

        let err = Wal::open(dir.path(), &config(), Durability::Full)
            .err()
            .unwrap();
        assert!(matches!(err, Error::CorruptLog { lsn: 3, .. }));
    }

    #[test]
    fn test_rotate_and_read_across_segments() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        for n in 0..3 {
            wal.append(&update(n)).unwrap();
        }
        wal.rotate().unwrap();
        // Empty active segment is not rotated again
        wal.rotate().unwrap();
        assert_eq!(wal.segment_count(), 2);
        for n in 3..5 {
            wal.append(&update(n)).unwrap();
        }

        let lsns: Vec<Lsn> = collect(&wal, 1).iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![1, 2, 3, 4, 5]);
        let lsns: Vec<Lsn> = collect(&wal, 4).iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, vec![4, 5]);

        drop(wal);
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        assert_eq!(wal.segment_count(), 2);
        assert_eq!(wal.current_lsn(), 5);
        assert_eq!(wal.append(&update(5)).unwrap(), 6);
    }

    #[test]
    fn test_truncate_before() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        for n in 0..5 {
            wal.append(&update(n)).unwrap();
        }
        wal.rotate().unwrap();
        for n in 5..10 {
            wal.append(&update(n)).unwrap();
        }
        let before = wal.size();

        assert_eq!(wal.truncate_before(6).unwrap(), 5);
        assert!(wal.size() < before);
        assert_eq!(wal.first_lsn(), 6);
        assert_eq!(wal.segment_count(), 1);
        assert!(!first_segment(dir.path()).exists());

        let records = collect(&wal, 6);
        assert_eq!(records.first().map(|r| r.lsn), Some(6));
        assert_eq!(records.len(), 5);

        // Reading truncated history is an error, appends continue
        assert!(wal.read_from(2).is_err());
        assert_eq!(wal.append(&update(10)).unwrap(), 11);

        drop(wal);
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        assert_eq!(wal.first_lsn(), 6);
        assert_eq!(wal.current_lsn(), 11);
    }

    #[test]
    fn test_truncate_keeps_segment_holding_the_marker() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        for n in 0..4 {
            wal.append(&update(n)).unwrap();
        }
        wal.rotate().unwrap();
        wal.append(&update(4)).unwrap();

        // LSN 3 lives in the first segment, which must stay
        assert_eq!(wal.truncate_before(3).unwrap(), 0);
        assert_eq!(wal.first_lsn(), 1);
        assert_eq!(collect(&wal, 1).len(), 5);

        assert_eq!(wal.truncate_before(5).unwrap(), 4);
        assert_eq!(wal.first_lsn(), 5);
    }

    #[test]
    fn test_append_during_truncate() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), &config(), Durability::Relaxed).unwrap();
        for n in 0..50 {
            wal.append(&update(n)).unwrap();
        }
        wal.rotate().unwrap();
        let marker = wal.append(&WalPayload::CheckpointBegin).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for n in 0..50 {
                    wal.append(&update(n)).unwrap();
                }
            });
            assert_eq!(wal.truncate_before(marker).unwrap(), 50);
        });

        let lsns: Vec<Lsn> = collect(&wal, marker).iter().map(|r| r.lsn).collect();
        assert_eq!(lsns.len(), 51);
        assert!(lsns.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_truncate_archives_records() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("archive");
        let config = WalConfig {
            archive_dir: Some(archive.clone()),
            ..WalConfig::default()
        };
        let wal = Wal::open(dir.path().join("wal"), &config, Durability::Full).unwrap();
        for n in 0..2 {
            wal.append(&update(n)).unwrap();
        }
        wal.rotate().unwrap();
        for n in 2..4 {
            wal.append(&update(n)).unwrap();
        }
        wal.truncate_before(3).unwrap();

        let mut frames = FrameReader::open(&archive.join(segment_name(1)))
            .unwrap()
            .unwrap();
        let mut lsns = Vec::new();
        while let Some((lsn, _)) = frames.next_frame().unwrap() {
            lsns.push(lsn);
        }
        assert_eq!(lsns, vec![1, 2]);
        assert_eq!(collect(&wal, 3).len(), 2);
    }

    #[test]
    fn test_iterator_is_restartable() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), &config(), Durability::Full).unwrap();
        for n in 0..6 {
            wal.append(&update(n)).unwrap();
        }

        let mut iter = wal.read_from(1).unwrap();
        let first: Vec<Lsn> = iter.by_ref().take(2).map(|r| r.unwrap().lsn).collect();
        assert_eq!(first, vec![1, 2]);

        let resumed: Vec<Lsn> = wal.read_from(3).unwrap().map(|r| r.unwrap().lsn).collect();
        assert_eq!(resumed, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_lifecycle_payloads_round_trip() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path(), &config(), Durability::Relaxed).unwrap();
        let descriptor = CacheDescriptor {
            id: CacheId::new(2),
            name: "cache2".into(),
            affinity: AffinityFunction::rendezvous(32, 0),
            atomicity: AtomicityMode::Transactional,
            write_sync: WriteSyncMode::FullSync,
            memory_policy: "default".into(),
        };
        wal.append(&WalPayload::CacheCreate {
            descriptor: descriptor.clone(),
        })
        .unwrap();
        wal.append(&WalPayload::CacheDestroy {
            cache_id: descriptor.id,
        })
        .unwrap();

        let records = collect(&wal, 1);
        assert_eq!(records[0].payload, WalPayload::CacheCreate { descriptor });
        assert_eq!(records[1].payload.kind(), "cache-destroy");
    }
}
