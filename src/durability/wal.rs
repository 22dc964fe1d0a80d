//! Write-ahead log: an append-only sequence of records in numbered segment
//! files. Each record is framed as `[len u32][crc32 u32][body]` with the
//! body encoded via bincode. A record is flushed and fsynced before the
//! corresponding ref update is attempted; after a checkpoint the older
//! segments are truncated away.
//!
//! A `wal.lock` file makes the writer exclusive per directory; readers only
//! scan during recovery. A torn record at the tail of the newest segment is
//! the signature of a crash mid-append and is discarded; a checksum mismatch
//! anywhere else is corruption and halts replay.

use std::{
    fs,
    io::{BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    sync::atomic::{AtomicU64, Ordering},
};

use bincode::{Decode, Encode};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::errors::{ChronError, Result};
use crate::utils::{LockFile, fsync_dir, reclaim_stale_locks};

/// One durable intent record.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum WalRecord {
    Save {
        seq: u64,
        tx_id: String,
        branch: String,
        document_id: String,
        /// Canonical JSON bytes of the document being stored.
        payload: Vec<u8>,
        timestamp: i64,
    },
    Delete {
        seq: u64,
        tx_id: String,
        branch: String,
        document_id: String,
        timestamp: i64,
    },
    /// Everything before this record has been applied and indexed.
    Checkpoint { seq: u64, timestamp: i64 },
}

impl WalRecord {
    pub fn seq(&self) -> u64 {
        match self {
            WalRecord::Save { seq, .. }
            | WalRecord::Delete { seq, .. }
            | WalRecord::Checkpoint { seq, .. } => *seq,
        }
    }

    pub fn tx_id(&self) -> Option<&str> {
        match self {
            WalRecord::Save { tx_id, .. } | WalRecord::Delete { tx_id, .. } => Some(tx_id),
            WalRecord::Checkpoint { .. } => None,
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self, WalRecord::Checkpoint { .. })
    }
}

/// Result of scanning the segment files.
#[derive(Debug)]
pub struct WalScan {
    pub records: Vec<WalRecord>,
    /// Torn records discarded from the tail of the newest segment.
    pub torn: usize,
}

impl WalScan {
    /// Records after the last checkpoint, in append order.
    pub fn pending(&self) -> &[WalRecord] {
        let cut = self
            .records
            .iter()
            .rposition(WalRecord::is_checkpoint)
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.records[cut..]
    }
}

struct WalWriter {
    writer: BufWriter<fs::File>,
    segment: u64,
}

pub struct Wal {
    dir: PathBuf,
    inner: Mutex<WalWriter>,
    next_seq: AtomicU64,
    _lock: LockFile,
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("wal-{segment:010}.log"))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(num) = name
            .strip_prefix("wal-")
            .and_then(|rest| rest.strip_suffix(".log"))
            && let Ok(num) = num.parse::<u64>()
        {
            segments.push(num);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

fn open_segment_for_append(dir: &Path, segment: u64) -> Result<WalWriter> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_path(dir, segment))?;
    Ok(WalWriter {
        writer: BufWriter::new(file),
        segment,
    })
}

/// One decoded segment: its records, whether a torn frame was discarded at
/// the tail, and the byte length of the clean prefix.
struct SegmentScan {
    records: Vec<WalRecord>,
    torn: usize,
    clean_len: u64,
}

/// Decode one segment. `tolerate_torn_tail` is set for the newest segment,
/// where a crash mid-append legitimately leaves a partial frame.
fn read_segment(path: &Path, tolerate_torn_tail: bool) -> Result<SegmentScan> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(SegmentScan {
                records: Vec::new(),
                torn: 0,
                clean_len: 0,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    let mut clean_len = 0u64;
    loop {
        let len = match file.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };
        let checksum = match file.read_u32::<LittleEndian>() {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && tolerate_torn_tail => {
                warn!(segment = %path.display(), "discarding torn record header at tail");
                return Ok(SegmentScan {
                    records,
                    torn: 1,
                    clean_len,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let mut body = vec![0u8; len as usize];
        match file.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && tolerate_torn_tail => {
                warn!(segment = %path.display(), "discarding torn record body at tail");
                return Ok(SegmentScan {
                    records,
                    torn: 1,
                    clean_len,
                });
            }
            Err(e) => return Err(e.into()),
        }
        if crc32fast::hash(&body) != checksum {
            return Err(ChronError::corrupt(
                format!("wal segment {}", path.display()),
                "record checksum mismatch",
            ));
        }
        let (record, _) = bincode::decode_from_slice(&body, bincode::config::standard())
            .map_err(|e| {
                ChronError::corrupt(format!("wal segment {}", path.display()), e.to_string())
            })?;
        records.push(record);
        clean_len += 8 + len as u64;
    }
    Ok(SegmentScan {
        records,
        torn: 0,
        clean_len,
    })
}

impl Wal {
    /// Open (or create) the WAL in `dir`, reclaiming stale locks and
    /// positioning the writer after the newest surviving record.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Wal> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        reclaim_stale_locks(&dir)?;
        let lock = LockFile::try_acquire(&dir.join("wal"))?;

        let segments = list_segments(&dir)?;
        let newest = segments.last().copied();
        let mut max_seq = 0;
        for segment in &segments {
            let path = segment_path(&dir, *segment);
            let tolerant = Some(*segment) == newest;
            let scan = read_segment(&path, tolerant)?;
            if let Some(last) = scan.records.last() {
                max_seq = max_seq.max(last.seq());
            }
            if scan.torn > 0 {
                // Appending after a torn frame would corrupt the framing;
                // cut the segment back to its clean prefix first.
                warn!(segment = %path.display(), clean_len = scan.clean_len, "truncating torn wal tail");
                fs::OpenOptions::new()
                    .write(true)
                    .open(&path)?
                    .set_len(scan.clean_len)?;
            }
        }
        let current = newest.unwrap_or(1);
        let inner = open_segment_for_append(&dir, current)?;
        debug!(dir = %dir.display(), segment = current, next_seq = max_seq + 1, "wal opened");
        Ok(Wal {
            dir,
            inner: Mutex::new(inner),
            next_seq: AtomicU64::new(max_seq + 1),
            _lock: lock,
        })
    }

    /// Append one record; the closure receives the assigned sequence
    /// number. Returns after the record is flushed and fsynced — only then
    /// may the caller touch the ref namespace.
    fn append_with(&self, make: impl FnOnce(u64) -> WalRecord) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = make(seq);
        let body = bincode::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| ChronError::Serialization(e.to_string()))?;
        inner.writer.write_u32::<LittleEndian>(body.len() as u32)?;
        inner.writer.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        inner.writer.write_all(&body)?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        Ok(seq)
    }

    pub fn append_save(
        &self,
        tx_id: &str,
        branch: &str,
        document_id: &str,
        payload: Vec<u8>,
    ) -> Result<u64> {
        self.append_with(|seq| WalRecord::Save {
            seq,
            tx_id: tx_id.to_string(),
            branch: branch.to_string(),
            document_id: document_id.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    pub fn append_delete(&self, tx_id: &str, branch: &str, document_id: &str) -> Result<u64> {
        self.append_with(|seq| WalRecord::Delete {
            seq,
            tx_id: tx_id.to_string(),
            branch: branch.to_string(),
            document_id: document_id.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        })
    }

    /// Write a checkpoint, roll to a fresh segment, and delete the older
    /// ones. Everything before the checkpoint is applied and indexed.
    pub fn checkpoint(&self) -> Result<u64> {
        let seq = self.append_with(|seq| WalRecord::Checkpoint {
            seq,
            timestamp: chrono::Utc::now().timestamp(),
        })?;
        let mut inner = self.inner.lock().unwrap();
        let old_segment = inner.segment;
        *inner = open_segment_for_append(&self.dir, old_segment + 1)?;
        fsync_dir(&self.dir)?;
        for segment in list_segments(&self.dir)? {
            if segment <= old_segment {
                fs::remove_file(segment_path(&self.dir, segment))?;
            }
        }
        Ok(seq)
    }

    /// Scan every surviving record in append order.
    pub fn scan(&self) -> Result<WalScan> {
        // Flush buffered frames so the scan sees them.
        self.inner.lock().unwrap().writer.flush()?;
        Self::scan_dir(&self.dir)
    }

    /// Scan a WAL directory without taking the writer lock; recovery uses
    /// this before the writer is handed out.
    pub fn scan_dir(dir: &Path) -> Result<WalScan> {
        let segments = list_segments(dir)?;
        let newest = segments.last().copied();
        let mut records = Vec::new();
        let mut torn = 0;
        for segment in segments {
            let tolerant = Some(segment) == newest;
            let mut scan = read_segment(&segment_path(dir, segment), tolerant)?;
            records.append(&mut scan.records);
            torn += scan.torn;
        }
        Ok(WalScan { records, torn })
    }
}
