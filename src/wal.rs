//! Persistent FIFO buffer between the collectors and the stream client.
//!
//! Two files under a configured base path:
//!
//! ```text
//! <base>.wal     append-only records: [u32 LE length][length bytes]
//! <base>.cursor  exactly 8 bytes, LE: next byte offset to read
//! ```
//!
//! The producer only appends fully-formed `(length, bytes)` pairs, fsynced
//! before `append` returns. The consumer reads at the cursor without
//! advancing it ([`WalBuffer::peek_next`]) and commits progress explicitly
//! ([`WalBuffer::acknowledge`]), which rewrites and fsyncs the cursor file.
//! A record peeked but never acknowledged is re-read after restart:
//! at-least-once delivery, exact write order.
//!
//! An absent or corrupt cursor resets to offset 0 (loud warning, replay;
//! the gateway deduplicates). A record length over [`MAX_RECORD_SIZE`] is
//! reported as [`WalError::SuspiciousLength`] and the caller must treat the
//! buffer instance as unusable.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

/// Maximum single record payload (1 MiB).
pub const MAX_RECORD_SIZE: u32 = 1024 * 1024;

/// Errors surfaced by the WAL buffer.
#[derive(Debug, Error)]
pub enum WalError {
    /// The caller tried to append a payload over [`MAX_RECORD_SIZE`].
    #[error("record too large: {0} bytes (max {MAX_RECORD_SIZE})")]
    RecordTooLarge(usize),

    /// A stored length prefix is implausible. Fatal for this buffer
    /// instance; operator intervention required.
    #[error("suspicious record length {length} at offset {offset}")]
    SuspiciousLength { length: u32, offset: u64 },

    /// Underlying file I/O failure (including disk full on append).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct WalInner {
    wal: File,
    cursor: File,
    /// Total bytes of complete records in the WAL file.
    size: u64,
    /// Next byte offset the consumer will read.
    read_offset: u64,
    /// Sequence the next appended record receives.
    next_sequence: u64,
    /// Sequence of the last record fully before `read_offset`.
    cursor_sequence: u64,
}

/// Durable at-least-once handoff queue. See the module docs.
///
/// One writer (the collectors) and one reader (the stream client) share it;
/// `append` / `peek_next` / `acknowledge` are each atomic with respect to
/// the others via a single mutex. Calls never block on the network.
pub struct WalBuffer {
    inner: Mutex<WalInner>,
    appended: Notify,
    wal_path: PathBuf,
}

impl WalBuffer {
    /// Open (or create) the buffer at `<base>.wal` / `<base>.cursor`.
    ///
    /// Scans existing records to recover the sequence counter, repairs a
    /// crash-truncated tail, and validates the cursor against record
    /// boundaries (resetting to 0 with a warning when it is absent,
    /// non-8-byte, past EOF, or mid-record).
    pub fn open(base: &Path) -> Result<Self, WalError> {
        let wal_path = base.with_extension("wal");
        let cursor_path = base.with_extension("cursor");
        if let Some(parent) = base.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut wal = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&wal_path)?;
        let cursor = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&cursor_path)?;

        // Optional sequence base left behind by an offline compaction:
        // sequences of the records currently in the file start at base+1.
        let base_sequence = read_sequence_base(&base.with_extension("seq"));

        let raw_len = wal.metadata()?.len();
        let (size, record_count, boundaries) = scan_records(&wal, raw_len);

        if size < raw_len {
            log::warn!(
                "[Wal] truncating partial tail record in {} ({} -> {} bytes)",
                wal_path.display(),
                raw_len,
                size
            );
            wal.set_len(size)?;
            wal.sync_data()?;
        }

        let read_offset = read_cursor(&cursor, &cursor_path, size, &boundaries);
        let acked_records = boundaries.iter().filter(|b| **b <= read_offset).count() as u64 - 1;
        // boundaries always contains 0, so the subtraction above is safe and
        // yields the number of records fully before read_offset.

        wal.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner: Mutex::new(WalInner {
                wal,
                cursor,
                size,
                read_offset,
                next_sequence: base_sequence + record_count + 1,
                cursor_sequence: base_sequence + acked_records,
            }),
            appended: Notify::new(),
            wal_path,
        })
    }

    /// Append one record, fsync, and return its assigned sequence.
    ///
    /// Returns only after the data is on disk.
    ///
    /// # Errors
    ///
    /// [`WalError::RecordTooLarge`] when `bytes` exceeds 1 MiB;
    /// [`WalError::Io`] on write/fsync failure (disk full included) — the
    /// caller drops the record and counts it.
    pub fn append(&self, bytes: &[u8]) -> Result<u64, WalError> {
        self.append_with(|_| bytes.to_vec())
    }

    /// Append a record whose bytes depend on the sequence being assigned.
    ///
    /// `build` runs under the buffer lock with the sequence the record will
    /// receive, letting callers embed the sequence inside the payload.
    pub fn append_with(&self, build: impl FnOnce(u64) -> Vec<u8>) -> Result<u64, WalError> {
        let mut inner = self.inner.lock().expect("wal mutex poisoned");
        let sequence = inner.next_sequence;
        let bytes = build(sequence);
        if bytes.len() > MAX_RECORD_SIZE as usize {
            return Err(WalError::RecordTooLarge(bytes.len()));
        }

        let mut record = Vec::with_capacity(4 + bytes.len());
        record.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        record.extend_from_slice(&bytes);

        inner.wal.seek(SeekFrom::End(0))?;
        inner.wal.write_all(&record)?;
        inner.wal.sync_data()?;

        inner.size += record.len() as u64;
        inner.next_sequence += 1;
        drop(inner);

        // notify_one stores a permit, so an append landing between the
        // producer's empty poll and its park is never lost.
        self.appended.notify_one();
        Ok(sequence)
    }

    /// Read the record at the cursor without advancing it.
    ///
    /// Returns `(bytes, sequence, next_offset)` or `None` when the cursor
    /// is at the end (or a tail record is still incomplete).
    ///
    /// # Errors
    ///
    /// [`WalError::SuspiciousLength`] on an implausible length prefix —
    /// fatal for this buffer instance.
    pub fn peek_next(&self) -> Result<Option<(Vec<u8>, u64, u64)>, WalError> {
        let inner = self.inner.lock().expect("wal mutex poisoned");
        let offset = inner.read_offset;
        if offset + 4 > inner.size {
            return Ok(None);
        }

        let mut len_buf = [0u8; 4];
        inner.wal.read_exact_at(&mut len_buf, offset)?;
        let length = u32::from_le_bytes(len_buf);
        if length == 0 || length > MAX_RECORD_SIZE {
            return Err(WalError::SuspiciousLength { length, offset });
        }

        let next_offset = offset + 4 + length as u64;
        if next_offset > inner.size {
            // Partial body: not yet written.
            return Ok(None);
        }

        let mut bytes = vec![0u8; length as usize];
        inner.wal.read_exact_at(&mut bytes, offset + 4)?;
        Ok(Some((bytes, inner.cursor_sequence + 1, next_offset)))
    }

    /// Read the complete record starting at `offset` without touching the
    /// cursor. Used by the stream producer to keep several records in
    /// flight ahead of the acknowledged prefix.
    ///
    /// Returns `(bytes, next_offset)`, or `None` at the end of complete
    /// data. `offset` must be a record boundary.
    pub fn read_at(&self, offset: u64) -> Result<Option<(Vec<u8>, u64)>, WalError> {
        let inner = self.inner.lock().expect("wal mutex poisoned");
        if offset + 4 > inner.size {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        inner.wal.read_exact_at(&mut len_buf, offset)?;
        let length = u32::from_le_bytes(len_buf);
        if length == 0 || length > MAX_RECORD_SIZE {
            return Err(WalError::SuspiciousLength { length, offset });
        }
        let next_offset = offset + 4 + length as u64;
        if next_offset > inner.size {
            return Ok(None);
        }
        let mut bytes = vec![0u8; length as usize];
        inner.wal.read_exact_at(&mut bytes, offset + 4)?;
        Ok(Some((bytes, next_offset)))
    }

    /// Current cursor offset (the next byte the consumer will read).
    pub fn read_offset(&self) -> u64 {
        self.inner.lock().expect("wal mutex poisoned").read_offset
    }

    /// Advance the cursor to `next_offset`, rewrite the cursor file from
    /// position 0, and fsync it.
    pub fn acknowledge(&self, next_offset: u64) -> Result<(), WalError> {
        let mut inner = self.inner.lock().expect("wal mutex poisoned");
        debug_assert!(next_offset <= inner.size, "cursor past WAL size");

        // Count the record boundaries being crossed so cursor_sequence
        // stays aligned even when a caller acks several records at once.
        let mut offset = inner.read_offset;
        while offset < next_offset {
            let mut len_buf = [0u8; 4];
            inner.wal.read_exact_at(&mut len_buf, offset)?;
            let length = u32::from_le_bytes(len_buf);
            if length == 0 || length > MAX_RECORD_SIZE {
                return Err(WalError::SuspiciousLength { length, offset });
            }
            offset += 4 + length as u64;
            inner.cursor_sequence += 1;
        }

        inner.read_offset = next_offset;
        inner.cursor.seek(SeekFrom::Start(0))?;
        inner.cursor.write_all(&next_offset.to_le_bytes())?;
        inner.cursor.sync_data()?;
        Ok(())
    }

    /// Sequence of the last acknowledged record (0 when none).
    pub fn cursor_sequence(&self) -> u64 {
        self.inner.lock().expect("wal mutex poisoned").cursor_sequence
    }

    /// Bytes appended but not yet acknowledged.
    pub fn backlog_bytes(&self) -> u64 {
        let inner = self.inner.lock().expect("wal mutex poisoned");
        inner.size - inner.read_offset
    }

    /// Total WAL size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().expect("wal mutex poisoned").size
    }

    /// Notifier signaled after every successful append; the stream producer
    /// parks on this instead of polling an empty buffer.
    pub fn append_notify(&self) -> &Notify {
        &self.appended
    }

    /// Path of the underlying WAL file (diagnostics).
    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }

    /// Flush and drop both file handles.
    pub fn close(self) -> Result<(), WalError> {
        let inner = self.inner.into_inner().expect("wal mutex poisoned");
        inner.wal.sync_data()?;
        inner.cursor.sync_data()?;
        Ok(())
    }

    /// Offline retention: rewrite the WAL keeping only unacknowledged
    /// records, reset the cursor to 0, and record the sequence base in
    /// `<base>.seq` so sequence assignment stays monotonic.
    ///
    /// Requires exclusive access — the buffer must not be open anywhere.
    /// The three-file update is not crash-atomic; re-run after a crash.
    pub fn compact(base: &Path) -> Result<u64, WalError> {
        let buffer = Self::open(base)?;
        let reclaimed = buffer.read_offset();
        if reclaimed == 0 {
            return Ok(0);
        }
        let new_base_sequence = buffer.cursor_sequence();

        let wal_path = base.with_extension("wal");
        let tmp_path = base.with_extension("wal.compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut offset = buffer.read_offset();
            while let Some((bytes, next_offset)) = buffer.read_at(offset)? {
                tmp.write_all(&(bytes.len() as u32).to_le_bytes())?;
                tmp.write_all(&bytes)?;
                offset = next_offset;
            }
            tmp.sync_data()?;
        }
        buffer.close()?;

        std::fs::write(
            base.with_extension("seq"),
            new_base_sequence.to_le_bytes(),
        )?;
        std::fs::rename(&tmp_path, &wal_path)?;
        let mut cursor = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(base.with_extension("cursor"))?;
        cursor.write_all(&0u64.to_le_bytes())?;
        cursor.sync_data()?;

        log::info!(
            "[Wal] compacted {}: reclaimed {reclaimed} bytes (sequence base {new_base_sequence})",
            wal_path.display()
        );
        Ok(reclaimed)
    }
}

/// Read the 8-byte sequence base; absent or malformed means 0.
fn read_sequence_base(path: &Path) -> u64 {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() == 8 => {
            u64::from_le_bytes(bytes.try_into().expect("length checked"))
        }
        Ok(bytes) if bytes.is_empty() => 0,
        Ok(_) => {
            log::warn!("[Wal] malformed sequence base {}; using 0", path.display());
            0
        }
        Err(_) => 0,
    }
}

/// Walk the record chain from offset 0. Returns the byte size of the
/// complete-record prefix, the record count, and every record boundary
/// (including 0 and the final size).
fn scan_records(wal: &File, file_len: u64) -> (u64, u64, Vec<u64>) {
    let mut offset = 0u64;
    let mut count = 0u64;
    let mut boundaries = vec![0u64];

    while offset + 4 <= file_len {
        let mut len_buf = [0u8; 4];
        if wal.read_exact_at(&mut len_buf, offset).is_err() {
            break;
        }
        let length = u32::from_le_bytes(len_buf);
        if length == 0 || length > MAX_RECORD_SIZE {
            log::warn!("[Wal] suspicious length {length} at offset {offset} during scan");
            break;
        }
        let end = offset + 4 + length as u64;
        if end > file_len {
            break; // partial tail
        }
        offset = end;
        count += 1;
        boundaries.push(offset);
    }

    (offset, count, boundaries)
}

/// Read and validate the cursor file. Any anomaly resets to 0.
fn read_cursor(cursor: &File, path: &Path, wal_size: u64, boundaries: &[u64]) -> u64 {
    let mut buf = [0u8; 8];
    let n = match cursor.read_at(&mut buf, 0) {
        Ok(n) => n,
        Err(e) => {
            log::warn!("[Wal] unreadable cursor {}: {e}; resetting to 0", path.display());
            return 0;
        }
    };
    if n == 0 {
        // Fresh cursor file.
        return 0;
    }
    if n != 8 {
        log::warn!(
            "[Wal] cursor {} is {n} bytes, expected 8; resetting to 0 (will replay)",
            path.display()
        );
        return 0;
    }
    let offset = u64::from_le_bytes(buf);
    if offset > wal_size || !boundaries.contains(&offset) {
        log::warn!(
            "[Wal] cursor offset {offset} not a record boundary in {}; resetting to 0 (will replay)",
            path.display()
        );
        return 0;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base(dir: &TempDir) -> PathBuf {
        dir.path().join("buffer")
    }

    #[test]
    fn test_append_peek_acknowledge_round_trip() {
        let dir = TempDir::new().unwrap();
        let wal = WalBuffer::open(&base(&dir)).unwrap();

        assert_eq!(wal.append(b"A").unwrap(), 1);
        assert_eq!(wal.append(b"B").unwrap(), 2);

        let (bytes, seq, next) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"A");
        assert_eq!(seq, 1);
        wal.acknowledge(next).unwrap();

        let (bytes, seq, next) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"B");
        assert_eq!(seq, 2);
        wal.acknowledge(next).unwrap();

        assert!(wal.peek_next().unwrap().is_none());
        assert_eq!(wal.backlog_bytes(), 0);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let dir = TempDir::new().unwrap();
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        wal.append(b"once").unwrap();

        let first = wal.peek_next().unwrap().unwrap();
        let second = wal.peek_next().unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_write_order_preserved() {
        let dir = TempDir::new().unwrap();
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        for i in 0..50u32 {
            wal.append(format!("rec-{i}").as_bytes()).unwrap();
        }
        for i in 0..50u32 {
            let (bytes, _, next) = wal.peek_next().unwrap().unwrap();
            assert_eq!(bytes, format!("rec-{i}").as_bytes());
            wal.acknowledge(next).unwrap();
        }
    }

    #[test]
    fn test_unacked_record_survives_reopen() {
        // Crash before ack: on reopen the record and cursor are intact.
        let dir = TempDir::new().unwrap();
        {
            let wal = WalBuffer::open(&base(&dir)).unwrap();
            wal.append(b"X").unwrap();
        }
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        let (bytes, seq, _) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"X");
        assert_eq!(seq, 1);
        assert_eq!(wal.cursor_sequence(), 0);
    }

    #[test]
    fn test_cursor_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalBuffer::open(&base(&dir)).unwrap();
            wal.append(b"first").unwrap();
            wal.append(b"second").unwrap();
            let (_, _, next) = wal.peek_next().unwrap().unwrap();
            wal.acknowledge(next).unwrap();
        }
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        let (bytes, seq, _) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"second");
        assert_eq!(seq, 2);
        assert_eq!(wal.cursor_sequence(), 1);
    }

    #[test]
    fn test_sequence_continues_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalBuffer::open(&base(&dir)).unwrap();
            assert_eq!(wal.append(b"a").unwrap(), 1);
            assert_eq!(wal.append(b"b").unwrap(), 2);
        }
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        assert_eq!(wal.append(b"c").unwrap(), 3);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = TempDir::new().unwrap();
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        let big = vec![0u8; MAX_RECORD_SIZE as usize + 1];
        assert!(matches!(
            wal.append(&big),
            Err(WalError::RecordTooLarge(_))
        ));
        // Buffer still usable after a rejected append.
        wal.append(b"ok").unwrap();
    }

    #[test]
    fn test_corrupt_cursor_resets_to_zero() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalBuffer::open(&base(&dir)).unwrap();
            wal.append(b"data").unwrap();
            let (_, _, next) = wal.peek_next().unwrap().unwrap();
            wal.acknowledge(next).unwrap();
        }
        // Clobber the cursor with a short write.
        std::fs::write(dir.path().join("buffer.cursor"), [1, 2, 3]).unwrap();

        let wal = WalBuffer::open(&base(&dir)).unwrap();
        // Replay from the start — duplicates accepted downstream.
        let (bytes, seq, _) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"data");
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_cursor_past_eof_resets_to_zero() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalBuffer::open(&base(&dir)).unwrap();
            wal.append(b"data").unwrap();
        }
        std::fs::write(dir.path().join("buffer.cursor"), 9999u64.to_le_bytes()).unwrap();

        let wal = WalBuffer::open(&base(&dir)).unwrap();
        assert!(wal.peek_next().unwrap().is_some());
    }

    #[test]
    fn test_suspicious_length_surfaces() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalBuffer::open(&base(&dir)).unwrap();
            wal.append(b"valid").unwrap();
        }
        // Corrupt the length prefix of the first record in place.
        let wal_path = dir.path().join("buffer.wal");
        let mut contents = std::fs::read(&wal_path).unwrap();
        contents[..4].copy_from_slice(&(MAX_RECORD_SIZE + 7).to_le_bytes());
        std::fs::write(&wal_path, &contents).unwrap();

        let wal = WalBuffer::open(&base(&dir)).unwrap();
        assert!(matches!(
            wal.peek_next(),
            Err(WalError::SuspiciousLength { .. })
        ));
    }

    #[test]
    fn test_partial_tail_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let wal = WalBuffer::open(&base(&dir)).unwrap();
            wal.append(b"whole").unwrap();
        }
        // Simulate a crash mid-append: a length prefix with no body.
        let wal_path = dir.path().join("buffer.wal");
        let mut contents = std::fs::read(&wal_path).unwrap();
        contents.extend_from_slice(&100u32.to_le_bytes());
        contents.extend_from_slice(b"tr");
        std::fs::write(&wal_path, &contents).unwrap();

        let wal = WalBuffer::open(&base(&dir)).unwrap();
        let (bytes, _, next) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"whole");
        wal.acknowledge(next).unwrap();
        assert!(wal.peek_next().unwrap().is_none());
        // Appending after repair keeps the chain intact.
        assert_eq!(wal.append(b"after").unwrap(), 2);
        let (bytes, _, _) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"after");
    }

    #[test]
    fn test_append_with_embeds_sequence() {
        let dir = TempDir::new().unwrap();
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        let seq = wal
            .append_with(|seq| format!("seq={seq}").into_bytes())
            .unwrap();
        assert_eq!(seq, 1);
        let (bytes, _, _) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"seq=1");
    }

    #[test]
    fn test_compact_keeps_unacked_and_sequences() {
        let dir = TempDir::new().unwrap();
        let base = base(&dir);
        {
            let wal = WalBuffer::open(&base).unwrap();
            for i in 1..=5u32 {
                wal.append(format!("rec-{i}").as_bytes()).unwrap();
            }
            // Ack the first three.
            for _ in 0..3 {
                let (_, _, next) = wal.peek_next().unwrap().unwrap();
                wal.acknowledge(next).unwrap();
            }
        }

        let reclaimed = WalBuffer::compact(&base).unwrap();
        assert!(reclaimed > 0);

        let wal = WalBuffer::open(&base).unwrap();
        // Unacked records 4 and 5 survive with their sequences.
        let (bytes, seq, next) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"rec-4");
        assert_eq!(seq, 4);
        wal.acknowledge(next).unwrap();
        let (bytes, seq, next) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"rec-5");
        assert_eq!(seq, 5);
        wal.acknowledge(next).unwrap();
        // New appends continue the monotonic sequence.
        assert_eq!(wal.append(b"rec-6").unwrap(), 6);
    }

    #[test]
    fn test_compact_noop_at_cursor_zero() {
        let dir = TempDir::new().unwrap();
        let base = base(&dir);
        {
            let wal = WalBuffer::open(&base).unwrap();
            wal.append(b"pending").unwrap();
        }
        assert_eq!(WalBuffer::compact(&base).unwrap(), 0);
        let wal = WalBuffer::open(&base).unwrap();
        let (bytes, seq, _) = wal.peek_next().unwrap().unwrap();
        assert_eq!(bytes, b"pending");
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_backlog_bytes_tracks_gap() {
        let dir = TempDir::new().unwrap();
        let wal = WalBuffer::open(&base(&dir)).unwrap();
        assert_eq!(wal.backlog_bytes(), 0);
        wal.append(b"12345678").unwrap(); // 4 + 8 bytes
        assert_eq!(wal.backlog_bytes(), 12);
        let (_, _, next) = wal.peek_next().unwrap().unwrap();
        wal.acknowledge(next).unwrap();
        assert_eq!(wal.backlog_bytes(), 0);
    }
}
