//! Write-ahead log: a flat sequence of fixed-width page-image records.
//!
//! Every record has the same shape regardless of what it carries:
//! `{page_id: u32 LE}{page_image: PAGE_SIZE bytes}{crc32: u32 LE}`, crc over the page
//! image only. Two page ids are reserved as transaction markers rather than real
//! pages (`TX_BEGIN`/`TX_COMMIT`); their "page image" holds an 8-byte little-endian
//! txid in the first eight bytes and zeroes elsewhere. This keeps transaction framing
//! inside the one record shape instead of adding a type tag to it. Replay only applies
//! the page writes between a matched begin/commit pair, which is how a multi-page
//! structural change (a split touching two leaves and a parent) becomes atomic across
//! a crash: a torn operation leaves its writes logged but uncommitted, and replay
//! discards them.
use crate::page::PageBuf;
use crate::{Error, NO_PAGE, PAGE_SIZE, Result};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Reserved page id marking the start of a transaction's page writes.
pub const TX_BEGIN: u32 = NO_PAGE - 1;
/// Reserved page id marking the end of a transaction's page writes.
pub const TX_COMMIT: u32 = NO_PAGE - 2;

const RECORD_LEN: u64 = 4 + PAGE_SIZE as u64 + 4;

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn txid_record(txid: u64) -> Box<PageBuf> {
    let mut buf = Box::new([0u8; PAGE_SIZE]);
    buf[0..8].copy_from_slice(&txid.to_le_bytes());
    buf
}

/// A page write recovered from the log during replay.
pub struct LoggedWrite {
    pub page_id: u32,
    pub page: Box<PageBuf>,
}

/// The write-ahead log file.
///
/// Every [`Wal::log_page`] call appends and fsyncs before returning, so a commit is
/// durable the instant its `CommitTx` record hits disk. [`Wal::replay`] is the only
/// other way records are read; there is no cursor/iteration API beyond it, matching
/// the store's points-only (no range scan) contract.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    next_txid: u64,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            next_txid: 1,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn append_record(&mut self, page_id: u32, page: &PageBuf) -> Result<()> {
        let crc = crc32(page);
        let mut record = Vec::with_capacity(RECORD_LEN as usize);
        record.extend_from_slice(&page_id.to_le_bytes());
        record.extend_from_slice(page);
        record.extend_from_slice(&crc.to_le_bytes());
        self.file.write_all(&record)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Begins a transaction, returning its id for the matching [`Wal::commit_tx`].
    pub fn begin_tx(&mut self) -> Result<u64> {
        let txid = self.next_txid;
        self.next_txid += 1;
        self.append_record(TX_BEGIN, &txid_record(txid))?;
        Ok(txid)
    }

    pub fn commit_tx(&mut self, txid: u64) -> Result<()> {
        self.append_record(TX_COMMIT, &txid_record(txid))
    }

    pub fn log_page(&mut self, page_id: u32, page: &PageBuf) -> Result<()> {
        debug_assert!(page_id != TX_BEGIN && page_id != TX_COMMIT);
        self.append_record(page_id, page)
    }

    /// Truncates the log to empty after a successful checkpoint or replay.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Replays the log from the start, returning the page writes belonging to
    /// committed transactions in the order they were logged. An uncommitted trailing
    /// transaction (begun but never matched by a `CommitTx`, the signature of a crash
    /// mid-operation) is discarded along with anything after it.
    ///
    /// A structurally complete record whose crc doesn't match is [`Error::ChecksumMismatch`],
    /// a hard failure: the log is corrupt, not merely torn. A short read at any field
    /// of a record (the signature of a write that was interrupted mid-append) is normal
    /// end-of-log and stops replay without error.
    pub fn replay(&mut self) -> Result<Vec<LoggedWrite>> {
        log::trace!("wal replay scanning {}", self.path.display());
        self.file.seek(SeekFrom::Start(0))?;
        let mut offset = 0u64;
        let mut committed = Vec::new();
        let mut pending: Vec<LoggedWrite> = Vec::new();
        let mut in_tx = false;

        loop {
            match self.read_record(offset)? {
                None => break,
                Some((page_id, page)) => {
                    offset += RECORD_LEN;
                    match page_id {
                        TX_BEGIN => {
                            log::trace!("wal replay: begin tx at offset {offset}");
                            pending.clear();
                            in_tx = true;
                        }
                        TX_COMMIT => {
                            if in_tx {
                                log::trace!(
                                    "wal replay: commit tx at offset {offset}, {} page writes",
                                    pending.len()
                                );
                                committed.append(&mut pending);
                            } else {
                                log::trace!("wal replay: commit tx with no matching begin, ignoring");
                            }
                            in_tx = false;
                        }
                        id => {
                            if in_tx {
                                pending.push(LoggedWrite { page_id: id, page });
                            }
                        }
                    }
                }
            }
        }

        if in_tx {
            log::debug!(
                "wal replay: discarding {} page writes from an uncommitted trailing transaction",
                pending.len()
            );
        }
        log::debug!("wal replay scanned {offset} bytes, {} page writes committed", committed.len());
        Ok(committed)
    }

    fn read_record(&mut self, offset: u64) -> Result<Option<(u32, Box<PageBuf>)>> {
        let mut id_buf = [0u8; 4];
        if !self.read_exact_or_eof(&mut id_buf)? {
            return Ok(None);
        }

        let mut page = Box::new([0u8; PAGE_SIZE]);
        if !self.read_exact_or_eof(page.as_mut_slice())? {
            return Ok(None);
        }

        let mut crc_buf = [0u8; 4];
        if !self.read_exact_or_eof(&mut crc_buf)? {
            return Ok(None);
        }

        let stored_crc = u32::from_le_bytes(crc_buf);
        let actual_crc = crc32(page.as_ref());
        if stored_crc != actual_crc {
            return Err(Error::ChecksumMismatch(offset));
        }

        Ok(Some((u32::from_le_bytes(id_buf), page)))
    }

    /// Reads exactly `buf.len()` bytes, or returns `Ok(false)` if the file ends before
    /// any of `buf` is filled or partway through it — both cases are a torn tail.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.file.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the log file from disk. Called after a clean [`crate::store::Store::close`].
    pub fn remove_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(byte: u8) -> Box<PageBuf> {
        Box::new([byte; PAGE_SIZE])
    }

    #[test]
    fn replay_empty_log_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }

    #[test]
    fn replay_applies_only_committed_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();

        let txid = wal.begin_tx().unwrap();
        wal.log_page(1, &page_with(1)).unwrap();
        wal.log_page(2, &page_with(2)).unwrap();
        wal.commit_tx(txid).unwrap();

        let writes = wal.replay().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].page_id, 1);
        assert_eq!(writes[1].page_id, 2);
    }

    #[test]
    fn replay_drops_an_uncommitted_trailing_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();

        let txid = wal.begin_tx().unwrap();
        wal.log_page(1, &page_with(1)).unwrap();
        wal.commit_tx(txid).unwrap();

        wal.begin_tx().unwrap();
        wal.log_page(2, &page_with(2)).unwrap();
        // no matching commit_tx: simulates a crash mid-operation

        let writes = wal.replay().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].page_id, 1);
    }

    #[test]
    fn replay_tolerates_a_torn_final_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            let txid = wal.begin_tx().unwrap();
            wal.log_page(1, &page_with(1)).unwrap();
            wal.commit_tx(txid).unwrap();
        }
        // append a truncated record: only the page id field, nothing else
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&99u32.to_le_bytes()).unwrap();
        }

        let mut wal = Wal::open(&path).unwrap();
        let writes = wal.replay().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].page_id, 1);
    }

    #[test]
    fn replay_rejects_a_complete_record_with_a_bad_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut wal = Wal::open(&path).unwrap();
            let txid = wal.begin_tx().unwrap();
            wal.log_page(1, &page_with(1)).unwrap();
            wal.commit_tx(txid).unwrap();
        }

        // flip a byte inside the second record's page image, leaving its crc stale
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            let corrupt_offset = RECORD_LEN + 4;
            file.seek(SeekFrom::Start(corrupt_offset)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let mut wal = Wal::open(&path).unwrap();
        match wal.replay() {
            Err(Error::ChecksumMismatch(_)) => {}
            other => panic!("expected ChecksumMismatch, got {other:?}"),
        }
    }

    #[test]
    fn truncate_resets_length_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = Wal::open(dir.path().join("wal.log")).unwrap();
        let txid = wal.begin_tx().unwrap();
        wal.log_page(1, &page_with(1)).unwrap();
        wal.commit_tx(txid).unwrap();
        assert!(wal.len().unwrap() > 0);
        wal.truncate().unwrap();
        assert_eq!(wal.len().unwrap(), 0);
    }
}
