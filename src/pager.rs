//! The pager: page cache, on-disk layout, and the free-page list.
//!
//! Owns the data file and the write-ahead log together, since every page write must
//! reach the log before it reaches the cache. The meta page (id 0) is just another
//! cached, WAL-logged page — `root_id`/`free_head_id` are mirrored in memory for quick
//! access, but the bytes that matter flow through [`Pager::write_page`] like any leaf
//! or internal page, so a root change and the page writes around it commit together.
use crate::leaf_page;
use crate::page::{PageBuf, PageId, PageType, read_u16, read_u32, write_u16, write_u32};
use crate::wal::Wal;
use crate::{Error, FILE_MAGIC, NO_PAGE, PAGE_SIZE, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

/// Checkpoint once the WAL grows past this many bytes.
const WAL_CHECKPOINT_THRESHOLD: u64 = 100 * 1024 * 1024;

const META_PAGE_SIZE_OFF: usize = 9;
const META_ROOT_OFF: usize = 15;
const META_FREE_HEAD_OFF: usize = 19;

/// In-memory mirror of the meta page's two mutable fields.
#[derive(Debug, Clone, Copy)]
struct Meta {
    root_id: u32,
    free_head_id: u32,
}

impl Meta {
    fn encode(self, buf: &mut PageBuf) {
        buf.fill(0);
        buf[0..9].copy_from_slice(&FILE_MAGIC);
        write_u16(buf, META_PAGE_SIZE_OFF, PAGE_SIZE as u16);
        write_u32(buf, META_ROOT_OFF, self.root_id);
        write_u32(buf, META_FREE_HEAD_OFF, self.free_head_id);
    }

    fn decode(buf: &PageBuf) -> Result<Self> {
        if buf[0..9] != FILE_MAGIC {
            return Err(Error::InvalidFileSignature);
        }
        let page_size = read_u16(buf, META_PAGE_SIZE_OFF);
        if page_size as usize != PAGE_SIZE {
            return Err(Error::CorruptFile("meta page size does not match this build"));
        }
        Ok(Self {
            root_id: read_u32(buf, META_ROOT_OFF),
            free_head_id: read_u32(buf, META_FREE_HEAD_OFF),
        })
    }
}

struct CacheEntry {
    page: Box<PageBuf>,
    dirty: bool,
}

pub struct Pager {
    path: PathBuf,
    file: File,
    meta: Meta,
    meta_dirty: bool,
    next_page_id: u32,
    cache: Mutex<HashMap<PageId, CacheEntry>>,
    wal: Mutex<Wal>,
    replaying: bool,
    checkpoint_in_progress: AtomicBool,
}

impl Pager {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if !existed || file.metadata()?.len() == 0 {
            let mut meta_buf = [0u8; PAGE_SIZE];
            Meta {
                root_id: 1,
                free_head_id: NO_PAGE,
            }
            .encode(&mut meta_buf);

            let mut root_buf = [0u8; PAGE_SIZE];
            leaf_page::init(&mut root_buf);

            file.set_len((PAGE_SIZE * 2) as u64)?;
            write_page_raw(&file, PageId::META, &meta_buf)?;
            write_page_raw(&file, PageId::new(1), &root_buf)?;
            file.sync_data()?;
        }

        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 || len < (PAGE_SIZE * 2) as u64 {
            return Err(Error::CorruptFile("file size is not a whole number of pages"));
        }

        let mut meta_buf = [0u8; PAGE_SIZE];
        read_page_raw(&file, PageId::META, &mut meta_buf)?;
        let meta = Meta::decode(&meta_buf)?;
        let next_page_id = (len / PAGE_SIZE as u64) as u32;

        let wal = Wal::open(wal_path_for(&path))?;

        let mut pager = Self {
            path,
            file,
            meta,
            meta_dirty: false,
            next_page_id,
            cache: Mutex::new(HashMap::new()),
            wal: Mutex::new(wal),
            replaying: false,
            checkpoint_in_progress: AtomicBool::new(false),
        };

        pager.replay_wal()?;
        Ok(pager)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn root(&self) -> PageId {
        PageId::new(self.meta.root_id)
    }

    pub fn set_root(&mut self, id: PageId) {
        self.meta.root_id = id.get();
        self.meta_dirty = true;
    }

    /// The free-list head, or `None` if the list is empty. Exposed alongside
    /// [`Pager::num_pages`] for whole-file consistency walkers (see
    /// `tests/structural_invariants.rs`), not used by the tree code itself.
    pub fn free_head(&self) -> Option<PageId> {
        (self.meta.free_head_id != NO_PAGE).then(|| PageId::new(self.meta.free_head_id))
    }

    /// One past the highest page id ever allocated in this file. Every id in
    /// `1..num_pages()` is either reachable from the root or on the free list.
    pub fn num_pages(&self) -> u32 {
        self.next_page_id
    }

    /// Writes the in-memory meta fields through to the cached meta page, if anything
    /// changed since the last sync. Called once per top-level operation, at the close
    /// of [`Pager::with_transaction`] — the "single checkMeta after each operation"
    /// mirrored from the data model's description of meta-page bookkeeping.
    fn sync_meta_if_dirty(&mut self) -> Result<()> {
        if !self.meta_dirty {
            return Ok(());
        }
        let mut buf = [0u8; PAGE_SIZE];
        self.meta.encode(&mut buf);
        self.write_page(PageId::META, &buf)?;
        self.meta_dirty = false;
        Ok(())
    }

    /// Replays the write-ahead log left over from an unclean shutdown, then truncates
    /// it. A short read at a field boundary is a normal (if unlucky) end of log; a
    /// structurally complete record with a bad checksum is fatal, surfaced by
    /// [`Wal::replay`] as [`Error::ChecksumMismatch`].
    fn replay_wal(&mut self) -> Result<()> {
        log::debug!("replaying wal at {}", wal_path_for(&self.path).display());
        let writes = self.wal.lock().unwrap().replay()?;
        if writes.is_empty() {
            log::trace!("wal replay found nothing to apply");
            return Ok(());
        }

        log::debug!("wal replay applying {} committed page writes", writes.len());
        self.replaying = true;
        for write in writes {
            let id = PageId::new(write.page_id);
            log::trace!("wal replay applying page {id}");
            if id.get() >= self.next_page_id {
                self.next_page_id = id.get() + 1;
            }
            self.write_page(id, &write.page)?;
        }
        self.replaying = false;

        self.flush_dirty()?;
        self.file.sync_data()?;
        self.wal.lock().unwrap().truncate()?;

        let mut meta_buf = [0u8; PAGE_SIZE];
        read_page_raw(&self.file, PageId::META, &mut meta_buf)?;
        self.meta = Meta::decode(&meta_buf)?;
        log::debug!("wal replay complete, root is now page {}", self.meta.root_id);
        Ok(())
    }

    /// Runs `f` as a single WAL transaction: every [`Pager::write_page`] call inside
    /// `f` is logged between a `BeginTx`/`CommitTx` pair, so either all of them survive
    /// a crash or none do. On error the transaction is left uncommitted in the log;
    /// the next open discards it during replay. Commits trigger a size-triggered
    /// checkpoint once the log has grown past [`WAL_CHECKPOINT_THRESHOLD`].
    pub fn with_transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let txid = self.wal.lock().unwrap().begin_tx()?;
        let value = f(self)?;
        self.sync_meta_if_dirty()?;
        self.wal.lock().unwrap().commit_tx(txid)?;
        self.maybe_checkpoint()?;
        Ok(value)
    }

    /// Pops a page off the free list if one is available, otherwise extends the file.
    /// A corrupt next-pointer (out of range for this file) truncates the remainder of
    /// the free list rather than failing the allocation: the popped page is still
    /// good, only the chain past it is suspect.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        if self.meta.free_head_id != NO_PAGE {
            let head = PageId::new(self.meta.free_head_id);
            let buf = self.read_page(head)?;
            let next = read_u32(&buf, 1);
            if next != NO_PAGE && next >= self.next_page_id {
                log::warn!(
                    "corrupt free list: next pointer {next} past page {head} is out of range; truncating free list"
                );
                self.meta.free_head_id = NO_PAGE;
            } else {
                self.meta.free_head_id = next;
            }
            self.meta_dirty = true;
            return Ok(head);
        }

        let id = PageId::new(self.next_page_id);
        self.next_page_id = self
            .next_page_id
            .checked_add(1)
            .ok_or(Error::PageOverflow)?;
        Ok(id)
    }

    /// Reclaims `id`, threading it onto the head of the free list. Never call this
    /// with the meta page or the current root: both must always be reachable.
    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        debug_assert!(id != PageId::META, "freePage must never target the meta page");
        debug_assert!(id != self.root(), "freePage must never target the current root");

        let mut buf = [0u8; PAGE_SIZE];
        buf[0] = PageType::Free as u8;
        write_u32(&mut buf, 1, self.meta.free_head_id);
        self.meta.free_head_id = id.get();
        self.meta_dirty = true;
        self.write_page(id, &buf)
    }

    pub fn read_page(&self, id: PageId) -> Result<PageBuf> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&id) {
                return Ok(*entry.page);
            }
        }

        let mut buf = [0u8; PAGE_SIZE];
        read_page_raw(&self.file, id, &mut buf)?;

        let mut cache = self.cache.lock().unwrap();
        cache.entry(id).or_insert_with(|| CacheEntry {
            page: Box::new(buf),
            dirty: false,
        });
        Ok(buf)
    }

    /// Logs `buf` to the WAL (unless this write is itself part of WAL replay), then
    /// installs it in the cache as dirty. The on-disk data file is only touched at the
    /// next [`Pager::checkpoint`].
    pub fn write_page(&mut self, id: PageId, buf: &PageBuf) -> Result<()> {
        if !self.replaying {
            self.wal.lock().unwrap().log_page(id.get(), buf)?;
        }

        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            id,
            CacheEntry {
                page: Box::new(*buf),
                dirty: true,
            },
        );
        drop(cache);

        if id.get() >= self.next_page_id {
            self.next_page_id = id.get() + 1;
        }
        Ok(())
    }

    fn flush_dirty(&mut self) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        for (id, entry) in cache.iter_mut() {
            if entry.dirty {
                write_page_raw(&self.file, *id, &entry.page)?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    fn maybe_checkpoint(&mut self) -> Result<()> {
        let len = self.wal.lock().unwrap().len()?;
        if len >= WAL_CHECKPOINT_THRESHOLD {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Flushes every dirty cached page to the data file, fsyncs it, then truncates the
    /// WAL. Coalesced: a checkpoint already in flight makes concurrent callers no-op
    /// rather than pile up redundant flushes.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.checkpoint_in_progress.swap(true, Ordering::AcqRel) {
            log::trace!("checkpoint already in flight, skipping");
            return Ok(());
        }
        log::debug!("checkpoint starting, wal len {}", self.wal.lock().unwrap().len()?);
        let result = self.checkpoint_inner();
        self.checkpoint_in_progress.store(false, Ordering::Release);
        match &result {
            Ok(()) => log::debug!("checkpoint complete, wal truncated"),
            Err(e) => log::debug!("checkpoint failed: {e}"),
        }
        result
    }

    fn checkpoint_inner(&mut self) -> Result<()> {
        self.sync_meta_if_dirty()?;
        self.flush_dirty()?;
        self.file.sync_data()?;
        self.wal.lock().unwrap().truncate()?;
        Ok(())
    }

    /// Checkpoints, then removes the WAL file. Called once by [`crate::Store::close`].
    pub fn close(mut self) -> Result<()> {
        self.checkpoint()?;
        self.wal.lock().unwrap().remove_file()?;
        Ok(())
    }
}

fn wal_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

fn read_page_raw(file: &File, id: PageId, buf: &mut PageBuf) -> Result<()> {
    let offset = id.get() as u64 * PAGE_SIZE as u64;
    read_exact_at(file, offset, buf)?;
    Ok(())
}

fn write_page_raw(file: &File, id: PageId, buf: &PageBuf) -> Result<()> {
    let offset = id.get() as u64 * PAGE_SIZE as u64;
    write_all_at(file, offset, buf)?;
    Ok(())
}

fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = read_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at returned 0 bytes",
            ));
        }
        offset = offset.saturating_add(n as u64);
        buf = &mut buf[n..];
    }
    Ok(())
}

fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = write_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_at returned 0 bytes",
            ));
        }
        offset = offset.saturating_add(n as u64);
        buf = &buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_file_has_an_empty_leaf_root() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("test.db")).unwrap();
        assert_eq!(pager.root(), PageId::new(1));
        let root = pager.read_page(pager.root()).unwrap();
        assert_eq!(root[0], PageType::Leaf as u8);
    }

    #[test]
    fn write_page_is_visible_before_checkpoint() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("test.db")).unwrap();
        let id = pager.allocate_page().unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        buf[10] = 0x42;
        pager.with_transaction(|p| p.write_page(id, &buf)).unwrap();

        let got = pager.read_page(id).unwrap();
        assert_eq!(got[10], 0x42);
    }

    #[test]
    fn reopen_after_checkpoint_preserves_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let id;
        {
            let mut pager = Pager::open(&path).unwrap();
            id = pager.allocate_page().unwrap();
            let mut buf = [0u8; PAGE_SIZE];
            buf[5] = 0x99;
            pager.with_transaction(|p| p.write_page(id, &buf)).unwrap();
            pager.checkpoint().unwrap();
        }

        let pager = Pager::open(&path).unwrap();
        let got = pager.read_page(id).unwrap();
        assert_eq!(got[5], 0x99);
    }

    #[test]
    fn reopen_without_checkpoint_replays_from_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let id;
        {
            let mut pager = Pager::open(&path).unwrap();
            id = pager.allocate_page().unwrap();
            let mut buf = [0u8; PAGE_SIZE];
            buf[7] = 0x55;
            pager.with_transaction(|p| p.write_page(id, &buf)).unwrap();
            // dropped without an explicit checkpoint: only the WAL has this page
        }

        let pager = Pager::open(&path).unwrap();
        let got = pager.read_page(id).unwrap();
        assert_eq!(got[7], 0x55);
    }

    #[test]
    fn free_then_allocate_reuses_the_page() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("test.db")).unwrap();
        let id = pager.allocate_page().unwrap();
        pager.with_transaction(|p| p.free_page(id)).unwrap();
        let reused = pager.allocate_page().unwrap();
        assert_eq!(reused, id);
    }

    static LOG_INIT: std::sync::Once = std::sync::Once::new();

    /// Installs `env_logger` once per test binary so the free-list-corruption warning
    /// below actually reaches a sink instead of being dropped by the `log` facade's
    /// default no-op logger. Run with `RUST_LOG=warn` to see it.
    fn init_logging() {
        LOG_INIT.call_once(|| {
            let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
        });
    }

    #[test]
    fn corrupt_free_list_is_truncated_and_warned_about() {
        init_logging();

        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("test.db")).unwrap();
        let id = pager.allocate_page().unwrap();
        pager.with_transaction(|p| p.free_page(id)).unwrap();

        // overwrite the freed page's next-pointer with an out-of-range value, as if
        // the free list had been corrupted by something outside the pager.
        let mut buf = pager.read_page(id).unwrap();
        write_u32(&mut buf, 1, 0xDEAD_BEEF);
        pager.with_transaction(|p| p.write_page(id, &buf)).unwrap();

        let allocated = pager.allocate_page().unwrap();
        assert_eq!(allocated, id);
        assert_eq!(pager.meta.free_head_id, NO_PAGE, "free list must be truncated, not left dangling");
    }

    #[test]
    fn rejects_a_file_with_the_wrong_signature() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let _pager = Pager::open(&path).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'X';
        std::fs::write(&path, bytes).unwrap();

        match Pager::open(&path) {
            Err(Error::InvalidFileSignature) => {}
            other => panic!("expected InvalidFileSignature, got {other:?}"),
        }
    }
}
