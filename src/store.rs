//! The public surface: [`Store::open`], [`Store::insert`], [`Store::search`],
//! [`Store::delete`], [`Store::close`]. Everything else in the crate — pages, the
//! pager, the WAL, the B+tree — is reachable only through these five calls; the CLI,
//! the network server, and the user catalog this store is embedded in never see a
//! page id or a WAL record.
//!
//! Concurrency follows the single-writer/many-readers discipline from the design: one
//! [`RwLock`] around the pager. `search` takes the shared (reader) side; `insert`,
//! `delete`, and an explicit [`Store::checkpoint`] take the exclusive (writer) side
//! for the entire operation, so a reader never observes a structural change mid-way
//! through its propagation.
use crate::btree;
use crate::pager::Pager;
use crate::Result;
use std::path::Path;
use std::sync::RwLock;

/// A single open key/value store backed by one data file and its WAL.
pub struct Store {
    pager: RwLock<Pager>,
}

impl Store {
    /// Opens `path`, creating it if it doesn't exist. Replays any WAL left over from
    /// an unclean shutdown before returning.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let pager = Pager::open(path)?;
        Ok(Self {
            pager: RwLock::new(pager),
        })
    }

    /// Inserts `key` → `val`. Fails with [`crate::Error::KeyExists`] if `key` is
    /// already present, leaving the store unchanged.
    pub fn insert(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut pager = self.pager.write().unwrap();
        btree::insert(&mut pager, key, val)
    }

    /// Looks up `key`. `Ok(None)` means it isn't present.
    pub fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let pager = self.pager.read().unwrap();
        btree::search(&pager, key)
    }

    /// Deletes `key`. Fails with [`crate::Error::KeyNotFound`] if it isn't present.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut pager = self.pager.write().unwrap();
        btree::delete(&mut pager, key)
    }

    /// Flushes every dirty page to the data file, fsyncs it, and truncates the WAL,
    /// without closing the store. Exposed for callers (the network server's periodic
    /// housekeeping, in particular) that want a durability point short of closing.
    pub fn checkpoint(&self) -> Result<()> {
        let mut pager = self.pager.write().unwrap();
        pager.checkpoint()
    }

    /// Checkpoints and releases the data file and WAL handles. After this call the
    /// `Store` is consumed; reopen the same path with [`Store::open`] to continue
    /// using it.
    pub fn close(self) -> Result<()> {
        self.pager.into_inner().unwrap().close()
    }
}
