//! Process-wide cache authority registry: remembers recently written bytes
//! per inode across handle close, and drives Restore's eligibility checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use log::{debug, info};
use parking_lot::Mutex;

use crate::buffer::ByteBuffer;
use crate::inode::InodeTranslator;

/// Seconds since the Unix epoch. `0` has the reserved meaning "a live
/// handle still owns this entry" everywhere `lifetime` is used.
pub type Lifetime = u64;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One inode's cached write-side state.
#[derive(Clone)]
pub struct CacheEntry {
    /// The cached bytes themselves, shared with every live handle on this
    /// inode.
    pub buffer: Arc<Mutex<ByteBuffer>>,
    /// Last-known committed size.
    pub size: u64,
    /// Set once a write exceeded the cacheable range; such an entry is
    /// never eligible for Restore.
    pub partial: bool,
    /// Absolute expiry epoch, or `0` while a handle still owns the entry.
    pub lifetime: Lifetime,
    /// Seconds added to `lifetime` when the owning handle closes.
    pub owner_lifetime: Duration,
    /// Set by Restore to the new inode the bytes were replayed under.
    pub restore_inode: u64,
}

impl CacheEntry {
    fn fresh(owner_lifetime: Duration) -> Self {
        CacheEntry {
            buffer: Arc::new(Mutex::new(ByteBuffer::new())),
            size: 0,
            partial: false,
            lifetime: 0,
            owner_lifetime,
            restore_inode: 0,
        }
    }

    /// Whether this entry can still serve reads/restore: owned by a live
    /// handle (`lifetime == 0`) or not yet expired.
    pub fn is_live(&self) -> bool {
        self.lifetime == 0 || now_secs() < self.lifetime
    }
}

/// Outcome of acquiring (or declining to acquire) a cache buffer for a
/// newly opened handle.
pub struct AcquireResult {
    /// The shared buffer to adopt, if any.
    pub buffer: Option<Arc<Mutex<ByteBuffer>>>,
    /// Whether the handle may use the cache at all.
    pub can_cache: bool,
    /// Whether this acquisition created a fresh entry (`CREAT`/`TRUNC`).
    pub creator: bool,
    /// The entry's size as of acquisition.
    pub known_size: u64,
}

/// The process-wide registry. Access only through the `REGISTRY` singleton
/// below; a second instance would defeat the "survives handle close"
/// invariant the whole design depends on.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<u64, CacheEntry>>,
}

impl Registry {
    /// Acquire a buffer for `inode`, creating a fresh entry when the open
    /// is `CREAT`/`TRUNC`, or reusing a live existing entry otherwise.
    pub fn acquire_or_reuse(
        &self,
        inode: u64,
        is_create_or_trunc: bool,
        owner_lifetime: Duration,
    ) -> AcquireResult {
        let mut entries = self.entries.lock();
        if is_create_or_trunc {
            let entry = CacheEntry::fresh(owner_lifetime);
            let buffer = entry.buffer.clone();
            entries.insert(inode, entry);
            info!(
                target: "eoslayout::cache",
                "acquired cap owner-authority for inode {inode:x} size=0 create/truncate=true"
            );
            return AcquireResult {
                buffer: Some(buffer),
                can_cache: true,
                creator: true,
                known_size: 0,
            };
        }

        match entries.get(&inode) {
            Some(entry) if entry.is_live() => {
                info!(
                    target: "eoslayout::cache",
                    "reusing cap owner-authority for inode {inode:x} cache-size={} file-size={}",
                    entry.buffer.lock().size(),
                    entry.size
                );
                AcquireResult {
                    buffer: Some(entry.buffer.clone()),
                    can_cache: true,
                    creator: false,
                    known_size: entry.size,
                }
            }
            _ => AcquireResult {
                buffer: None,
                can_cache: false,
                creator: false,
                known_size: 0,
            },
        }
    }

    /// Grow the recorded size to cover a write ending at `end_offset`.
    pub fn record_write(&self, inode: u64, end_offset: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&inode) {
            entry.size = entry.size.max(end_offset);
        }
    }

    /// Mark an entry as no longer fully restorable.
    pub fn mark_partial(&self, inode: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&inode) {
            entry.partial = true;
        }
    }

    /// Record a committed truncate.
    pub fn truncate(&self, inode: u64, new_size: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&inode) {
            entry.size = new_size;
        }
    }

    /// On a write-mode close, start the entry's expiry countdown. Returns
    /// false if the entry has vanished in the meantime (e.g. a concurrent
    /// `remove`), in which case the caller must not treat the handle as
    /// cacheable any longer.
    pub fn stamp_expiry(&self, inode: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&inode) {
            Some(entry) => {
                let expire = now_secs() + entry.owner_lifetime.as_secs();
                entry.lifetime = expire;
                info!(
                    target: "eoslayout::cache",
                    "define expiry of cap owner-authority for inode {inode:x} tst={expire} lifetime={}",
                    entry.owner_lifetime.as_secs()
                );
                true
            }
            None => false,
        }
    }

    /// The cached size of `inode`, if the entry is present and live.
    pub fn lookup_size(&self, inode: u64) -> Option<u64> {
        let entries = self.entries.lock();
        entries.get(&inode).filter(|e| e.is_live()).map(|e| e.size)
    }

    /// A read-only snapshot of `inode`'s entry, usable by Restore without
    /// holding the registry lock across the replay.
    pub fn snapshot(&self, inode: u64) -> Option<CacheEntry> {
        self.entries.lock().get(&inode).cloned()
    }

    /// Record that `old`'s contents were replayed to `new` by Restore.
    pub fn set_restore_inode(&self, old: u64, new: u64) {
        if let Some(entry) = self.entries.lock().get_mut(&old) {
            entry.restore_inode = new;
        }
    }

    /// Migrate the entry at `old` to live under `new`, clearing the
    /// restore pointer. Returns the new inode, or 0 if `old` had no entry.
    /// Idempotent: a second call finds nothing at `old` and returns 0.
    pub fn migrate(&self, old: u64) -> u64 {
        let mut entries = self.entries.lock();
        let Some(mut entry) = entries.remove(&old) else {
            return 0;
        };
        let new = entry.restore_inode;
        if new == 0 {
            // nothing to migrate to; put it back under the old key
            entries.insert(old, entry);
            return 0;
        }
        entry.restore_inode = 0;
        entries.insert(new, entry);
        new
    }

    /// Drop an inode's entry entirely (e.g. on unlink).
    pub fn remove(&self, inode: u64) {
        self.entries.lock().remove(&inode);
    }

    /// External-facing size lookup: translates `external_inode` through
    /// `translator` into the internal file id the registry is keyed on
    /// before consulting it. Mirrors `CacheAuthSize`.
    pub fn cache_auth_size(
        &self,
        translator: &dyn InodeTranslator,
        external_inode: u64,
    ) -> Option<u64> {
        let fid = translator.inode_to_fid(external_inode);
        if fid == 0 {
            return None;
        }
        match self.lookup_size(fid) {
            Some(size) => {
                debug!(
                    target: "eoslayout::cache",
                    "reusing cap owner-authority for inode {fid:x} cache-file-size={size}"
                );
                Some(size)
            }
            None => {
                debug!(
                    target: "eoslayout::cache",
                    "found expired or unknown cap owner-authority for inode {fid:x}"
                );
                None
            }
        }
    }

    /// External-facing restore migration: translates `external_inode` to
    /// its internal file id, migrates the entry to its restore target, and
    /// translates the result back to external-inode space. Mirrors
    /// `CacheRestore`. Idempotent, since `migrate` is.
    pub fn cache_restore(&self, translator: &dyn InodeTranslator, external_inode: u64) -> u64 {
        let fid = translator.inode_to_fid(external_inode);
        debug!(target: "eoslayout::cache", "cache_restore inode={fid:x}");
        if fid == 0 {
            return 0;
        }
        let new_fid = self.migrate(fid);
        if new_fid == 0 {
            return 0;
        }
        info!(
            target: "eoslayout::cache",
            "migrated cap owner-authority for file inode={fid:x} => inode={new_fid:x}"
        );
        translator.fid_to_inode(new_fid)
    }

    /// External-facing removal (e.g. on unlink or eviction). Mirrors
    /// `CacheRemove`.
    pub fn cache_remove(&self, translator: &dyn InodeTranslator, external_inode: u64) {
        let fid = translator.inode_to_fid(external_inode);
        if fid == 0 {
            return;
        }
        if self.entries.lock().remove(&fid).is_some() {
            info!(
                target: "eoslayout::cache",
                "removed cap owner-authority for file inode={fid:x}"
            );
        }
    }
}

lazy_static! {
    /// The single process-wide cache authority. A `lazy_static` here
    /// mirrors the idiom `fuser::ll::errno` already uses for its own
    /// process-wide errno table.
    pub static ref REGISTRY: Registry = Registry::default();
}
