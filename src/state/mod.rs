//! Content-keyed file state shared by every opener of a path --- the
//! sharing-mode arbiter, byte-range lock table, oplock record, and
//! change-notification subscriber list all live here.
//!
//! Entries are handed out by a [`FileStateCache`] backend: standalone keeps
//! them in process, clustered replicates the interesting transitions to
//! peer nodes. Entry mutexes guard short critical sections only; the one
//! place a caller waits (a pending oplock break) parks on
//! [`FileState::break_done`] with the mutex released.

pub mod cluster;
pub mod standalone;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::codec::header::Header;
use crate::disk::{DesiredAccess, SharingMode};
use crate::locks::LockTable;
use crate::message_types::OutgoingSender;
use crate::status::Status;

/// Canonical content key: owning share plus the case-folded path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub share: u16,
    pub path: String,
}

impl StateKey {
    pub fn new(share: u16, path: &str) -> StateKey {
        StateKey { share, path: path.to_ascii_uppercase() }
    }

    /// Stable two-entry lock order (rename locks source and destination):
    /// ascending hash, ties broken lexicographically.
    pub fn lock_order(&self, other: &StateKey) -> std::cmp::Ordering {
        fn hash(key: &StateKey) -> u64 {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish()
        }
        hash(self).cmp(&hash(other)).then_with(|| {
            (self.share, self.path.as_str()).cmp(&(other.share, other.path.as_str()))
        })
    }
}

/// Oplock levels, with their NTCreateAndX response encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum OplockLevel {
    None = 0,
    Exclusive = 1,
    Batch = 2,
    LevelII = 3,
}

impl OplockLevel {
    pub fn is_exclusive(self) -> bool {
        matches!(self, OplockLevel::Exclusive | OplockLevel::Batch)
    }
}

/// The opener currently holding an oplock on the entry.
#[derive(Debug, Clone)]
pub struct OplockOwner {
    pub connection: u64,
    pub uid: u16,
    pub tid: u16,
    pub fid: u16,
    pub level: OplockLevel,
    /// Write funnel of the owning connection, for server-initiated breaks.
    pub sender: OutgoingSender,
}

/// A break the server has sent and is still waiting to see acknowledged.
/// The timestamp uses the tokio clock so break timeouts honor paused time
/// in tests.
#[derive(Debug, Clone)]
pub struct PendingBreak {
    pub to_level: OplockLevel,
    pub since: tokio::time::Instant,
}

/// One active opener of the entry.
#[derive(Debug, Clone)]
pub struct Opener {
    pub connection: u64,
    pub uid: u16,
    pub fid: u16,
    pub access: DesiredAccess,
    pub sharing: SharingMode,
}

/// A parked change-notify request watching this directory.
pub struct NotifySubscriber {
    pub connection: u64,
    pub uid: u16,
    pub mid: u16,
    pub filter: u32,
    pub recursive: bool,
    pub auto_resubmit: bool,
    /// Response header template captured from the parked request.
    pub reply_header: Header,
    pub sender: OutgoingSender,
}

/// Mutable state behind the entry mutex.
pub struct StateInner {
    /// Number of live citations (open files and in-flight acquisitions).
    pub refs: u32,
    pub openers: Vec<Opener>,
    /// The exclusive or batch holder; level-II holders sit in `level_ii`.
    pub oplock: Option<OplockOwner>,
    pub level_ii: Vec<OplockOwner>,
    pub breaking: Option<PendingBreak>,
    pub locks: LockTable,
    pub subscribers: Vec<NotifySubscriber>,
    /// Cached existence; `None` until a create attempt resolves it.
    pub exists: Option<bool>,
    /// Any opener requested delete-on-close.
    pub delete_on_close: bool,
    /// Set when `refs` drops to zero; the reaper compares it to the TTL.
    pub idle_since: Option<Instant>,
}

/// A file-state cache entry.
pub struct FileState {
    pub key: StateKey,
    inner: Mutex<StateInner>,
    break_done: Notify,
}

impl FileState {
    pub fn new(key: StateKey) -> FileState {
        FileState {
            key,
            inner: Mutex::new(StateInner {
                refs: 0,
                openers: Vec::new(),
                oplock: None,
                level_ii: Vec::new(),
                breaking: None,
                locks: LockTable::new(),
                subscribers: Vec::new(),
                exists: None,
                delete_on_close: false,
                idle_since: None,
            }),
            break_done: Notify::new(),
        }
    }

    /// Runs `f` under the entry mutex. Callers must not block inside `f`.
    pub fn locked<T>(&self, f: impl FnOnce(&mut StateInner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut inner)
    }

    /// Signalled whenever a pending break resolves (ack, timeout, or the
    /// holder closing).
    pub fn break_done(&self) -> &Notify {
        &self.break_done
    }

    pub fn notify_break_done(&self) {
        self.break_done.notify_waiters();
    }
}

/// Checks a prospective opener against every current opener, both ways: the
/// newcomer's desired access must be allowed by each holder's sharing mode,
/// and each holder's access must be allowed by the newcomer's sharing mode.
pub fn sharing_compatible(
    openers: &[Opener],
    access: DesiredAccess,
    sharing: SharingMode,
) -> Result<(), Status> {
    fn allowed(access: DesiredAccess, sharing: SharingMode) -> bool {
        if access.wants_read() && !sharing.contains(SharingMode::READ) {
            return false;
        }
        if access.wants_write() && !sharing.contains(SharingMode::WRITE) {
            return false;
        }
        if access.wants_delete() && !sharing.contains(SharingMode::DELETE) {
            return false;
        }
        true
    }

    for opener in openers {
        if !allowed(access, opener.sharing) || !allowed(opener.access, sharing) {
            return Err(Status::SHARING_VIOLATION);
        }
    }
    Ok(())
}

/// Pluggable file-state backend.
#[async_trait]
pub trait FileStateCache: Send + Sync {
    /// Returns the entry for `key`, creating it on first reference, with one
    /// citation added for the caller.
    async fn acquire(&self, key: StateKey) -> std::sync::Arc<FileState>;

    /// Drops one citation.
    async fn release(&self, entry: &std::sync::Arc<FileState>);

    /// Runs `f` under the entry's (possibly distributed) lock.
    async fn with_locked(
        &self,
        entry: &std::sync::Arc<FileState>,
        f: &mut (dyn for<'a> FnMut(&'a mut StateInner) + Send),
    );

    /// Evicts quiescent entries idle for at least `ttl`; returns how many.
    async fn reap(&self, ttl: Duration) -> usize;

    /// Looks up an existing entry without adding a citation.
    fn find(&self, key: &StateKey) -> Option<std::sync::Arc<FileState>>;

    /// Records existence knowledge for negative caching.
    fn set_exists(&self, key: &StateKey, exists: bool);

    /// Consults the negative cache.
    fn cached_exists(&self, key: &StateKey) -> Option<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opener(fid: u16, access: DesiredAccess, sharing: SharingMode) -> Opener {
        Opener { connection: 1, uid: 100, fid, access, sharing }
    }

    #[test]
    fn compatible_readers() {
        let openers =
            vec![opener(1, DesiredAccess::READ_DATA, SharingMode::READ | SharingMode::WRITE)];
        assert!(sharing_compatible(&openers, DesiredAccess::READ_DATA, SharingMode::READ).is_ok());
    }

    #[test]
    fn writer_rejected_by_read_only_sharing() {
        // first opener shares for read only; a writer must be refused
        let openers = vec![opener(1, DesiredAccess::READ_DATA, SharingMode::READ)];
        assert_eq!(
            sharing_compatible(
                &openers,
                DesiredAccess::WRITE_DATA,
                SharingMode::READ | SharingMode::WRITE
            ),
            Err(Status::SHARING_VIOLATION)
        );
    }

    #[test]
    fn holder_access_checked_against_new_sharing() {
        // existing writer; newcomer refuses to share writes
        let openers =
            vec![opener(1, DesiredAccess::WRITE_DATA, SharingMode::READ | SharingMode::WRITE)];
        assert_eq!(
            sharing_compatible(&openers, DesiredAccess::READ_DATA, SharingMode::READ),
            Err(Status::SHARING_VIOLATION)
        );
    }

    #[test]
    fn key_folds_case() {
        assert_eq!(StateKey::new(1, "\\Docs\\File.TXT"), StateKey::new(1, "\\DOCS\\FILE.txt"));
    }

    #[test]
    fn lock_order_is_total_and_symmetric() {
        let a = StateKey::new(1, "\\a");
        let b = StateKey::new(1, "\\b");
        assert_eq!(a.lock_order(&b), b.lock_order(&a).reverse());
        assert_eq!(a.lock_order(&a), std::cmp::Ordering::Equal);
    }
}
