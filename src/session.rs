//! Connection, virtual-circuit, tree, and open-file records.
//!
//! A [`Connection`] is one transport link. It owns the negotiated dialect,
//! the server challenge, the file-id space, and its virtual circuits; each
//! [`VirtualCircuit`] is an authenticated session identified by UID, owning
//! trees and a pending-async map; each [`Tree`] is one connected share. Ids
//! are never recycled while in use. Teardown is strictly top-down:
//! connection → circuits → trees → open files.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::acl::Decision;
use crate::auth::Identity;
use crate::config::DialectGroup;
use crate::disk::{DesiredAccess, Fh, SharingMode};
use crate::message_types::OutgoingSender;
use crate::pool::PooledBuffer;
use crate::share::Share;
use crate::state::{FileState, OplockLevel, StateKey};
use crate::Server;

/// SMB1 dialects this server can speak, in ascending preference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dialect {
    Core,
    Lanman10,
    Lanman12,
    Lanman21,
    NtLm012,
}

impl Dialect {
    pub fn wire_name(self) -> &'static str {
        match self {
            Dialect::Core => "PC NETWORK PROGRAM 1.0",
            Dialect::Lanman10 => "LANMAN1.0",
            Dialect::Lanman12 => "LM1.2X002",
            Dialect::Lanman21 => "LANMAN2.1",
            Dialect::NtLm012 => "NT LM 0.12",
        }
    }

    pub fn group(self) -> DialectGroup {
        match self {
            Dialect::Core => DialectGroup::Core,
            Dialect::Lanman10 | Dialect::Lanman12 | Dialect::Lanman21 => DialectGroup::Lanman,
            Dialect::NtLm012 => DialectGroup::Nt,
        }
    }

    /// Whether the NT command set, NT status codes, and Unicode apply.
    pub fn is_nt(self) -> bool {
        self == Dialect::NtLm012
    }

    /// Every dialect the server knows, ascending preference.
    pub fn all() -> &'static [Dialect] {
        &[Dialect::Core, Dialect::Lanman10, Dialect::Lanman12, Dialect::Lanman21, Dialect::NtLm012]
    }
}

/// Virtual-circuit lifecycle. The only legal walk is top to bottom.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VcPhase {
    Authenticating,
    Established,
    Closing,
    Closed,
}

/// A request parked in a circuit's pending-async map, keyed by MID.
pub enum PendingAsync {
    /// A change-notify watch; completion or cancellation answers it.
    Notify { key: StateKey },
}

/// An authenticated session within a connection.
pub struct VirtualCircuit {
    pub uid: u16,
    pub vc_number: u16,
    phase: Mutex<VcPhase>,
    identity: Mutex<Option<Identity>>,
    trees: DashMap<u16, Arc<Tree>>,
    /// MID → parked asynchronous request.
    pub pending: DashMap<u16, PendingAsync>,
}

impl VirtualCircuit {
    fn new(uid: u16, vc_number: u16) -> VirtualCircuit {
        VirtualCircuit {
            uid,
            vc_number,
            phase: Mutex::new(VcPhase::Authenticating),
            identity: Mutex::new(None),
            trees: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn phase(&self) -> VcPhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Advances the lifecycle; backwards transitions are refused.
    pub fn advance(&self, to: VcPhase) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(|p| p.into_inner());
        if to > *phase {
            *phase = to;
            true
        } else {
            to == *phase
        }
    }

    /// Binds the authenticated identity. The identity of a circuit never
    /// changes once set.
    pub fn establish(&self, identity: Identity) {
        let mut slot = self.identity.lock().unwrap_or_else(|p| p.into_inner());
        debug_assert!(slot.is_none(), "circuit identity rebound");
        *slot = Some(identity);
        self.advance(VcPhase::Established);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn tree(&self, tid: u16) -> Option<Arc<Tree>> {
        self.trees.get(&tid).map(|t| Arc::clone(&t))
    }

    pub fn insert_tree(&self, tree: Arc<Tree>) {
        self.trees.insert(tree.tid, tree);
    }

    pub fn remove_tree(&self, tid: u16) -> Option<Arc<Tree>> {
        self.trees.remove(&tid).map(|(_, t)| t)
    }

    fn drain_trees(&self) -> Vec<Arc<Tree>> {
        let tids: Vec<u16> = self.trees.iter().map(|t| t.tid).collect();
        tids.into_iter().filter_map(|tid| self.remove_tree(tid)).collect()
    }
}

/// One connected share.
pub struct Tree {
    pub tid: u16,
    pub uid: u16,
    pub share: Arc<Share>,
    /// Granted level: `Read` or `ReadWrite`.
    pub access: Decision,
    pub admin: bool,
    fids: Mutex<Vec<u16>>,
}

impl Tree {
    pub fn new(tid: u16, uid: u16, share: Arc<Share>, access: Decision, admin: bool) -> Tree {
        Tree { tid, uid, share, access, admin, fids: Mutex::new(Vec::new()) }
    }

    pub fn writable(&self) -> bool {
        self.access == Decision::ReadWrite
    }

    pub fn track_fid(&self, fid: u16) {
        self.fids.lock().unwrap_or_else(|p| p.into_inner()).push(fid);
    }

    pub fn forget_fid(&self, fid: u16) {
        self.fids.lock().unwrap_or_else(|p| p.into_inner()).retain(|f| *f != fid);
    }

    fn drain_fids(&self) -> Vec<u16> {
        std::mem::take(&mut *self.fids.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// An open file handle.
pub struct OpenFile {
    pub fid: u16,
    pub uid: u16,
    pub tid: u16,
    /// Canonical path within the share, original case preserved.
    pub path: String,
    pub access: DesiredAccess,
    pub sharing: SharingMode,
    pub directory: bool,
    pub write_through: bool,
    pub handle: Fh,
    pub share: Arc<Share>,
    pub state: Arc<FileState>,
    oplock: Mutex<OplockLevel>,
    /// Implied position for the legacy sequential operations.
    pub position: AtomicU64,
    pub delete_on_close: AtomicBool,
}

impl OpenFile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fid: u16,
        uid: u16,
        tid: u16,
        path: String,
        access: DesiredAccess,
        sharing: SharingMode,
        directory: bool,
        write_through: bool,
        handle: Fh,
        share: Arc<Share>,
        state: Arc<FileState>,
    ) -> OpenFile {
        OpenFile {
            fid,
            uid,
            tid,
            path,
            access,
            sharing,
            directory,
            write_through,
            handle,
            share,
            state,
            oplock: Mutex::new(OplockLevel::None),
            position: AtomicU64::new(0),
            delete_on_close: AtomicBool::new(false),
        }
    }

    pub fn oplock(&self) -> OplockLevel {
        *self.oplock.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_oplock(&self, level: OplockLevel) {
        *self.oplock.lock().unwrap_or_else(|p| p.into_inner()) = level;
    }
}

/// One inbound frame waiting for a worker.
pub struct Request {
    pub buffer: PooledBuffer,
}

/// A resumable directory-search snapshot produced by FIND_FIRST2.
pub struct Search {
    pub directory: String,
    pub pattern: String,
    pub entries: Vec<crate::disk::FileInfo>,
    /// Index of the next entry to hand out.
    pub next: usize,
}

#[derive(Default)]
pub struct ConnectionStats {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub opens: AtomicU64,
}

/// A live transport link.
pub struct Connection {
    pub id: u64,
    pub peer: SocketAddr,
    /// Write funnel; the stream writer task is the single consumer.
    pub sender: OutgoingSender,
    dialect: Mutex<Option<Dialect>>,
    challenge: Mutex<Option<[u8; 8]>>,
    /// Client's declared maximum buffer size, from session setup.
    pub max_buffer_size: AtomicU32,
    vcs: DashMap<u16, Arc<VirtualCircuit>>,
    opens: DashMap<u16, Arc<OpenFile>>,
    next_uid: AtomicU16,
    next_tid: AtomicU16,
    next_fid: AtomicU16,
    /// Frames waiting for a worker run.
    pub queue: SegQueue<Request>,
    queued: AtomicBool,
    pub closing: AtomicBool,
    pub stats: ConnectionStats,
    /// (UID, MID) → transaction reassembly in progress.
    pub transactions: DashMap<(u16, u16), crate::trans::Assembly>,
    /// Search id → directory snapshot.
    pub searches: DashMap<u16, Search>,
    next_sid: AtomicU16,
}

impl Connection {
    pub fn new(id: u64, peer: SocketAddr, sender: OutgoingSender) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            peer,
            sender,
            dialect: Mutex::new(None),
            challenge: Mutex::new(None),
            max_buffer_size: AtomicU32::new(0xFFFF),
            vcs: DashMap::new(),
            opens: DashMap::new(),
            next_uid: AtomicU16::new(100),
            next_tid: AtomicU16::new(1),
            next_fid: AtomicU16::new(1),
            queue: SegQueue::new(),
            queued: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            stats: ConnectionStats::default(),
            transactions: DashMap::new(),
            searches: DashMap::new(),
            next_sid: AtomicU16::new(1),
        })
    }

    /// Registers a directory-search snapshot, returning its search id.
    pub fn insert_search(&self, search: Search) -> u16 {
        let sid = self.allocate(&self.next_sid, |sid| !self.searches.contains_key(&sid));
        self.searches.insert(sid, search);
        sid
    }

    pub fn dialect(&self) -> Option<Dialect> {
        *self.dialect.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Freezes the dialect for the connection lifetime. Only the first call
    /// takes effect.
    pub fn set_dialect(&self, dialect: Dialect) {
        let mut slot = self.dialect.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(dialect);
        }
    }

    pub fn challenge(&self) -> Option<[u8; 8]> {
        *self.challenge.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_challenge(&self, challenge: [u8; 8]) {
        *self.challenge.lock().unwrap_or_else(|p| p.into_inner()) = Some(challenge);
    }

    pub fn vc(&self, uid: u16) -> Option<Arc<VirtualCircuit>> {
        self.vcs.get(&uid).map(|v| Arc::clone(&v))
    }

    pub fn vc_count(&self) -> usize {
        self.vcs.len()
    }

    /// Creates a circuit with a fresh UID.
    pub fn create_vc(&self, vc_number: u16) -> Arc<VirtualCircuit> {
        let uid = self.allocate(&self.next_uid, |uid| !self.vcs.contains_key(&uid));
        let vc = Arc::new(VirtualCircuit::new(uid, vc_number));
        self.vcs.insert(uid, Arc::clone(&vc));
        vc
    }

    pub fn remove_vc(&self, uid: u16) -> Option<Arc<VirtualCircuit>> {
        self.vcs.remove(&uid).map(|(_, v)| v)
    }

    fn drain_vcs(&self) -> Vec<Arc<VirtualCircuit>> {
        let uids: Vec<u16> = self.vcs.iter().map(|v| v.uid).collect();
        uids.into_iter().filter_map(|uid| self.remove_vc(uid)).collect()
    }

    pub fn allocate_tid(&self) -> u16 {
        self.allocate(&self.next_tid, |_| true)
    }

    /// Allocates a FID unused on this connection.
    pub fn allocate_fid(&self) -> u16 {
        self.allocate(&self.next_fid, |fid| !self.opens.contains_key(&fid))
    }

    fn allocate(&self, counter: &AtomicU16, free: impl Fn(u16) -> bool) -> u16 {
        loop {
            let id = counter.fetch_add(1, Ordering::AcqRel);
            if id != 0 && id != 0xFFFF && free(id) {
                return id;
            }
        }
    }

    pub fn insert_open(&self, open: Arc<OpenFile>) {
        self.stats.opens.fetch_add(1, Ordering::Relaxed);
        self.opens.insert(open.fid, open);
    }

    pub fn open(&self, fid: u16) -> Option<Arc<OpenFile>> {
        self.opens.get(&fid).map(|o| Arc::clone(&o))
    }

    pub fn remove_open(&self, fid: u16) -> Option<Arc<OpenFile>> {
        self.opens.remove(&fid).map(|(_, o)| o)
    }

    /// Every open file belonging to one circuit.
    pub fn opens_of_circuit(&self, uid: u16) -> Vec<Arc<OpenFile>> {
        self.opens.iter().filter(|o| o.uid == uid).map(|o| Arc::clone(&o)).collect()
    }

    /// Queues a frame and makes sure a worker will run this connection.
    pub fn enqueue(self: &Arc<Self>, server: &Server, request: Request) {
        self.queue.push(request);
        self.schedule(server);
    }

    /// Puts the connection on the shared run queue unless it is already
    /// there.
    pub fn schedule(self: &Arc<Self>, server: &Server) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            if server.run_queue().try_send(Arc::clone(self)).is_err() {
                self.queued.store(false, Ordering::Release);
                warn!(connection = self.id, "run queue closed; dropping schedule");
            }
        }
    }

    /// Called by a worker after its packet run; re-schedules if frames
    /// arrived while the run was in progress.
    pub fn finish_run(self: &Arc<Self>, server: &Server) {
        self.queued.store(false, Ordering::Release);
        if !self.queue.is_empty() {
            self.schedule(server);
        }
    }
}

/// Closes one open file: byte-range locks released, oplock relinquished
/// (waking any break waiter), state citation dropped, disk handle closed,
/// and the delayed delete honored when this was the last citation.
pub async fn close_open_file(server: &Server, connection: &Connection, open: &Arc<OpenFile>) {
    let mut unlink = false;
    let mut woke_break = false;
    open.state.locked(|inner| {
        inner.locks.release_fid(connection.id, open.fid);
        inner.openers.retain(|o| !(o.connection == connection.id && o.fid == open.fid));
        if let Some(holder) = &inner.oplock {
            if holder.connection == connection.id && holder.fid == open.fid {
                inner.oplock = None;
                inner.breaking = None;
                woke_break = true;
            }
        }
        inner.level_ii.retain(|h| !(h.connection == connection.id && h.fid == open.fid));
        if open.delete_on_close.load(Ordering::Acquire) {
            inner.delete_on_close = true;
        }
        if inner.delete_on_close && inner.openers.is_empty() {
            unlink = true;
        }
    });
    if woke_break {
        open.state.notify_break_done();
    }
    open.set_oplock(OplockLevel::None);

    if let Err(err) = open.share.disk.close(open.handle).await {
        debug!(fid = open.fid, ?err, "disk close failed");
    }
    if unlink {
        match open.share.disk.unlink(&open.path).await {
            Ok(()) => {
                open.share.cache.set_exists(&open.state.key, false);
                crate::notify::post(
                    server,
                    &open.share,
                    &open.path,
                    crate::notify::completion_filter::FILE_NAME,
                    crate::notify::action::REMOVED,
                )
                .await;
            }
            Err(err) => debug!(path = %open.path, ?err, "delete-on-close unlink failed"),
        }
    }
    open.share.cache.release(&open.state).await;
}

/// Disconnects one tree, closing every open file created under it.
pub async fn disconnect_tree(server: &Server, connection: &Connection, tree: &Tree) {
    for fid in tree.drain_fids() {
        if let Some(open) = connection.remove_open(fid) {
            close_open_file(server, connection, &open).await;
        }
    }
}

/// Logs a circuit off: cancels parked async requests, disconnects trees.
pub async fn teardown_vc(server: &Server, connection: &Connection, vc: &VirtualCircuit) {
    vc.advance(VcPhase::Closing);
    let pending: Vec<u16> = vc.pending.iter().map(|p| *p.key()).collect();
    for mid in pending {
        if let Some((_, PendingAsync::Notify { key })) = vc.pending.remove(&mid) {
            crate::notify::unsubscribe(server, connection.id, vc.uid, mid, &key).await;
        }
    }
    for tree in vc.drain_trees() {
        disconnect_tree(server, connection, &tree).await;
    }
    vc.advance(VcPhase::Closed);
}

/// Full connection teardown on transport close or fatal protocol error.
pub async fn teardown_connection(server: &Server, connection: &Arc<Connection>) {
    if connection.closing.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!(
        connection = connection.id,
        packets_in = connection.stats.packets_in.load(Ordering::Relaxed),
        packets_out = connection.stats.packets_out.load(Ordering::Relaxed),
        bytes_in = connection.stats.bytes_in.load(Ordering::Relaxed),
        bytes_out = connection.stats.bytes_out.load(Ordering::Relaxed),
        "connection teardown"
    );
    for vc in connection.drain_vcs() {
        teardown_vc(server, connection, &vc).await;
    }
    // Any open not reachable through a tree (protocol abuse) still closes.
    let leftover: Vec<u16> = connection.opens.iter().map(|o| o.fid).collect();
    for fid in leftover {
        if let Some(open) = connection.remove_open(fid) {
            close_open_file(server, connection, &open).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_types::create_outgoing_channel;

    fn connection() -> Arc<Connection> {
        let (sender, _recv) = create_outgoing_channel();
        Connection::new(7, "127.0.0.1:445".parse().unwrap(), sender)
    }

    #[test]
    fn dialect_freezes_on_first_set() {
        let conn = connection();
        assert_eq!(conn.dialect(), None);
        conn.set_dialect(Dialect::NtLm012);
        conn.set_dialect(Dialect::Core);
        assert_eq!(conn.dialect(), Some(Dialect::NtLm012));
    }

    #[test]
    fn first_uid_is_one_hundred() {
        let conn = connection();
        let vc = conn.create_vc(0);
        assert_eq!(vc.uid, 100);
        assert_eq!(conn.create_vc(1).uid, 101);
    }

    #[test]
    fn circuit_phase_never_walks_backwards() {
        let conn = connection();
        let vc = conn.create_vc(0);
        assert_eq!(vc.phase(), VcPhase::Authenticating);
        vc.establish(Identity::guest());
        assert_eq!(vc.phase(), VcPhase::Established);
        assert!(!vc.advance(VcPhase::Authenticating));
        assert_eq!(vc.phase(), VcPhase::Established);
        assert!(vc.advance(VcPhase::Closing));
        assert!(vc.advance(VcPhase::Closed));
        assert!(!vc.advance(VcPhase::Established));
    }

    #[test]
    fn fids_skip_reserved_and_live_values() {
        let conn = connection();
        let first = conn.allocate_fid();
        assert_ne!(first, 0);
        let second = conn.allocate_fid();
        assert_ne!(first, second);
    }

    #[test]
    fn search_ids_are_tracked() {
        let conn = connection();
        let sid = conn.insert_search(Search {
            directory: "docs".to_string(),
            pattern: "*.txt".to_string(),
            entries: Vec::new(),
            next: 0,
        });
        assert!(conn.searches.contains_key(&sid));
    }
}
