//! smbserve - An SMB/CIFS file-sharing server and client library in Rust.

pub mod acl;
pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod disk;
pub mod dispatch;
pub mod handlers;
pub mod locks;
pub mod message_types;
pub mod notify;
pub mod oplock;
pub mod pool;
mod read_task;
pub mod session;
pub mod share;
pub mod state;
pub mod status;
mod stream_writer;
pub mod trans;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::message_types::create_outgoing_channel;
use crate::pool::BufferPool;
use crate::read_task::ReadTask;
use crate::session::Connection;
use crate::share::{AccessControl, Share, ShareRegistry};
use crate::stream_writer::StreamWriter;

/// The server core: configuration, the share registry, the pluggable
/// collaborators, and the worker machinery shared by every connection.
pub struct Server {
    pub config: ServerConfig,
    pub shares: ShareRegistry,
    pub authenticator: Arc<dyn Authenticator>,
    pub access: Arc<dyn AccessControl>,
    pub pool: Arc<BufferPool>,
    run_tx: async_channel::Sender<Arc<Connection>>,
    run_rx: async_channel::Receiver<Arc<Connection>>,
    connections: DashMap<u64, Arc<Connection>>,
    next_connection: AtomicU64,
    pub(crate) worker_count: AtomicUsize,
    started: AtomicBool,
}

impl Server {
    /// Builds a server from a validated configuration, a share registry,
    /// and the authenticator plug-in.
    pub fn new(
        config: ServerConfig,
        shares: ShareRegistry,
        authenticator: Arc<dyn Authenticator>,
        access: Arc<dyn AccessControl>,
    ) -> Arc<Server> {
        debug_assert!(config.validate().is_ok(), "configuration must be validated");
        let pool = BufferPool::new(&config.pool_classes());
        let (run_tx, run_rx) = async_channel::unbounded();
        Arc::new(Server {
            config,
            shares,
            authenticator,
            access,
            pool,
            run_tx,
            run_rx,
            connections: DashMap::new(),
            next_connection: AtomicU64::new(1),
            worker_count: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        })
    }

    pub(crate) fn run_queue(&self) -> &async_channel::Sender<Arc<Connection>> {
        &self.run_tx
    }

    pub(crate) fn run_rx(&self) -> &async_channel::Receiver<Arc<Connection>> {
        &self.run_rx
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|c| Arc::clone(&c))
    }

    pub(crate) fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| Arc::clone(&c)).collect()
    }

    pub(crate) fn forget_connection(&self, id: u64) {
        self.connections.remove(&id);
    }

    /// Looks a share up by the dense id used in state-cache keys.
    pub fn share_by_id(&self, id: u16) -> Option<Arc<Share>> {
        self.shares.all().get(id as usize).cloned()
    }

    fn ensure_started(self: &Arc<Self>) {
        if !self.started.swap(true, Ordering::AcqRel) {
            worker::start(self);
            info!(
                server = %self.config.server_name,
                workers = self.config.workers_initial,
                shares = self.shares.all().len(),
                "server core started"
            );
        }
    }
}

/// Accepts native-SMB (port 445 style) connections forever.
pub async fn handle_forever(listener: TcpListener, server: Arc<Server>) -> std::io::Result<()> {
    server.ensure_started();
    loop {
        let (socket, _) = listener.accept().await?;

        socket.set_nodelay(true)?;

        process_socket(&server, socket, false);
    }
}

/// Accepts NetBIOS session service (port 139 style) connections forever.
pub async fn handle_forever_netbios(
    listener: TcpListener,
    server: Arc<Server>,
) -> std::io::Result<()> {
    server.ensure_started();
    loop {
        let (socket, _) = listener.accept().await?;

        socket.set_nodelay(true)?;

        process_socket(&server, socket, true);
    }
}

fn process_socket(server: &Arc<Server>, socket: TcpStream, netbios: bool) {
    let peer = match socket.peer_addr() {
        Ok(peer) => peer,
        Err(_) => return,
    };
    let (readhalf, writehalf) = socket.into_split();

    let (sender, recv) = create_outgoing_channel();
    let id = server.next_connection.fetch_add(1, Ordering::AcqRel);
    let connection = Connection::new(id, peer, sender);
    server.connections.insert(id, Arc::clone(&connection));
    info!(connection = id, %peer, netbios, "connection accepted");

    ReadTask::spawn(Arc::clone(server), connection, readhalf, netbios);
    StreamWriter::spawn(writehalf, recv);
}
