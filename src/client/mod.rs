//! The client side of the protocol: connect, negotiate, authenticate, and
//! drive file operations over a multiplexed connection.
//!
//! One demultiplexer task owns the read half. Replies are routed to their
//! callers by MID; unsolicited oplock-break frames from the server invoke
//! the registered callback and are acknowledged automatically unless the
//! callback opts out.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::codec::frame;
use crate::codec::header::{Command, Flags1, Flags2, Header};
use crate::codec::packet::{self, Body, ReplyBuilder};
use crate::codec::primitive;
use crate::oplock::lock_type;
use crate::state::OplockLevel;
use crate::status::Status;

/// Client-side errors.
#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Codec(crate::codec::Error),
    /// The server answered with a failure status.
    Server(Status),
    /// The connection's demultiplexer has gone away.
    Closed,
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

impl From<crate::codec::Error> for ClientError {
    fn from(err: crate::codec::Error) -> Self {
        ClientError::Codec(err)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "transport failure: {err}"),
            ClientError::Codec(err) => write!(f, "malformed frame: {err}"),
            ClientError::Server(status) => write!(f, "server returned {status}"),
            ClientError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Result of client operations with error type [`ClientError`].
pub type Result<T> = std::result::Result<T, ClientError>;

/// What to do about a server-initiated oplock break.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakDecision {
    /// Acknowledge at the given post-break level.
    Ack(OplockLevel),
    /// Send no acknowledgement; the server's timeout handles it.
    Silent,
}

type OplockCallback = Box<dyn Fn(u16, OplockLevel) -> BreakDecision + Send + Sync>;

struct ClientInner {
    write: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: DashMap<u16, mpsc::UnboundedSender<Vec<u8>>>,
    next_mid: AtomicU16,
    unicode: AtomicBool,
    oplock_callback: Mutex<Option<OplockCallback>>,
}

impl ClientInner {
    fn request_header(&self, command: Command, uid: u16, tid: u16, mid: u16) -> Header {
        let mut flags2 = Flags2::NT_STATUS | Flags2::LONG_NAMES;
        if self.unicode.load(Ordering::Acquire) {
            flags2 |= Flags2::UNICODE;
        }
        Header {
            command: command as u8,
            status: Status::SUCCESS,
            flags: Flags1::CASELESS | Flags1::CANONICAL_PATHS,
            flags2,
            pid_high: 0,
            signature: [0; 8],
            tid,
            pid: 0xFEFF,
            uid,
            mid,
        }
    }

    fn allocate_mid(&self) -> u16 {
        loop {
            let mid = self.next_mid.fetch_add(1, Ordering::AcqRel);
            if mid != 0xFFFF && !self.pending.contains_key(&mid) {
                return mid;
            }
        }
    }

    fn begin(&self, mid: u16) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(mid, tx);
        rx
    }

    fn end(&self, mid: u16) {
        self.pending.remove(&mid);
    }

    async fn send(&self, frame_bytes: &[u8]) -> Result<()> {
        let mut write = self.write.lock().await;
        frame::write_frame(&mut *write, frame_bytes).await?;
        Ok(())
    }

    async fn ack_break(&self, header: &Header, fid: u16, level: OplockLevel) -> Result<()> {
        let mid = self.allocate_mid();
        let ack_header = self.request_header(Command::LockingAndX, header.uid, header.tid, mid);
        let frame_bytes = build_frame(ack_header, |b| {
            b.begin(8);
            b.andx_slot();
            b.u16(fid);
            b.u8(lock_type::OPLOCK_RELEASE);
            b.u8(if level == OplockLevel::LevelII { 1 } else { 0 });
            b.u32(0);
            b.u16(0);
            b.u16(0);
            b.begin_bytes();
            b.finish_block();
        })?;
        self.send(&frame_bytes).await
    }
}

fn build_frame(header: Header, f: impl FnOnce(&mut ReplyBuilder<'_>)) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(1024);
    let mut builder = ReplyBuilder::new_growable(&mut buf, header)?;
    f(&mut builder);
    builder.finish()?;
    Ok(buf)
}

/// The outcome of dialect negotiation.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub dialect_index: u16,
    pub challenge: [u8; 8],
    pub max_buffer: u32,
}

/// A client connection.
#[derive(Clone)]
pub struct SmbClient {
    inner: Arc<ClientInner>,
}

impl SmbClient {
    /// Connects the native-SMB transport and starts the demultiplexer.
    pub async fn connect(addr: std::net::SocketAddr) -> std::io::Result<SmbClient> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;
        let (readhalf, writehalf) = socket.into_split();
        let inner = Arc::new(ClientInner {
            write: tokio::sync::Mutex::new(writehalf),
            pending: DashMap::new(),
            next_mid: AtomicU16::new(1),
            unicode: AtomicBool::new(true),
            oplock_callback: Mutex::new(None),
        });
        tokio::spawn(demux(Arc::clone(&inner), readhalf));
        Ok(SmbClient { inner })
    }

    /// Registers the oplock-break callback. Without one, every break is
    /// acknowledged at the server's requested level.
    pub fn on_oplock_break(
        &self,
        callback: impl Fn(u16, OplockLevel) -> BreakDecision + Send + Sync + 'static,
    ) {
        let mut slot =
            self.inner.oplock_callback.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Box::new(callback));
    }

    /// One request, one response.
    async fn transact(&self, frame_bytes: Vec<u8>, mid: u16) -> Result<Vec<u8>> {
        let mut rx = self.inner.begin(mid);
        let sent = self.inner.send(&frame_bytes).await;
        if let Err(err) = sent {
            self.inner.end(mid);
            return Err(err);
        }
        let response = tokio::time::timeout(Duration::from_secs(45), rx.recv()).await;
        self.inner.end(mid);
        match response {
            Ok(Some(frame_bytes)) => Ok(frame_bytes),
            _ => Err(ClientError::Closed),
        }
    }

    /// SMB_COM_NEGOTIATE with the given dialect strings.
    pub async fn negotiate(&self, dialects: &[&str]) -> Result<Negotiated> {
        let mid = self.inner.allocate_mid();
        let header = self.inner.request_header(Command::Negotiate, 0, 0, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(0);
            b.begin_bytes();
            for dialect in dialects {
                b.u8(0x02);
                for byte in dialect.bytes() {
                    b.u8(byte);
                }
                b.u8(0);
            }
            b.finish_block();
        })?;
        let response = self.transact(frame_bytes, mid).await?;
        let (header, body) = packet::parse(&response)?;
        if !header.status.is_success() {
            return Err(ClientError::Server(header.status));
        }
        let mut words = body.words();
        let dialect_index = primitive::u16(&mut words)?;
        if dialect_index == 0xFFFF {
            return Err(ClientError::Server(Status::NOT_SUPPORTED));
        }
        if body.word_count() >= 17 {
            primitive::u8(&mut words)?; // security mode
            primitive::u16(&mut words)?; // max mpx
            primitive::u16(&mut words)?; // max vcs
            let max_buffer = primitive::u32(&mut words)?;
            primitive::u32(&mut words)?; // max raw
            primitive::u32(&mut words)?; // session key
            primitive::u32(&mut words)?; // capabilities
            primitive::u64(&mut words)?; // system time
            primitive::u16(&mut words)?; // time zone
            let challenge_len = primitive::u8(&mut words)? as usize;
            let mut bytes = body.bytes();
            let raw = bytes.take(challenge_len.min(8)).unwrap_or(&[]);
            let mut challenge = [0u8; 8];
            challenge[..raw.len()].copy_from_slice(raw);
            Ok(Negotiated { dialect_index, challenge, max_buffer })
        } else {
            // Pre-NT selection: strings stay OEM from here on.
            self.inner.unicode.store(false, Ordering::Release);
            Ok(Negotiated { dialect_index, challenge: [0; 8], max_buffer: 0xFFFF })
        }
    }

    /// SMB_COM_SESSION_SETUP_ANDX with plaintext credentials.
    pub async fn session_setup(&self, account: &str, password: &str, domain: &str)
        -> Result<ClientSession> {
        let unicode = self.inner.unicode.load(Ordering::Acquire);
        let mid = self.inner.allocate_mid();
        let header = self.inner.request_header(Command::SessionSetupAndX, 0, 0, mid);
        let ansi: Vec<u8> = password.bytes().chain(std::iter::once(0)).collect();
        let frame_bytes = build_frame(header, |b| {
            b.begin(13);
            b.andx_slot();
            b.u16(0xFFFF); // our receive buffer
            b.u16(16); // max multiplexed
            b.u16(0); // vc number
            b.u32(0); // session key
            b.u16(ansi.len() as u16);
            b.u16(0);
            b.u32(0);
            b.u32(0x0000_0040); // CAP_STATUS32
            b.begin_bytes();
            b.bytes(&ansi);
            b.string(account, unicode);
            b.string(domain, unicode);
            b.string("Unix", unicode);
            b.string("smbserve", unicode);
            b.finish_block();
        })?;
        let response = self.transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        if !header.status.is_success() || header.status == Status::MORE_PROCESSING_REQUIRED {
            return Err(ClientError::Server(header.status));
        }
        debug!(uid = header.uid, "session established");
        Ok(ClientSession { client: self.clone(), uid: header.uid })
    }
}

async fn demux(inner: Arc<ClientInner>, mut readhalf: OwnedReadHalf) {
    loop {
        let header = match frame::read_header(&mut readhalf).await {
            Ok(header) => header,
            Err(_) => break,
        };
        let mut frame_bytes = vec![0u8; header.length];
        if readhalf.read_exact(&mut frame_bytes).await.is_err() {
            break;
        }
        let Ok((smb_header, body)) = packet::parse(&frame_bytes) else { continue };

        let is_break = smb_header.command == Command::LockingAndX as u8
            && smb_header.mid == 0xFFFF;
        if is_break {
            handle_break(&inner, &smb_header, &body).await;
            continue;
        }
        match inner.pending.get(&smb_header.mid) {
            Some(tx) => {
                let _ = tx.send(frame_bytes);
            }
            None => trace!(mid = smb_header.mid, "reply for unknown mid"),
        }
    }
    inner.pending.clear();
}

async fn handle_break(inner: &Arc<ClientInner>, header: &Header, body: &Body<'_>) {
    let parsed = (|| -> crate::codec::Result<(u16, OplockLevel)> {
        let mut words = body.require_words(8)?;
        primitive::skip(&mut words, 4)?;
        let fid = primitive::u16(&mut words)?;
        primitive::u8(&mut words)?; // lock type
        let level = if primitive::u8(&mut words)? & 0x01 != 0 {
            OplockLevel::LevelII
        } else {
            OplockLevel::None
        };
        Ok((fid, level))
    })();
    let Ok((fid, target)) = parsed else { return };
    debug!(fid, ?target, "oplock break received");

    let decision = {
        let slot =
            inner.oplock_callback.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_ref() {
            Some(callback) => callback(fid, target),
            None => BreakDecision::Ack(target),
        }
    };
    if let BreakDecision::Ack(level) = decision {
        let _ = inner.ack_break(header, fid, level).await;
    }
}

/// An authenticated session (one virtual circuit).
#[derive(Clone)]
pub struct ClientSession {
    client: SmbClient,
    pub uid: u16,
}

impl ClientSession {
    /// SMB_COM_TREE_CONNECT_ANDX to a `\\SERVER\SHARE` path.
    pub async fn tree_connect(&self, unc: &str) -> Result<ClientTree> {
        let inner = &self.client.inner;
        let unicode = inner.unicode.load(Ordering::Acquire);
        let mid = inner.allocate_mid();
        let header = inner.request_header(Command::TreeConnectAndX, self.uid, 0, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(4);
            b.andx_slot();
            b.u16(0); // flags
            b.u16(1); // password length
            b.begin_bytes();
            b.u8(0); // empty password
            b.string(unc, unicode);
            for byte in "?????".bytes() {
                b.u8(byte);
            }
            b.u8(0);
            b.finish_block();
        })?;
        let response = self.client.transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        if !header.status.is_success() {
            return Err(ClientError::Server(header.status));
        }
        debug!(tid = header.tid, unc, "tree connected");
        Ok(ClientTree { session: self.clone(), tid: header.tid })
    }

    /// SMB_COM_LOGOFF_ANDX.
    pub async fn logoff(&self) -> Result<()> {
        let inner = &self.client.inner;
        let mid = inner.allocate_mid();
        let header = inner.request_header(Command::LogoffAndX, self.uid, 0, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(2);
            b.andx_slot();
            b.begin_bytes();
            b.finish_block();
        })?;
        let response = self.client.transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        status_of(&header)
    }
}

fn status_of(header: &Header) -> Result<()> {
    if header.status.is_success() {
        Ok(())
    } else {
        Err(ClientError::Server(header.status))
    }
}

/// How [`ClientTree::open`] should behave.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub access: crate::disk::DesiredAccess,
    pub sharing: crate::disk::SharingMode,
    pub disposition: crate::disk::CreateDisposition,
    pub options: crate::disk::CreateOptions,
    pub request_oplock: bool,
}

impl OpenRequest {
    pub fn read(disposition: crate::disk::CreateDisposition) -> OpenRequest {
        OpenRequest {
            access: crate::disk::DesiredAccess::READ_DATA
                | crate::disk::DesiredAccess::READ_ATTRIBUTES,
            sharing: crate::disk::SharingMode::READ | crate::disk::SharingMode::WRITE,
            disposition,
            options: crate::disk::CreateOptions::empty(),
            request_oplock: false,
        }
    }

    pub fn read_write(disposition: crate::disk::CreateDisposition) -> OpenRequest {
        OpenRequest {
            access: crate::disk::DesiredAccess::READ_DATA
                | crate::disk::DesiredAccess::WRITE_DATA
                | crate::disk::DesiredAccess::READ_ATTRIBUTES,
            sharing: crate::disk::SharingMode::READ | crate::disk::SharingMode::WRITE,
            disposition,
            options: crate::disk::CreateOptions::empty(),
            request_oplock: false,
        }
    }

    pub fn with_sharing(mut self, sharing: crate::disk::SharingMode) -> OpenRequest {
        self.sharing = sharing;
        self
    }

    pub fn with_oplock(mut self) -> OpenRequest {
        self.request_oplock = true;
        self
    }
}

/// A connected share.
#[derive(Clone)]
pub struct ClientTree {
    session: ClientSession,
    pub tid: u16,
}

impl ClientTree {
    fn inner(&self) -> &Arc<ClientInner> {
        &self.session.client.inner
    }

    fn client(&self) -> &SmbClient {
        &self.session.client
    }

    /// SMB_COM_NT_CREATE_ANDX.
    pub async fn open(&self, path: &str, request: OpenRequest) -> Result<RemoteFile> {
        let unicode = self.inner().unicode.load(Ordering::Acquire);
        let mid = self.inner().allocate_mid();
        let header =
            self.inner().request_header(Command::NtCreateAndX, self.session.uid, self.tid, mid);
        let flags: u32 = if request.request_oplock { 0x0002 | 0x0004 } else { 0 };
        let frame_bytes = build_frame(header, |b| {
            b.begin(24);
            b.andx_slot();
            b.u8(0);
            b.u16((path.len() * if unicode { 2 } else { 1 }) as u16);
            b.u32(flags);
            b.u32(0); // root directory fid
            b.u32(request.access.bits());
            b.u64(0); // allocation size
            b.u32(crate::disk::FileAttributes::NORMAL.bits());
            b.u32(request.sharing.bits());
            b.u32(request.disposition as u32);
            b.u32(request.options.bits());
            b.u32(2); // impersonation
            b.u8(0); // security flags
            b.begin_bytes();
            b.string(path, unicode);
            b.finish_block();
        })?;
        let response = self.client().transact(frame_bytes, mid).await?;
        let (header, body) = packet::parse(&response)?;
        status_of(&header)?;

        let mut words = body.require_words(26)?;
        primitive::skip(&mut words, 4)?;
        let oplock = match primitive::u8(&mut words)? {
            1 => OplockLevel::Exclusive,
            2 => OplockLevel::Batch,
            3 => OplockLevel::LevelII,
            _ => OplockLevel::None,
        };
        let fid = primitive::u16(&mut words)?;
        primitive::u32(&mut words)?; // create action
        primitive::skip(&mut words, 32)?; // times
        primitive::u32(&mut words)?; // attributes
        primitive::u64(&mut words)?; // allocation
        let size = primitive::u64(&mut words)?;
        debug!(fid, path, ?oplock, "opened");
        Ok(RemoteFile { tree: self.clone(), fid, oplock, size })
    }

    /// SMB_COM_DELETE.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let unicode = self.inner().unicode.load(Ordering::Acquire);
        let mid = self.inner().allocate_mid();
        let header = self.inner().request_header(Command::Delete, self.session.uid, self.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(1);
            b.u16(0x0006); // search attributes: hidden + system
            b.begin_bytes();
            b.u8(0x04);
            b.string(path, unicode);
            b.finish_block();
        })?;
        let response = self.client().transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        status_of(&header)
    }

    /// SMB_COM_RENAME.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let unicode = self.inner().unicode.load(Ordering::Acquire);
        let mid = self.inner().allocate_mid();
        let header = self.inner().request_header(Command::Rename, self.session.uid, self.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(1);
            b.u16(0x0006);
            b.begin_bytes();
            b.u8(0x04);
            b.string(from, unicode);
            b.u8(0x04);
            b.string(to, unicode);
            b.finish_block();
        })?;
        let response = self.client().transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        status_of(&header)
    }

    /// A raw Trans2 exchange. `fragment` bounds how much data each request
    /// frame carries; everything beyond goes in secondaries.
    pub async fn trans2(
        &self,
        setup: &[u16],
        params: &[u8],
        data: &[u8],
        fragment: Option<usize>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mid = self.inner().allocate_mid();
        let mut rx = self.inner().begin(mid);
        let outcome = self
            .trans2_send(setup, params, data, fragment, mid, &mut rx)
            .await;
        self.inner().end(mid);
        outcome
    }

    async fn trans2_send(
        &self,
        setup: &[u16],
        params: &[u8],
        data: &[u8],
        fragment: Option<usize>,
        mid: u16,
        rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let chunk = fragment.unwrap_or(usize::MAX).max(1);
        let first_data = &data[..data.len().min(chunk)];

        let header =
            self.inner().request_header(Command::Transaction2, self.session.uid, self.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            let words = 14 + setup.len() as u8;
            let byte_area = 32 + 1 + 2 * words as usize + 2;
            let pad1 = (4 - byte_area % 4) % 4;
            let param_offset = byte_area + pad1;
            let pad2 = (4 - (param_offset + params.len()) % 4) % 4;
            let data_offset = param_offset + params.len() + pad2;

            b.begin(words);
            b.u16(params.len() as u16);
            b.u16(data.len() as u16);
            b.u16(64); // max parameter reply
            b.u16(0xFFFF); // max data reply
            b.u8(0);
            b.u8(0);
            b.u16(0); // flags
            b.u32(0); // timeout
            b.u16(0);
            b.u16(params.len() as u16);
            b.u16(param_offset as u16);
            b.u16(first_data.len() as u16);
            b.u16(if first_data.is_empty() { 0 } else { data_offset as u16 });
            b.u8(setup.len() as u8);
            b.u8(0);
            for word in setup {
                b.u16(*word);
            }
            b.begin_bytes();
            b.bytes(&vec![0u8; pad1]);
            b.bytes(params);
            b.bytes(&vec![0u8; pad2]);
            b.bytes(first_data);
            b.finish_block();
        })?;
        self.inner().send(&frame_bytes).await?;

        // Remaining data goes out in secondaries.
        let mut sent = first_data.len();
        if sent < data.len() {
            // The server acknowledges the primary with an interim response.
            let interim = recv_frame(rx).await?;
            let (interim_header, _) = packet::parse(&interim)?;
            status_of(&interim_header)?;
        }
        while sent < data.len() {
            let piece = &data[sent..data.len().min(sent + chunk)];
            let header = self.inner().request_header(
                Command::Transaction2Secondary,
                self.session.uid,
                self.tid,
                mid,
            );
            let frame_bytes = build_frame(header, |b| {
                let byte_area = 32 + 1 + 2 * 9 + 2;
                let pad = (4 - byte_area % 4) % 4;
                b.begin(9);
                b.u16(params.len() as u16);
                b.u16(data.len() as u16);
                b.u16(0); // parameter bytes here
                b.u16(0);
                b.u16(0);
                b.u16(piece.len() as u16);
                b.u16((byte_area + pad) as u16);
                b.u16(sent as u16);
                b.u16(0xFFFF); // fid: none
                b.begin_bytes();
                b.bytes(&vec![0u8; pad]);
                b.bytes(piece);
                b.finish_block();
            })?;
            self.inner().send(&frame_bytes).await?;
            sent += piece.len();
        }

        // Collect response frames until the declared totals arrive.
        let mut out_params: Vec<u8> = Vec::new();
        let mut out_data: Vec<u8> = Vec::new();
        loop {
            let response = recv_frame(rx).await?;
            let (header, body) = packet::parse(&response)?;
            status_of(&header)?;
            let mut words = body.require_words(10)?;
            let total_params = primitive::u16(&mut words)? as usize;
            let total_data = primitive::u16(&mut words)? as usize;
            primitive::u16(&mut words)?;
            let param_count = primitive::u16(&mut words)? as usize;
            let param_offset = primitive::u16(&mut words)? as usize;
            let param_disp = primitive::u16(&mut words)? as usize;
            let data_count = primitive::u16(&mut words)? as usize;
            let data_offset = primitive::u16(&mut words)? as usize;
            let data_disp = primitive::u16(&mut words)? as usize;

            place(&mut out_params, param_disp, &response, param_offset, param_count)?;
            place(&mut out_data, data_disp, &response, data_offset, data_count)?;
            if out_params.len() >= total_params && out_data.len() >= total_data {
                return Ok((out_params, out_data));
            }
        }
    }

    /// QUERY_FS_INFORMATION at the volume-info level.
    pub async fn query_fs_volume(&self) -> Result<VolumeLabel> {
        let level = crate::trans::trans2::fs_level::VOLUME_INFO;
        let (_, data) = self
            .trans2(
                &[crate::trans::trans2::subcommand::QUERY_FS_INFORMATION],
                &level.to_le_bytes(),
                &[],
                None,
            )
            .await?;
        if data.len() < 18 {
            return Err(ClientError::Server(Status::INVALID_PARAMETER));
        }
        let created = u64::from_le_bytes(data[0..8].try_into().unwrap_or_default());
        let serial = u32::from_le_bytes(data[8..12].try_into().unwrap_or_default());
        let label_len = u32::from_le_bytes(data[12..16].try_into().unwrap_or_default()) as usize;
        let raw = &data[18..(18 + label_len).min(data.len())];
        let label = primitive::unicode_sized(&mut &raw[..], raw.len())?;
        Ok(VolumeLabel { label, serial, created })
    }

    /// Arms an NT-Trans change-notify on an open directory. The returned
    /// watch resolves when a change fires or the request is cancelled.
    pub async fn change_notify(&self, directory: &RemoteFile, filter: u32) -> Result<NotifyWatch> {
        let mid = self.inner().allocate_mid();
        let rx = self.inner().begin(mid);
        let header =
            self.inner().request_header(Command::NtTransact, self.session.uid, self.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            let setup = [
                (filter & 0xFFFF) as u16,
                (filter >> 16) as u16,
                directory.fid,
                0, // watch tree: this directory only
            ];
            b.begin(19 + setup.len() as u8);
            b.u8(0); // max setup reply
            b.u16(0);
            b.u32(0); // total params
            b.u32(0); // total data
            b.u32(64); // max parameter reply
            b.u32(0); // max data reply
            b.u32(0);
            b.u32(0);
            b.u32(0);
            b.u32(0);
            b.u8(setup.len() as u8);
            b.u16(crate::trans::nttrans::function::NOTIFY_CHANGE);
            for word in setup {
                b.u16(word);
            }
            b.begin_bytes();
            b.finish_block();
        })?;
        if let Err(err) = self.inner().send(&frame_bytes).await {
            self.inner().end(mid);
            return Err(err);
        }
        Ok(NotifyWatch { tree: self.clone(), mid, rx })
    }

    /// SMB_COM_NT_CANCEL aimed at a parked MID.
    pub async fn nt_cancel(&self, mid: u16) -> Result<()> {
        let header = self.inner().request_header(Command::NtCancel, self.session.uid, self.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(0);
            b.begin_bytes();
            b.finish_block();
        })?;
        self.inner().send(&frame_bytes).await
    }

    /// SMB_COM_TREE_DISCONNECT.
    pub async fn disconnect(&self) -> Result<()> {
        let mid = self.inner().allocate_mid();
        let header =
            self.inner().request_header(Command::TreeDisconnect, self.session.uid, self.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(0);
            b.begin_bytes();
            b.finish_block();
        })?;
        let response = self.client().transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        status_of(&header)
    }
}

fn place(
    dest: &mut Vec<u8>,
    displacement: usize,
    frame_bytes: &[u8],
    offset: usize,
    count: usize,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    if offset + count > frame_bytes.len() {
        return Err(ClientError::Codec(crate::codec::Error::Truncated));
    }
    if dest.len() < displacement + count {
        dest.resize(displacement + count, 0);
    }
    dest[displacement..displacement + count].copy_from_slice(&frame_bytes[offset..offset + count]);
    Ok(())
}

async fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Result<Vec<u8>> {
    match tokio::time::timeout(Duration::from_secs(45), rx.recv()).await {
        Ok(Some(frame_bytes)) => Ok(frame_bytes),
        _ => Err(ClientError::Closed),
    }
}

/// Parsed QUERY_FS volume information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLabel {
    pub label: String,
    pub serial: u32,
    /// Raw FILETIME of volume creation.
    pub created: u64,
}

/// A parked change-notify request.
pub struct NotifyWatch {
    tree: ClientTree,
    pub mid: u16,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// How a watch resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub status: Status,
    /// (action, name) pairs when the watch fired.
    pub changes: Vec<(u32, String)>,
}

impl NotifyWatch {
    /// Waits for the watch to resolve.
    pub async fn wait(mut self) -> Result<NotifyOutcome> {
        let response = recv_frame(&mut self.rx).await;
        self.tree.inner().end(self.mid);
        let response = response?;
        let (header, body) = packet::parse(&response)?;
        if !header.status.is_success() {
            return Ok(NotifyOutcome { status: header.status, changes: Vec::new() });
        }
        let mut words = body.require_words(18)?;
        primitive::skip(&mut words, 3)?;
        primitive::u32(&mut words)?; // total params
        primitive::u32(&mut words)?; // total data
        let param_count = primitive::u32(&mut words)? as usize;
        let param_offset = primitive::u32(&mut words)? as usize;

        let mut changes = Vec::new();
        if param_count >= 12 && param_offset + param_count <= response.len() {
            let params = &response[param_offset..param_offset + param_count];
            let action = u32::from_le_bytes(params[4..8].try_into().unwrap_or_default());
            let name_len =
                u32::from_le_bytes(params[8..12].try_into().unwrap_or_default()) as usize;
            let raw = &params[12..(12 + name_len).min(params.len())];
            let name = primitive::unicode_sized(&mut &raw[..], raw.len())?;
            changes.push((action, name));
        }
        Ok(NotifyOutcome { status: header.status, changes })
    }

    /// Cancels the watch; [`NotifyWatch::wait`] then resolves with
    /// `STATUS_CANCELLED`.
    pub async fn cancel(&self) -> Result<()> {
        self.tree.nt_cancel(self.mid).await
    }
}

/// An open remote file.
pub struct RemoteFile {
    tree: ClientTree,
    pub fid: u16,
    pub oplock: OplockLevel,
    pub size: u64,
}

impl RemoteFile {
    /// SMB_COM_READ_ANDX.
    pub async fn read(&self, offset: u64, len: u16) -> Result<Vec<u8>> {
        let inner = self.tree.inner();
        let mid = inner.allocate_mid();
        let header =
            inner.request_header(Command::ReadAndX, self.tree.session.uid, self.tree.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(12);
            b.andx_slot();
            b.u16(self.fid);
            b.u32(offset as u32);
            b.u16(len);
            b.u16(len);
            b.u32(0);
            b.u16(0);
            b.u32((offset >> 32) as u32);
            b.begin_bytes();
            b.finish_block();
        })?;
        let response = self.tree.client().transact(frame_bytes, mid).await?;
        let (header, body) = packet::parse(&response)?;
        status_of(&header)?;
        let mut words = body.require_words(12)?;
        primitive::skip(&mut words, 4)?;
        primitive::u16(&mut words)?; // available
        primitive::u16(&mut words)?;
        primitive::u16(&mut words)?;
        let data_len = primitive::u16(&mut words)? as usize;
        let data_offset = primitive::u16(&mut words)? as usize;
        if data_offset + data_len > response.len() {
            return Err(ClientError::Codec(crate::codec::Error::Truncated));
        }
        Ok(response[data_offset..data_offset + data_len].to_vec())
    }

    /// SMB_COM_WRITE_ANDX.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let inner = self.tree.inner();
        let mid = inner.allocate_mid();
        let header =
            inner.request_header(Command::WriteAndX, self.tree.session.uid, self.tree.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            let data_offset = 32 + 1 + 2 * 14 + 2;
            b.begin(14);
            b.andx_slot();
            b.u16(self.fid);
            b.u32(offset as u32);
            b.u32(0); // timeout
            b.u16(0); // write mode
            b.u16(0); // remaining
            b.u16((data.len() >> 16) as u16);
            b.u16(data.len() as u16);
            b.u16(data_offset as u16);
            b.u32((offset >> 32) as u32);
            b.begin_bytes();
            b.bytes(data);
            b.finish_block();
        })?;
        let response = self.tree.client().transact(frame_bytes, mid).await?;
        let (header, body) = packet::parse(&response)?;
        status_of(&header)?;
        let mut words = body.require_words(6)?;
        primitive::skip(&mut words, 4)?;
        Ok(primitive::u16(&mut words)? as usize)
    }

    /// SMB_COM_LOCKING_ANDX with one lock range.
    pub async fn lock(&self, offset: u64, len: u64, exclusive: bool) -> Result<()> {
        self.locking(&[], &[(offset, len)], exclusive).await
    }

    /// SMB_COM_LOCKING_ANDX with one unlock range.
    pub async fn unlock(&self, offset: u64, len: u64) -> Result<()> {
        self.locking(&[(offset, len)], &[], false).await
    }

    async fn locking(
        &self,
        unlocks: &[(u64, u64)],
        locks: &[(u64, u64)],
        exclusive: bool,
    ) -> Result<()> {
        let inner = self.tree.inner();
        let mid = inner.allocate_mid();
        let header =
            inner.request_header(Command::LockingAndX, self.tree.session.uid, self.tree.tid, mid);
        let mut lock_bits = lock_type::LARGE_FILES;
        if !exclusive {
            lock_bits |= lock_type::SHARED_LOCK;
        }
        let frame_bytes = build_frame(header, |b| {
            b.begin(8);
            b.andx_slot();
            b.u16(self.fid);
            b.u8(lock_bits);
            b.u8(0);
            b.u32(0);
            b.u16(unlocks.len() as u16);
            b.u16(locks.len() as u16);
            b.begin_bytes();
            for (offset, len) in unlocks.iter().chain(locks) {
                b.u16(0xFEFF); // pid
                b.u16(0);
                b.u32((offset >> 32) as u32);
                b.u32(*offset as u32);
                b.u32((len >> 32) as u32);
                b.u32(*len as u32);
            }
            b.finish_block();
        })?;
        let response = self.tree.client().transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        status_of(&header)
    }

    /// SMB_COM_CLOSE.
    pub async fn close(&self) -> Result<()> {
        let inner = self.tree.inner();
        let mid = inner.allocate_mid();
        let header =
            inner.request_header(Command::Close, self.tree.session.uid, self.tree.tid, mid);
        let frame_bytes = build_frame(header, |b| {
            b.begin(3);
            b.u16(self.fid);
            b.u32(0); // last write time
            b.begin_bytes();
            b.finish_block();
        })?;
        let response = self.tree.client().transact(frame_bytes, mid).await?;
        let (header, _) = packet::parse(&response)?;
        status_of(&header)
    }
}
