use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use smbserve::acl::Acl;
use smbserve::auth::LocalAuth;
use smbserve::client::{ClientSession, ClientTree, SmbClient};
use smbserve::config::ServerConfig;
use smbserve::disk::memory::MemoryDisk;
use smbserve::share::{DefaultAccessControl, ShareKind, ShareRegistry, VolumeInfo};
use smbserve::state::standalone::StandaloneCache;
use smbserve::Server;
use tokio::net::TcpListener;

/// 2024-01-01T00:00:00Z, the volume creation time the suite asserts on.
pub const VOLUME_CREATED_UNIX: u64 = 1_704_067_200;

pub struct Fixture {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub disk: Arc<MemoryDisk>,
    pub cache: Arc<StandaloneCache>,
}

impl Fixture {
    /// Boots a server on an ephemeral port with a seeded PUBLIC share.
    pub async fn start() -> Fixture {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();

        let mut config = ServerConfig::with_name("SERVER");
        config.domain = "WORKGROUP".to_string();
        config.workers_initial = 8;
        config.workers_maximum = 16;
        config.validate().expect("fixture configuration");

        let cache = StandaloneCache::new(Duration::from_secs(5));
        let disk = Arc::new(MemoryDisk::new());
        disk.seed_file("hello.txt", b"Hello, SMB!\r\n").await;
        disk.seed_file("shared.bin", &[0u8; 128]).await;
        disk.seed_file("exclusive.dat", b"cached").await;
        disk.seed_directory("docs").await;

        let mut shares = ShareRegistry::new();
        shares.add(
            "PUBLIC",
            ShareKind::Disk,
            "Public files",
            Arc::clone(&disk) as Arc<dyn smbserve::disk::Disk>,
            Acl::open(),
            VolumeInfo {
                label: "DATA".to_string(),
                serial: 0xC0DE_CAFE,
                created: std::time::UNIX_EPOCH + Duration::from_secs(VOLUME_CREATED_UNIX),
            },
            cache.clone(),
        );
        shares.add(
            "IPC$",
            ShareKind::Ipc,
            "IPC service",
            Arc::new(MemoryDisk::new()),
            Acl::open(),
            VolumeInfo::default(),
            cache.clone(),
        );

        let server = Server::new(
            config,
            shares,
            Arc::new(LocalAuth::new(true).with_account("alice", "secret")),
            Arc::new(DefaultAccessControl),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture listener");
        let addr = listener.local_addr().expect("fixture address");
        {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let _ = smbserve::handle_forever(listener, server).await;
            });
        }
        Fixture { server, addr, disk, cache }
    }

    pub async fn client(&self) -> SmbClient {
        SmbClient::connect(self.addr).await.expect("connect")
    }

    /// Fresh connection, negotiated and authenticated as guest, connected
    /// to PUBLIC.
    pub async fn guest_tree(&self) -> (SmbClient, ClientSession, ClientTree) {
        let client = self.client().await;
        client
            .negotiate(&["PC NETWORK PROGRAM 1.0", "NT LM 0.12"])
            .await
            .expect("negotiate");
        let session = client.session_setup("", "", "").await.expect("session setup");
        let tree = session.tree_connect("\\\\SERVER\\PUBLIC").await.expect("tree connect");
        (client, session, tree)
    }
}
