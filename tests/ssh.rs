//! Sessions over the real SSH transport, driven by a russh client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::{Channel, ChannelMsg, ChannelOpenFailure, Disconnect};
use russh_sftp::client::SftpSession;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use sftp_listener::lifecycle::{Server, Shutdown};

mod common;

/// Client handler that trusts whatever host key the test server presents.
struct TrustingClient;

impl client::Handler for TrustingClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

struct TestServer {
    addr: SocketAddr,
    root: TempDir,
    shutdown: Shutdown,
    running: JoinHandle<()>,
    _keys: TempDir,
}

impl TestServer {
    /// Build the production server around a fresh host key and an empty root.
    async fn start(max_channels: Option<usize>) -> Self {
        let keys = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let key_path = keys.path().join("ssh_host_ed25519_key");
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .unwrap()
            .write_openssh_file(&key_path, LineEnding::LF)
            .unwrap();

        let mut config = common::local_config();
        config.ssh.host_key_path = key_path.display().to_string();
        config.ssh.auth_rejection_time_secs = 0;
        config.sftp.root = root.path().display().to_string();
        config.listener.max_channels_per_connection = max_channels;

        let server = Server::build(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let running = tokio::spawn(server.run(shutdown.subscribe()));

        Self {
            addr,
            root,
            shutdown,
            running,
            _keys: keys,
        }
    }

    async fn connect(&self) -> client::Handle<TrustingClient> {
        let config = Arc::new(client::Config::default());
        client::connect(config, self.addr, TrustingClient).await.unwrap()
    }

    async fn login(&self) -> client::Handle<TrustingClient> {
        let mut session = self.connect().await;
        let auth = session.authenticate_password("testuser", "tiger").await.unwrap();
        assert!(auth.success());
        session
    }

    async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.running)
            .await
            .unwrap()
            .unwrap();
    }
}

/// Wait for the server's answer to a `want_reply` channel request.
async fn channel_reply(channel: &mut Channel<client::Msg>) -> Option<ChannelMsg> {
    loop {
        match channel.wait().await? {
            reply @ (ChannelMsg::Success | ChannelMsg::Failure) => return Some(reply),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn wrong_password_is_rejected_and_next_login_succeeds() {
    let (logs, _guard) = common::capture_logs();
    let server = TestServer::start(None).await;

    let mut intruder = server.connect().await;
    let auth = intruder.authenticate_password("testuser", "guess").await.unwrap();
    assert!(!auth.success());
    intruder
        .disconnect(Disconnect::ByApplication, "giving up", "en")
        .await
        .unwrap();
    drop(intruder);

    assert!(
        common::eventually(|| {
            logs.count("WARN", "Handshake failed") == 1
                && logs.count("WARN", "authentication rejected for \"testuser\"") == 1
        })
        .await
    );

    let session = server.login().await;
    let channel = session.channel_open_session().await.unwrap();
    drop(channel);
    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn subsystem_negotiation_and_file_round_trip() {
    let server = TestServer::start(None).await;
    let session = server.login().await;
    let mut channel = session.channel_open_session().await.unwrap();

    channel.request_subsystem(true, "ftp").await.unwrap();
    assert!(matches!(channel_reply(&mut channel).await, Some(ChannelMsg::Failure)));

    channel.request_subsystem(true, "sftp").await.unwrap();
    assert!(matches!(channel_reply(&mut channel).await, Some(ChannelMsg::Success)));

    let sftp = SftpSession::new(channel.into_stream()).await.unwrap();
    let mut file = sftp.create("/uploaded.txt").await.unwrap();
    file.write_all(b"carried over ssh").await.unwrap();
    file.shutdown().await.unwrap();

    assert_eq!(sftp.read("/uploaded.txt").await.unwrap(), b"carried over ssh");
    let on_disk = std::fs::read(server.root.path().join("uploaded.txt")).unwrap();
    assert_eq!(on_disk, b"carried over ssh");

    drop(sftp);
    drop(session);
    server.stop().await;
}

#[tokio::test]
async fn refused_opens_reach_the_peer_as_administratively_prohibited() {
    let server = TestServer::start(Some(1)).await;
    let session = server.login().await;

    let forwarded = session
        .channel_open_direct_tcpip("localhost", 22, "127.0.0.1", 40000)
        .await;
    assert!(matches!(
        forwarded,
        Err(russh::Error::ChannelOpenFailure(ChannelOpenFailure::AdministrativelyProhibited))
    ));

    // The channel limit is reported the same way.
    let _held = session.channel_open_session().await.unwrap();
    let excess = session.channel_open_session().await;
    assert!(matches!(
        excess,
        Err(russh::Error::ChannelOpenFailure(ChannelOpenFailure::AdministrativelyProhibited))
    ));

    drop(session);
    server.stop().await;
}
