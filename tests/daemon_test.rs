//! Client daemon against a live server.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use certdeliver::client::{Daemon, DaemonState};
use certdeliver::deploy::{ProcessRunner, SiteDeploy};
use certdeliver::protocol::{AuthResponse, CertPush, Envelope, Message};
use certdeliver::server;
use common::*;
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Server side of a single scripted connection.
type Peer = WebSocketStream<TcpStream>;

async fn accept_peer(listener: &TcpListener) -> Peer {
    let (tcp, _) = tokio::time::timeout(RECV_TIMEOUT, listener.accept())
        .await
        .expect("daemon never connected")
        .unwrap();
    tokio_tungstenite::accept_async(tcp).await.unwrap()
}

async fn peer_send(peer: &mut Peer, message: Message) {
    peer.send(WsMessage::Text(message.encode().unwrap()))
        .await
        .unwrap();
}

async fn peer_recv_within(peer: &mut Peer, window: Duration) -> Message {
    loop {
        let frame = tokio::time::timeout(window, peer.next())
            .await
            .expect("timed out waiting for daemon")
            .expect("daemon closed the connection")
            .unwrap();
        if let WsMessage::Text(text) = frame {
            return Envelope::decode(&text).unwrap().message().unwrap();
        }
    }
}

/// Accept the daemon, check its auth subscription and let it in.
async fn admit(listener: &TcpListener, expected: &[&str]) -> Peer {
    let mut peer = accept_peer(listener).await;
    match peer_recv_within(&mut peer, RECV_TIMEOUT).await {
        Message::Auth(req) => assert_eq!(req.domains, expected),
        other => panic!("expected auth, got {:?}", other),
    }
    peer
}

fn accepted() -> Message {
    Message::AuthResult(AuthResponse {
        success: true,
        message: String::new(),
    })
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn read(path: &Path) -> Option<Vec<u8>> {
    std::fs::read(path).ok()
}

fn spawn_daemon(daemon: Arc<Daemon>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        daemon.run(cancel).await.unwrap();
    })
}

#[tokio::test]
async fn test_daemon_syncs_and_deploys_on_connect() {
    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let deployed = TempDir::new().unwrap();
    write_bundle(root.path(), "a.com", 1_700_000_000);
    write_bundle(root.path(), "other.com", 1_700_000_000);

    let handle = server::start(&server_config(root.path())).await.unwrap();

    let mut config = client_config(handle.local_addr(), work.path(), &["a.com"]);
    config.sites = vec![SiteDeploy {
        domain: "a.com".to_string(),
        cert_path: deployed.path().join("{domain}/cert.pem").display().to_string(),
        key_path: deployed.path().join("{domain}/key.pem").display().to_string(),
        fullchain_path: String::new(),
        reloadcmd: String::new(),
    }];

    let daemon = Arc::new(Daemon::new(
        config.daemon_options(),
        Arc::new(ProcessRunner::default()),
    ));
    let cancel = CancellationToken::new();
    let task = spawn_daemon(daemon.clone(), cancel.clone());

    let target = deployed.path().join("a.com/key.pem");
    wait_for("deployed key", || read(&target).is_some()).await;
    assert_eq!(read(&target).unwrap(), b"KEY a.com");
    assert_eq!(daemon.state(), DaemonState::Active);
    assert_eq!(daemon.workspace().timestamp("a.com"), Some(1_700_000_000));
    assert!(!work.path().join("other.com").exists());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(daemon.state(), DaemonState::Disconnected);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_daemon_receives_watcher_push() {
    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    std::fs::create_dir(root.path().join("www.example.com")).unwrap();

    let handle = server::start(&server_config(root.path())).await.unwrap();
    let config = client_config(handle.local_addr(), work.path(), &["*.example.com"]);
    let daemon = Arc::new(Daemon::new(
        config.daemon_options(),
        Arc::new(ProcessRunner::default()),
    ));
    let cancel = CancellationToken::new();
    let task = spawn_daemon(daemon.clone(), cancel.clone());

    let mut state = daemon.state_receiver();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == DaemonState::Active),
    )
    .await
    .unwrap()
    .unwrap();

    write_bundle(root.path(), "www.example.com", 1_700_000_500);
    let saved = work.path().join("www.example.com/cert.pem");
    wait_for("pushed bundle", || read(&saved).is_some()).await;
    assert_eq!(read(&saved).unwrap(), b"CERT www.example.com 1700000500");

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_daemon_reconnects_after_server_restart() {
    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    write_bundle(root.path(), "a.com", 10);

    let mut server_cfg = server_config(root.path());
    let first = server::start(&server_cfg).await.unwrap();
    let addr = first.local_addr();

    let config = client_config(addr, work.path(), &["a.com"]);
    let daemon = Arc::new(Daemon::new(
        config.daemon_options(),
        Arc::new(ProcessRunner::default()),
    ));
    let cancel = CancellationToken::new();
    let task = spawn_daemon(daemon.clone(), cancel.clone());

    wait_for("first sync", || daemon.workspace().timestamp("a.com") == Some(10)).await;

    first.shutdown().await;
    let mut state = daemon.state_receiver();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s != DaemonState::Active),
    )
    .await
    .unwrap()
    .unwrap();

    write_bundle(root.path(), "a.com", 20);
    server_cfg.port = addr.port();
    let second = server::start(&server_cfg).await.unwrap();

    wait_for("resync after restart", || {
        daemon.workspace().timestamp("a.com") == Some(20)
    })
    .await;

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_update_config_while_active_changes_subscription() {
    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    write_bundle(root.path(), "a.com", 1);

    let handle = server::start(&server_config(root.path())).await.unwrap();
    let config = client_config(handle.local_addr(), work.path(), &["a.com"]);
    let daemon = Arc::new(Daemon::new(
        config.daemon_options(),
        Arc::new(ProcessRunner::default()),
    ));
    let cancel = CancellationToken::new();
    let task = spawn_daemon(daemon.clone(), cancel.clone());

    let mut state = daemon.state_receiver();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == DaemonState::Active),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(
        daemon
            .update_config(vec!["b.com".to_string()], Vec::new())
            .await
    );

    let hub = handle.hub().clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = hub.list_connections().await;
        if snapshot.len() == 1 && snapshot[0].patterns == vec!["b.com".to_string()] {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "subscription not updated");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    handle.shutdown().await;
}

#[tokio::test]
async fn test_update_config_during_handshake_is_sent_after_auth() {
    let work = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = client_config(listener.local_addr().unwrap(), work.path(), &["a.com"]);
    let daemon = Arc::new(Daemon::new(
        config.daemon_options(),
        Arc::new(ProcessRunner::default()),
    ));
    let cancel = CancellationToken::new();
    let task = spawn_daemon(daemon.clone(), cancel.clone());

    // auth_result is held back while the config changes
    let mut peer = admit(&listener, &["a.com"]).await;
    assert_eq!(daemon.state(), DaemonState::Authenticating);
    assert!(
        !daemon
            .update_config(vec!["b.com".to_string()], Vec::new())
            .await
    );

    peer_send(&mut peer, accepted()).await;
    loop {
        match peer_recv_within(&mut peer, RECV_TIMEOUT).await {
            Message::SyncRequest(_) => continue,
            Message::Subscribe(req) => {
                assert_eq!(req.domains, vec!["b.com"]);
                break;
            }
            other => panic!("expected subscribe, got {:?}", other),
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
}

#[tokio::test]
async fn test_slow_deploy_does_not_block_heartbeat() {
    let work = TempDir::new().unwrap();
    let targets = TempDir::new().unwrap();
    // A regular file where the target directory should be keeps the
    // deploy failing and retrying
    let blocker = targets.path().join("blocker");
    std::fs::write(&blocker, "").unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = client_config(listener.local_addr().unwrap(), work.path(), &["a.com"]);
    config.deploy_attempts = 3;
    config.sites = vec![SiteDeploy {
        domain: "a.com".to_string(),
        cert_path: blocker.join("{domain}.crt").display().to_string(),
        ..Default::default()
    }];
    let daemon = Arc::new(Daemon::new(
        config.daemon_options(),
        Arc::new(ProcessRunner::default()),
    ));
    let cancel = CancellationToken::new();
    let task = spawn_daemon(daemon.clone(), cancel.clone());

    let mut peer = admit(&listener, &["a.com"]).await;
    peer_send(&mut peer, accepted()).await;
    match peer_recv_within(&mut peer, RECV_TIMEOUT).await {
        Message::SyncRequest(_) => {}
        other => panic!("expected sync_request, got {:?}", other),
    }

    let mut files = certdeliver::bundle::FileMap::new();
    files.insert("cert.pem".to_string(), b"CERT a.com".to_vec());
    peer_send(
        &mut peer,
        Message::CertPush(CertPush {
            domain: "a.com".to_string(),
            files,
            timestamp: 1_700_000_000,
        }),
    )
    .await;
    peer_send(&mut peer, Message::Ping).await;

    // Retries pause 500 ms then 1 s, the pong must not wait for them
    assert_eq!(
        peer_recv_within(&mut peer, Duration::from_millis(400)).await,
        Message::Pong
    );
    match peer_recv_within(&mut peer, RECV_TIMEOUT).await {
        Message::CertAck(ack) => {
            assert_eq!(ack.domain, "a.com");
            assert!(!ack.success);
        }
        other => panic!("expected cert_ack, got {:?}", other),
    }
    assert_eq!(read(&work.path().join("a.com/cert.pem")).unwrap(), b"CERT a.com");

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
}
