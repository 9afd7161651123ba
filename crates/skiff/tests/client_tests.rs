//! End-to-end tests of the client task over real TCP sockets, with a scripted
//! protocol engine standing in for libssh2

use async_trait::async_trait;
use skiff::ssh::mock::{MockEngine, MockServer};
use skiff::ssh::{AuthList, Connector, EngineError, HostIdentity, HostKeyType, Step, TcpConnector};
use skiff::{
    Client, ClientBuilder, ClientConfig, ConnectError, ErrorKind, EventReceiver, HostKeyPolicy,
    SessionEvent, SessionState, SkiffError, Target,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Blackhole;

#[async_trait]
impl Connector for Blackhole {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<TcpStream> {
        std::future::pending().await
    }
}

fn identity() -> HostIdentity {
    HostIdentity::new(HostKeyType::Ed25519, vec![7u8; 51], vec![9u8; 32])
}

fn config() -> ClientConfig {
    ClientConfig {
        host_key_policy: HostKeyPolicy::AcceptNew,
        ..Default::default()
    }
}

fn spawn(server: &MockServer, config: ClientConfig) -> (Client<MockEngine>, EventReceiver) {
    Client::spawn(config, server.factory(), Arc::new(TcpConnector::new())).unwrap()
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Wait for the first event matching `wanted`, skipping everything else
async fn wait_for(
    events: &mut EventReceiver,
    wanted: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Drain every event already delivered, ignoring traffic samples
fn drain(events: &mut EventReceiver) -> Vec<SessionEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, SessionEvent::TrafficSample { .. }) {
            drained.push(event);
        }
    }
    drained
}

#[tokio::test]
async fn test_refused_port_exhausts_retries() {
    let port = closed_port().await;
    let server = MockServer::new();
    let (client, mut events) = spawn(
        &server,
        ClientConfig {
            retries: 2,
            ..config()
        },
    );

    let result = client.connect_and_wait(Target::new("alice", "127.0.0.1", port)).await;

    assert!(matches!(
        result,
        Err(SkiffError::Connect(ConnectError::Failed {
            kind: ErrorKind::ConnectionRefused,
            attempts: 3,
        }))
    ));

    let refusals = drain(&mut events)
        .into_iter()
        .filter(|event| *event == SessionEvent::Error(ErrorKind::ConnectionRefused))
        .count();
    assert_eq!(refusals, 3);
    // One engine up front plus a fresh one per failed attempt
    assert_eq!(server.engines_created(), 4);
    assert_eq!(client.state().await.unwrap(), SessionState::Idle);
}

#[tokio::test]
async fn test_connect_timeout_with_retry() {
    let server = MockServer::new();
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(50),
        retries: 1,
        ..config()
    };
    let (client, mut events) =
        Client::spawn(config, server.factory(), Arc::new(Blackhole)).unwrap();

    let result = client.connect_and_wait(Target::new("alice", "192.0.2.1", 22)).await;

    assert!(matches!(
        result,
        Err(SkiffError::Connect(ConnectError::Failed {
            kind: ErrorKind::TimeOut,
            attempts: 2,
        }))
    ));
    let timeouts = drain(&mut events)
        .into_iter()
        .filter(|event| event.error_kind() == Some(ErrorKind::TimeOut))
        .count();
    assert_eq!(timeouts, 2);
}

#[tokio::test]
async fn test_builder_reports_refusal() {
    let port = closed_port().await;
    let server = MockServer::new();

    let result = ClientBuilder::new(&format!("alice@127.0.0.1:{}", port))
        .with_retries(2)
        .with_password("secret")
        .connect_with(server.factory(), Arc::new(TcpConnector::new()))
        .await;

    match result {
        Err(SkiffError::Connect(err)) => {
            assert_eq!(err.kind(), Some(ErrorKind::ConnectionRefused));
            assert_eq!(
                err,
                ConnectError::Failed {
                    kind: ErrorKind::ConnectionRefused,
                    attempts: 3,
                }
            );
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_full_session_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = MockServer::new();
    server
        .handshake(Ok(Step::Done(())))
        .identity(identity())
        .auth_list(Ok(Step::Done(AuthList::Methods(vec!["password".to_string()]))))
        .password(Ok(Step::Done(())));
    let (client, mut events) = spawn(
        &server,
        ClientConfig {
            traffic_sample_interval: Duration::from_millis(20),
            ..config()
        },
    );
    client.set_password("secret").await.unwrap();

    client
        .connect_and_wait(Target::new("alice", "127.0.0.1", port))
        .await
        .unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.state, SessionState::ChannelsReady);
    assert!(status.local_port.is_some());
    assert_eq!(client.host_identity().await.unwrap(), Some(identity()));
    wait_for(&mut events, |event| *event == SessionEvent::Connected).await;

    // Server bytes reach the engine, wake the session and are counted
    peer.write_all(b"SSH-2.0-test\r\n").await.unwrap();
    wait_for(&mut events, |event| *event == SessionEvent::DataReady).await;

    let mut received = 0;
    timeout(WAIT, async {
        while received < 14 {
            if let Some(SessionEvent::TrafficSample { received: n, .. }) = events.recv().await {
                received += n;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, 14);

    // Peer hangs up
    drop(peer);
    wait_for(&mut events, |event| *event == SessionEvent::Disconnected).await;
    assert_eq!(client.state().await.unwrap(), SessionState::Idle);
    assert_eq!(client.local_port().await.unwrap(), None);
}

#[tokio::test]
async fn test_commands_served_while_engine_not_reading() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = MockServer::new();
    server
        .handshake(Ok(Step::Done(())))
        .identity(identity())
        .auth_list(Ok(Step::Done(AuthList::AlreadyAuthenticated)));
    let (client, mut events) = spawn(
        &server,
        ClientConfig {
            traffic_sample_interval: Duration::from_millis(20),
            ..config()
        },
    );

    client
        .connect_and_wait(Target::new("alice", "127.0.0.1", port))
        .await
        .unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    // The scripted engine never reads its socket, so most of this stays queued
    let flood = tokio::spawn(async move {
        let _ = peer.write_all(&vec![0u8; 4 * 1024 * 1024]).await;
        peer
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = timeout(Duration::from_secs(3), client.status())
        .await
        .expect("client stopped answering")
        .unwrap();
    assert_eq!(status.state, SessionState::ChannelsReady);

    // Traffic samples keep flowing too
    wait_for(&mut events, |event| matches!(event, SessionEvent::TrafficSample { .. })).await;

    client.shutdown().await.unwrap();
    flood.abort();
}

#[tokio::test]
async fn test_missing_password_then_supplied() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = MockServer::new();
    server
        .handshake(Ok(Step::Done(())))
        .identity(identity())
        .auth_list(Ok(Step::Done(AuthList::Methods(vec!["password".to_string()]))))
        .password(Err(EngineError::new(-18, "Authentication failed")))
        .password(Ok(Step::Done(())));
    let (client, mut events) = spawn(&server, config());

    let result = client.connect_and_wait(Target::new("alice", "127.0.0.1", port)).await;
    assert!(matches!(
        result,
        Err(SkiffError::Connect(ConnectError::Failed {
            kind: ErrorKind::Authentication,
            ..
        }))
    ));
    let _peer = listener.accept().await.unwrap();

    let required = wait_for(&mut events, |event| event.auth_required().is_some()).await;
    assert_eq!(
        required.auth_required().map(|m| m.iter().collect::<Vec<_>>()),
        Some(vec![skiff::AuthMethod::Password])
    );

    client.set_password("wrong").await.unwrap();
    wait_for(&mut events, |event| event.auth_required().is_some()).await;
    assert_eq!(client.last_error().await.unwrap().map(|e| e.code), Some(-18));

    client.set_password("right").await.unwrap();
    wait_for(&mut events, |event| *event == SessionEvent::Connected).await;
    assert_eq!(client.state().await.unwrap(), SessionState::ChannelsReady);
}

#[tokio::test]
async fn test_known_hosts_through_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("known_hosts");
    let server = MockServer::new();

    let (client, _events) = spawn(&server, config());
    client.add_known_host("example.com", identity()).await.unwrap();
    client.save_known_hosts(&path).await.unwrap();

    let (other, _other_events) = spawn(&server, config());
    assert_eq!(other.load_known_hosts(&path).await.unwrap(), 1);

    let odd = HostIdentity::new(HostKeyType::Unknown, vec![1u8], vec![2u8]);
    assert!(matches!(
        client.add_known_host("example.com", odd).await,
        Err(SkiffError::KnownHosts(_))
    ));
}

#[tokio::test]
async fn test_traffic_samples_while_idle() {
    let server = MockServer::new();
    let (_client, mut events) = spawn(
        &server,
        ClientConfig {
            traffic_sample_interval: Duration::from_millis(10),
            ..config()
        },
    );

    let sample = wait_for(&mut events, |event| {
        matches!(event, SessionEvent::TrafficSample { .. })
    })
    .await;
    assert_eq!(sample, SessionEvent::TrafficSample { sent: 0, received: 0 });
}

#[tokio::test]
async fn test_shutdown_closes_client() {
    let server = MockServer::new();
    let (client, _events) = spawn(&server, config());

    client.shutdown().await.unwrap();

    let closed = timeout(WAIT, async {
        loop {
            match client.status().await {
                Err(SkiffError::ClientClosed) => return true,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    })
    .await;
    assert!(matches!(closed, Ok(true)));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let server = MockServer::new();
    let config = ClientConfig {
        traffic_sample_interval: Duration::ZERO,
        ..config()
    };

    let result = Client::spawn(config, server.factory(), Arc::new(TcpConnector::new()));
    assert!(matches!(result, Err(SkiffError::Configuration(_))));
}
