//! End-to-end signaling flows over loopback TCP.
//!
//! Spawns the real engine, acceptor and reaper tasks against an in-memory
//! directory, then drives them with plain `TcpStream` clients speaking the
//! wire protocol.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use serde_json::{json, Value};
use signaling_service::engine::{Event, SignalingEngine};
use signaling_service::mirror::Mirror;

use common::types::MeetingId;
use meeting_directory::memory::MemoryDirectory;
use meeting_directory::Directory;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    addr: SocketAddr,
    cancel: CancellationToken,
    directory: MemoryDirectory,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn spawn_server(reaper_period: Duration) -> Harness {
    let directory = MemoryDirectory::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel::<Event>(256);

    let engine = SignalingEngine::new(
        events_rx,
        Mirror::enabled(directory.clone()),
        cancel.clone(),
    );
    tokio::spawn(engine.run());
    tokio::spawn(common::net::run_acceptor(
        listener,
        events_tx.clone(),
        cancel.clone(),
    ));
    tokio::spawn(common::tasks::run_ticker(
        events_tx.clone(),
        || Event::SweepClients,
        reaper_period,
        cancel.clone(),
        "test.clients",
    ));
    tokio::spawn(common::tasks::run_ticker(
        events_tx,
        || Event::SweepMeetings,
        reaper_period,
        cancel.clone(),
        "test.meetings",
    ));

    Harness {
        addr,
        cancel,
        directory,
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    async fn send(&mut self, raw: &str) {
        self.stream.write_all(raw.as_bytes()).await.unwrap();
    }

    async fn recv_json(&mut self) -> Value {
        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf))
            .await
            .expect("timed out waiting for a frame")
            .unwrap();
        assert!(n > 0, "connection closed while expecting a frame");
        serde_json::from_slice(&buf[..n]).expect("frame should be one JSON document")
    }

    async fn start_meeting(&mut self) -> (String, String) {
        self.send(r#"{"request":"start"}"#).await;
        let reply = self.recv_json().await;
        assert_eq!(reply["response"], "success");
        assert_eq!(reply["type"], "created");
        (
            reply["id"].as_str().unwrap().to_string(),
            reply["password"].as_str().unwrap().to_string(),
        )
    }

    async fn join(&mut self, id: &str, password: &str) -> Value {
        self.send(&format!(
            r#"{{"request":"join","id":"{id}","password":"{password}"}}"#
        ))
        .await;
        self.recv_json().await
    }
}

#[tokio::test]
async fn s1_create_and_join() {
    let server = spawn_server(Duration::from_secs(60)).await;
    let mut a = Client::connect(server.addr).await;
    let mut b = Client::connect(server.addr).await;

    let (id, password) = a.start_meeting().await;
    assert_eq!(id.len(), 9);
    assert_eq!(password.len(), 12);

    assert_eq!(
        a.join(&id, &password).await,
        json!({"response":"success","type":"connected","waiting":true})
    );
    assert_eq!(
        b.join(&id, &password).await,
        json!({"response":"success","type":"connected","waiting":false})
    );
    assert_eq!(
        a.recv_json().await,
        json!({"response":"info","type":"connected"})
    );

    // The mirror now authorizes both loopback participants by IP.
    let record = server
        .directory
        .get(&MeetingId::from(id.as_str()))
        .await
        .unwrap()
        .expect("meeting should be mirrored");
    assert_eq!(record.password, password);
    assert_eq!(record.participants.len(), 2);
}

#[tokio::test]
async fn s2_wrong_password_leaves_state_alone() {
    let server = spawn_server(Duration::from_secs(60)).await;
    let mut a = Client::connect(server.addr).await;
    let mut c = Client::connect(server.addr).await;

    let (id, password) = a.start_meeting().await;
    assert_eq!(
        c.join(&id, "bad").await,
        json!({"response":"error","reason":"The password for this meeting is incorrect"})
    );

    // The meeting is intact and still joinable.
    assert_eq!(
        c.join(&id, &password).await,
        json!({"response":"success","type":"connected","waiting":true})
    );
}

#[tokio::test]
async fn s3_third_joiner_is_turned_away() {
    let server = spawn_server(Duration::from_secs(60)).await;
    let mut a = Client::connect(server.addr).await;
    let mut b = Client::connect(server.addr).await;
    let mut d = Client::connect(server.addr).await;

    let (id, password) = a.start_meeting().await;
    a.join(&id, &password).await;
    b.join(&id, &password).await;
    a.recv_json().await; // info: connected

    assert_eq!(
        d.join(&id, &password).await,
        json!({"response":"error","reason":"This meeting is full"})
    );
}

#[tokio::test]
async fn s4_host_transfer_round_trip() {
    let server = spawn_server(Duration::from_secs(60)).await;
    let mut a = Client::connect(server.addr).await;
    let mut b = Client::connect(server.addr).await;

    let (id, password) = a.start_meeting().await;
    a.join(&id, &password).await;
    b.join(&id, &password).await;
    a.recv_json().await; // info: connected

    a.send(r#"{"request":"switch"}"#).await;
    assert_eq!(
        a.recv_json().await,
        json!({"response":"success","type":"switched"})
    );
    assert_eq!(
        b.recv_json().await,
        json!({"response":"info","type":"switched"})
    );

    // Involution: a second switch from the new host hands it back.
    b.send(r#"{"request":"switch"}"#).await;
    assert_eq!(
        b.recv_json().await,
        json!({"response":"success","type":"switched"})
    );
    assert_eq!(
        a.recv_json().await,
        json!({"response":"info","type":"switched"})
    );

    // A is host again: A may end the meeting.
    a.send(r#"{"request":"end"}"#).await;
    assert_eq!(
        a.recv_json().await,
        json!({"response":"success","type":"ended"})
    );
    assert_eq!(
        b.recv_json().await,
        json!({"response":"info","type":"ended"})
    );
}

#[tokio::test]
async fn s7_silent_client_is_disconnected() {
    let server = spawn_server(Duration::from_millis(100)).await;
    let mut a = Client::connect(server.addr).await;

    // Never answer anything; the server heartbeats twice, then closes.
    let mut total = Vec::new();
    let mut buf = [0u8; 64];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let closed = loop {
        let read = tokio::time::timeout_at(deadline, a.stream.read(&mut buf)).await;
        match read {
            Ok(Ok(0)) => break true,
            Ok(Ok(n)) => total.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break true,
            Err(_) => break false,
        }
    };

    assert!(closed, "server should close a silent client's transport");
    // Everything we heard was heartbeat traffic (possibly coalesced).
    assert!(!total.is_empty());
    assert_eq!(total.len() % 9, 0);
    assert!(total.chunks(9).all(|chunk| chunk == b"HEARTBEAT"));
}

#[tokio::test]
async fn heartbeat_echo_keeps_the_client_alive() {
    let server = spawn_server(Duration::from_millis(100)).await;
    let mut a = Client::connect(server.addr).await;

    // Echo heartbeats for ~8 reaper periods.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
    let mut buf = [0u8; 64];
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(150), a.stream.read(&mut buf)).await {
            Ok(Ok(0)) => panic!("server dropped a live client"),
            Ok(Ok(_)) => a.stream.write_all(b"HEARTBEAT").await.unwrap(),
            Ok(Err(e)) => panic!("read failed: {e}"),
            Err(_) => {}
        }
    }

    // Still welcome: a request round-trips. Late heartbeats may coalesce
    // with the reply, so strip any leading tokens before parsing.
    a.send(r#"{"request":"start"}"#).await;
    let mut collected: Vec<u8> = Vec::new();
    let reply = loop {
        let n = tokio::time::timeout(Duration::from_secs(2), a.stream.read(&mut buf))
            .await
            .expect("timed out waiting for the reply")
            .unwrap();
        assert!(n > 0, "server closed a live client");
        collected.extend_from_slice(&buf[..n]);
        while collected.starts_with(b"HEARTBEAT") {
            collected.drain(..b"HEARTBEAT".len());
        }
        if collected.first() == Some(&b'{') {
            if let Ok(value) = serde_json::from_slice::<Value>(&collected) {
                break value;
            }
        }
    };
    assert_eq!(reply["response"], "success");
    assert_eq!(reply["type"], "created");
}
