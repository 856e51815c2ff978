//! End-to-end TURN relay flows over loopback UDP.
//!
//! Runs the full stack - receiver loop, engine and reaper ticker - against
//! an in-memory directory, driven by plain `UdpSocket` clients.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use turn_relay::engine::{Event, TurnEngine};
use turn_relay::socket::run_receiver;

use common::types::MeetingId;
use meeting_directory::memory::MemoryDirectory;
use meeting_directory::MirrorRecord;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MEETING: &str = "123456789";
const PASSWORD: &str = "aB3dE6gH9jK2";

struct Harness {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn spawn_relay(reaper_period: Duration) -> Harness {
    let directory = MemoryDirectory::new().with_record(
        MeetingId::from(MEETING),
        MirrorRecord::new(PASSWORD, vec!["127.0.0.1".parse().unwrap()]),
    );

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel::<Event>(256);

    let engine = TurnEngine::new(events_rx, directory, Arc::clone(&socket), cancel.clone());
    tokio::spawn(engine.run());
    tokio::spawn(run_receiver(socket, events_tx.clone(), cancel.clone()));
    tokio::spawn(common::tasks::run_ticker(
        events_tx,
        || Event::Sweep,
        reaper_period,
        cancel.clone(),
        "test.clients",
    ));

    Harness { addr, cancel }
}

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
}

impl Client {
    async fn bind(server: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
        }
    }

    async fn send(&self, raw: &[u8]) {
        self.socket.send_to(raw, self.server).await.unwrap();
    }

    async fn recv(&self) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for a datagram")
            .unwrap();
        buf[..n].to_vec()
    }

    async fn recv_server_json(&self) -> Value {
        let datagram = self.recv().await;
        assert_eq!(
            datagram.first(),
            Some(&b'S'),
            "expected a server-tagged datagram, got {datagram:?}"
        );
        serde_json::from_slice(&datagram[1..]).expect("server datagram should be JSON")
    }

    async fn relay_connect(&self) -> Value {
        self.send(
            format!(r#"{{"request":"connect","id":"{MEETING}","password":"{PASSWORD}"}}"#)
                .as_bytes(),
        )
        .await;
        self.recv_server_json().await
    }
}

#[tokio::test]
async fn s6_relay_with_origin_tags() {
    let server = spawn_relay(Duration::from_secs(60)).await;
    let a = Client::bind(server.addr).await;
    let b = Client::bind(server.addr).await;

    assert_eq!(
        a.relay_connect().await,
        json!({"response":"success","waiting":true})
    );
    assert_eq!(
        b.relay_connect().await,
        json!({"response":"success","waiting":false})
    );
    // The server notification to A arrives S-tagged.
    assert_eq!(
        a.recv_server_json().await,
        json!({"response":"info","type":"connected"})
    );

    // A's opaque datagram X lands at B as CX.
    a.send(b"X").await;
    assert_eq!(b.recv().await, b"CX");

    // And the reverse direction, with binary payload.
    b.send(b"\x01\x02\x03").await;
    assert_eq!(a.recv().await, b"C\x01\x02\x03");
}

#[tokio::test]
async fn forwarding_before_pairing_is_refused() {
    let server = spawn_relay(Duration::from_secs(60)).await;
    let a = Client::bind(server.addr).await;

    a.relay_connect().await;
    a.send(b"media").await;
    assert_eq!(
        a.recv_server_json().await,
        json!({"response":"error","reason":"The other user is not connected yet."})
    );
}

#[tokio::test]
async fn unknown_sources_are_challenged() {
    let server = spawn_relay(Duration::from_secs(60)).await;
    let x = Client::bind(server.addr).await;

    x.send(b"media").await;
    assert_eq!(
        x.recv_server_json().await,
        json!({"response":"error","reason":"Invalid request"})
    );
}

#[tokio::test]
async fn heartbeats_flow_and_silent_clients_are_reaped() {
    let server = spawn_relay(Duration::from_millis(100)).await;
    let a = Client::bind(server.addr).await;
    let b = Client::bind(server.addr).await;

    a.relay_connect().await;
    b.relay_connect().await;
    a.recv_server_json().await; // info: connected

    // B echoes heartbeats; A goes silent and gets reaped. B eventually
    // hears the departure notice among its heartbeats.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut saw_left = false;
    while tokio::time::Instant::now() < deadline && !saw_left {
        let mut buf = [0u8; 2048];
        let received =
            tokio::time::timeout(Duration::from_millis(200), b.socket.recv_from(&mut buf)).await;
        let Ok(Ok((n, _))) = received else { continue };
        let datagram = &buf[..n];
        if datagram == b"HEARTBEAT" {
            b.send(b"HEARTBEAT").await;
        } else if datagram.first() == Some(&b'S') {
            let value: Value = serde_json::from_slice(&datagram[1..]).unwrap();
            if value == json!({"response":"info","type":"left"}) {
                saw_left = true;
            }
        }
    }
    assert!(saw_left, "survivor should hear that the silent peer left");

    // The link is gone: media from B now bounces.
    b.send(b"media").await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut saw_error = false;
    while tokio::time::Instant::now() < deadline && !saw_error {
        let datagram = b.recv().await;
        if datagram.first() == Some(&b'S') {
            let value: Value = serde_json::from_slice(&datagram[1..]).unwrap();
            if value == json!({"response":"error","reason":"The other user is not connected yet."})
            {
                saw_error = true;
            }
        }
    }
    assert!(saw_error);
}
