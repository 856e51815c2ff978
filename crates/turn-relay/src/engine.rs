//! TURN relay engine.
//!
//! One actor task owns the client and pairing tables; datagrams and reaper
//! ticks arrive through the mailbox. The first datagram from an unknown
//! source must be a JSON `connect` request; admission mirrors the ICE
//! broker exactly. After that, datagrams are forwarded verbatim to the
//! peer with no per-packet parsing beyond the heartbeat/request check.
//!
//! # Origin tags
//!
//! Both directions of a meeting share one server socket, so every JSON
//! datagram the relay originates is prefixed with `S` and every forwarded
//! peer payload with `C`. That one positional ASCII byte is the entire
//! demultiplexing contract. The heartbeat token is the exception: it is
//! sent bare, so clients can match it literally.

use crate::errors::TurnError;

use bytes::Bytes;
use common::protocol::{
    parse_frame, tag_peer_payload, ErrorReason, EventKind, InboundFrame, ServerMessage,
    TurnRequest, CLIENT_TTL, HEARTBEAT, ORIGIN_SERVER,
};
use common::types::MeetingId;
use meeting_directory::Directory;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mailbox messages for the TURN engine.
#[derive(Debug)]
pub enum Event {
    /// One datagram from the shared socket.
    Datagram { addr: SocketAddr, payload: Bytes },
    /// Client liveness sweep tick.
    Sweep,
}

#[derive(Debug)]
struct ClientRecord {
    ttl: u8,
    /// The meeting this client was admitted into.
    meeting: MeetingId,
    /// Return address of the counterparty, cross-linked at pairing time.
    peer: Option<SocketAddr>,
}

/// Response to the caller plus side notifications.
struct Outcome {
    reply: ServerMessage,
    notices: Vec<(SocketAddr, ServerMessage)>,
}

impl Outcome {
    fn reply(reply: ServerMessage) -> Self {
        Self {
            reply,
            notices: Vec::new(),
        }
    }

    fn with_notice(mut self, peer: SocketAddr, message: ServerMessage) -> Self {
        self.notices.push((peer, message));
        self
    }
}

/// The TURN relay actor.
pub struct TurnEngine<D> {
    events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    clients: HashMap<SocketAddr, ClientRecord>,
    /// Per-meeting pairing list, one or two members.
    pairings: HashMap<MeetingId, Vec<SocketAddr>>,
    directory: D,
    socket: Arc<UdpSocket>,
}

impl<D: Directory> TurnEngine<D> {
    /// Build an engine reading from `events` and sending on `socket`.
    #[must_use]
    pub fn new(
        events: mpsc::Receiver<Event>,
        directory: D,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            cancel,
            clients: HashMap::new(),
            pairings: HashMap::new(),
            directory,
            socket,
        }
    }

    /// Run until cancelled or the mailbox closes.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = self.events.recv() => {
                    match event {
                        None => break,
                        Some(event) => self.handle_event(event).await,
                    }
                }
            }
        }

        info!(target: "turn.engine", "Engine stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Datagram { addr, payload } => self.on_datagram(addr, &payload).await,
            Event::Sweep => self.sweep_clients().await,
        }
    }

    async fn on_datagram(&mut self, addr: SocketAddr, payload: &Bytes) {
        if let Some(client) = self.clients.get_mut(&addr) {
            client.ttl = CLIENT_TTL;
        }

        match parse_frame::<TurnRequest>(payload) {
            InboundFrame::Heartbeat => {}
            InboundFrame::Request(TurnRequest::Connect { id, password }) => {
                let result = self.connect(addr, &id, &password).await;
                self.conclude(addr, result).await;
            }
            InboundFrame::Invalid => {
                self.send_server(addr, &ServerMessage::error(ErrorReason::InvalidRequest))
                    .await;
            }
            InboundFrame::Opaque => self.forward(addr, payload).await,
        }
    }

    async fn conclude(&mut self, addr: SocketAddr, result: Result<Outcome, TurnError>) {
        match result {
            Ok(outcome) => {
                self.send_server(addr, &outcome.reply).await;
                for (peer, message) in outcome.notices {
                    self.send_server(peer, &message).await;
                }
            }
            Err(err) => {
                if err.is_internal() {
                    error!(target: "turn.engine", client = %addr, error = %err, "Request failed internally");
                } else {
                    debug!(target: "turn.engine", client = %addr, error = %err, "Request rejected");
                }
                self.send_server(addr, &ServerMessage::error(err.reason()))
                    .await;
            }
        }
    }

    /// `connect`: admit the source address into the pairing for its
    /// meeting and cross-link the peer fields.
    async fn connect(
        &mut self,
        addr: SocketAddr,
        id: &MeetingId,
        password: &str,
    ) -> Result<Outcome, TurnError> {
        if let Some(client) = self.clients.get(&addr) {
            let members = self.pairings.get(&client.meeting).map_or(0, Vec::len);
            return Err(if members > 1 {
                TurnError::AlreadyPaired
            } else {
                TurnError::WaitingForPeer
            });
        }

        let record = self
            .directory
            .get(id)
            .await?
            .ok_or(TurnError::UnknownMeeting)?;
        if record.password != password {
            return Err(TurnError::WrongPassword);
        }
        if !record.admits(addr.ip()) {
            return Err(TurnError::UnknownParticipant);
        }
        if self.pairings.get(id).map_or(0, Vec::len) > 1 {
            return Err(TurnError::PairingFull);
        }

        let members = self.pairings.entry(id.clone()).or_default();
        let earlier = members.first().copied();
        members.push(addr);

        self.clients.insert(
            addr,
            ClientRecord {
                ttl: CLIENT_TTL,
                meeting: id.clone(),
                peer: earlier,
            },
        );
        if let Some(peer) = earlier {
            if let Some(peer_record) = self.clients.get_mut(&peer) {
                peer_record.peer = Some(addr);
            }
        }

        info!(
            target: "turn.engine",
            client = %addr,
            meeting_id = %id,
            waiting = earlier.is_none(),
            "Client paired"
        );

        let mut outcome = Outcome::reply(ServerMessage::paired(earlier.is_none()));
        if let Some(peer) = earlier {
            outcome = outcome.with_notice(peer, ServerMessage::info(EventKind::Connected));
        }
        Ok(outcome)
    }

    /// Forward a media datagram to the counterparty, tagged `C`.
    async fn forward(&mut self, addr: SocketAddr, payload: &Bytes) {
        let Some(client) = self.clients.get(&addr) else {
            // Unknown sources must introduce themselves with `connect`.
            self.send_server(addr, &ServerMessage::error(ErrorReason::InvalidRequest))
                .await;
            return;
        };

        match client.peer {
            None => {
                self.send_server(addr, &ServerMessage::error(ErrorReason::PeerNotConnected))
                    .await;
            }
            Some(peer) => {
                if self.send_raw(peer, &tag_peer_payload(payload)).await.is_err() {
                    warn!(target: "turn.engine", peer = %peer, "Forward failed; evicting peer");
                    self.evict(peer, "transport failure").await;
                }
            }
        }
    }

    /// Remove `addr` from the pairing for `id`. Returns the surviving
    /// member; an emptied pairing is dropped.
    fn unpair(&mut self, id: &MeetingId, addr: SocketAddr) -> Option<SocketAddr> {
        let members = self.pairings.get_mut(id)?;
        members.retain(|m| *m != addr);
        let survivor = members.first().copied();
        if members.is_empty() {
            self.pairings.remove(id);
        }
        survivor
    }

    async fn send_raw(&self, addr: SocketAddr, frame: &[u8]) -> std::io::Result<()> {
        self.socket.send_to(frame, addr).await.map(|_| ())
    }

    /// Send a server-originated JSON datagram (tagged `S`), evicting the
    /// target on a transport error.
    async fn send_server(&mut self, addr: SocketAddr, message: &ServerMessage) {
        if self
            .send_raw(addr, &message.encode_tagged(ORIGIN_SERVER))
            .await
            .is_err()
        {
            warn!(target: "turn.engine", client = %addr, "Send failed; evicting");
            self.evict(addr, "transport failure").await;
        }
    }

    /// Evict `addr` and everything a failed peer notification drags along.
    /// Returns the number of clients removed.
    async fn evict(&mut self, addr: SocketAddr, cause: &str) -> usize {
        let mut evicted = 0;
        let mut next = Some(addr);
        while let Some(victim) = next.take() {
            if self.clients.contains_key(&victim) {
                next = self.evict_one(victim, cause).await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove one client, unlink and notify the surviving peer with
    /// `left`. Returns the peer if notifying it failed.
    async fn evict_one(&mut self, addr: SocketAddr, cause: &str) -> Option<SocketAddr> {
        let client = self.clients.remove(&addr)?;
        info!(target: "turn.engine", client = %addr, cause, "Client disconnected");

        let survivor = self.unpair(&client.meeting, addr)?;
        if let Some(peer_record) = self.clients.get_mut(&survivor) {
            peer_record.peer = None;
        }

        let frame = ServerMessage::info(EventKind::Left).encode_tagged(ORIGIN_SERVER);
        if self.send_raw(survivor, &frame).await.is_err() {
            return Some(survivor);
        }
        None
    }

    /// One liveness tick: evict the exhausted, heartbeat the rest. The
    /// token goes out bare - no origin tag.
    async fn sweep_clients(&mut self) {
        let snapshot: Vec<SocketAddr> = self.clients.keys().copied().collect();
        let mut evicted = 0;

        for addr in snapshot {
            let Some(client) = self.clients.get_mut(&addr) else {
                continue;
            };
            if client.ttl == 0 {
                evicted += self.evict(addr, "missed heartbeats").await;
            } else {
                client.ttl -= 1;
                if self.send_raw(addr, HEARTBEAT).await.is_err() {
                    evicted += self.evict(addr, "transport failure").await;
                }
            }
        }

        if evicted > 0 {
            info!(target: "turn.task.reaper", evicted, "Reaped dead clients");
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use meeting_directory::memory::MemoryDirectory;
    use meeting_directory::MirrorRecord;
    use serde_json::{json, Value};
    use std::time::Duration;

    const MEETING: &str = "123456789";
    const PASSWORD: &str = "aB3dE6gH9jK2";

    struct TestPeer {
        socket: UdpSocket,
        addr: SocketAddr,
    }

    impl TestPeer {
        async fn bind() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = socket.local_addr().unwrap();
            Self { socket, addr }
        }

        async fn recv(&self) -> Vec<u8> {
            let mut buf = [0u8; 2048];
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for a datagram")
                .unwrap();
            buf[..n].to_vec()
        }

        /// Datagram tagged `S`, decoded as JSON.
        async fn recv_server_json(&self) -> Value {
            let datagram = self.recv().await;
            assert_eq!(datagram.first(), Some(&b'S'), "expected a server-tagged datagram");
            serde_json::from_slice(&datagram[1..]).expect("server datagram should be JSON")
        }

        async fn expect_silence(&self) {
            let mut buf = [0u8; 2048];
            let received =
                tokio::time::timeout(Duration::from_millis(100), self.socket.recv_from(&mut buf))
                    .await;
            assert!(received.is_err(), "unexpected datagram");
        }
    }

    async fn engine_with_ips(ips: &[&str]) -> TurnEngine<MemoryDirectory> {
        let directory = MemoryDirectory::new().with_record(
            MeetingId::from(MEETING),
            MirrorRecord::new(
                PASSWORD,
                ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            ),
        );
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (_tx, rx) = mpsc::channel(8);
        TurnEngine::new(rx, directory, socket, CancellationToken::new())
    }

    async fn seeded_engine() -> TurnEngine<MemoryDirectory> {
        engine_with_ips(&["127.0.0.1"]).await
    }

    async fn send(engine: &mut TurnEngine<MemoryDirectory>, peer: &TestPeer, raw: &[u8]) {
        engine
            .handle_event(Event::Datagram {
                addr: peer.addr,
                payload: Bytes::copy_from_slice(raw),
            })
            .await;
    }

    fn connect_frame(id: &str, password: &str) -> Vec<u8> {
        format!(r#"{{"request":"connect","id":"{id}","password":"{password}"}}"#).into_bytes()
    }

    async fn pair_both(engine: &mut TurnEngine<MemoryDirectory>) -> (TestPeer, TestPeer) {
        let a = TestPeer::bind().await;
        let b = TestPeer::bind().await;

        send(engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            a.recv_server_json().await,
            json!({"response":"success","waiting":true})
        );

        send(engine, &b, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            b.recv_server_json().await,
            json!({"response":"success","waiting":false})
        );
        assert_eq!(
            a.recv_server_json().await,
            json!({"response":"info","type":"connected"})
        );

        (a, b)
    }

    #[tokio::test]
    async fn test_admission_cross_links_peers() {
        let mut engine = seeded_engine().await;
        let (a, b) = pair_both(&mut engine).await;

        assert_eq!(engine.clients[&a.addr].peer, Some(b.addr));
        assert_eq!(engine.clients[&b.addr].peer, Some(a.addr));
    }

    #[tokio::test]
    async fn test_datagrams_cross_with_origin_tags() {
        let mut engine = seeded_engine().await;
        let (a, b) = pair_both(&mut engine).await;

        // S6: opaque X arrives at the peer as CX.
        send(&mut engine, &a, b"X").await;
        assert_eq!(b.recv().await, b"CX");

        send(&mut engine, &b, b"\x00\x01binary media\xff").await;
        assert_eq!(a.recv().await, b"C\x00\x01binary media\xff");
    }

    #[tokio::test]
    async fn test_forward_without_peer() {
        let mut engine = seeded_engine().await;
        let a = TestPeer::bind().await;

        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        a.recv_server_json().await;

        send(&mut engine, &a, b"media").await;
        assert_eq!(
            a.recv_server_json().await,
            json!({"response":"error","reason":"The other user is not connected yet."})
        );
    }

    #[tokio::test]
    async fn test_unknown_source_must_connect_first() {
        let mut engine = seeded_engine().await;
        let x = TestPeer::bind().await;

        send(&mut engine, &x, b"media").await;
        assert_eq!(
            x.recv_server_json().await,
            json!({"response":"error","reason":"Invalid request"})
        );

        // A malformed request object gets the same answer.
        send(&mut engine, &x, br#"{"request":"connect","id":"123456789"}"#).await;
        assert_eq!(
            x.recv_server_json().await,
            json!({"response":"error","reason":"Invalid request"})
        );
    }

    #[tokio::test]
    async fn test_admission_rejections() {
        let mut engine = seeded_engine().await;
        let a = TestPeer::bind().await;

        send(&mut engine, &a, &connect_frame("000000000", PASSWORD)).await;
        assert_eq!(
            a.recv_server_json().await,
            json!({"response":"error","reason":"An invalid meeting ID was entered"})
        );

        send(&mut engine, &a, &connect_frame(MEETING, "bad")).await;
        assert_eq!(
            a.recv_server_json().await,
            json!({"response":"error","reason":"The password for this meeting is incorrect"})
        );
    }

    #[tokio::test]
    async fn test_foreign_ip_is_rejected() {
        let mut engine = engine_with_ips(&["10.1.2.3"]).await;
        let a = TestPeer::bind().await;

        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            a.recv_server_json().await,
            json!({
                "response":"error",
                "reason":"This IP address is not connected to this meeting via the Signaling service"
            })
        );
    }

    #[tokio::test]
    async fn test_full_pairing_rejects_a_third_source() {
        let mut engine = seeded_engine().await;
        let (_a, _b) = pair_both(&mut engine).await;

        let c = TestPeer::bind().await;
        send(&mut engine, &c, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            c.recv_server_json().await,
            json!({"response":"error","reason":"This meeting is full"})
        );
    }

    #[tokio::test]
    async fn test_reconnect_reports_pairing_state() {
        let mut engine = seeded_engine().await;
        let a = TestPeer::bind().await;

        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        a.recv_server_json().await;

        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            a.recv_server_json().await,
            json!({"response":"error","reason":"You're waiting for a peer"})
        );

        let b = TestPeer::bind().await;
        send(&mut engine, &b, &connect_frame(MEETING, PASSWORD)).await;
        b.recv_server_json().await;
        a.recv_server_json().await;

        send(&mut engine, &b, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            b.recv_server_json().await,
            json!({"response":"error","reason":"You already have a connected peer"})
        );
    }

    #[tokio::test]
    async fn test_heartbeats_go_out_bare_and_reset_ttl() {
        let mut engine = seeded_engine().await;
        let a = TestPeer::bind().await;

        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        a.recv_server_json().await;

        // Two sweeps drain the TTL; the token carries no origin tag.
        engine.handle_event(Event::Sweep).await;
        assert_eq!(a.recv().await, b"HEARTBEAT");
        engine.handle_event(Event::Sweep).await;
        assert_eq!(a.recv().await, b"HEARTBEAT");

        // An echo restores full health; no response comes back.
        send(&mut engine, &a, b"HEARTBEAT").await;
        a.expect_silence().await;

        engine.handle_event(Event::Sweep).await;
        assert!(engine.clients.contains_key(&a.addr));
    }

    #[tokio::test]
    async fn test_silent_client_is_reaped_and_peer_unlinked() {
        let mut engine = seeded_engine().await;
        let (a, b) = pair_both(&mut engine).await;

        // B keeps echoing, A goes silent.
        for _ in 0..3 {
            engine.handle_event(Event::Sweep).await;
            send(&mut engine, &b, b"HEARTBEAT").await;
        }

        assert!(!engine.clients.contains_key(&a.addr));
        assert_eq!(engine.clients[&b.addr].peer, None);
        assert_eq!(engine.pairings[&MeetingId::from(MEETING)], vec![b.addr]);

        // B drains heartbeats until the departure notice shows up.
        let mut saw_left = false;
        for _ in 0..8 {
            let datagram = b.recv().await;
            if datagram.first() == Some(&b'S') {
                let value: Value = serde_json::from_slice(&datagram[1..]).unwrap();
                if value == json!({"response":"info","type":"left"}) {
                    saw_left = true;
                    break;
                }
            }
        }
        assert!(saw_left, "survivor should hear a left notification");

        // With the link gone, media bounces.
        send(&mut engine, &b, b"media").await;
        let mut saw_error = false;
        for _ in 0..8 {
            let datagram = b.recv().await;
            if datagram.first() == Some(&b'S') {
                let value: Value = serde_json::from_slice(&datagram[1..]).unwrap();
                if value
                    == json!({"response":"error","reason":"The other user is not connected yet."})
                {
                    saw_error = true;
                    break;
                }
            }
        }
        assert!(saw_error);
    }
}
