//! ICE broker engine.
//!
//! One actor task owns the client and pairing tables; session events and
//! reaper ticks arrive through the mailbox. Admission is authorized
//! against the directory mirror written by Signaling - the broker never
//! trusts its own state for membership, only for pairing bookkeeping.
//!
//! # Forwarding
//!
//! After a successful pairing, any frame that is not a JSON object request
//! is an opaque candidate payload and is relayed verbatim to the peer,
//! prefixed with the single origin-tag byte `C`. Server frames on this
//! stream transport are plain JSON with no tag.

use crate::errors::IceError;

use bytes::Bytes;
use common::net::{SessionEvent, SessionHandle};
use common::protocol::{
    parse_frame, tag_peer_payload, ErrorReason, EventKind, IceRequest, InboundFrame,
    ServerMessage, CLIENT_TTL, HEARTBEAT,
};
use common::types::MeetingId;
use meeting_directory::Directory;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mailbox messages for the ICE engine.
#[derive(Debug)]
pub enum Event {
    /// Connection activity.
    Session(SessionEvent),
    /// Client liveness sweep tick.
    Sweep,
}

impl From<SessionEvent> for Event {
    fn from(event: SessionEvent) -> Self {
        Event::Session(event)
    }
}

#[derive(Debug)]
struct ClientRecord {
    handle: SessionHandle,
    ttl: u8,
    /// Set once the client is admitted into a pairing.
    pairing: Option<MeetingId>,
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

/// The ICE broker actor.
pub struct IceEngine<D> {
    events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    clients: HashMap<SocketAddr, ClientRecord>,
    /// Per-meeting pairing list, one or two members. Distinct from
    /// Signaling's participant list: a client appears here only after
    /// connecting to the broker.
    pairings: HashMap<MeetingId, Vec<SocketAddr>>,
    directory: D,
}

impl<D: Directory> IceEngine<D> {
    /// Build an engine reading from `events`.
    #[must_use]
    pub fn new(events: mpsc::Receiver<Event>, directory: D, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            clients: HashMap::new(),
            pairings: HashMap::new(),
            directory,
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

        info!(target: "ice.engine", "Engine stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Session(SessionEvent::Opened { addr, handle }) => self.on_opened(addr, handle),
            Event::Session(SessionEvent::Frame { addr, payload }) => {
                self.on_frame(addr, &payload).await;
            }
            Event::Session(SessionEvent::Closed { addr }) => {
                self.evict(addr, "connection closed");
            }
            Event::Sweep => self.sweep_clients(),
        }
    }

    fn on_opened(&mut self, addr: SocketAddr, handle: SessionHandle) {
        debug!(target: "ice.engine", client = %addr, "Client connected");
        self.clients.insert(
            addr,
            ClientRecord {
                handle,
                ttl: CLIENT_TTL,
                pairing: None,
            },
        );
    }

    async fn on_frame(&mut self, addr: SocketAddr, payload: &Bytes) {
        let Some(client) = self.clients.get_mut(&addr) else {
            return;
        };
        client.ttl = CLIENT_TTL;

        match parse_frame::<IceRequest>(payload) {
            InboundFrame::Heartbeat => {}
            InboundFrame::Request(IceRequest::Connect { id, password }) => {
                let result = self.connect(addr, &id, &password).await;
                self.conclude(addr, result);
            }
            InboundFrame::Request(IceRequest::Disconnect) => {
                let result = self.disconnect(addr);
                self.conclude(addr, result);
            }
            InboundFrame::Invalid => {
                self.deliver(addr, &ServerMessage::error(ErrorReason::InvalidRequest));
            }
            InboundFrame::Opaque => self.relay(addr, payload),
        }
    }

    fn conclude(&mut self, addr: SocketAddr, result: Result<Outcome, IceError>) {
        match result {
            Ok(outcome) => {
                self.deliver(addr, &outcome.reply);
                for (peer, message) in outcome.notices {
                    self.deliver(peer, &message);
                }
            }
            Err(err) => {
                if err.is_internal() {
                    error!(target: "ice.engine", client = %addr, error = %err, "Request failed internally");
                } else {
                    debug!(target: "ice.engine", client = %addr, error = %err, "Request rejected");
                }
                self.deliver(addr, &ServerMessage::error(err.reason()));
            }
        }
    }

    /// `connect`: admit the caller into the pairing for its meeting.
    async fn connect(
        &mut self,
        addr: SocketAddr,
        id: &MeetingId,
        password: &str,
    ) -> Result<Outcome, IceError> {
        // A caller that already sits in a pairing only learns which state
        // it is in; re-admission is not a thing.
        {
            let Some(client) = self.clients.get(&addr) else {
                return Err(IceError::NotConnected);
            };
            if let Some(current) = &client.pairing {
                let members = self.pairings.get(current).map_or(0, Vec::len);
                return Err(if members > 1 {
                    IceError::AlreadyPaired
                } else {
                    IceError::WaitingForPeer
                });
            }
        }

        let record = self
            .directory
            .get(id)
            .await?
            .ok_or(IceError::UnknownMeeting)?;
        if record.password != password {
            return Err(IceError::WrongPassword);
        }
        if !record.admits(addr.ip()) {
            return Err(IceError::UnknownParticipant);
        }
        if self.pairings.get(id).map_or(0, Vec::len) > 1 {
            return Err(IceError::PairingFull);
        }

        let members = self.pairings.entry(id.clone()).or_default();
        let earlier = members.first().copied();
        members.push(addr);

        if let Some(client) = self.clients.get_mut(&addr) {
            client.pairing = Some(id.clone());
        }

        info!(
            target: "ice.engine",
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

    /// `disconnect`: leave the pairing, keeping it alive for the peer so a
    /// rejoining client can find them again.
    fn disconnect(&mut self, addr: SocketAddr) -> Result<Outcome, IceError> {
        let Some(client) = self.clients.get_mut(&addr) else {
            return Err(IceError::NotConnected);
        };
        let Some(id) = client.pairing.take() else {
            return Err(IceError::NotConnected);
        };

        let survivor = self.unpair(&id, addr);
        info!(target: "ice.engine", client = %addr, meeting_id = %id, "Client unpaired");

        let mut outcome = Outcome::reply(ServerMessage::ack());
        if let Some(peer) = survivor {
            outcome = outcome.with_notice(peer, ServerMessage::info(EventKind::Disconnected));
        }
        Ok(outcome)
    }

    /// Relay an opaque candidate frame to the paired peer, tagged with the
    /// counterparty origin byte.
    fn relay(&mut self, addr: SocketAddr, payload: &Bytes) {
        let Some(client) = self.clients.get(&addr) else {
            return;
        };
        let Some(id) = client.pairing.clone() else {
            // Not admitted into any meeting here.
            self.deliver(addr, &ServerMessage::error(ErrorReason::UnknownParticipant));
            return;
        };

        let peer = self
            .pairings
            .get(&id)
            .and_then(|members| members.iter().find(|m| **m != addr).copied());
        let Some(peer) = peer else {
            self.deliver(addr, &ServerMessage::error(ErrorReason::WaitingForPeer));
            return;
        };

        let Some(peer_record) = self.clients.get(&peer) else {
            return;
        };
        if peer_record.handle.send(tag_peer_payload(payload)).is_err() {
            warn!(target: "ice.engine", peer = %peer, "Relay failed; evicting peer");
            self.evict(peer, "transport failure");
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

    /// Send `message`, evicting the client on transport failure.
    fn deliver(&mut self, addr: SocketAddr, message: &ServerMessage) {
        let Some(client) = self.clients.get(&addr) else {
            return;
        };
        if client.handle.send(message.encode()).is_err() {
            warn!(target: "ice.engine", client = %addr, "Send failed; evicting");
            self.evict(addr, "transport failure");
        }
    }

    /// Evict `addr` and everything a failed peer notification drags along.
    /// Returns the number of clients removed.
    fn evict(&mut self, addr: SocketAddr, cause: &str) -> usize {
        let mut evicted = 0;
        let mut next = Some(addr);
        while let Some(victim) = next.take() {
            if self.clients.contains_key(&victim) {
                next = self.evict_one(victim, cause);
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove one client; an abrupt departure notifies the surviving peer
    /// with `left` (unlike an explicit `disconnect`). Returns the peer if
    /// notifying it failed.
    fn evict_one(&mut self, addr: SocketAddr, cause: &str) -> Option<SocketAddr> {
        let client = self.clients.remove(&addr)?;
        client.handle.close();
        info!(target: "ice.engine", client = %addr, cause, "Client disconnected");

        let id = client.pairing?;
        let peer = self.unpair(&id, addr)?;
        let peer_record = self.clients.get(&peer)?;
        if peer_record
            .handle
            .send(ServerMessage::info(EventKind::Left).encode())
            .is_err()
        {
            return Some(peer);
        }
        None
    }

    /// One liveness tick: evict the exhausted, heartbeat the rest.
    fn sweep_clients(&mut self) {
        let snapshot: Vec<SocketAddr> = self.clients.keys().copied().collect();
        let mut evicted = 0;

        for addr in snapshot {
            let Some(client) = self.clients.get_mut(&addr) else {
                continue;
            };
            if client.ttl == 0 {
                evicted += self.evict(addr, "missed heartbeats");
            } else {
                client.ttl -= 1;
                if client.handle.send(Bytes::from_static(HEARTBEAT)).is_err() {
                    evicted += self.evict(addr, "transport failure");
                }
            }
        }

        if evicted > 0 {
            info!(target: "ice.task.reaper", evicted, "Reaped dead clients");
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

    const MEETING: &str = "123456789";
    const PASSWORD: &str = "aB3dE6gH9jK2";

    struct TestClient {
        addr: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
        session: CancellationToken,
    }

    impl TestClient {
        fn recv_json(&mut self) -> Value {
            let frame = self.rx.try_recv().expect("expected a frame");
            serde_json::from_slice(&frame).expect("frame should be JSON")
        }

        fn recv_raw(&mut self) -> Bytes {
            self.rx.try_recv().expect("expected a frame")
        }

        fn no_frame(&mut self) {
            assert!(self.rx.try_recv().is_err(), "unexpected frame queued");
        }
    }

    fn seeded_engine() -> IceEngine<MemoryDirectory> {
        let directory = MemoryDirectory::new().with_record(
            MeetingId::from(MEETING),
            MirrorRecord::new(
                PASSWORD,
                vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
            ),
        );
        let (_tx, rx) = mpsc::channel(8);
        IceEngine::new(rx, directory, CancellationToken::new())
    }

    async fn open(engine: &mut IceEngine<MemoryDirectory>, addr: &str) -> TestClient {
        let addr: SocketAddr = addr.parse().unwrap();
        let (tx, rx) = mpsc::channel(32);
        let session = CancellationToken::new();
        engine
            .handle_event(Event::Session(SessionEvent::Opened {
                addr,
                handle: SessionHandle::new(tx, session.clone()),
            }))
            .await;
        TestClient { addr, rx, session }
    }

    async fn send(engine: &mut IceEngine<MemoryDirectory>, client: &TestClient, raw: &[u8]) {
        engine
            .handle_event(Event::Session(SessionEvent::Frame {
                addr: client.addr,
                payload: Bytes::copy_from_slice(raw),
            }))
            .await;
    }

    fn connect_frame(id: &str, password: &str) -> Vec<u8> {
        format!(r#"{{"request":"connect","id":"{id}","password":"{password}"}}"#).into_bytes()
    }

    async fn pair_both(
        engine: &mut IceEngine<MemoryDirectory>,
    ) -> (TestClient, TestClient) {
        let mut a = open(engine, "10.0.0.1:4000").await;
        let mut b = open(engine, "10.0.0.2:5000").await;

        send(engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"success","waiting":true})
        );

        send(engine, &b, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            b.recv_json(),
            json!({"response":"success","waiting":false})
        );
        assert_eq!(a.recv_json(), json!({"response":"info","type":"connected"}));

        (a, b)
    }

    #[tokio::test]
    async fn test_admission_pairs_two_clients() {
        let mut engine = seeded_engine();
        let (_a, _b) = pair_both(&mut engine).await;
        assert_eq!(
            engine.pairings[&MeetingId::from(MEETING)].len(),
            2
        );
    }

    #[tokio::test]
    async fn test_unknown_meeting_is_rejected() {
        let mut engine = seeded_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        send(&mut engine, &a, &connect_frame("000000000", PASSWORD)).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"An invalid meeting ID was entered"})
        );
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let mut engine = seeded_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        send(&mut engine, &a, &connect_frame(MEETING, "bad")).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"The password for this meeting is incorrect"})
        );
    }

    #[tokio::test]
    async fn test_foreign_ip_is_rejected() {
        let mut engine = seeded_engine();
        let mut x = open(&mut engine, "10.9.9.9:4000").await;

        send(&mut engine, &x, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            x.recv_json(),
            json!({
                "response":"error",
                "reason":"This IP address is not connected to this meeting via the Signaling service"
            })
        );
    }

    #[tokio::test]
    async fn test_full_pairing_rejects_a_third_socket() {
        let mut engine = seeded_engine();
        let (_a, _b) = pair_both(&mut engine).await;

        // Same authorized IP, different socket: the pairing has no room.
        let mut c = open(&mut engine, "10.0.0.1:6000").await;
        send(&mut engine, &c, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            c.recv_json(),
            json!({"response":"error","reason":"This meeting is full"})
        );
    }

    #[tokio::test]
    async fn test_reconnect_reports_pairing_state() {
        let mut engine = seeded_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        a.recv_json();

        // Waiting alone.
        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"You're waiting for a peer"})
        );

        let mut b = open(&mut engine, "10.0.0.2:5000").await;
        send(&mut engine, &b, &connect_frame(MEETING, PASSWORD)).await;
        b.recv_json();
        a.recv_json();

        // Fully paired now.
        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"You already have a connected peer"})
        );
    }

    #[tokio::test]
    async fn test_candidate_frames_are_relayed_with_origin_tag() {
        let mut engine = seeded_engine();
        let (a, mut b) = pair_both(&mut engine).await;

        send(&mut engine, &a, b"IP10.0.0.127").await;
        assert_eq!(b.recv_raw(), Bytes::from_static(b"CIP10.0.0.127"));

        // JSON that is not an object is still peer-bound.
        send(&mut engine, &a, b"[1,2,3]").await;
        assert_eq!(b.recv_raw(), Bytes::from_static(b"C[1,2,3]"));
    }

    #[tokio::test]
    async fn test_opaque_frame_from_unpaired_client() {
        let mut engine = seeded_engine();
        let mut x = open(&mut engine, "10.9.9.9:4000").await;

        send(&mut engine, &x, b"IP10.0.0.127").await;
        assert_eq!(
            x.recv_json(),
            json!({
                "response":"error",
                "reason":"This IP address is not connected to this meeting via the Signaling service"
            })
        );
    }

    #[tokio::test]
    async fn test_opaque_frame_while_waiting() {
        let mut engine = seeded_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        a.recv_json();

        send(&mut engine, &a, b"candidate").await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"You're waiting for a peer"})
        );
    }

    #[tokio::test]
    async fn test_disconnect_keeps_pairing_for_survivor() {
        let mut engine = seeded_engine();
        let (mut a, mut b) = pair_both(&mut engine).await;

        send(&mut engine, &a, br#"{"request":"disconnect"}"#).await;
        assert_eq!(a.recv_json(), json!({"response":"success"}));
        assert_eq!(
            b.recv_json(),
            json!({"response":"info","type":"disconnected"})
        );

        // B still holds the pairing; A can come back.
        assert_eq!(engine.pairings[&MeetingId::from(MEETING)], vec![b.addr]);
        send(&mut engine, &a, &connect_frame(MEETING, PASSWORD)).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"success","waiting":false})
        );
        assert_eq!(b.recv_json(), json!({"response":"info","type":"connected"}));
    }

    #[tokio::test]
    async fn test_disconnect_without_pairing() {
        let mut engine = seeded_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        send(&mut engine, &a, br#"{"request":"disconnect"}"#).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"You're not connected"})
        );
    }

    #[tokio::test]
    async fn test_invalid_object_request() {
        let mut engine = seeded_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        // Missing password: a JSON object, so not peer-bound.
        send(&mut engine, &a, br#"{"request":"connect","id":"123456789"}"#).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"Invalid request"})
        );
    }

    #[tokio::test]
    async fn test_silent_client_eviction_notifies_peer_with_left() {
        let mut engine = seeded_engine();
        let (a, mut b) = pair_both(&mut engine).await;

        // B keeps echoing, A goes silent.
        for _ in 0..3 {
            engine.handle_event(Event::Sweep).await;
            send(&mut engine, &b, HEARTBEAT).await;
        }

        assert!(!engine.clients.contains_key(&a.addr));
        assert!(a.session.is_cancelled());

        let mut saw_left = false;
        while let Ok(frame) = b.rx.try_recv() {
            if let Ok(value) = serde_json::from_slice::<Value>(&frame) {
                if value == json!({"response":"info","type":"left"}) {
                    saw_left = true;
                }
            }
        }
        assert!(saw_left, "survivor should hear a left notification");

        // The pairing survives for B.
        assert_eq!(engine.pairings[&MeetingId::from(MEETING)], vec![b.addr]);
    }

    #[tokio::test]
    async fn test_heartbeat_resets_ttl_and_gets_no_reply() {
        let mut engine = seeded_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        engine.handle_event(Event::Sweep).await;
        assert_eq!(a.recv_raw(), Bytes::from_static(b"HEARTBEAT"));
        engine.handle_event(Event::Sweep).await;
        assert_eq!(a.recv_raw(), Bytes::from_static(b"HEARTBEAT"));

        send(&mut engine, &a, HEARTBEAT).await;
        a.no_frame();

        engine.handle_event(Event::Sweep).await;
        assert!(engine.clients.contains_key(&a.addr));
    }

    #[tokio::test]
    async fn test_abrupt_close_of_paired_client() {
        let mut engine = seeded_engine();
        let (a, mut b) = pair_both(&mut engine).await;

        engine
            .handle_event(Event::Session(SessionEvent::Closed { addr: a.addr }))
            .await;

        assert_eq!(b.recv_json(), json!({"response":"info","type":"left"}));
        assert_eq!(engine.pairings[&MeetingId::from(MEETING)], vec![b.addr]);
    }
}
