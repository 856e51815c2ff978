//! Signaling engine.
//!
//! One actor task owns the client and meeting tables. Everything that can
//! mutate them arrives through the mailbox: session events from the
//! acceptor and per-connection readers, and sweep ticks from the reaper
//! tasks. Each mailbox message is one logical critical section, so no
//! locking is needed anywhere.
//!
//! # Liveness
//!
//! Clients carry a TTL of [`CLIENT_TTL`] heartbeat intervals, reset on any
//! inbound frame. The client sweep evicts exhausted clients and heartbeats
//! the rest; the meeting sweep expires meetings that have sat empty for
//! [`EXPIRATION_TICKS`] intervals.
//!
//! # Failure edges
//!
//! A send failure to a client is a transport failure: the client is
//! evicted immediately and its meeting peer (if any) is notified. If that
//! notification fails too, the peer is evicted in the same pass.

use crate::errors::SignalingError;
use crate::meeting::{self, Meeting, Participant, EXPIRATION_TICKS, MAX_PARTICIPANTS};
use crate::mirror::Mirror;

use bytes::Bytes;
use common::net::{SessionEvent, SessionHandle};
use common::protocol::{
    parse_frame, ErrorReason, EventKind, InboundFrame, ServerMessage, SignalingRequest, CLIENT_TTL,
    HEARTBEAT,
};
use common::types::MeetingId;
use meeting_directory::Directory;
use ring::rand::SystemRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts at deriving an unused meeting ID before giving up.
const MAX_ID_ATTEMPTS: usize = 64;

/// Mailbox messages for the signaling engine.
#[derive(Debug)]
pub enum Event {
    /// Connection activity.
    Session(SessionEvent),
    /// Client liveness sweep tick.
    SweepClients,
    /// Meeting expiration sweep tick.
    SweepMeetings,
}

impl From<SessionEvent> for Event {
    fn from(event: SessionEvent) -> Self {
        Event::Session(event)
    }
}

/// Where a client currently stands in the meeting lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Membership {
    Idle,
    Joined(MeetingId),
}

#[derive(Debug)]
struct ClientRecord {
    handle: SessionHandle,
    ttl: u8,
    /// Sticky until the created meeting ends; prevents re-creation abuse.
    created: bool,
    membership: Membership,
}

/// Directory write queued by a command handler, applied before replies go
/// out so the relay services never trail an acknowledged join.
enum MirrorOp {
    Publish(MeetingId),
    Withdraw(MeetingId),
}

/// Response to the caller plus side notifications to other clients.
struct Outcome {
    reply: ServerMessage,
    notices: Vec<(SocketAddr, ServerMessage)>,
    mirror_ops: Vec<MirrorOp>,
}

impl Outcome {
    fn reply(reply: ServerMessage) -> Self {
        Self {
            reply,
            notices: Vec::new(),
            mirror_ops: Vec::new(),
        }
    }

    fn with_notice(mut self, peer: SocketAddr, message: ServerMessage) -> Self {
        self.notices.push((peer, message));
        self
    }

    fn with_publish(mut self, id: MeetingId) -> Self {
        self.mirror_ops.push(MirrorOp::Publish(id));
        self
    }

    fn with_withdraw(mut self, id: MeetingId) -> Self {
        self.mirror_ops.push(MirrorOp::Withdraw(id));
        self
    }
}

/// The signaling actor.
pub struct SignalingEngine<D> {
    events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
    clients: HashMap<SocketAddr, ClientRecord>,
    meetings: HashMap<MeetingId, Meeting>,
    mirror: Mirror<D>,
    rng: SystemRandom,
}

impl<D: Directory> SignalingEngine<D> {
    /// Build an engine reading from `events`.
    #[must_use]
    pub fn new(
        events: mpsc::Receiver<Event>,
        mirror: Mirror<D>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            cancel,
            clients: HashMap::new(),
            meetings: HashMap::new(),
            mirror,
            rng: SystemRandom::new(),
        }
    }

    /// Run until cancelled or the mailbox closes. Flushes the directory
    /// namespace on the way out (clean shutdown).
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

        self.mirror.flush().await;
        info!(target: "signaling.engine", "Engine stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Session(SessionEvent::Opened { addr, handle }) => self.on_opened(addr, handle),
            Event::Session(SessionEvent::Frame { addr, payload }) => {
                self.on_frame(addr, &payload).await;
            }
            Event::Session(SessionEvent::Closed { addr }) => {
                self.evict(addr, "connection closed").await;
            }
            Event::SweepClients => self.sweep_clients().await,
            Event::SweepMeetings => self.sweep_meetings().await,
        }
    }

    fn on_opened(&mut self, addr: SocketAddr, handle: SessionHandle) {
        debug!(target: "signaling.engine", client = %addr, "Client connected");
        self.clients.insert(
            addr,
            ClientRecord {
                handle,
                ttl: CLIENT_TTL,
                created: false,
                membership: Membership::Idle,
            },
        );
    }

    async fn on_frame(&mut self, addr: SocketAddr, payload: &Bytes) {
        let Some(client) = self.clients.get_mut(&addr) else {
            return;
        };
        // Any frame proves the client is alive.
        client.ttl = CLIENT_TTL;

        match parse_frame::<SignalingRequest>(payload) {
            InboundFrame::Heartbeat => {}
            InboundFrame::Request(request) => self.apply(addr, request).await,
            InboundFrame::Invalid | InboundFrame::Opaque => {
                self.deliver(addr, &ServerMessage::error(ErrorReason::InvalidRequest))
                    .await;
            }
        }
    }

    async fn apply(&mut self, addr: SocketAddr, request: SignalingRequest) {
        let result = match request {
            SignalingRequest::Start => self.start(addr),
            SignalingRequest::Join { id, password } => self.join(addr, &id, &password),
            SignalingRequest::Switch => self.switch(addr),
            SignalingRequest::Leave => self.leave(addr),
            SignalingRequest::End => self.end(addr),
        };

        match result {
            Ok(outcome) => {
                for op in &outcome.mirror_ops {
                    match op {
                        MirrorOp::Publish(id) => self.publish(id).await,
                        MirrorOp::Withdraw(id) => self.mirror.withdraw(id).await,
                    }
                }
                self.deliver(addr, &outcome.reply).await;
                for (peer, message) in outcome.notices {
                    self.deliver(peer, &message).await;
                }
            }
            Err(err) => {
                if err.is_internal() {
                    error!(
                        target: "signaling.engine",
                        client = %addr,
                        error = %err,
                        "Request failed internally"
                    );
                } else {
                    debug!(
                        target: "signaling.engine",
                        client = %addr,
                        error = %err,
                        "Request rejected"
                    );
                }
                self.deliver(addr, &ServerMessage::error(err.reason())).await;
            }
        }
    }

    /// `start`: create a meeting, remember the creator.
    fn start(&mut self, addr: SocketAddr) -> Result<Outcome, SignalingError> {
        {
            let client = self.client(addr)?;
            if matches!(client.membership, Membership::Joined(_)) {
                return Err(SignalingError::AlreadyInMeeting);
            }
            if client.created {
                return Err(SignalingError::AlreadyCreated);
            }
        }

        let id = self.fresh_meeting_id()?;
        let password = meeting::generate_password(&self.rng)?;
        self.meetings
            .insert(id.clone(), Meeting::new(password.clone(), addr));

        if let Some(client) = self.clients.get_mut(&addr) {
            client.created = true;
        }

        info!(target: "signaling.engine", client = %addr, meeting_id = %id, "Meeting created");
        Ok(
            Outcome::reply(ServerMessage::created(id.clone(), password))
                .with_publish(id),
        )
    }

    /// `join`: enter an existing meeting; first joiner becomes host.
    fn join(
        &mut self,
        addr: SocketAddr,
        id: &MeetingId,
        password: &str,
    ) -> Result<Outcome, SignalingError> {
        if matches!(self.client(addr)?.membership, Membership::Joined(_)) {
            return Err(SignalingError::AlreadyInMeeting);
        }

        let meeting = self
            .meetings
            .get_mut(id)
            .ok_or(SignalingError::UnknownMeeting)?;
        if meeting.password != password {
            return Err(SignalingError::WrongPassword);
        }
        if meeting.participants.len() >= MAX_PARTICIPANTS {
            return Err(SignalingError::MeetingFull);
        }

        let earlier = meeting.participants.first().map(|p| p.addr);
        meeting.participants.push(Participant {
            addr,
            host: earlier.is_none(),
        });
        meeting.expiration_ticks = EXPIRATION_TICKS;

        if let Some(client) = self.clients.get_mut(&addr) {
            client.membership = Membership::Joined(id.clone());
        }

        info!(
            target: "signaling.engine",
            client = %addr,
            meeting_id = %id,
            waiting = earlier.is_none(),
            "Participant joined"
        );

        let mut outcome = Outcome::reply(ServerMessage::joined(earlier.is_none()))
            .with_publish(id.clone());
        if let Some(peer) = earlier {
            outcome = outcome.with_notice(peer, ServerMessage::info(EventKind::Connected));
        }
        Ok(outcome)
    }

    /// `switch`: hand the host flag to the other participant.
    fn switch(&mut self, addr: SocketAddr) -> Result<Outcome, SignalingError> {
        let id = self.joined_meeting(addr)?;
        let meeting = self
            .meetings
            .get_mut(&id)
            .ok_or_else(|| SignalingError::TableDrift(format!("meeting {id} missing")))?;

        let caller_is_host = meeting
            .participants
            .iter()
            .any(|p| p.addr == addr && p.host);
        if !caller_is_host {
            return Err(SignalingError::NotHost);
        }
        if meeting.participants.len() < MAX_PARTICIPANTS {
            return Err(SignalingError::AloneInMeeting);
        }

        for participant in &mut meeting.participants {
            participant.host = !participant.host;
        }
        let new_host = meeting
            .host()
            .ok_or_else(|| SignalingError::TableDrift("no host after switch".to_string()))?;

        info!(target: "signaling.engine", meeting_id = %id, new_host = %new_host, "Host switched");
        Ok(Outcome::reply(ServerMessage::done(EventKind::Switched))
            .with_notice(new_host, ServerMessage::info(EventKind::Switched)))
    }

    /// `leave`: exit the meeting; a remaining participant inherits the
    /// host flag.
    fn leave(&mut self, addr: SocketAddr) -> Result<Outcome, SignalingError> {
        let id = self.joined_meeting(addr)?;
        let survivor = self.remove_participant(&id, addr)?;

        if let Some(client) = self.clients.get_mut(&addr) {
            client.membership = Membership::Idle;
        }

        info!(target: "signaling.engine", client = %addr, meeting_id = %id, "Participant left");
        let mut outcome = Outcome::reply(ServerMessage::done(EventKind::Disconnected))
            .with_publish(id.clone());
        if let Some(peer) = survivor {
            outcome = outcome.with_notice(peer, ServerMessage::info(EventKind::Disconnected));
        }
        Ok(outcome)
    }

    /// `end`: host-only; deletes the meeting for both participants.
    fn end(&mut self, addr: SocketAddr) -> Result<Outcome, SignalingError> {
        let id = self.joined_meeting(addr)?;
        {
            let meeting = self
                .meetings
                .get(&id)
                .ok_or_else(|| SignalingError::TableDrift(format!("meeting {id} missing")))?;
            let caller_is_host = meeting
                .participants
                .iter()
                .any(|p| p.addr == addr && p.host);
            if !caller_is_host {
                return Err(SignalingError::NotHost);
            }
        }

        let meeting = self
            .meetings
            .remove(&id)
            .ok_or_else(|| SignalingError::TableDrift(format!("meeting {id} missing")))?;

        let mut outcome =
            Outcome::reply(ServerMessage::done(EventKind::Ended)).with_withdraw(id.clone());
        for participant in &meeting.participants {
            if let Some(client) = self.clients.get_mut(&participant.addr) {
                client.membership = Membership::Idle;
            }
            if participant.addr != addr {
                outcome =
                    outcome.with_notice(participant.addr, ServerMessage::info(EventKind::Ended));
            }
        }
        if let Some(creator) = self.clients.get_mut(&meeting.creator) {
            creator.created = false;
        }

        info!(target: "signaling.engine", meeting_id = %id, "Meeting ended");
        Ok(outcome)
    }

    /// Remove `addr` from the participant list of `id`, promoting the
    /// survivor to host. Returns the survivor.
    fn remove_participant(
        &mut self,
        id: &MeetingId,
        addr: SocketAddr,
    ) -> Result<Option<SocketAddr>, SignalingError> {
        let meeting = self
            .meetings
            .get_mut(id)
            .ok_or_else(|| SignalingError::TableDrift(format!("meeting {id} missing")))?;
        meeting.participants.retain(|p| p.addr != addr);
        Ok(meeting.participants.first_mut().map(|p| {
            p.host = true;
            p.addr
        }))
    }

    fn client(&self, addr: SocketAddr) -> Result<&ClientRecord, SignalingError> {
        self.clients
            .get(&addr)
            .ok_or_else(|| SignalingError::TableDrift(format!("client {addr} missing")))
    }

    fn joined_meeting(&self, addr: SocketAddr) -> Result<MeetingId, SignalingError> {
        match &self.client(addr)?.membership {
            Membership::Joined(id) => Ok(id.clone()),
            Membership::Idle => Err(SignalingError::NotInMeeting),
        }
    }

    fn fresh_meeting_id(&self) -> Result<MeetingId, SignalingError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            if let Some(id) = meeting::derive_meeting_id() {
                if !self.meetings.contains_key(&id) {
                    return Ok(id);
                }
            }
        }
        Err(SignalingError::IdSpaceExhausted)
    }

    /// Publish the current state of `id` to the directory mirror.
    async fn publish(&self, id: &MeetingId) {
        if let Some(meeting) = self.meetings.get(id) {
            self.mirror.publish(id, meeting).await;
        }
    }

    /// Send `message`, evicting the client on transport failure.
    async fn deliver(&mut self, addr: SocketAddr, message: &ServerMessage) {
        let Some(client) = self.clients.get(&addr) else {
            return;
        };
        if client.handle.send(message.encode()).is_err() {
            warn!(target: "signaling.engine", client = %addr, "Send failed; evicting");
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

    /// Remove one client. On meeting membership, behaves like `leave`:
    /// removal, host promotion, `disconnected` notification. Returns the
    /// peer if notifying it failed.
    async fn evict_one(&mut self, addr: SocketAddr, cause: &str) -> Option<SocketAddr> {
        let client = self.clients.remove(&addr)?;
        client.handle.close();
        info!(target: "signaling.engine", client = %addr, cause, "Client disconnected");

        let Membership::Joined(id) = client.membership else {
            return None;
        };
        let survivor = self.remove_participant(&id, addr).ok()?;
        self.publish(&id).await;

        let peer = survivor?;
        let peer_record = self.clients.get(&peer)?;
        if peer_record
            .handle
            .send(ServerMessage::info(EventKind::Disconnected).encode())
            .is_err()
        {
            return Some(peer);
        }
        None
    }

    /// One client liveness tick (period T): evict the exhausted, heartbeat
    /// the rest.
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
                if client.handle.send(Bytes::from_static(HEARTBEAT)).is_err() {
                    evicted += self.evict(addr, "transport failure").await;
                }
            }
        }

        if evicted > 0 {
            info!(target: "signaling.task.reaper", evicted, "Reaped dead clients");
        }
    }

    /// One meeting expiration tick: empty meetings count down and are
    /// deleted at zero, releasing the creator's created flag.
    async fn sweep_meetings(&mut self) {
        let snapshot: Vec<MeetingId> = self.meetings.keys().cloned().collect();
        let mut expired = 0;

        for id in snapshot {
            let Some(meeting) = self.meetings.get_mut(&id) else {
                continue;
            };
            if !meeting.participants.is_empty() {
                continue;
            }
            if meeting.expiration_ticks <= 1 {
                if let Some(meeting) = self.meetings.remove(&id) {
                    if let Some(creator) = self.clients.get_mut(&meeting.creator) {
                        creator.created = false;
                    }
                }
                self.mirror.withdraw(&id).await;
                expired += 1;
            } else {
                meeting.expiration_ticks -= 1;
            }
        }

        if expired > 0 {
            info!(target: "signaling.task.reaper", expired, "Expired empty meetings");
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
    use serde_json::{json, Value};

    struct TestClient {
        addr: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
        session: CancellationToken,
    }

    impl TestClient {
        /// Next frame pushed to this client, decoded as JSON.
        fn recv_json(&mut self) -> Value {
            let frame = self.rx.try_recv().expect("expected a frame");
            serde_json::from_slice(&frame).expect("frame should be JSON")
        }

        /// Next frame pushed to this client, raw.
        fn recv_raw(&mut self) -> Bytes {
            self.rx.try_recv().expect("expected a frame")
        }

        fn no_frame(&mut self) {
            assert!(self.rx.try_recv().is_err(), "unexpected frame queued");
        }
    }

    fn test_engine() -> (SignalingEngine<MemoryDirectory>, MemoryDirectory) {
        let directory = MemoryDirectory::new();
        let (_tx, rx) = mpsc::channel(8);
        let engine = SignalingEngine::new(
            rx,
            Mirror::enabled(directory.clone()),
            CancellationToken::new(),
        );
        (engine, directory)
    }

    async fn open(engine: &mut SignalingEngine<MemoryDirectory>, addr: &str) -> TestClient {
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

    async fn send(engine: &mut SignalingEngine<MemoryDirectory>, client: &TestClient, raw: &str) {
        engine
            .handle_event(Event::Session(SessionEvent::Frame {
                addr: client.addr,
                payload: Bytes::copy_from_slice(raw.as_bytes()),
            }))
            .await;
    }

    /// Create a meeting via A and return its credentials.
    async fn start_meeting(
        engine: &mut SignalingEngine<MemoryDirectory>,
        client: &mut TestClient,
    ) -> (String, String) {
        send(engine, client, r#"{"request":"start"}"#).await;
        let reply = client.recv_json();
        assert_eq!(reply["response"], "success");
        assert_eq!(reply["type"], "created");
        let id = reply["id"].as_str().unwrap().to_string();
        let password = reply["password"].as_str().unwrap().to_string();
        (id, password)
    }

    fn join_frame(id: &str, password: &str) -> String {
        format!(r#"{{"request":"join","id":"{id}","password":"{password}"}}"#)
    }

    #[tokio::test]
    async fn test_start_creates_meeting_and_mirror() {
        let (mut engine, directory) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        let (id, password) = start_meeting(&mut engine, &mut a).await;
        assert_eq!(id.len(), 9);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(password.len(), 12);

        // Mirrored with an empty participant list.
        let record = directory
            .get(&MeetingId::from(id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.password, password);
        assert!(record.participants.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, r#"{"request":"start"}"#).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"You've already created a meeting recently"})
        );
    }

    #[tokio::test]
    async fn test_start_while_joined_is_rejected() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();

        send(&mut engine, &b, r#"{"request":"start"}"#).await;
        assert_eq!(
            b.recv_json(),
            json!({"response":"error","reason":"You're already in a meeting"})
        );
    }

    #[tokio::test]
    async fn test_create_and_join_flow() {
        let (mut engine, directory) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:5000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;

        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"success","type":"connected","waiting":true})
        );

        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        assert_eq!(
            b.recv_json(),
            json!({"response":"success","type":"connected","waiting":false})
        );
        // The earlier participant hears about the arrival.
        assert_eq!(a.recv_json(), json!({"response":"info","type":"connected"}));

        // Mirror carries both IPs, ports discarded.
        let record = directory
            .get(&MeetingId::from(id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.participants,
            vec![
                "10.0.0.1".parse::<std::net::IpAddr>().unwrap(),
                "10.0.0.2".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_join_wrong_password() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut c = open(&mut engine, "10.0.0.3:4000").await;

        let (id, _) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &c, &join_frame(&id, "bad")).await;
        assert_eq!(
            c.recv_json(),
            json!({"response":"error","reason":"The password for this meeting is incorrect"})
        );

        // State unchanged: the meeting is still joinable by its creator.
        assert!(engine.meetings.get(&MeetingId::from(id.as_str())).is_some());
    }

    #[tokio::test]
    async fn test_join_unknown_meeting() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        send(&mut engine, &a, &join_frame("000000000", "whatever")).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"An invalid meeting ID was entered"})
        );
    }

    #[tokio::test]
    async fn test_third_joiner_is_rejected() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;
        let mut d = open(&mut engine, "10.0.0.4:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        send(&mut engine, &d, &join_frame(&id, &pw)).await;
        assert_eq!(
            d.recv_json(),
            json!({"response":"error","reason":"This meeting is full"})
        );
    }

    #[tokio::test]
    async fn test_switch_is_an_involution() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        let meeting_id = MeetingId::from(id.as_str());
        assert_eq!(engine.meetings[&meeting_id].host(), Some(a.addr));

        send(&mut engine, &a, r#"{"request":"switch"}"#).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"success","type":"switched"})
        );
        assert_eq!(b.recv_json(), json!({"response":"info","type":"switched"}));
        assert_eq!(engine.meetings[&meeting_id].host(), Some(b.addr));

        // Switching back restores the original host.
        send(&mut engine, &b, r#"{"request":"switch"}"#).await;
        b.recv_json();
        a.recv_json();
        assert_eq!(engine.meetings[&meeting_id].host(), Some(a.addr));
    }

    #[tokio::test]
    async fn test_switch_requires_host() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        send(&mut engine, &b, r#"{"request":"switch"}"#).await;
        assert_eq!(
            b.recv_json(),
            json!({"response":"error","reason":"Insufficient permissions"})
        );
    }

    #[tokio::test]
    async fn test_switch_alone_is_rejected() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();

        send(&mut engine, &a, r#"{"request":"switch"}"#).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"You're alone in this meeting"})
        );
    }

    #[tokio::test]
    async fn test_nonhost_leave_keeps_the_host() {
        let (mut engine, directory) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        send(&mut engine, &b, r#"{"request":"leave"}"#).await;
        assert_eq!(
            b.recv_json(),
            json!({"response":"success","type":"disconnected"})
        );
        assert_eq!(
            a.recv_json(),
            json!({"response":"info","type":"disconnected"})
        );

        let meeting_id = MeetingId::from(id.as_str());
        let meeting = &engine.meetings[&meeting_id];
        assert_eq!(meeting.participants.len(), 1);
        assert_eq!(meeting.host(), Some(a.addr));

        // Mirror shrank with the departure.
        let record = directory.get(&meeting_id).await.unwrap().unwrap();
        assert_eq!(record.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_host_leave_promotes_survivor() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        send(&mut engine, &a, r#"{"request":"leave"}"#).await;
        a.recv_json();
        b.recv_json();

        assert_eq!(
            engine.meetings[&MeetingId::from(id.as_str())].host(),
            Some(b.addr)
        );
    }

    #[tokio::test]
    async fn test_leave_without_meeting() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        send(&mut engine, &a, r#"{"request":"leave"}"#).await;
        assert_eq!(
            a.recv_json(),
            json!({"response":"error","reason":"You're not in a meeting"})
        );
    }

    #[tokio::test]
    async fn test_end_unwinds_everything() {
        let (mut engine, directory) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        send(&mut engine, &a, r#"{"request":"end"}"#).await;
        assert_eq!(a.recv_json(), json!({"response":"success","type":"ended"}));
        assert_eq!(b.recv_json(), json!({"response":"info","type":"ended"}));

        // No leaked records: meeting gone, mirror gone, created flag
        // released, so the same caller can start again.
        let meeting_id = MeetingId::from(id.as_str());
        assert!(engine.meetings.get(&meeting_id).is_none());
        assert!(directory.get(&meeting_id).await.unwrap().is_none());
        start_meeting(&mut engine, &mut a).await;
    }

    #[tokio::test]
    async fn test_end_requires_host() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        send(&mut engine, &b, r#"{"request":"end"}"#).await;
        assert_eq!(
            b.recv_json(),
            json!({"response":"error","reason":"Insufficient permissions"})
        );
        assert!(engine.meetings.contains_key(&MeetingId::from(id.as_str())));
    }

    #[tokio::test]
    async fn test_malformed_frames_get_invalid_request() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        for raw in ["not json", r#"{"no_request":1}"#, r#"{"request":"dance"}"#, "[1,2]"] {
            send(&mut engine, &a, raw).await;
            assert_eq!(
                a.recv_json(),
                json!({"response":"error","reason":"Invalid request"}),
                "for frame {raw:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_heartbeat_resets_ttl() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        // Two sweeps drain the TTL to zero...
        engine.handle_event(Event::SweepClients).await;
        assert_eq!(a.recv_raw(), Bytes::from_static(b"HEARTBEAT"));
        engine.handle_event(Event::SweepClients).await;
        assert_eq!(a.recv_raw(), Bytes::from_static(b"HEARTBEAT"));

        // ...but an echo brings the client back to full health.
        send(&mut engine, &a, "HEARTBEAT").await;
        a.no_frame();

        engine.handle_event(Event::SweepClients).await;
        assert_eq!(a.recv_raw(), Bytes::from_static(b"HEARTBEAT"));
        assert!(engine.clients.contains_key(&a.addr));
    }

    #[tokio::test]
    async fn test_silent_client_is_reaped() {
        let (mut engine, _) = test_engine();
        let a = open(&mut engine, "10.0.0.1:4000").await;

        engine.handle_event(Event::SweepClients).await;
        engine.handle_event(Event::SweepClients).await;
        assert!(engine.clients.contains_key(&a.addr));

        // Third sweep finds the TTL exhausted and closes the transport.
        engine.handle_event(Event::SweepClients).await;
        assert!(!engine.clients.contains_key(&a.addr));
        assert!(a.session.is_cancelled());
    }

    #[tokio::test]
    async fn test_reaped_participant_is_removed_from_meeting() {
        let (mut engine, directory) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        // B goes silent while A keeps echoing heartbeats.
        for _ in 0..3 {
            engine.handle_event(Event::SweepClients).await;
            send(&mut engine, &a, "HEARTBEAT").await;
        }

        assert!(!engine.clients.contains_key(&b.addr));
        let meeting_id = MeetingId::from(id.as_str());
        let meeting = &engine.meetings[&meeting_id];
        assert_eq!(meeting.participants.len(), 1);
        assert_eq!(meeting.host(), Some(a.addr));
        assert_eq!(
            directory.get(&meeting_id).await.unwrap().unwrap().participants.len(),
            1
        );

        // A heard about the departure (after the heartbeats already
        // drained above).
        let mut saw_disconnect = false;
        while let Ok(frame) = a.rx.try_recv() {
            if let Ok(value) = serde_json::from_slice::<Value>(&frame) {
                if value == json!({"response":"info","type":"disconnected"}) {
                    saw_disconnect = true;
                }
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_abrupt_close_behaves_like_leave() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        engine
            .handle_event(Event::Session(SessionEvent::Closed { addr: b.addr }))
            .await;

        assert!(!engine.clients.contains_key(&b.addr));
        assert_eq!(
            a.recv_json(),
            json!({"response":"info","type":"disconnected"})
        );
    }

    #[tokio::test]
    async fn test_failed_peer_notification_cascades() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;
        let mut b = open(&mut engine, "10.0.0.2:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();
        send(&mut engine, &b, &join_frame(&id, &pw)).await;
        b.recv_json();
        a.recv_json();

        // A's transport dies too: replacing the receiver drops the real
        // one, so sends to A now fail.
        a.rx = mpsc::channel(1).1;

        engine
            .handle_event(Event::Session(SessionEvent::Closed { addr: b.addr }))
            .await;

        // Both ends are gone in the same pass.
        assert!(!engine.clients.contains_key(&b.addr));
        assert!(!engine.clients.contains_key(&a.addr));
    }

    #[tokio::test]
    async fn test_empty_meeting_expires_and_releases_creator() {
        let (mut engine, directory) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        let (id, _) = start_meeting(&mut engine, &mut a).await;
        let meeting_id = MeetingId::from(id.as_str());

        // Four ticks count down, the fifth deletes.
        for _ in 0..4 {
            engine.handle_event(Event::SweepMeetings).await;
            assert!(engine.meetings.contains_key(&meeting_id));
        }
        engine.handle_event(Event::SweepMeetings).await;

        assert!(engine.meetings.get(&meeting_id).is_none());
        assert!(directory.get(&meeting_id).await.unwrap().is_none());

        // The creator may start a fresh meeting now.
        start_meeting(&mut engine, &mut a).await;
    }

    #[tokio::test]
    async fn test_occupied_meeting_does_not_expire() {
        let (mut engine, _) = test_engine();
        let mut a = open(&mut engine, "10.0.0.1:4000").await;

        let (id, pw) = start_meeting(&mut engine, &mut a).await;
        send(&mut engine, &a, &join_frame(&id, &pw)).await;
        a.recv_json();

        for _ in 0..10 {
            engine.handle_event(Event::SweepMeetings).await;
        }
        assert!(engine.meetings.contains_key(&MeetingId::from(id.as_str())));
    }
}
