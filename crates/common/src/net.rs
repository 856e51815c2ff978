//! Stream transport plumbing shared by the TCP services.
//!
//! One acceptor task owns the listening socket. Each accepted connection
//! gets a split reader/writer task pair and a [`SessionHandle`] the engine
//! uses to push frames and to close the transport. All inbound activity is
//! funneled into the engine's mailbox as [`SessionEvent`]s, so the engine
//! remains the single owner of its client tables.
//!
//! The reader delivers at most [`MAX_FRAME_LEN`] bytes per frame; clients
//! send one JSON document (or the heartbeat token) per write, so one read
//! is one frame. EOF or a read error becomes a `Closed` event.

use crate::protocol::MAX_FRAME_LEN;
use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound frames buffered per connection before the client is considered
/// too slow to keep.
const OUTBOUND_BUFFER: usize = 256;

/// Failure pushing a frame towards a client.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionSendError {
    /// The connection tasks are gone; the transport is dead.
    #[error("session closed")]
    Closed,
    /// The outbound queue is full; the client is not draining.
    #[error("outbound queue full")]
    Backpressure,
}

/// Engine-side handle to one client connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Build a handle from its parts. Exposed so engine tests can stand in
    /// a plain channel for the writer task.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Bytes>, cancel: CancellationToken) -> Self {
        Self { outbound, cancel }
    }

    /// Queue one frame for the client without blocking the engine.
    ///
    /// # Errors
    ///
    /// [`SessionSendError::Closed`] when the connection tasks have exited,
    /// [`SessionSendError::Backpressure`] when the client stopped draining.
    /// Either way the transport is unusable and the caller should evict.
    pub fn send(&self, frame: Bytes) -> Result<(), SessionSendError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => SessionSendError::Closed,
            mpsc::error::TrySendError::Full(_) => SessionSendError::Backpressure,
        })
    }

    /// Tear the connection down. Both halves exit and the socket is
    /// dropped, so the client observes EOF.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Inbound activity on one client connection.
#[derive(Debug)]
pub enum SessionEvent {
    /// A connection was accepted.
    Opened {
        addr: SocketAddr,
        handle: SessionHandle,
    },
    /// One frame arrived (at most [`MAX_FRAME_LEN`] bytes).
    Frame { addr: SocketAddr, payload: Bytes },
    /// The client hung up or the transport failed.
    Closed { addr: SocketAddr },
}

/// Accept connections until cancelled, wiring each one to the engine
/// mailbox.
///
/// The `Opened` event is sent before the connection tasks are spawned, so
/// an engine never sees a `Frame` for an address it has not been handed a
/// handle for.
pub async fn run_acceptor<E>(
    listener: TcpListener,
    events: mpsc::Sender<E>,
    cancel: CancellationToken,
) where
    E: From<SessionEvent> + Send + 'static,
{
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!(target: "net.acceptor", client = %addr, "Client connected");
                        let session = cancel.child_token();
                        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
                        let handle = SessionHandle::new(outbound_tx, session.clone());

                        let opened = SessionEvent::Opened { addr, handle };
                        if events.send(opened.into()).await.is_err() {
                            // Engine is gone; stop accepting.
                            break;
                        }

                        let (read_half, write_half) = stream.into_split();
                        tokio::spawn(run_writer(write_half, outbound_rx, session.clone()));
                        tokio::spawn(run_reader(read_half, addr, events.clone(), session));
                    }
                    Err(e) => {
                        warn!(target: "net.acceptor", error = %e, "Accept failed");
                    }
                }
            }
        }
    }

    debug!(target: "net.acceptor", "Acceptor stopped");
}

async fn run_reader<E>(
    mut read_half: OwnedReadHalf,
    addr: SocketAddr,
    events: mpsc::Sender<E>,
    session: CancellationToken,
) where
    E: From<SessionEvent> + Send + 'static,
{
    let mut buf = [0u8; MAX_FRAME_LEN];

    loop {
        tokio::select! {
            () = session.cancelled() => break,
            read = read_half.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => {
                        let _ = events.send(SessionEvent::Closed { addr }.into()).await;
                        break;
                    }
                    Ok(n) => n,
                };
                let Some(frame) = buf.get(..n) else { break };
                let payload = Bytes::copy_from_slice(frame);
                if events
                    .send(SessionEvent::Frame { addr, payload }.into())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }

    // Dropping the read half after the writer exits releases the socket.
    session.cancel();
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    session: CancellationToken,
) {
    loop {
        tokio::select! {
            () = session.cancelled() => break,
            frame = outbound.recv() => {
                match frame {
                    None => break,
                    Some(frame) => {
                        if write_half.write_all(&frame).await.is_err() {
                            // Broken pipe; the engine notices on its next
                            // send or heartbeat.
                            break;
                        }
                    }
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
    session.cancel();
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

    async fn accept_harness() -> (
        std::net::SocketAddr,
        mpsc::Receiver<SessionEvent>,
        CancellationToken,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        tokio::spawn(run_acceptor(listener, tx, cancel.clone()));
        (local, rx, cancel)
    }

    #[tokio::test]
    async fn test_open_frame_close_sequence() {
        let (server_addr, mut events, cancel) = accept_harness().await;

        let mut client = TcpStream::connect(server_addr).await.unwrap();

        let (addr, handle) = match events.recv().await.unwrap() {
            SessionEvent::Opened { addr, handle } => (addr, handle),
            other => panic!("expected Opened, got {other:?}"),
        };

        client.write_all(b"{\"request\":\"start\"}").await.unwrap();
        match events.recv().await.unwrap() {
            SessionEvent::Frame { addr: frame_addr, payload } => {
                assert_eq!(frame_addr, addr);
                assert_eq!(&payload[..], b"{\"request\":\"start\"}");
            }
            other => panic!("expected Frame, got {other:?}"),
        }

        // Server-side push reaches the client.
        handle.send(Bytes::from_static(b"PING")).unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        drop(client);
        match events.recv().await.unwrap() {
            SessionEvent::Closed { addr: closed } => assert_eq!(closed, addr),
            other => panic!("expected Closed, got {other:?}"),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_close_drops_the_socket() {
        let (server_addr, mut events, cancel) = accept_harness().await;

        let mut client = TcpStream::connect(server_addr).await.unwrap();
        let handle = match events.recv().await.unwrap() {
            SessionEvent::Opened { handle, .. } => handle,
            other => panic!("expected Opened, got {other:?}"),
        };

        handle.close();

        // The client observes EOF once both halves are gone.
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_after_close_reports_closed() {
        let (server_addr, mut events, cancel) = accept_harness().await;

        let client = TcpStream::connect(server_addr).await.unwrap();
        let handle = match events.recv().await.unwrap() {
            SessionEvent::Opened { handle, .. } => handle,
            other => panic!("expected Opened, got {other:?}"),
        };

        handle.close();
        drop(client);

        // Give the writer task a moment to drop its receiver.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(
            handle.send(Bytes::from_static(b"X")),
            Err(SessionSendError::Closed)
        );

        cancel.cancel();
    }
}
