//! Datagram receive loop.
//!
//! One task owns the inbound side of the shared UDP socket and funnels
//! every datagram into the engine mailbox. Sending happens directly from
//! the engine through the same (shared) socket.

use crate::engine::Event;
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest datagram the relay accepts. Media packets are MTU-sized in
/// practice, but the relay imposes no parsing so it takes what UDP gives.
pub const MAX_DATAGRAM_LEN: usize = 65_535;

/// Receive datagrams until cancelled, wiring each into the engine mailbox.
pub async fn run_receiver(
    socket: Arc<UdpSocket>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, addr)) => {
                        let Some(datagram) = buf.get(..n) else { continue };
                        let payload = Bytes::copy_from_slice(datagram);
                        if events.send(Event::Datagram { addr, payload }).await.is_err() {
                            // Engine is gone; stop receiving.
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "turn.receiver", error = %e, "Receive failed");
                    }
                }
            }
        }
    }

    debug!(target: "turn.receiver", "Receiver stopped");
}
