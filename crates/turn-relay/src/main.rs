//! Waypost TURN relay.
//!
//! UDP fallback relay for meetings whose direct path failed (default
//! 0.0.0.0:3479). Admits only sources whose meeting, password and IP check
//! out against the directory mirror written by Signaling; a reachable
//! directory is a hard startup requirement here.

#![warn(clippy::pedantic)]

use turn_relay::config::Config;
use turn_relay::engine::{Event, TurnEngine};
use turn_relay::socket::run_receiver;

use anyhow::Context;
use common::secret::ExposeSecret;
use meeting_directory::redis::RedisDirectory;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Engine mailbox depth.
const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turn_relay=debug,common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TURN relay");

    let config = Config::from_env();
    info!(
        bind_address = %config.bind_address,
        reaper_period_seconds = config.reaper_period_seconds,
        "Configuration loaded"
    );

    let directory = RedisDirectory::connect(config.redis_url.expose_secret())
        .await
        .context("could not reach the meeting directory; is Redis running with the default parameters?")?;
    info!("Directory attached");

    let socket = Arc::new(UdpSocket::bind(&config.bind_address).await?);
    info!(local_addr = %socket.local_addr()?, "Listening");

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel::<Event>(EVENT_BUFFER);

    let engine = TurnEngine::new(events_rx, directory, Arc::clone(&socket), cancel.clone());
    let engine_task = tokio::spawn(engine.run());
    let receiver_task = tokio::spawn(run_receiver(socket, events_tx.clone(), cancel.clone()));
    let reaper_task = tokio::spawn(common::tasks::run_ticker(
        events_tx,
        || Event::Sweep,
        Duration::from_secs(config.reaper_period_seconds),
        cancel.clone(),
        "turn.clients",
    ));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down");
    cancel.cancel();

    let _ = tokio::join!(engine_task, receiver_task, reaper_task);
    info!("TURN relay stopped");

    Ok(())
}
