//! Waypost ICE broker.
//!
//! TCP rendezvous for candidate exchange (default 0.0.0.0:1673). Admits
//! only clients whose meeting, password and source IP check out against
//! the directory mirror written by Signaling; a reachable directory is
//! therefore a hard startup requirement here.

#![warn(clippy::pedantic)]

use ice_broker::config::Config;
use ice_broker::engine::{Event, IceEngine};

use anyhow::Context;
use common::secret::ExposeSecret;
use meeting_directory::redis::RedisDirectory;
use std::time::Duration;
use tokio::net::TcpListener;
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
                .unwrap_or_else(|_| "ice_broker=debug,common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting ICE broker");

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

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!(local_addr = %listener.local_addr()?, "Listening");

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel::<Event>(EVENT_BUFFER);

    let engine = IceEngine::new(events_rx, directory, cancel.clone());
    let engine_task = tokio::spawn(engine.run());
    let acceptor_task = tokio::spawn(common::net::run_acceptor(
        listener,
        events_tx.clone(),
        cancel.clone(),
    ));
    let reaper_task = tokio::spawn(common::tasks::run_ticker(
        events_tx,
        || Event::Sweep,
        Duration::from_secs(config.reaper_period_seconds),
        cancel.clone(),
        "ice.clients",
    ));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down");
    cancel.cancel();

    let _ = tokio::join!(engine_task, acceptor_task, reaper_task);
    info!("ICE broker stopped");

    Ok(())
}
