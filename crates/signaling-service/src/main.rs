//! Waypost Signaling service.
//!
//! Stateful TCP controller for meeting rooms (default 0.0.0.0:5060).
//! Owns the meeting lifecycle and is the single writer of the shared
//! directory; the ICE broker and TURN relay authorize against the mirror
//! it publishes. Runs with mirroring disabled if the directory is
//! unreachable at startup.

#![warn(clippy::pedantic)]

use signaling_service::config::Config;
use signaling_service::engine::{Event, SignalingEngine};
use signaling_service::mirror::Mirror;

use common::secret::ExposeSecret;
use meeting_directory::redis::RedisDirectory;
use meeting_directory::Directory;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Engine mailbox depth.
const EVENT_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signaling_service=debug,common=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Signaling service");

    let config = Config::from_env();
    info!(
        bind_address = %config.bind_address,
        reaper_period_seconds = config.reaper_period_seconds,
        "Configuration loaded"
    );

    // The directory is best-effort for Signaling: without it the relay
    // services cannot authorize anyone, but meetings still work.
    let mirror = match RedisDirectory::connect(config.redis_url.expose_secret()).await {
        Ok(directory) => {
            // Startup flush: no meetings survive a restart.
            if let Err(e) = directory.flush_all().await {
                warn!(error = %e, "Startup directory flush failed");
            }
            info!("Directory attached; public mirroring enabled");
            Mirror::enabled(directory)
        }
        Err(e) => {
            warn!(error = %e, "Directory unavailable; continuing with public mirroring disabled");
            Mirror::disabled()
        }
    };

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!(local_addr = %listener.local_addr()?, "Listening");

    let cancel = CancellationToken::new();
    let (events_tx, events_rx) = mpsc::channel::<Event>(EVENT_BUFFER);
    let period = Duration::from_secs(config.reaper_period_seconds);

    let engine = SignalingEngine::new(events_rx, mirror, cancel.clone());
    let engine_task = tokio::spawn(engine.run());
    let acceptor_task = tokio::spawn(common::net::run_acceptor(
        listener,
        events_tx.clone(),
        cancel.clone(),
    ));
    let client_reaper_task = tokio::spawn(common::tasks::run_ticker(
        events_tx.clone(),
        || Event::SweepClients,
        period,
        cancel.clone(),
        "signaling.clients",
    ));
    let meeting_reaper_task = tokio::spawn(common::tasks::run_ticker(
        events_tx,
        || Event::SweepMeetings,
        period,
        cancel.clone(),
        "signaling.meetings",
    ));

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down");
    cancel.cancel();

    let _ = tokio::join!(
        engine_task,
        acceptor_task,
        client_reaper_task,
        meeting_reaper_task
    );
    info!("Signaling service stopped");

    Ok(())
}
