//! Public mirror of the meeting table.
//!
//! The signaling engine writes through this wrapper on every participant
//! addition/removal and on meeting creation/deletion. When the directory
//! is unreachable at startup the service keeps running with mirroring
//! disabled; runtime write failures are logged and do not fail the client
//! operation that triggered them - the local tables stay authoritative.

use crate::meeting::Meeting;
use common::types::MeetingId;
use meeting_directory::{Directory, MirrorRecord};
use tracing::warn;

/// Directory write-through handle, possibly disabled.
#[derive(Debug, Clone)]
pub struct Mirror<D> {
    directory: Option<D>,
}

impl<D: Directory> Mirror<D> {
    /// Mirror into `directory`.
    #[must_use]
    pub fn enabled(directory: D) -> Self {
        Self {
            directory: Some(directory),
        }
    }

    /// Run without a directory (degraded mode).
    #[must_use]
    pub fn disabled() -> Self {
        Self { directory: None }
    }

    /// Whether a directory is attached.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.directory.is_some()
    }

    /// Publish the public subset of `meeting` under `id`.
    pub async fn publish(&self, id: &MeetingId, meeting: &Meeting) {
        let Some(directory) = &self.directory else {
            return;
        };
        let record = MirrorRecord::new(meeting.password.clone(), meeting.participant_ips());
        if let Err(e) = directory.set(id, &record).await {
            warn!(target: "signaling.mirror", meeting_id = %id, error = %e, "Mirror publish failed");
        }
    }

    /// Withdraw the record for `id`.
    pub async fn withdraw(&self, id: &MeetingId) {
        let Some(directory) = &self.directory else {
            return;
        };
        if let Err(e) = directory.delete(id).await {
            warn!(target: "signaling.mirror", meeting_id = %id, error = %e, "Mirror withdraw failed");
        }
    }

    /// Flush the whole namespace (startup and clean shutdown).
    pub async fn flush(&self) {
        let Some(directory) = &self.directory else {
            return;
        };
        if let Err(e) = directory.flush_all().await {
            warn!(target: "signaling.mirror", error = %e, "Mirror flush failed");
        }
    }
}
