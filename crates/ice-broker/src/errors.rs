//! ICE broker error types.

use common::protocol::ErrorReason;
use meeting_directory::DirectoryError;
use thiserror::Error;

/// ICE broker engine error type.
#[derive(Debug, Error)]
pub enum IceError {
    /// Caller is already paired with a peer.
    #[error("caller already has a connected peer")]
    AlreadyPaired,

    /// Caller is in a pairing but no peer has arrived yet.
    #[error("caller is waiting for a peer")]
    WaitingForPeer,

    /// Caller is not part of any pairing.
    #[error("caller is not connected to a meeting")]
    NotConnected,

    /// The claimed meeting is not published in the directory.
    #[error("unknown meeting ID")]
    UnknownMeeting,

    /// Password does not match the directory record.
    #[error("password mismatch")]
    WrongPassword,

    /// Caller's source IP is not a participant of the meeting.
    #[error("source IP is not a meeting participant")]
    UnknownParticipant,

    /// The pairing already holds two members.
    #[error("pairing is full")]
    PairingFull,

    /// Directory lookup failed.
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl IceError {
    /// The wire `reason` literal for this error.
    #[must_use]
    pub fn reason(&self) -> ErrorReason {
        match self {
            IceError::AlreadyPaired => ErrorReason::AlreadyPaired,
            IceError::WaitingForPeer => ErrorReason::WaitingForPeer,
            IceError::NotConnected => ErrorReason::NotConnected,
            IceError::UnknownMeeting => ErrorReason::InvalidMeetingId,
            IceError::WrongPassword => ErrorReason::InvalidPassword,
            IceError::UnknownParticipant => ErrorReason::UnknownParticipant,
            IceError::PairingFull => ErrorReason::MeetingFull,
            IceError::Directory(_) => ErrorReason::Unknown,
        }
    }

    /// True for failures that indicate a server-side problem.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, IceError::Directory(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(IceError::AlreadyPaired.reason(), ErrorReason::AlreadyPaired);
        assert_eq!(
            IceError::UnknownMeeting.reason(),
            ErrorReason::InvalidMeetingId
        );
        assert_eq!(
            IceError::UnknownParticipant.reason(),
            ErrorReason::UnknownParticipant
        );
        assert_eq!(IceError::PairingFull.reason(), ErrorReason::MeetingFull);
        assert_eq!(
            IceError::Directory(DirectoryError::Backend("down".to_string())).reason(),
            ErrorReason::Unknown
        );
    }

    #[test]
    fn test_internal_flag() {
        assert!(!IceError::WrongPassword.is_internal());
        assert!(IceError::Directory(DirectoryError::Backend("down".to_string())).is_internal());
    }
}
