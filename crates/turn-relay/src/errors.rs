//! TURN relay error types.

use common::protocol::ErrorReason;
use meeting_directory::DirectoryError;
use thiserror::Error;

/// TURN relay engine error type.
#[derive(Debug, Error)]
pub enum TurnError {
    /// Caller is already paired with a peer.
    #[error("caller already has a connected peer")]
    AlreadyPaired,

    /// Caller is in a pairing but no peer has arrived yet.
    #[error("caller is waiting for a peer")]
    WaitingForPeer,

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

impl TurnError {
    /// The wire `reason` literal for this error.
    #[must_use]
    pub fn reason(&self) -> ErrorReason {
        match self {
            TurnError::AlreadyPaired => ErrorReason::AlreadyPaired,
            TurnError::WaitingForPeer => ErrorReason::WaitingForPeer,
            TurnError::UnknownMeeting => ErrorReason::InvalidMeetingId,
            TurnError::WrongPassword => ErrorReason::InvalidPassword,
            TurnError::UnknownParticipant => ErrorReason::UnknownParticipant,
            TurnError::PairingFull => ErrorReason::MeetingFull,
            TurnError::Directory(_) => ErrorReason::Unknown,
        }
    }

    /// True for failures that indicate a server-side problem.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, TurnError::Directory(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            TurnError::UnknownMeeting.reason(),
            ErrorReason::InvalidMeetingId
        );
        assert_eq!(
            TurnError::WrongPassword.reason(),
            ErrorReason::InvalidPassword
        );
        assert_eq!(TurnError::PairingFull.reason(), ErrorReason::MeetingFull);
        assert_eq!(
            TurnError::Directory(DirectoryError::Backend("down".to_string())).reason(),
            ErrorReason::Unknown
        );
    }
}
