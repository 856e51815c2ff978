//! Signaling error types.
//!
//! Every client-visible failure maps to one of the wire `reason` literals
//! via [`SignalingError::reason`]. Internal failures are logged server-side
//! and surface to the client only as the generic unknown-error frame; the
//! session is never torn down over them.

use common::protocol::ErrorReason;
use thiserror::Error;

/// Signaling engine error type.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Caller already created a meeting that is still live.
    #[error("caller already created a live meeting")]
    AlreadyCreated,

    /// Caller is a participant of some meeting.
    #[error("caller is already in a meeting")]
    AlreadyInMeeting,

    /// Caller is not a participant of any meeting.
    #[error("caller is not in a meeting")]
    NotInMeeting,

    /// No meeting under the given ID.
    #[error("unknown meeting ID")]
    UnknownMeeting,

    /// Password does not match the meeting.
    #[error("password mismatch")]
    WrongPassword,

    /// The meeting already has two participants.
    #[error("meeting is full")]
    MeetingFull,

    /// A two-party operation was attempted in a one-party meeting.
    #[error("no second participant")]
    AloneInMeeting,

    /// Caller does not hold the host flag.
    #[error("caller is not the host")]
    NotHost,

    /// The system random source failed.
    #[error("random source failure")]
    RandomSource,

    /// Could not derive an unused meeting ID.
    #[error("meeting ID space exhausted")]
    IdSpaceExhausted,

    /// Client and meeting tables disagree; indicates a bug.
    #[error("table inconsistency: {0}")]
    TableDrift(String),
}

impl SignalingError {
    /// The wire `reason` literal for this error.
    #[must_use]
    pub fn reason(&self) -> ErrorReason {
        match self {
            SignalingError::AlreadyCreated => ErrorReason::AlreadyCreated,
            SignalingError::AlreadyInMeeting => ErrorReason::AlreadyInMeeting,
            SignalingError::NotInMeeting => ErrorReason::NotInMeeting,
            SignalingError::UnknownMeeting => ErrorReason::InvalidMeetingId,
            SignalingError::WrongPassword => ErrorReason::InvalidPassword,
            SignalingError::MeetingFull => ErrorReason::MeetingFull,
            SignalingError::AloneInMeeting => ErrorReason::AloneInMeeting,
            SignalingError::NotHost => ErrorReason::InsufficientPermissions,
            SignalingError::RandomSource
            | SignalingError::IdSpaceExhausted
            | SignalingError::TableDrift(_) => ErrorReason::Unknown,
        }
    }

    /// True for failures that indicate a server-side problem rather than a
    /// bad request; these are logged with full context.
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            SignalingError::RandomSource
                | SignalingError::IdSpaceExhausted
                | SignalingError::TableDrift(_)
        )
    }
}

impl From<ring::error::Unspecified> for SignalingError {
    fn from(_: ring::error::Unspecified) -> Self {
        SignalingError::RandomSource
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(
            SignalingError::AlreadyCreated.reason(),
            ErrorReason::AlreadyCreated
        );
        assert_eq!(
            SignalingError::UnknownMeeting.reason(),
            ErrorReason::InvalidMeetingId
        );
        assert_eq!(
            SignalingError::NotHost.reason(),
            ErrorReason::InsufficientPermissions
        );
        assert_eq!(SignalingError::RandomSource.reason(), ErrorReason::Unknown);
        assert_eq!(
            SignalingError::TableDrift("x".to_string()).reason(),
            ErrorReason::Unknown
        );
    }

    #[test]
    fn test_internal_flag() {
        assert!(!SignalingError::MeetingFull.is_internal());
        assert!(!SignalingError::WrongPassword.is_internal());
        assert!(SignalingError::IdSpaceExhausted.is_internal());
        assert!(SignalingError::TableDrift("x".to_string()).is_internal());
    }
}
