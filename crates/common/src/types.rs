//! Common data types for Waypost components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a meeting.
///
/// Nine decimal digits, derived by the Signaling service from the integer
/// form of a random UUID. Carried verbatim on the wire and used as the
/// directory key suffix, so it stays a string end to end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(pub String);

impl MeetingId {
    /// Number of decimal digits in a meeting ID.
    pub const LEN: usize = 9;

    /// View the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MeetingId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for MeetingId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_meeting_id_is_transparent_on_the_wire() {
        let id = MeetingId::from("123456789");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"123456789\"");

        let back: MeetingId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_meeting_id_display() {
        assert_eq!(MeetingId::from("000000001").to_string(), "000000001");
    }
}
