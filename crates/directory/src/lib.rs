//! Shared meeting directory.
//!
//! The Signaling service is the single writer: it publishes, for every live
//! meeting, the password and the IP addresses of the joined participants.
//! The ICE broker and the TURN relay are readers; they admit a client only
//! if its claimed meeting exists here, the password matches, and the
//! client's source IP is in the published participant list.
//!
//! # Layout
//!
//! Keys are `meetings:<id>`. Each value is a flat hash:
//!
//! - `password`: the meeting password, verbatim;
//! - `participants`: a JSON-encoded array of IP address strings (ports are
//!   deliberately discarded; the relay services authorize by IP only).
//!
//! Individual operations are atomic; there are no multi-key transactions.
//! Any key/hash store satisfies this contract - the [`redis`] backend is
//! the deployed one, [`memory`] serves tests and single-host setups.

#![warn(clippy::pedantic)]

pub mod memory;
pub mod redis;

use common::types::MeetingId;
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use thiserror::Error;

/// Namespace prefix for every directory key.
pub const KEY_PREFIX: &str = "meetings";

/// Hash field holding the meeting password.
pub const FIELD_PASSWORD: &str = "password";

/// Hash field holding the JSON-encoded participant IP list.
pub const FIELD_PARTICIPANTS: &str = "participants";

/// Directory operation failure.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The backend could not be reached or rejected the operation.
    #[error("Directory backend error: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("Corrupt directory record: {0}")]
    Corrupt(String),
}

/// The subset of a meeting record published for relay authorization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MirrorRecord {
    /// Meeting password, mirrored verbatim.
    pub password: String,
    /// IP addresses of the joined participants, ports discarded.
    pub participants: Vec<IpAddr>,
}

impl MirrorRecord {
    /// Build a record from a password and participant addresses.
    #[must_use]
    pub fn new(password: impl Into<String>, participants: Vec<IpAddr>) -> Self {
        Self {
            password: password.into(),
            participants,
        }
    }

    /// True if `ip` is one of the published participants.
    #[must_use]
    pub fn admits(&self, ip: IpAddr) -> bool {
        self.participants.contains(&ip)
    }

    /// Encode into the flat hash representation.
    #[must_use]
    pub fn to_fields(&self) -> [(&'static str, String); 2] {
        let ips: Vec<String> = self.participants.iter().map(ToString::to_string).collect();
        let encoded = serde_json::to_string(&ips).unwrap_or_else(|_| "[]".to_string());
        [
            (FIELD_PASSWORD, self.password.clone()),
            (FIELD_PARTICIPANTS, encoded),
        ]
    }

    /// Decode from the flat hash representation.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::Corrupt`] when a field is missing or the
    /// participant list does not parse as IP address strings.
    pub fn from_fields(mut fields: HashMap<String, String>) -> Result<Self, DirectoryError> {
        let password = fields
            .remove(FIELD_PASSWORD)
            .ok_or_else(|| DirectoryError::Corrupt("missing password field".to_string()))?;

        let raw = fields
            .remove(FIELD_PARTICIPANTS)
            .ok_or_else(|| DirectoryError::Corrupt("missing participants field".to_string()))?;

        let ips: Vec<String> = serde_json::from_str(&raw)
            .map_err(|e| DirectoryError::Corrupt(format!("participant list: {e}")))?;

        let participants = ips
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .map_err(|e| DirectoryError::Corrupt(format!("participant address: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            password,
            participants,
        })
    }
}

/// Compose the storage key for a meeting.
#[must_use]
pub fn key_for(id: &MeetingId) -> String {
    format!("{KEY_PREFIX}:{id}")
}

/// A key/hash store holding the public mirror of the meeting table.
///
/// Concurrency contract: single writer (Signaling), many readers (ICE,
/// TURN); each operation is atomic on its key.
pub trait Directory: Clone + Send + Sync + 'static {
    /// Fetch the record for `id`, or `None` if the meeting is not
    /// published.
    fn get(
        &self,
        id: &MeetingId,
    ) -> impl Future<Output = Result<Option<MirrorRecord>, DirectoryError>> + Send;

    /// Publish (create or replace) the record for `id`.
    fn set(
        &self,
        id: &MeetingId,
        record: &MirrorRecord,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    /// Remove the record for `id`. Removing an absent record is not an
    /// error.
    fn delete(&self, id: &MeetingId) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    /// Remove every record under the `meetings:` namespace.
    fn flush_all(&self) -> impl Future<Output = Result<(), DirectoryError>> + Send;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(key_for(&MeetingId::from("123456789")), "meetings:123456789");
    }

    #[test]
    fn test_record_field_round_trip() {
        let record = MirrorRecord::new(
            "aB3dE6gH9jK2",
            vec!["10.0.0.7".parse().unwrap(), "192.168.1.20".parse().unwrap()],
        );

        let fields: HashMap<String, String> = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(fields.get(FIELD_PASSWORD).unwrap(), "aB3dE6gH9jK2");
        assert_eq!(
            fields.get(FIELD_PARTICIPANTS).unwrap(),
            r#"["10.0.0.7","192.168.1.20"]"#
        );

        let back = MirrorRecord::from_fields(fields).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_empty_participant_list() {
        let record = MirrorRecord::new("pw", vec![]);
        let fields: HashMap<String, String> = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields.get(FIELD_PARTICIPANTS).unwrap(), "[]");
        assert_eq!(MirrorRecord::from_fields(fields).unwrap(), record);
    }

    #[test]
    fn test_corrupt_records_are_rejected() {
        let missing_password: HashMap<String, String> =
            [(FIELD_PARTICIPANTS.to_string(), "[]".to_string())].into();
        assert!(matches!(
            MirrorRecord::from_fields(missing_password),
            Err(DirectoryError::Corrupt(_))
        ));

        let bad_list: HashMap<String, String> = [
            (FIELD_PASSWORD.to_string(), "pw".to_string()),
            (FIELD_PARTICIPANTS.to_string(), "not json".to_string()),
        ]
        .into();
        assert!(matches!(
            MirrorRecord::from_fields(bad_list),
            Err(DirectoryError::Corrupt(_))
        ));

        let bad_ip: HashMap<String, String> = [
            (FIELD_PASSWORD.to_string(), "pw".to_string()),
            (FIELD_PARTICIPANTS.to_string(), r#"["not-an-ip"]"#.to_string()),
        ]
        .into();
        assert!(matches!(
            MirrorRecord::from_fields(bad_ip),
            Err(DirectoryError::Corrupt(_))
        ));
    }

    #[test]
    fn test_admits_checks_ip_membership() {
        let record = MirrorRecord::new("pw", vec!["10.0.0.7".parse().unwrap()]);
        assert!(record.admits("10.0.0.7".parse().unwrap()));
        assert!(!record.admits("10.0.0.8".parse().unwrap()));
    }
}
