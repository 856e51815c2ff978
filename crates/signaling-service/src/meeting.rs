//! Meeting table types and credential generation.
//!
//! A meeting ID is the decimal rendering of a random v4 UUID's 128-bit
//! integer, truncated to nine digits; the caller retries on collision. The
//! password is twelve alphanumeric characters drawn uniformly from the
//! system's cryptographically secure source.

use common::types::MeetingId;
use ring::rand::SecureRandom;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

/// Maximum participants per meeting.
pub const MAX_PARTICIPANTS: usize = 2;

/// Reaper ticks an empty meeting survives before deletion.
pub const EXPIRATION_TICKS: u8 = 5;

/// Password length in characters.
pub const PASSWORD_LEN: usize = 12;

const PASSWORD_ALPHABET: &[u8; 62] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// One joined participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    /// Transport identity (IP + port).
    pub addr: SocketAddr,
    /// Exactly one participant of a non-empty meeting holds this flag.
    pub host: bool,
}

/// One live meeting, owned by the signaling engine.
#[derive(Debug, Clone)]
pub struct Meeting {
    /// Immutable after creation.
    pub password: String,
    /// Creator identity, for clearing the created flag on deletion.
    pub creator: SocketAddr,
    /// Joined participants, at most [`MAX_PARTICIPANTS`].
    pub participants: Vec<Participant>,
    /// Remaining reaper ticks while the participant list is empty; reset
    /// to [`EXPIRATION_TICKS`] on every join.
    pub expiration_ticks: u8,
}

impl Meeting {
    /// Create an empty meeting.
    #[must_use]
    pub fn new(password: String, creator: SocketAddr) -> Self {
        Self {
            password,
            creator,
            participants: Vec::new(),
            expiration_ticks: EXPIRATION_TICKS,
        }
    }

    /// IP addresses of the joined participants, for the public mirror.
    #[must_use]
    pub fn participant_ips(&self) -> Vec<IpAddr> {
        self.participants.iter().map(|p| p.addr.ip()).collect()
    }

    /// The participant holding the host flag, if any.
    #[must_use]
    pub fn host(&self) -> Option<SocketAddr> {
        self.participants.iter().find(|p| p.host).map(|p| p.addr)
    }

    /// The participant other than `addr`, if any.
    #[must_use]
    pub fn peer_of(&self, addr: SocketAddr) -> Option<SocketAddr> {
        self.participants
            .iter()
            .find(|p| p.addr != addr)
            .map(|p| p.addr)
    }
}

/// Derive a candidate meeting ID.
///
/// Returns `None` in the (vanishingly rare) case the UUID's decimal form
/// is shorter than nine digits; callers loop anyway for collision retry.
#[must_use]
pub fn derive_meeting_id() -> Option<MeetingId> {
    let digits = Uuid::new_v4().as_u128().to_string();
    digits.get(..MeetingId::LEN).map(MeetingId::from)
}

/// Generate a meeting password.
///
/// Rejection sampling keeps the draw uniform over the alphabet.
///
/// # Errors
///
/// Propagates a failure of the system random source.
pub fn generate_password(rng: &dyn SecureRandom) -> Result<String, ring::error::Unspecified> {
    // Largest multiple of the alphabet size that fits a byte; anything at
    // or above it is rejected.
    const LIMIT: u8 = (u8::MAX / 62) * 62;

    let mut password = String::with_capacity(PASSWORD_LEN);
    let mut buf = [0u8; 32];

    while password.len() < PASSWORD_LEN {
        rng.fill(&mut buf)?;
        for byte in buf {
            if byte >= LIMIT {
                continue;
            }
            if let Some(&ch) = PASSWORD_ALPHABET.get(usize::from(byte % 62)) {
                password.push(char::from(ch));
                if password.len() == PASSWORD_LEN {
                    break;
                }
            }
        }
    }

    Ok(password)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;

    #[test]
    fn test_meeting_id_is_nine_decimal_digits() {
        for _ in 0..64 {
            let id = derive_meeting_id().unwrap();
            assert_eq!(id.as_str().len(), MeetingId::LEN);
            assert!(id.as_str().chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_password_shape() {
        let rng = SystemRandom::new();
        let password = generate_password(&rng).unwrap();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_passwords_are_not_repeated() {
        let rng = SystemRandom::new();
        let a = generate_password(&rng).unwrap();
        let b = generate_password(&rng).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_meeting_starts_empty_with_full_ttl() {
        let meeting = Meeting::new("pw".to_string(), "10.0.0.1:4000".parse().unwrap());
        assert!(meeting.participants.is_empty());
        assert_eq!(meeting.expiration_ticks, EXPIRATION_TICKS);
        assert_eq!(meeting.host(), None);
    }
}
