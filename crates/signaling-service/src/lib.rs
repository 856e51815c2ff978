//! Waypost Signaling service library.
//!
//! Owns the meeting lifecycle: creation, join, host transfer, leave, end
//! and abuse prevention. The authoritative meeting table lives here; a
//! public subset (password + participant IPs) is mirrored to the shared
//! directory for the relay services to authorize against.

#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod errors;
pub mod meeting;
pub mod mirror;
