//! Waypost ICE broker library.
//!
//! Pairs the two authenticated clients of an existing meeting over TCP and
//! relays opaque connectivity-candidate frames between them. Admission is
//! authorized against the directory mirror published by Signaling; the
//! broker holds no meeting state of its own beyond the pairing table.

#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod errors;
