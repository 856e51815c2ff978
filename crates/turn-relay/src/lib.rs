//! Waypost TURN relay library.
//!
//! Fallback path for meetings whose peer-to-peer traversal failed: both
//! clients send their media datagrams here and the relay forwards them to
//! the counterparty with a one-byte origin tag. Admission mirrors the ICE
//! broker exactly, authorized against the directory written by Signaling.

#![warn(clippy::pedantic)]

pub mod config;
pub mod engine;
pub mod errors;
pub mod socket;
