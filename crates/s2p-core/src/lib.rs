//! # s2p-core
//!
//! Shared types, wire model, crypto, framing, and configuration used across
//! all Speech2Prompt crates. This is the foundation layer — no I/O, just
//! primitives and contracts.

pub mod backoff;
pub mod config;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod message;

pub use error::{BridgeError, BridgeResult};
