//! # s2p-link
//!
//! The secure BLE transport stack, bottom to top:
//! - [`ble`] — adapter abstraction over the platform BLE central role
//! - [`sysble`] — the real adapter backed by btleplug
//! - [`manager`] — connection state machine, scan/connect/reconnect, framing
//! - [`transport`] — sign/encrypt rules, ACK correlation, inbound delivery
//! - [`pairing`] — PIN handshake and the at-rest-encrypted pairing store

pub mod ble;
pub mod manager;
pub mod pairing;
pub mod sysble;
pub mod transport;

pub use ble::{BleAdapter, BleLink, LinkEvent, PeerInfo, PeerStatus};
pub use manager::{ConnectionState, LinkManager, LinkNotice};
pub use pairing::{Keystore, PairedPeer, PairingFlow, PairingStore};
pub use transport::{SendOutcome, Transport};
