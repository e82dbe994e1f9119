//! Platform BLE abstraction.
//!
//! The link manager talks to the radio through [`BleAdapter`]/[`BleLink`]
//! so the whole stack runs against an in-memory peer in tests. The real
//! implementation lives in [`crate::sysble`].

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::{uuid, Uuid};

use s2p_core::BridgeResult;

/// Well-known service the desktop peer advertises.
pub const SERVICE_UUID: Uuid = uuid!("12345678-1234-5678-1234-56789abcdef0");
/// Write characteristic: central → peer packets.
pub const COMMAND_RX_UUID: Uuid = uuid!("12345678-1234-5678-1234-56789abcdef1");
/// Notify characteristic: peer → central packets.
pub const RESPONSE_TX_UUID: Uuid = uuid!("12345678-1234-5678-1234-56789abcdef2");
/// Notify characteristic: peer → central one-byte status codes.
pub const STATUS_UUID: Uuid = uuid!("12345678-1234-5678-1234-56789abcdef3");

/// Smallest MTU BLE guarantees; the granted value never goes below this.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// One-byte status codes on the `status` characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Idle,
    AwaitingPairing,
    Paired,
    Busy,
    Error,
}

impl PeerStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(Self::Idle),
            0x01 => Some(Self::AwaitingPairing),
            0x02 => Some(Self::Paired),
            0x03 => Some(Self::Busy),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Idle => 0x00,
            Self::AwaitingPairing => 0x01,
            Self::Paired => 0x02,
            Self::Busy => 0x03,
            Self::Error => 0xFF,
        }
    }
}

/// A peer seen during scanning. Unique by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Events flowing up from an established link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A packet arrived on `response_tx`.
    Notification(Vec<u8>),
    /// A status byte arrived on `status`.
    Status(PeerStatus),
    /// The platform reported the link gone.
    Disconnected,
}

/// Platform scan/connect primitives (BLE central role).
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Begin scanning, filtered by [`SERVICE_UUID`]. Emits raw sightings;
    /// deduplication happens in the link manager.
    async fn start_scan(&self) -> BridgeResult<mpsc::Receiver<PeerInfo>>;

    async fn stop_scan(&self) -> BridgeResult<()>;

    /// Connect, negotiate the MTU towards `mtu_target`, discover the service
    /// and its three characteristics, and subscribe to both notify
    /// characteristics. Returns the link plus its event stream.
    async fn connect(
        &self,
        address: &str,
        mtu_target: u16,
        timeout: Duration,
    ) -> BridgeResult<(Box<dyn BleLink>, mpsc::Receiver<LinkEvent>)>;
}

/// An established GATT connection.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Negotiated MTU (≥ [`DEFAULT_ATT_MTU`]).
    fn mtu(&self) -> u16;

    /// Whether writes resolve on the platform's write-completion signal.
    /// When false the caller must pace packets itself.
    fn has_write_completion(&self) -> bool;

    /// Write one packet to `command_rx`. Resolves on write completion where
    /// the platform provides it.
    async fn write_packet(&self, packet: &[u8]) -> BridgeResult<()>;

    async fn disconnect(&self) -> BridgeResult<()>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bytes_round_trip() {
        for status in [
            PeerStatus::Idle,
            PeerStatus::AwaitingPairing,
            PeerStatus::Paired,
            PeerStatus::Busy,
            PeerStatus::Error,
        ] {
            assert_eq!(PeerStatus::from_byte(status.as_byte()), Some(status));
        }
        assert_eq!(PeerStatus::from_byte(0x42), None);
    }
}
