//! Chunked framing over fixed-size GATT writes and notifications.
//!
//! Each packet is one byte of header followed by a payload fragment. Header
//! bit 7 is HAS_MORE; bits 0–6 are reserved zero. Ordering is inherited from
//! the BLE notification channel, so there is no sequence number.

use crate::error::{BridgeError, BridgeResult};

/// Continuation bit: set on every chunk except the last.
pub const HAS_MORE: u8 = 0x80;

/// Framing header plus ATT overhead; the usable payload per packet is
/// `mtu - PACKET_OVERHEAD`.
pub const PACKET_OVERHEAD: u16 = 4;

/// Default cap on a reassembled message.
pub const DEFAULT_REASSEMBLY_CAP: usize = 64 * 1024;

/// Split a buffer into packets of at most `mtu - 4` payload bytes each.
///
/// The final chunk always carries HAS_MORE = 0, even when the whole buffer
/// fits in one packet. An empty buffer yields a single empty final packet.
pub fn chunk(buf: &[u8], mtu: u16) -> BridgeResult<Vec<Vec<u8>>> {
    if mtu <= PACKET_OVERHEAD {
        return Err(BridgeError::InvalidMtu { mtu });
    }
    let payload_size = (mtu - PACKET_OVERHEAD) as usize;

    let mut packets = Vec::with_capacity(buf.len() / payload_size + 1);
    let mut slices = buf.chunks(payload_size).peekable();

    if buf.is_empty() {
        packets.push(vec![0x00]);
        return Ok(packets);
    }

    while let Some(slice) = slices.next() {
        let header = if slices.peek().is_some() { HAS_MORE } else { 0x00 };
        let mut packet = Vec::with_capacity(1 + slice.len());
        packet.push(header);
        packet.extend_from_slice(slice);
        packets.push(packet);
    }

    Ok(packets)
}

/// Stateful per-link reassembler.
///
/// Feeds on inbound packets and yields the full message once a packet with
/// HAS_MORE = 0 arrives. Owned exclusively by the link task; reset whenever
/// the link resets.
pub struct Reassembler {
    buffer: Vec<u8>,
    cap: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REASSEMBLY_CAP)
    }

    /// `cap` bounds the reassembled message size; a malformed or malicious
    /// peer cannot grow the buffer past it.
    pub fn with_capacity(cap: usize) -> Self {
        Self { buffer: Vec::new(), cap }
    }

    /// Consume one inbound packet.
    ///
    /// Returns `Ok(None)` while the message is incomplete, `Ok(Some(bytes))`
    /// when the final chunk completes it. Exceeding the cap resets the
    /// assembler and errors.
    pub fn push(&mut self, packet: &[u8]) -> BridgeResult<Option<Vec<u8>>> {
        let Some((&header, payload)) = packet.split_first() else {
            return Err(BridgeError::protocol("empty packet"));
        };

        let size = self.buffer.len() + payload.len();
        if size > self.cap {
            let cap = self.cap;
            self.reset();
            return Err(BridgeError::FrameTooLarge { size, cap });
        }

        self.buffer.extend_from_slice(payload);

        if header & HAS_MORE != 0 {
            return Ok(None);
        }
        Ok(Some(std::mem::take(&mut self.buffer)))
    }

    /// Drop any partial message. Called on link reset.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut asm = Reassembler::new();
        let mut out = None;
        for p in packets {
            out = asm.push(p).unwrap();
        }
        out.expect("final packet should complete the message")
    }

    #[test]
    fn round_trip_various_sizes() {
        for mtu in [5u16, 23, 64, 512] {
            let payload_size = (mtu - PACKET_OVERHEAD) as usize;
            for len in [0usize, 1, payload_size - 1, payload_size, payload_size + 1, 1000] {
                let buf: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let packets = chunk(&buf, mtu).unwrap();
                assert_eq!(reassemble(&packets), buf, "mtu={mtu} len={len}");
            }
        }
    }

    #[test]
    fn only_the_final_packet_clears_has_more() {
        let buf = vec![0xAB; 50];
        let packets = chunk(&buf, 23).unwrap();
        assert_eq!(packets.len(), 3); // 19 + 19 + 12

        for p in &packets[..packets.len() - 1] {
            assert_eq!(p[0], HAS_MORE);
        }
        assert_eq!(packets.last().unwrap()[0], 0x00);
    }

    #[test]
    fn single_chunk_message_has_no_continuation() {
        let packets = chunk(b"hi", 23).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], 0x00);

        let packets = chunk(b"", 23).unwrap();
        assert_eq!(packets, vec![vec![0x00]]);
    }

    #[test]
    fn rejects_unusable_mtu() {
        assert!(matches!(chunk(b"x", 4), Err(BridgeError::InvalidMtu { mtu: 4 })));
        assert!(chunk(b"x", 5).is_ok());
    }

    #[test]
    fn cap_overflow_resets_with_error() {
        let mut asm = Reassembler::with_capacity(8);
        assert!(asm.push(&[HAS_MORE, 1, 2, 3, 4, 5]).unwrap().is_none());

        let err = asm.push(&[HAS_MORE, 6, 7, 8, 9]).unwrap_err();
        assert!(matches!(err, BridgeError::FrameTooLarge { size: 9, cap: 8 }));
        assert!(asm.is_empty());

        // The assembler is usable again after the reset.
        assert_eq!(asm.push(&[0x00, 0xFF]).unwrap(), Some(vec![0xFF]));
    }

    #[test]
    fn rejects_empty_packet() {
        let mut asm = Reassembler::new();
        assert!(matches!(asm.push(&[]), Err(BridgeError::Protocol { .. })));
    }

    #[test]
    fn reset_drops_partial_state() {
        let mut asm = Reassembler::new();
        asm.push(&[HAS_MORE, 1, 2]).unwrap();
        assert!(!asm.is_empty());

        asm.reset();
        assert_eq!(asm.push(&[0x00, 9]).unwrap(), Some(vec![9]));
    }
}
