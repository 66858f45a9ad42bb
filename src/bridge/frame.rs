//! Bridge frame codec.
//!
//! IP packets travelling between subnets are wrapped in a 12-byte header:
//!
//!   `<magic u32><version u8><src_subnet u8><dest_subnet u8><reserved u8>`
//!   `<payload_len u16><checksum u16>`
//!
//! followed by `payload_len` bytes of an opaque IP packet. All multi-byte
//! fields are little-endian on the wire; both ends of a link must agree on
//! this regardless of host architecture, so the layout is produced and
//! consumed field by field rather than through any struct representation.
//!
//! The magic value disambiguates bridge frames from other payload kinds
//! sharing the mesh transport (chat, etc.); consumers of mesh data inspect
//! the leading bytes and ignore frames that are not theirs.

use bytes::{BufMut, Bytes, BytesMut};

use crate::addressing::SubnetId;

/// "GEO" — identifies a bridge frame among mesh payloads.
pub const BRIDGE_MAGIC: u32 = 0x0047_454F;

/// The single protocol version this implementation understands.
pub const BRIDGE_VERSION: u8 = 1;

/// Wire size of the bridge header.
pub const HEADER_LEN: usize = 12;

/// Decoded bridge frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeHeader {
    pub version: u8,
    pub src_subnet: SubnetId,
    pub dest_subnet: SubnetId,
    pub payload_len: u16,
    pub checksum: u16,
}

impl BridgeHeader {
    /// Inspect the leading bytes of a mesh payload. Returns `None` when the
    /// buffer is too short for a header or the magic does not match; either
    /// way the payload is simply not a bridge frame. Field validation
    /// (version, length, checksum) is the caller's job, in that order.
    pub fn peek(data: &[u8]) -> Option<BridgeHeader> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != BRIDGE_MAGIC {
            return None;
        }
        Some(BridgeHeader {
            version: data[4],
            src_subnet: SubnetId::new(data[5]),
            dest_subnet: SubnetId::new(data[6]),
            payload_len: u16::from_le_bytes([data[8], data[9]]),
            checksum: u16::from_le_bytes([data[10], data[11]]),
        })
    }
}

/// Build a complete frame: header stamped with the current version and a
/// checksum computed over the raw payload only (the header itself is not
/// covered).
pub fn encode_frame(src: SubnetId, dest: SubnetId, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= u16::MAX as usize);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(BRIDGE_MAGIC);
    buf.put_u8(BRIDGE_VERSION);
    buf.put_u8(src.raw());
    buf.put_u8(dest.raw());
    buf.put_u8(0); // reserved
    buf.put_u16_le(payload.len() as u16);
    buf.put_u16_le(checksum(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Folded 16-bit checksum: sum all bytes into a 32-bit accumulator, fold
/// the high half into the low 16 bits until the value fits, then take the
/// one's complement. Lightweight defense against random transport
/// corruption only; it is not a cryptographic integrity check.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for &b in data {
        sum = sum.wrapping_add(b as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn verify_checksum(data: &[u8], expected: u16) -> bool {
    checksum(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips_for_assorted_inputs() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x00],
            vec![0xFF; 3],
            b"hello mesh".to_vec(),
            (0..=255u8).collect(),
            vec![0xFF; 70_000], // forces repeated folding
        ];
        for case in cases {
            assert!(verify_checksum(&case, checksum(&case)));
        }
    }

    #[test]
    fn checksum_detects_single_bit_flip() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let sum = checksum(&data);
        let mut flipped = data.clone();
        flipped[7] ^= 0x01;
        assert!(!verify_checksum(&flipped, sum));
    }

    #[test]
    fn checksum_matches_known_vector() {
        // 1 + 2 + 3 = 6, no folding needed, complement of 0x0006.
        assert_eq!(checksum(&[1, 2, 3]), !6u16);
        assert_eq!(checksum(&[]), 0xFFFF);
    }

    #[test]
    fn encode_produces_pinned_little_endian_layout() {
        let frame = encode_frame(SubnetId::new(3), SubnetId::new(7), &[0xAA, 0xBB]);
        assert_eq!(&frame[0..4], &[0x4F, 0x45, 0x47, 0x00]); // magic LE
        assert_eq!(frame[4], BRIDGE_VERSION);
        assert_eq!(frame[5], 3);
        assert_eq!(frame[6], 7);
        assert_eq!(frame[7], 0);
        assert_eq!(&frame[8..10], &[2, 0]); // payload_len LE
        let sum = checksum(&[0xAA, 0xBB]);
        assert_eq!(&frame[10..12], &sum.to_le_bytes());
        assert_eq!(&frame[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn peek_decodes_what_encode_produced() {
        let payload = b"0123456789".as_slice();
        let frame = encode_frame(SubnetId::new(10), SubnetId::new(20), payload);
        let header = BridgeHeader::peek(&frame).expect("bridge frame");
        assert_eq!(header.version, BRIDGE_VERSION);
        assert_eq!(header.src_subnet, SubnetId::new(10));
        assert_eq!(header.dest_subnet, SubnetId::new(20));
        assert_eq!(header.payload_len as usize, payload.len());
        assert!(verify_checksum(payload, header.checksum));
    }

    #[test]
    fn peek_ignores_short_buffers_and_foreign_magic() {
        assert!(BridgeHeader::peek(&[0x4F, 0x45, 0x47]).is_none());
        let mut noise = vec![0u8; 32];
        noise[0] = 0x42;
        assert!(BridgeHeader::peek(&noise).is_none());
    }
}
