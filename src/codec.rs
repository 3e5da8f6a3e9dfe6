//! Record frame codec (spec §4.3, on-disk layout in spec §6).
//!
//! Frame = 24-byte fixed header + variable-length body:
//! `magic:u32`, `body_length:u32`, `body_offset:u64`, `body_crc:u32`, `header_crc:u32`, `body`.
//! All multi-byte fields are little-endian, mirroring the teacher's `zerocopy` little-endian
//! header convention (`SegmentHeader`/`FrameHeader`).

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::DecodeError;

pub const RECORD_MAGIC: u32 = 0x8765_4321;
pub const HEADER_SIZE: u64 = std::mem::size_of::<RecordHeader>() as u64;

/// An upper bound on a single record's body length, guarding against a corrupt `body_length`
/// field causing an unbounded allocation during recovery.
pub const MAX_BODY_LENGTH: u32 = 64 * 1024 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct RecordHeader {
    magic: U32,
    body_length: U32,
    body_offset: U64,
    body_crc: U32,
    header_crc: U32,
}

impl RecordHeader {
    pub fn body_length(&self) -> u32 {
        self.body_length.get()
    }

    pub fn body_offset(&self) -> u64 {
        self.body_offset.get()
    }

    pub fn body_crc(&self) -> u32 {
        self.body_crc.get()
    }

    fn checksum_bytes(&self) -> &[u8] {
        // Everything but the trailing header_crc field.
        &self.as_bytes()[..20]
    }

    fn header_crc_matches(&self) -> bool {
        crc32fast::hash(self.checksum_bytes()) == self.header_crc.get()
    }
}

/// Encodes `body` into a framed record starting at logical offset `record_offset`. `body_crc` is
/// computed by the caller if not supplied, matching spec §4.3's "computed by the caller if not
/// supplied" wording (callers that already have the CRC from an earlier stage avoid recomputing).
pub fn encode(body: &[u8], body_crc: Option<u32>, record_offset: u64) -> Vec<u8> {
    let body_crc = body_crc.unwrap_or_else(|| crc32fast::hash(body));
    let mut header = RecordHeader {
        magic: RECORD_MAGIC.into(),
        body_length: (body.len() as u32).into(),
        body_offset: (record_offset + HEADER_SIZE).into(),
        body_crc: body_crc.into(),
        header_crc: 0.into(),
    };
    let crc = crc32fast::hash(header.checksum_bytes());
    header.header_crc = crc.into();

    let mut out = Vec::with_capacity(HEADER_SIZE as usize + body.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Decodes and validates the fixed header at the start of `bytes`, checking that it is
/// consistent with the physical `record_offset` it was read from.
pub fn decode_header(bytes: &[u8], record_offset: u64) -> Result<RecordHeader, DecodeError> {
    if (bytes.len() as u64) < HEADER_SIZE {
        return Err(DecodeError::HeaderCrc);
    }
    let header = RecordHeader::read_from_prefix(bytes).ok_or(DecodeError::HeaderCrc)?;

    if header.magic.get() != RECORD_MAGIC {
        return Err(DecodeError::Magic);
    }
    if !header.header_crc_matches() {
        return Err(DecodeError::HeaderCrc);
    }
    if header.body_length() == 0 || header.body_length() > MAX_BODY_LENGTH {
        return Err(DecodeError::BodyLength);
    }
    if header.body_offset() != record_offset + HEADER_SIZE {
        return Err(DecodeError::OffsetMismatch);
    }

    Ok(header)
}

pub fn verify_body(header: &RecordHeader, body: &[u8]) -> Result<(), DecodeError> {
    if body.len() as u32 != header.body_length() {
        return Err(DecodeError::BodyLength);
    }
    if crc32fast::hash(body) != header.body_crc() {
        return Err(DecodeError::BodyCrc);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let body = b"hello durable world";
        let frame = encode(body, None, 0x2000);
        let header = decode_header(&frame, 0x2000).unwrap();
        assert_eq!(header.body_length() as usize, body.len());
        let decoded_body = &frame[HEADER_SIZE as usize..];
        verify_body(&header, decoded_body).unwrap();
        assert_eq!(decoded_body, body);
    }

    #[test]
    fn bad_magic_detected() {
        let mut frame = encode(b"x", None, 0);
        frame[0] ^= 0xFF;
        assert_eq!(decode_header(&frame, 0).unwrap_err(), DecodeError::Magic);
    }

    #[test]
    fn header_crc_detects_single_bit_flip() {
        let mut frame = encode(b"some body bytes", None, 0x4000);
        // flip a bit inside body_length, leaving header_crc untouched.
        frame[4] ^= 0x01;
        assert_eq!(
            decode_header(&frame, 0x4000).unwrap_err(),
            DecodeError::HeaderCrc
        );
    }

    #[test]
    fn body_crc_detects_corruption() {
        let frame = encode(b"payload", None, 0);
        let header = decode_header(&frame, 0).unwrap();
        let mut body = frame[HEADER_SIZE as usize..].to_vec();
        body[0] ^= 0xFF;
        assert_eq!(verify_body(&header, &body).unwrap_err(), DecodeError::BodyCrc);
    }

    #[test]
    fn offset_mismatch_detected() {
        let frame = encode(b"payload", None, 0x1000);
        // Decoding as if this slot were at a different logical offset (stale ring content).
        assert_eq!(
            decode_header(&frame, 0x2000).unwrap_err(),
            DecodeError::OffsetMismatch
        );
    }

    proptest::proptest! {
        /// P6: for every random body, encode/decode round-trips and the body verifies.
        #[test]
        fn round_trip_arbitrary_bodies(
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..256),
            offset in 0u64..1_000_000,
        ) {
            let frame = encode(&body, None, offset);
            let header = decode_header(&frame, offset).unwrap();
            let decoded_body = &frame[HEADER_SIZE as usize..];
            verify_body(&header, decoded_body).unwrap();
            proptest::prop_assert_eq!(decoded_body, body.as_slice());
        }

        /// P6: a single flipped bit anywhere in the CRC-covered header bytes is always detected.
        #[test]
        fn header_single_bit_flip_always_detected(
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..256),
            offset in 0u64..1_000_000,
            byte_index in 0usize..20,
            bit in 0u8..8,
        ) {
            let mut frame = encode(&body, None, offset);
            frame[byte_index] ^= 1 << bit;
            proptest::prop_assert!(decode_header(&frame, offset).is_err());
        }

        /// P6: a single flipped bit anywhere in the body is always detected.
        #[test]
        fn body_single_bit_flip_always_detected(
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..256),
            offset in 0u64..1_000_000,
            bit in 0u8..8,
        ) {
            let frame = encode(&body, None, offset);
            let header = decode_header(&frame, offset).unwrap();
            let mut decoded_body = frame[HEADER_SIZE as usize..].to_vec();
            decoded_body[0] ^= 1 << bit;
            proptest::prop_assert!(verify_body(&header, &decoded_body).is_err());
        }
    }

    #[test]
    fn zero_body_length_rejected() {
        let mut header = RecordHeader {
            magic: RECORD_MAGIC.into(),
            body_length: 0u32.into(),
            body_offset: HEADER_SIZE.into(),
            body_crc: 0u32.into(),
            header_crc: 0.into(),
        };
        let crc = crc32fast::hash(header.checksum_bytes());
        header.header_crc = crc.into();
        assert_eq!(
            decode_header(header.as_bytes(), 0).unwrap_err(),
            DecodeError::BodyLength
        );
    }
}
