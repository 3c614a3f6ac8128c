//! Base-128 varints and zigzag mapping.

use bytes::BufMut;

use crate::error::EncodingError;

/// Longest varint that can hold a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn encoded_len_varint(value: u64) -> usize {
    // Every 7 significant bits take one byte; zero still takes one.
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Decode a varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed. A buffer that ends
/// while the continuation bit is still set yields [`EncodingError::Truncated`],
/// which framing code treats as "need more bytes".
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), EncodingError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        let bits = u64::from(byte & 0x7f);
        // The tenth byte may only contribute the top bit of a u64.
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(EncodingError::VarintOverflow);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(EncodingError::Truncated)
}

pub fn zigzag_encode32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

pub fn zigzag_decode32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

pub fn zigzag_encode64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

pub fn zigzag_decode64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        buf
    }

    #[test]
    fn test_encode_varint() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
        assert_eq!(encode(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        for value in [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            assert_eq!(encoded_len_varint(value), encode(value).len(), "value {value}");
        }
    }

    #[test]
    fn test_decode_varint_reports_consumed() {
        assert_eq!(decode_varint(&[0xac, 0x02, 0xff]).unwrap(), (300, 2));
        assert_eq!(decode_varint(&encode(u64::MAX)).unwrap(), (u64::MAX, 10));
    }

    #[test]
    fn test_decode_varint_truncated() {
        assert_eq!(decode_varint(&[]), Err(EncodingError::Truncated));
        assert_eq!(decode_varint(&[0x80, 0x80]), Err(EncodingError::Truncated));
    }

    #[test]
    fn test_decode_varint_overflow() {
        let eleven = [0xff; 11];
        assert_eq!(decode_varint(&eleven), Err(EncodingError::VarintOverflow));
        let ten = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x02];
        assert_eq!(decode_varint(&ten), Err(EncodingError::VarintOverflow));
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag_encode32(0), 0);
        assert_eq!(zigzag_encode32(-1), 1);
        assert_eq!(zigzag_encode32(1), 2);
        assert_eq!(zigzag_encode32(i32::MAX), u32::MAX - 1);
        assert_eq!(zigzag_encode32(i32::MIN), u32::MAX);
        assert_eq!(zigzag_decode32(u32::MAX), i32::MIN);
        assert_eq!(zigzag_encode64(-33), 65);
        assert_eq!(zigzag_decode64(zigzag_encode64(i64::MIN)), i64::MIN);
    }
}
