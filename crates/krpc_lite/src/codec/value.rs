use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{BuildHasher, Hash};

use bytes::{BufMut, Bytes, BytesMut};

use super::float::{float32_to_float64, float64_to_float32};
use super::handle::ObjectHandle;
use super::varint::{
    decode_varint, encode_varint, zigzag_decode32, zigzag_decode64, zigzag_encode32,
    zigzag_encode64,
};
use crate::error::EncodingError;
use crate::schema;

/// A value with a wire representation.
///
/// An encoded value is a self-contained blob: decoding consumes all of it and
/// rejects trailing bytes.
pub trait WireValue: Sized {
    fn encode(&self, buf: &mut BytesMut);

    fn decode(data: &[u8]) -> Result<Self, EncodingError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// A double on the wire, held locally as an `f32`.
///
/// For callers that must not touch 64-bit float arithmetic; the conversion is
/// done on the bit patterns.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Double32(pub f32);

fn decode_whole_varint(data: &[u8]) -> Result<u64, EncodingError> {
    let (value, consumed) = decode_varint(data)?;
    if consumed != data.len() {
        return Err(EncodingError::DecodeFailed(format!(
            "{} trailing bytes after varint",
            data.len() - consumed
        )));
    }
    Ok(value)
}

fn decode_fixed<const N: usize>(data: &[u8]) -> Result<[u8; N], EncodingError> {
    if data.len() < N {
        return Err(EncodingError::Truncated);
    }
    <[u8; N]>::try_from(data).map_err(|_| {
        EncodingError::DecodeFailed(format!("expected {N} bytes, got {}", data.len()))
    })
}

/// Split a length-prefixed blob into its payload.
fn decode_length_prefixed(data: &[u8]) -> Result<&[u8], EncodingError> {
    let (len, consumed) = decode_varint(data)?;
    let rest = &data[consumed..];
    let len = usize::try_from(len)
        .map_err(|_| EncodingError::DecodeFailed("length does not fit in memory".into()))?;
    if len > rest.len() {
        return Err(EncodingError::Truncated);
    }
    if len < rest.len() {
        return Err(EncodingError::DecodeFailed(format!(
            "{} trailing bytes after length-delimited value",
            rest.len() - len
        )));
    }
    Ok(rest)
}

fn encode_length_prefixed(data: &[u8], buf: &mut BytesMut) {
    encode_varint(data.len() as u64, buf);
    buf.put_slice(data);
}

impl WireValue for u32 {
    fn encode(&self, buf: &mut BytesMut) {
        encode_varint(u64::from(*self), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        let value = decode_whole_varint(data)?;
        u32::try_from(value)
            .map_err(|_| EncodingError::DecodeFailed(format!("{value} does not fit in uint32")))
    }
}

impl WireValue for u64 {
    fn encode(&self, buf: &mut BytesMut) {
        encode_varint(*self, buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        decode_whole_varint(data)
    }
}

impl WireValue for i32 {
    fn encode(&self, buf: &mut BytesMut) {
        encode_varint(u64::from(zigzag_encode32(*self)), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        let value = decode_whole_varint(data)?;
        let value = u32::try_from(value)
            .map_err(|_| EncodingError::DecodeFailed(format!("{value} does not fit in sint32")))?;
        Ok(zigzag_decode32(value))
    }
}

impl WireValue for i64 {
    fn encode(&self, buf: &mut BytesMut) {
        encode_varint(zigzag_encode64(*self), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        Ok(zigzag_decode64(decode_whole_varint(data)?))
    }
}

impl WireValue for f32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_f32_le(*self);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        Ok(f32::from_le_bytes(decode_fixed::<4>(data)?))
    }
}

impl WireValue for f64 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_f64_le(*self);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        Ok(f64::from_le_bytes(decode_fixed::<8>(data)?))
    }
}

impl WireValue for Double32 {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(float32_to_float64(self.0.to_bits()));
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        let bits = u64::from_le_bytes(decode_fixed::<8>(data)?);
        Ok(Double32(f32::from_bits(float64_to_float32(bits))))
    }
}

impl WireValue for bool {
    fn encode(&self, buf: &mut BytesMut) {
        encode_varint(u64::from(*self), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        Ok(decode_whole_varint(data)? != 0)
    }
}

impl WireValue for String {
    fn encode(&self, buf: &mut BytesMut) {
        encode_length_prefixed(self.as_bytes(), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        let payload = decode_length_prefixed(data)?;
        String::from_utf8(payload.to_vec())
            .map_err(|e| EncodingError::DecodeFailed(format!("invalid UTF-8 in string: {e}")))
    }
}

impl WireValue for Bytes {
    fn encode(&self, buf: &mut BytesMut) {
        encode_length_prefixed(self, buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        Ok(Bytes::copy_from_slice(decode_length_prefixed(data)?))
    }
}

impl WireValue for ObjectHandle {
    fn encode(&self, buf: &mut BytesMut) {
        encode_varint(self.id(), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        Ok(ObjectHandle::new(decode_whole_varint(data)?))
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        let list = schema::List {
            items: self.iter().map(WireValue::to_bytes).collect(),
        };
        buf.put_slice(&encode_message(&list));
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        let list: schema::List = decode_message(data)?;
        list.items.iter().map(|item| T::decode(item)).collect()
    }
}

impl<T: WireValue + Ord> WireValue for BTreeSet<T> {
    fn encode(&self, buf: &mut BytesMut) {
        encode_set(self.iter(), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        decode_set::<T, _>(data)
    }
}

impl<T, S> WireValue for HashSet<T, S>
where
    T: WireValue + Eq + Hash,
    S: BuildHasher + Default,
{
    fn encode(&self, buf: &mut BytesMut) {
        encode_set(self.iter(), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        decode_set::<T, _>(data)
    }
}

fn encode_set<'a, T: WireValue + 'a>(items: impl Iterator<Item = &'a T>, buf: &mut BytesMut) {
    let mut items: Vec<Bytes> = items.map(WireValue::to_bytes).collect();
    items.sort();
    buf.put_slice(&encode_message(&schema::Set { items }));
}

fn decode_set<T: WireValue, C: FromIterator<T>>(data: &[u8]) -> Result<C, EncodingError> {
    let set: schema::Set = decode_message(data)?;
    set.items.iter().map(|item| T::decode(item)).collect()
}

impl<K: WireValue + Ord, V: WireValue> WireValue for BTreeMap<K, V> {
    fn encode(&self, buf: &mut BytesMut) {
        encode_dictionary(self.iter(), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        decode_dictionary::<K, V, _>(data)
    }
}

impl<K, V, S> WireValue for HashMap<K, V, S>
where
    K: WireValue + Eq + Hash,
    V: WireValue,
    S: BuildHasher + Default,
{
    fn encode(&self, buf: &mut BytesMut) {
        encode_dictionary(self.iter(), buf);
    }

    fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        decode_dictionary::<K, V, _>(data)
    }
}

// Entries are ordered by encoded key so both map types produce the same bytes.
fn encode_dictionary<'a, K, V>(entries: impl Iterator<Item = (&'a K, &'a V)>, buf: &mut BytesMut)
where
    K: WireValue + 'a,
    V: WireValue + 'a,
{
    let mut entries: Vec<schema::DictionaryEntry> = entries
        .map(|(key, value)| schema::DictionaryEntry {
            key: key.to_bytes(),
            value: value.to_bytes(),
        })
        .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    buf.put_slice(&encode_message(&schema::Dictionary { entries }));
}

fn decode_dictionary<K, V, C>(data: &[u8]) -> Result<C, EncodingError>
where
    K: WireValue,
    V: WireValue,
    C: FromIterator<(K, V)>,
{
    let dictionary: schema::Dictionary = decode_message(data)?;
    dictionary
        .entries
        .iter()
        .map(|entry| Ok((K::decode(&entry.key)?, V::decode(&entry.value)?)))
        .collect()
}

macro_rules! impl_tuple {
    ($len:expr => $($name:ident : $idx:tt),+) => {
        impl<$($name: WireValue),+> WireValue for ($($name,)+) {
            fn encode(&self, buf: &mut BytesMut) {
                let tuple = schema::Tuple {
                    items: vec![$(self.$idx.to_bytes()),+],
                };
                buf.put_slice(&encode_message(&tuple));
            }

            fn decode(data: &[u8]) -> Result<Self, EncodingError> {
                let tuple: schema::Tuple = decode_message(data)?;
                if tuple.items.len() != $len {
                    return Err(EncodingError::DecodeFailed(format!(
                        "tuple has {} items, expected {}",
                        tuple.items.len(),
                        $len
                    )));
                }
                Ok(($($name::decode(&tuple.items[$idx])?,)+))
            }
        }
    };
}

impl_tuple!(1 => A: 0);
impl_tuple!(2 => A: 0, B: 1);
impl_tuple!(3 => A: 0, B: 1, C: 2);
impl_tuple!(4 => A: 0, B: 1, C: 2, D: 3);

/// Encode a protocol message.
pub fn encode_message<M: prost::Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

/// Decode a protocol message from a whole buffer.
pub fn decode_message<M: prost::Message + Default>(data: &[u8]) -> Result<M, EncodingError> {
    Ok(M::decode(data)?)
}

/// Encode `value` into a caller-provided buffer, returning the bytes written.
pub fn encode_into<T: WireValue>(value: &T, out: &mut [u8]) -> Result<usize, EncodingError> {
    let encoded = value.to_bytes();
    if encoded.len() > out.len() {
        return Err(EncodingError::EncodeFailed(format!(
            "value needs {} bytes, output buffer holds {}",
            encoded.len(),
            out.len()
        )));
    }
    out[..encoded.len()].copy_from_slice(&encoded);
    Ok(encoded.len())
}

/// Decode a bytes value into a caller-provided buffer, returning its length.
pub fn decode_bytes_into(data: &[u8], out: &mut [u8]) -> Result<usize, EncodingError> {
    let payload = decode_length_prefixed(data)?;
    if payload.len() > out.len() {
        return Err(EncodingError::BufferTooSmall {
            needed: payload.len(),
            available: out.len(),
        });
    }
    out[..payload.len()].copy_from_slice(payload);
    Ok(payload.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(data: &[u8]) -> String {
        data.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn check<T: WireValue + PartialEq + std::fmt::Debug>(cases: &[(T, &str)]) {
        for (value, encoded) in cases {
            assert_eq!(hex(&value.to_bytes()), *encoded, "encode {value:?}");
            assert_eq!(&T::decode(&unhex(encoded)).unwrap(), value, "decode {encoded}");
        }
    }

    #[test]
    fn test_literal_vectors() {
        assert_eq!(hex(&300u32.to_bytes()), "ac02");
        assert_eq!(hex(&"foo".to_string().to_bytes()), "03666f6f");
        assert_eq!(hex(&true.to_bytes()), "01");
        assert!(ObjectHandle::decode(&[0x00]).unwrap().is_null());
    }

    #[test]
    fn test_double() {
        check(&[
            (0.0f64, "0000000000000000"),
            (-1.0, "000000000000f0bf"),
            (3.14159265359, "ea2e4454fb210940"),
            (f64::INFINITY, "000000000000f07f"),
            (f64::NEG_INFINITY, "000000000000f0ff"),
        ]);
        assert!(f64::decode(&unhex("000000000000f87f")).unwrap().is_nan());
    }

    #[test]
    fn test_float() {
        check(&[
            (3.14159265359f32, "db0f4940"),
            (-1.0, "000080bf"),
            (0.0, "00000000"),
            (f32::INFINITY, "0000807f"),
            (f32::NEG_INFINITY, "000080ff"),
        ]);
        assert!(f32::decode(&unhex("0000c07f")).unwrap().is_nan());
    }

    #[test]
    fn test_sint32() {
        check(&[
            (0i32, "00"),
            (1, "02"),
            (42, "54"),
            (300, "d804"),
            (-33, "41"),
            (i32::MAX, "feffffff0f"),
            (i32::MIN, "ffffffff0f"),
        ]);
    }

    #[test]
    fn test_sint64() {
        check(&[
            (0i64, "00"),
            (1, "02"),
            (42, "54"),
            (300, "d804"),
            (1234567890000, "a091d89fee47"),
            (-33, "41"),
        ]);
    }

    #[test]
    fn test_unsigned() {
        check(&[(0u32, "00"), (1, "01"), (42, "2a"), (300, "ac02")]);
        check(&[(1234567890000u64, "d088ec8ff723"), (u64::MAX, "ffffffffffffffffff01")]);
    }

    #[test]
    fn test_uint32_rejects_wide_values() {
        let err = u32::decode(&unhex("d088ec8ff723")).unwrap_err();
        assert!(matches!(err, EncodingError::DecodeFailed(_)));
    }

    #[test]
    fn test_bool() {
        check(&[(true, "01"), (false, "00")]);
    }

    #[test]
    fn test_string() {
        check(&[
            (String::new(), "00"),
            ("testing".to_string(), "0774657374696e67"),
            ("\u{2122}".to_string(), "03e284a2"),
        ]);
        let err = String::decode(&unhex("02c328")).unwrap_err();
        assert!(matches!(err, EncodingError::DecodeFailed(_)));
    }

    #[test]
    fn test_bytes() {
        check(&[
            (Bytes::new(), "00"),
            (Bytes::from_static(&[0xba, 0xda, 0x55]), "03bada55"),
            (Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]), "04deadbeef"),
        ]);
        let empty = Bytes::decode(&[0x00]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_truncated_values() {
        assert_eq!(String::decode(&unhex("0574")), Err(EncodingError::Truncated));
        assert_eq!(u64::decode(&[0x80]), Err(EncodingError::Truncated));
        assert_eq!(f64::decode(&[0x00; 4]), Err(EncodingError::Truncated));
        assert!(matches!(
            u32::decode(&[0x01, 0x02]),
            Err(EncodingError::DecodeFailed(_))
        ));
    }

    #[test]
    fn test_object_handle() {
        check(&[(ObjectHandle::new(0), "00"), (ObjectHandle::new(300), "ac02")]);
    }

    #[test]
    fn test_double32() {
        check(&[(Double32(-1.0), "000000000000f0bf"), (Double32(0.0), "0000000000000000")]);
        assert!(Double32::decode(&unhex("000000000000f87f")).unwrap().0.is_nan());
        assert_eq!(Double32::decode(&unhex("000000000000f07f")).unwrap().0, f32::INFINITY);
    }

    #[test]
    fn test_tuple() {
        check(&[((1u32,), "0a0101")]);
        check(&[((1u32, "jeb".to_string(), false), "0a01010a04036a65620a0100")]);
        let err = <(u32, u32)>::decode(&unhex("0a0101")).unwrap_err();
        assert!(matches!(err, EncodingError::DecodeFailed(_)));
    }

    #[test]
    fn test_list() {
        check(&[
            (Vec::<u32>::new(), ""),
            (vec![1u32], "0a0101"),
            (vec![1u32, 2, 3, 4], "0a01010a01020a01030a0104"),
        ]);
    }

    #[test]
    fn test_set() {
        check(&[
            (BTreeSet::<u32>::new(), ""),
            (BTreeSet::from([1u32]), "0a0101"),
            (BTreeSet::from([1u32, 2, 3, 4]), "0a01010a01020a01030a0104"),
        ]);
        let set: HashSet<u32> = HashSet::decode(&unhex("0a01010a0102")).unwrap();
        assert_eq!(set, HashSet::from([1, 2]));
    }

    #[test]
    fn test_dictionary() {
        check(&[
            (BTreeMap::<String, u32>::new(), ""),
            (BTreeMap::from([(String::new(), 0u32)]), "0a060a0100120100"),
            (
                BTreeMap::from([
                    ("foo".to_string(), 42u32),
                    ("bar".to_string(), 365),
                    ("baz".to_string(), 3),
                ]),
                "0a0a0a04036261721202ed020a090a040362617a1201030a090a0403666f6f12012a",
            ),
        ]);
    }

    #[test]
    fn test_hash_map_matches_btree_map() {
        let hashed: HashMap<String, u32> =
            HashMap::from([("foo".to_string(), 42), ("bar".to_string(), 365)]);
        let ordered: BTreeMap<String, u32> = hashed.clone().into_iter().collect();
        assert_eq!(hashed.to_bytes(), ordered.to_bytes());
    }

    #[test]
    fn test_nested_collections() {
        let value = BTreeMap::from([("a".to_string(), vec![1i32, -2]), ("b".to_string(), vec![])]);
        let decoded = BTreeMap::<String, Vec<i32>>::decode(&value.to_bytes()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_malformed_collection() {
        let err = Vec::<u32>::decode(&[0x0a, 0x05, 0x01]).unwrap_err();
        assert!(matches!(err, EncodingError::DecodeFailed(_)));
    }

    #[test]
    fn test_encode_into_fixed_buffer() {
        let mut out = [0u8; 2];
        assert_eq!(encode_into(&300u32, &mut out).unwrap(), 2);
        assert_eq!(out, [0xac, 0x02]);
        let err = encode_into(&"foo".to_string(), &mut out).unwrap_err();
        assert!(matches!(err, EncodingError::EncodeFailed(_)));
    }

    #[test]
    fn test_decode_bytes_into() {
        let mut out = [0u8; 4];
        assert_eq!(decode_bytes_into(&unhex("03bada55"), &mut out).unwrap(), 3);
        assert_eq!(&out[..3], &[0xba, 0xda, 0x55]);
        assert_eq!(decode_bytes_into(&[0x00], &mut out).unwrap(), 0);

        let mut small = [0u8; 2];
        assert_eq!(
            decode_bytes_into(&unhex("03bada55"), &mut small),
            Err(EncodingError::BufferTooSmall {
                needed: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_message_round_trip() {
        let call = schema::ProcedureCall::new("TestService", "Int32ToString", [42i32.to_bytes()]);
        let decoded: schema::ProcedureCall = decode_message(&encode_message(&call)).unwrap();
        assert_eq!(decoded, call);
        assert_eq!(decoded.arguments[0].position, 0);
    }
}
