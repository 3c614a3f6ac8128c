//! Wire encoding of procedure arguments, return values and protocol messages.
//!
//! Scalars are varints (zigzag for signed integers), fixed-width little-endian
//! floats, or length-prefixed strings and bytes. Collections are protocol
//! messages whose repeated field holds independently encoded items.
//!
//! # Example
//!
//! ```
//! use krpc_lite::codec::WireValue;
//!
//! assert_eq!(&300u32.to_bytes()[..], &[0xac, 0x02]);
//! assert_eq!(String::decode(&[0x03, b'f', b'o', b'o']).unwrap(), "foo");
//! ```

mod float;
mod handle;
mod value;
mod varint;

pub use float::{float32_to_float64, float64_to_float32};
pub use handle::ObjectHandle;
pub use value::{
    Double32, WireValue, decode_bytes_into, decode_message, encode_into, encode_message,
};
pub use varint::{
    MAX_VARINT_LEN, decode_varint, encode_varint, encoded_len_varint, zigzag_decode32,
    zigzag_decode64, zigzag_encode32, zigzag_encode64,
};
