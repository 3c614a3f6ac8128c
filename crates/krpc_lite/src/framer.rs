//! Length-delimited framing on top of a [`Transport`].
//!
//! Every message is `varint(len) || payload`. The header length is not known
//! up front, so it is read one byte at a time and decoded after each byte.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::codec::{decode_message, decode_varint, encode_message, encode_varint, encoded_len_varint};
use crate::error::{EncodingError, Result};
use crate::transport::Transport;

/// Largest payload accepted unless configured otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Partially received frame header.
///
/// Keeps the bytes read so far, so a reader polling with a timeout can stop
/// between bytes and resume later without losing its place.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    bytes: Vec<u8>,
    max_size: usize,
}

impl FrameHeader {
    pub fn new(max_size: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max_size,
        }
    }

    /// Add one header byte. Returns the payload length once the varint is
    /// complete, after which the header is empty again.
    pub fn push(&mut self, byte: u8) -> std::result::Result<Option<usize>, EncodingError> {
        self.bytes.push(byte);
        let decoded = decode_varint(&self.bytes);
        match decoded {
            Err(EncodingError::Truncated) => Ok(None),
            Err(e) => {
                self.bytes.clear();
                Err(e)
            }
            Ok((len, _)) => {
                self.bytes.clear();
                match usize::try_from(len) {
                    Ok(len) if len <= self.max_size => Ok(Some(len)),
                    _ => Err(EncodingError::DecodeFailed(format!(
                        "frame of {len} bytes exceeds maximum of {}",
                        self.max_size
                    ))),
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Read header bytes until the length is known.
///
/// With a timeout, returns `Ok(None)` when no byte arrives in time; bytes read
/// so far stay in `header`.
pub fn read_frame_header<T: Transport + ?Sized>(
    transport: &mut T,
    header: &mut FrameHeader,
    timeout: Option<Duration>,
) -> Result<Option<usize>> {
    loop {
        let byte = transport.partial_receive(1, timeout)?;
        let Some(&byte) = byte.first() else {
            return Ok(None);
        };
        if let Some(len) = header.push(byte)? {
            return Ok(Some(len));
        }
    }
}

/// Read a payload whose length came from a frame header.
pub fn read_payload<T: Transport + ?Sized>(transport: &mut T, len: usize) -> Result<Bytes> {
    if len == 0 {
        return Ok(Bytes::new());
    }
    let payload = transport.receive(len)?;
    trace!(len, "frame received");
    Ok(Bytes::from(payload))
}

/// Block until one whole frame has been read.
pub fn read_frame<T: Transport + ?Sized>(transport: &mut T, max_size: usize) -> Result<Bytes> {
    let mut header = FrameHeader::new(max_size);
    loop {
        if let Some(len) = read_frame_header(transport, &mut header, None)? {
            return read_payload(transport, len);
        }
    }
}

pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len_varint(payload.len() as u64) + payload.len());
    encode_varint(payload.len() as u64, &mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

pub fn write_frame<T: Transport + ?Sized>(transport: &mut T, payload: &[u8]) -> Result<()> {
    transport.send(&encode_frame(payload))?;
    trace!(len = payload.len(), "frame sent");
    Ok(())
}

pub fn write_message<T, M>(transport: &mut T, message: &M) -> Result<()>
where
    T: Transport + ?Sized,
    M: prost::Message,
{
    write_frame(transport, &encode_message(message))
}

pub fn read_message<T, M>(transport: &mut T, max_size: usize) -> Result<M>
where
    T: Transport + ?Sized,
    M: prost::Message + Default,
{
    let payload = read_frame(transport, max_size)?;
    Ok(decode_message(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::schema;
    use crate::transport::MemoryTransport;

    #[test]
    fn test_header_needs_every_byte() {
        let mut header = FrameHeader::default();
        assert_eq!(header.push(0xac).unwrap(), None);
        assert!(!header.is_empty());
        assert_eq!(header.push(0x02).unwrap(), Some(300));
        assert!(header.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut header = FrameHeader::new(16);
        let err = header.push(0x11).unwrap_err();
        assert!(matches!(err, EncodingError::DecodeFailed(_)));
        assert!(header.is_empty());
    }

    #[test]
    fn test_header_survives_timeouts() {
        let (mut client, mut server) = MemoryTransport::pair();
        let frame = encode_frame(&[7u8; 200]);
        assert_eq!(&frame[..2], &[0xc8, 0x01]);

        let mut header = FrameHeader::default();
        server.send(&frame[..1]).unwrap();
        let timeout = Some(Duration::from_millis(5));
        assert_eq!(read_frame_header(&mut client, &mut header, timeout).unwrap(), None);
        assert!(!header.is_empty());

        server.send(&frame[1..]).unwrap();
        let len = read_frame_header(&mut client, &mut header, timeout)
            .unwrap()
            .unwrap();
        assert_eq!(len, 200);
        assert_eq!(read_payload(&mut client, len).unwrap(), Bytes::from(vec![7u8; 200]));
    }

    #[test]
    fn test_message_round_trip() {
        let (mut client, mut server) = MemoryTransport::pair();
        let request = schema::Request {
            calls: vec![schema::ProcedureCall::new("KRPC", "GetStatus", Vec::<Bytes>::new())],
        };
        write_message(&mut client, &request).unwrap();
        let received: schema::Request =
            read_message(&mut server, DEFAULT_MAX_MESSAGE_SIZE).unwrap();
        assert_eq!(received, request);
    }

    #[test]
    fn test_empty_frame() {
        let (mut client, mut server) = MemoryTransport::pair();
        write_frame(&mut client, &[]).unwrap();
        assert!(read_frame(&mut server, 8).unwrap().is_empty());
    }

    #[test]
    fn test_eof_mid_frame() {
        let (mut client, mut server) = MemoryTransport::pair();
        server.send(&[0x05, 0x01]).unwrap();
        drop(server);
        let err = read_frame(&mut client, 64).unwrap_err();
        assert!(matches!(err, Error::Transport(crate::error::TransportError::Eof)));
    }
}
