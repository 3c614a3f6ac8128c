//! Length-delimited protocol messages over async sockets.

use std::io;

use krpc_lite::codec::{decode_message, encode_message};
use krpc_lite::framer::{FrameHeader, encode_frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ServerError;

/// Read one framed message. Returns `None` when the peer closes the
/// connection between frames.
pub async fn read_message<R, M>(reader: &mut R, max_size: usize) -> Result<Option<M>, ServerError>
where
    R: AsyncRead + Unpin,
    M: prost::Message + Default,
{
    let mut header = FrameHeader::new(max_size);
    let len = loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && header.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(len) = header.push(byte)? {
            break len;
        }
    };

    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode_message(&payload)?))
}

pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
    M: prost::Message,
{
    writer.write_all(&encode_frame(&encode_message(message))).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use krpc_lite::schema::{Argument, ProcedureCall, Request};

    use super::*;

    #[tokio::test]
    async fn test_message_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let request = Request {
            calls: vec![ProcedureCall {
                service: "TestService".into(),
                procedure: "Int32ToString".into(),
                arguments: vec![Argument {
                    position: 0,
                    value: bytes::Bytes::from_static(&[0x54]),
                }],
                ..Default::default()
            }],
        };

        write_message(&mut client, &request).await.unwrap();
        let received: Request = read_message(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(received, request);
    }

    #[tokio::test]
    async fn test_clean_close_between_frames() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let received: Option<Request> = read_message(&mut server, 1024).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_close_inside_header_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x80]).await.unwrap();
        drop(client);
        let result: Result<Option<Request>, _> = read_message(&mut server, 1024).await;
        assert!(matches!(result, Err(ServerError::Io(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0xff, 0x01]).await.unwrap();
        let result: Result<Option<Request>, _> = read_message(&mut server, 16).await;
        assert!(matches!(result, Err(ServerError::Encoding(_))));
    }
}
