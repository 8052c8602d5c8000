//! Length-prefixed framing
//!
//! Wire format: `[4-byte big-endian length][JSON WireBatch]`.

use crate::error::{TransportError, TransportResult};
use crate::wire::WireBatch;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the length prefix
pub const FRAME_HEADER_SIZE_BYTES: usize = 4;

/// Encode a batch as one frame
///
/// # Errors
/// `FrameTooLarge` if the encoded batch exceeds `max_size`.
pub fn encode_frame(batch: &WireBatch, max_size: usize) -> TransportResult<Bytes> {
    let json = serde_json::to_vec(batch).map_err(TransportError::codec)?;
    if json.len() > max_size || json.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            size: json.len(),
            limit: max_size,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE_BYTES + json.len());
    buf.put_u32(json.len() as u32);
    buf.put_slice(&json);
    Ok(buf.freeze())
}

/// Read one frame
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_size: usize, peer: &str) -> TransportResult<Option<WireBatch>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; FRAME_HEADER_SIZE_BYTES];
    if let Err(e) = reader.read_exact(&mut len_bytes).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(TransportError::io(peer, &e));
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_size {
        return Err(TransportError::FrameTooLarge {
            size: len,
            limit: max_size,
        });
    }

    let mut buffer = vec![0u8; len];
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|e| TransportError::io(peer, &e))?;

    let batch = serde_json::from_slice(&buffer).map_err(TransportError::codec)?;
    Ok(Some(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::WireMessage;
    use tokio::io::AsyncWriteExt;

    fn join(req: u64) -> WireBatch {
        WireBatch::single(
            "h2:1",
            WireMessage::JoinRequest {
                req,
                addr: "h2:1".into(),
            },
        )
    }

    #[test]
    fn test_header_is_big_endian_length() {
        let frame = encode_frame(&join(1), 1024).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_SIZE_BYTES);
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let err = encode_frame(&join(1), 8).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { limit: 8, .. }));
    }

    #[tokio::test]
    async fn test_frames_read_back_in_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        for req in 1..=3 {
            client
                .write_all(&encode_frame(&join(req), 1024).unwrap())
                .await
                .unwrap();
        }
        drop(client);

        for req in 1..=3 {
            let batch = read_frame(&mut server, 1024, "h2:1").await.unwrap().unwrap();
            assert_eq!(batch, join(req));
        }
        assert!(read_frame(&mut server, 1024, "h2:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_declared_length_over_limit() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&1_000_000u32.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server, 1024, "h2:1").await.unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { size: 1_000_000, .. }));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_codec_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(b"nope").await.unwrap();
        let err = read_frame(&mut server, 1024, "h2:1").await.unwrap_err();
        assert!(matches!(err, TransportError::Codec { .. }));
    }
}
