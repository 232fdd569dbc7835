//! Length-prefixed CBOR framing for the broker wire protocol.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{TerminError, TerminResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted from a peer (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> TerminResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(TerminError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> TerminResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Read one frame from an async stream and decode it.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> TerminResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TerminError::Transport(format!("frame read: {e}"))),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TerminError::Codec(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| TerminError::Transport(format!("frame read: {e}")))?;
    cbor_decode(&payload).map(Some)
}

/// Encode a value and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> TerminResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = frame_encode(value)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| TerminError::Transport(format!("frame write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| TerminError::Transport(format!("frame flush: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ClientMessage, RequestBody};
    use crate::session::AttachEvent;

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &len).await.unwrap();
        let err = read_frame::<_, ClientMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, TerminError::Codec(_)));
    }

    #[tokio::test]
    async fn truncated_frame_is_a_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let frame = frame_encode(&ClientMessage {
            id: 7,
            body: RequestBody::ListSessions,
        })
        .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame[..frame.len() - 1]).await.unwrap();
        drop(a);
        let err = read_frame::<_, ClientMessage>(&mut b).await.unwrap_err();
        assert!(matches!(err, TerminError::Transport(_)));
    }

    #[test]
    fn oversized_payload_is_not_encoded() {
        let event = AttachEvent::Output(vec![0; MAX_FRAME_SIZE + 1]);
        assert!(matches!(frame_encode(&event), Err(TerminError::Codec(_))));
    }

    #[test]
    fn output_bytes_are_a_cbor_byte_string() {
        let event = AttachEvent::Output(vec![0xff; 64]);
        let frame = frame_encode(&event).unwrap();
        // As an integer array each 0xff would take two bytes.
        assert!(frame.len() < 64 + 32, "frame was {} bytes", frame.len());
        let back: AttachEvent = cbor_decode(&frame[4..]).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn async_frames_over_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let msg = ClientMessage {
            id: 1,
            body: RequestBody::Reap {
                session_id: "00".repeat(16),
            },
        };
        write_frame(&mut a, &msg).await.unwrap();
        drop(a);

        let got: Option<ClientMessage> = read_frame(&mut b).await.unwrap();
        assert_eq!(got, Some(msg));
        let eof: Option<ClientMessage> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }
}
