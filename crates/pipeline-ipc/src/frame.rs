//! Length-prefixed framing.
//!
//! ```text
//! [4 bytes: payload length, little-endian][payload]
//! ```

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{IpcError, IpcResult};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Encode a payload as one frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Read a length-prefixed frame from a buffer.
///
/// Returns `Ok(None)` if there isn't enough data for a complete frame, and
/// `Ok(Some((frame_data, consumed)))` otherwise. A length above `max` is a
/// protocol error; the stream cannot be resynchronized after it.
pub fn read_frame(buf: &[u8], max: usize) -> IpcResult<Option<(&[u8], usize)>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let mut len_bytes = [0u8; FRAME_HEADER_SIZE];
    len_bytes.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > max {
        return Err(IpcError::MessageTooLarge { size: len, max });
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }

    Ok(Some((
        &buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len],
        FRAME_HEADER_SIZE + len,
    )))
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> IpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_frame_partial() {
        let encoded = encode_frame(b"0123456789");
        assert!(read_frame(&encoded[..3], 64).unwrap().is_none());
        assert!(read_frame(&encoded[..9], 64).unwrap().is_none());

        let (frame, consumed) = read_frame(&encoded, 64).unwrap().unwrap();
        assert_eq!(frame, b"0123456789");
        assert_eq!(consumed, 14);
    }

    #[test]
    fn test_read_frame_leaves_following_bytes() {
        let mut buf = encode_frame(b"first");
        buf.extend(encode_frame(b""));
        buf.extend(encode_frame(b"third"));

        let (frame, consumed) = read_frame(&buf, 64).unwrap().unwrap();
        assert_eq!(frame, b"first");
        let rest = &buf[consumed..];

        let (frame, consumed) = read_frame(rest, 64).unwrap().unwrap();
        assert!(frame.is_empty());
        assert_eq!(consumed, FRAME_HEADER_SIZE);

        let (frame, _) = read_frame(&rest[consumed..], 64).unwrap().unwrap();
        assert_eq!(frame, b"third");
    }

    #[test]
    fn test_read_frame_rejects_oversized_length() {
        let encoded = encode_frame(&[7u8; 100]);
        assert!(matches!(
            read_frame(&encoded[..4], 64),
            Err(IpcError::MessageTooLarge { size: 100, max: 64 })
        ));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, b"abc").await.unwrap();
        assert_eq!(out, vec![3, 0, 0, 0, b'a', b'b', b'c']);
    }
}
