//! Multipart framing over a plain `TcpStream`.
//!
//! None of the retrieved example crates depend on a ZeroMQ binding, so the
//! "reliable stream-of-frames abstraction" required by spec.md §6 is
//! implemented directly on top of `tokio::net::TcpStream`, in the style of
//! the teacher's length-prefixed `DriftFrame` (`[len][type][payload][crc]`):
//! here each logical multipart message is `[u32 BE frame count]` followed by
//! `[u32 BE length][payload]` per frame. One TCP connection carries exactly
//! one multipart message in each direction for the request/reply and
//! fire-and-forget paths this crate uses (§4.D, §4.E).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TransportError;

/// Maximum encoded message size, mirroring the teacher's `MAX_MESSAGE_SIZE`
/// guard in `message::codec` (spec.md §4.A).
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Hard ceiling on frame count, defending against a malicious peer claiming
/// billions of zero-length frames.
const MAX_FRAMES: u32 = 64;

pub async fn write_multipart(
    stream: &mut TcpStream,
    frames: &[Vec<u8>],
) -> Result<(), TransportError> {
    let total: usize = frames.iter().map(|f| f.len() + 4).sum::<usize>() + 4;
    if total > MAX_MESSAGE_SIZE {
        return Err(TransportError::Unexpected(format!(
            "encoded multipart message too large: {total} bytes"
        )));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }

    stream
        .write_all(&buf)
        .await
        .map_err(|e| TransportError::Unexpected(format!("write failed: {e}")))
}

pub async fn read_multipart(stream: &mut TcpStream) -> Result<Vec<Vec<u8>>, TransportError> {
    let mut count_buf = [0u8; 4];
    stream
        .read_exact(&mut count_buf)
        .await
        .map_err(|e| TransportError::Unexpected(format!("read failed: {e}")))?;
    let count = u32::from_be_bytes(count_buf);
    if count > MAX_FRAMES {
        return Err(TransportError::InvalidMessage(format!(
            "frame count {count} exceeds maximum {MAX_FRAMES}"
        )));
    }

    let mut frames = Vec::with_capacity(count as usize);
    let mut total = 0usize;
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TransportError::Unexpected(format!("read failed: {e}")))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        total += len;
        if total > MAX_MESSAGE_SIZE {
            return Err(TransportError::InvalidMessage(
                "multipart message exceeds maximum size".into(),
            ));
        }
        let mut frame = vec![0u8; len];
        stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| TransportError::Unexpected(format!("read failed: {e}")))?;
        frames.push(frame);
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn multipart_roundtrips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let frames = vec![b"one".to_vec(), b"".to_vec(), b"three".to_vec()];
        let frames_clone = frames.clone();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_multipart(&mut stream).await.unwrap()
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        write_multipart(&mut client, &frames_clone).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, frames);
    }

    #[tokio::test]
    async fn oversized_frame_count_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_multipart(&mut stream).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&(MAX_FRAMES + 1).to_be_bytes())
            .await
            .unwrap();

        let result = server.await.unwrap();
        assert!(matches!(result, Err(TransportError::InvalidMessage(_))));
    }
}
