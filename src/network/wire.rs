//! Newline-delimited JSON wire protocol shared by rendezvous sessions and peer links.
//!
//! Frame format: one JSON document followed by `\n`.
//! Maximum frame size: 1MB (prevents memory exhaustion attacks)

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum Frame<M> {
    Message(M),
    /// A line arrived but did not parse as `M`.
    Malformed(String),
}

/// Pre-serialize a message into a newline-terminated frame (for broadcast efficiency).
pub fn serialize_frame<M: Serialize>(message: &M) -> Result<String, String> {
    let mut json =
        serde_json::to_string(message).map_err(|e| format!("Failed to serialize message: {}", e))?;

    // The limit covers the trailing newline, same as the reader
    if json.len() + 1 > MAX_FRAME_SIZE {
        return Err(format!(
            "Message too large: {} bytes (max: {})",
            json.len() + 1,
            MAX_FRAME_SIZE
        ));
    }

    json.push('\n');
    Ok(json)
}

/// Serialize a message and write it as a single frame.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let frame = serialize_frame(message)?;
    write_frame(writer, &frame).await
}

/// Write an already-serialized frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> Result<(), String> {
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| format!("Failed to write frame: {}", e))?;

    writer
        .flush()
        .await
        .map_err(|e| format!("Failed to flush: {}", e))?;

    Ok(())
}

/// Read one frame and deserialize it.
/// Returns Ok(None) on clean EOF (connection closed).
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<Frame<M>>, String>
where
    R: AsyncBufRead + Unpin,
    M: DeserializeOwned,
{
    let mut buf = Vec::new();
    loop {
        let limit = (MAX_FRAME_SIZE + 1 - buf.len()) as u64;
        let n = (&mut *reader)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| format!("Failed to read frame: {}", e))?;

        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            // EOF in the middle of a frame
            return Err("Connection closed mid-frame".to_string());
        }

        if buf.len() > MAX_FRAME_SIZE {
            return Err(format!(
                "Frame too large: more than {} bytes",
                MAX_FRAME_SIZE
            ));
        }

        if buf.last() == Some(&b'\n') {
            break;
        }
    }

    let line = String::from_utf8_lossy(&buf);
    let line = line.trim();
    if line.is_empty() {
        return Ok(Some(Frame::Malformed(String::new())));
    }

    match serde_json::from_str::<M>(line) {
        Ok(message) => Ok(Some(Frame::Message(message))),
        Err(e) => Ok(Some(Frame::Malformed(format!("{}: {}", e, truncate(line, 120))))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
