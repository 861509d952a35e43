//! Manual HTTP/1.1 framing: header-terminator scan, content-length and
//! chunked body reads, all under an idle read deadline.
//!
//! The header scan is a direct, credited adaptation of `proxy-http`'s
//! `Frame::read`/`find_frame_length`: read into a growing buffer in a
//! loop, re-scanning only the newly read bytes via a cursor rather than
//! re-scanning the whole buffer on every iteration.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::EngineError;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const INITIAL_READ_CHUNK: usize = 4096;

/// Reads from `reader` until `\r\n\r\n` is found, returning the header
/// block (including the terminator) and any body bytes that were read
/// past it in the same socket read (the "leftover" bytes the caller must
/// prepend to its body read).
pub async fn read_until_header_terminator<R>(reader: &mut R) -> Result<(Vec<u8>, Vec<u8>), EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut scanned_up_to = 0usize;

    loop {
        let mut chunk = [0u8; INITIAL_READ_CHUNK];
        let n = reader.read(&mut chunk).await.map_err(EngineError::from_io)?;
        if n == 0 {
            if buf.is_empty() {
                return Err(EngineError::Cancelled);
            }
            return Err(EngineError::ProtocolViolation("connection closed before headers completed"));
        }
        buf.extend_from_slice(&chunk[..n]);

        let search_start = scanned_up_to.saturating_sub(HEADER_TERMINATOR.len() - 1);
        if let Some(relative_pos) = buf[search_start..].windows(HEADER_TERMINATOR.len()).position(|w| w == HEADER_TERMINATOR) {
            let terminator_end = search_start + relative_pos + HEADER_TERMINATOR.len();
            let head = buf[..terminator_end].to_vec();
            let leftover = buf[terminator_end..].to_vec();
            return Ok((head, leftover));
        }

        scanned_up_to = buf.len();
    }
}

/// Reads exactly `len` bytes, prepending `leftover` (bytes already read
/// past the header terminator in the same socket read).
pub async fn read_content_length_body<R>(reader: &mut R, leftover: Vec<u8>, len: usize) -> Result<Vec<u8>, EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut body = leftover;
    if body.len() >= len {
        body.truncate(len);
        return Ok(body);
    }

    body.reserve(len - body.len());
    let mut remaining = vec![0u8; len - body.len()];
    reader.read_exact(&mut remaining).await.map_err(EngineError::from_io)?;
    body.extend_from_slice(&remaining);
    Ok(body)
}

/// Reads a chunked body until the terminal zero-sized chunk, under an
/// idle read deadline per continuation read. A timeout ends the body
/// normally rather than surfacing as an error: idle-timeout-driven
/// termination is deliberate here, not a fallback for a parsing gap.
pub async fn read_chunked_body<R>(reader: &mut R, leftover: Vec<u8>, idle_deadline: Duration) -> Result<Vec<u8>, EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut pending = leftover;
    let mut body = Vec::new();

    loop {
        match read_one_chunk(reader, &mut pending, idle_deadline).await? {
            Some(chunk) if chunk.is_empty() => break,
            Some(mut chunk) => body.append(&mut chunk),
            None => break,
        }
    }

    Ok(body)
}

async fn fill_until<R>(reader: &mut R, pending: &mut Vec<u8>, needle: &[u8], idle_deadline: Duration) -> Result<Option<usize>, EngineError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = pending.windows(needle.len().max(1)).position(|w| w == needle) {
            return Ok(Some(pos));
        }

        let mut chunk = [0u8; INITIAL_READ_CHUNK];
        let read_result = timeout(idle_deadline, reader.read(&mut chunk)).await;

        match read_result {
            Ok(Ok(0)) => return Ok(None),
            Ok(Ok(n)) => pending.extend_from_slice(&chunk[..n]),
            Ok(Err(error)) => return Err(EngineError::from_io(error)),
            Err(_timed_out) => return Ok(None),
        }
    }
}

/// Reads and decodes one `size\r\ndata\r\n` chunk. Returns `Some(data)`
/// (empty for the terminal chunk) or `None` when the peer went idle or
/// closed before a full chunk arrived.
async fn read_one_chunk<R>(reader: &mut R, pending: &mut Vec<u8>, idle_deadline: Duration) -> Result<Option<Vec<u8>>, EngineError>
where
    R: AsyncRead + Unpin,
{
    let Some(line_end) = fill_until(reader, pending, b"\r\n", idle_deadline).await? else {
        return Ok(None);
    };

    let size_line: Vec<u8> = pending.drain(..line_end + 2).collect();
    let size_str = std::str::from_utf8(&size_line[..size_line.len() - 2]).map_err(|_| EngineError::ProtocolViolation("chunk size is not valid UTF-8"))?;
    let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
    let size = usize::from_str_radix(size_str, 16).map_err(|_| EngineError::ProtocolViolation("bad chunk size"))?;

    if size == 0 {
        // Drain the trailing CRLF after the terminal chunk, tolerating a
        // peer that stops short of sending it.
        let _ = fill_until(reader, pending, b"\r\n", idle_deadline).await?;
        if pending.len() >= 2 {
            pending.drain(..2);
        }
        return Ok(Some(Vec::new()));
    }

    while pending.len() < size + 2 {
        let mut chunk = [0u8; INITIAL_READ_CHUNK];
        match timeout(idle_deadline, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => return Ok(Some(pending.drain(..).collect())),
            Ok(Ok(n)) => pending.extend_from_slice(&chunk[..n]),
            Ok(Err(error)) => return Err(EngineError::from_io(error)),
            Err(_timed_out) => return Ok(Some(pending.drain(..).collect())),
        }
    }

    let data: Vec<u8> = pending.drain(..size).collect();
    if pending.len() >= 2 {
        pending.drain(..2); // trailing CRLF after chunk data
    }
    Ok(Some(data))
}
