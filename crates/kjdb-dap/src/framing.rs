//! Content-Length framed JSON transport.
//!
//! Each message is `Content-Length: <n>\r\n\r\n<json of n bytes>`. Header
//! names are case-insensitive; unknown headers are skipped.

use std::io::{BufRead, Write};

use thiserror::Error;

use crate::protocol::Message;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed header: {0:?}")]
    BadHeader(String),
    #[error("missing Content-Length header")]
    MissingLength,
    #[error("malformed message body: {0}")]
    BadBody(#[from] serde_json::Error),
}

/// Read one framed message. `Ok(None)` on a clean EOF at a message
/// boundary.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Message>, FramingError> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return if content_length.is_none() {
                Ok(None)
            } else {
                Err(FramingError::MissingLength)
            };
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| FramingError::BadHeader(trimmed.to_string()))?;
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .trim()
                .parse()
                .map_err(|_| FramingError::BadHeader(trimmed.to_string()))?;
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or(FramingError::MissingLength)?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Write one framed message and flush.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), FramingError> {
    let body = serde_json::to_vec(message)?;
    write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}
