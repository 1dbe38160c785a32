//! `Content-Length` framing for protocol messages.
//!
//! Wire format:
//!
//! ```text
//! Content-Length: <n>\r\n
//! [Other-Header: value\r\n]*
//! \r\n
//! <n bytes of UTF-8 JSON>
//! ```
//!
//! Header names are matched case-insensitively. Headers other than
//! `Content-Length` are accepted and ignored.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (16 MiB). Prevents OOM on malformed data.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Longest accepted header line, including the line terminator.
const MAX_HEADER_LINE: u64 = 8 * 1024;

const CONTENT_LENGTH: &str = "content-length";

/// Encode a body into a complete frame.
pub fn encode(body: &[u8]) -> Bytes {
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut buf = BytesMut::with_capacity(header.len() + body.len());
    buf.put(header.as_bytes());
    buf.put(body);
    buf.freeze()
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    let encoded = encode(body);
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Read one frame body.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte of a frame. An end of stream anywhere inside a frame is an error.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    let mut at_frame_start = true;

    loop {
        line.clear();
        let n = (&mut *reader).take(MAX_HEADER_LINE).read_line(&mut line).await?;
        if n == 0 {
            if at_frame_start {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside frame header",
            ));
        }
        at_frame_start = false;

        if !line.ends_with('\n') {
            if n as u64 >= MAX_HEADER_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame header line too long",
                ));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside frame header",
            ));
        }

        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }

        let (name, value) = header.split_once(':').ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed frame header: {:?}", header),
            )
        })?;
        if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            let length = value.trim().parse::<usize>().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid Content-Length: {:?}", value.trim()),
                )
            })?;
            content_length = Some(length);
        }
    }

    let length = content_length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length header")
    })?;
    if length > MAX_BODY_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body too large: {} bytes", length),
        ));
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}
