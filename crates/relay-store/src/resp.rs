//! RESP2 frames and a `tokio_util::codec` implementation for them.
//!
//! Only the client side is needed: commands go out as arrays of bulk
//! strings, replies come back as any frame type.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";
const CRLF_LEN: usize = 2;

const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024;
const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024;
const MAX_RECURSION_DEPTH: usize = 32;

/// Codec failure.
#[derive(Debug, Error)]
pub enum RespError {
    /// Not enough bytes buffered yet. Never escapes the decoder.
    #[error("incomplete frame")]
    Incomplete,

    /// The peer sent bytes that are not valid RESP.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One RESP2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespFrame {
    /// `+OK`
    SimpleString(String),
    /// `-ERR ...`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$3\r\nfoo`
    BulkString(Bytes),
    /// `$-1`
    Null,
    /// `*-1`
    NullArray,
    /// `*N` followed by N frames.
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Build a command: an array of bulk strings.
    pub fn command<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Array(
            parts
                .into_iter()
                .map(|p| Self::BulkString(Bytes::copy_from_slice(p.as_ref().as_bytes())))
                .collect(),
        )
    }

    /// Textual content of a simple or bulk string. Bulk strings that are
    /// not valid UTF-8 have none.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::SimpleString(s) => Some(s.clone()),
            Self::BulkString(b) => String::from_utf8(b.to_vec()).ok(),
            _ => None,
        }
    }
}

/// Encoder/decoder for [`RespFrame`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Encoder<RespFrame> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => dst.extend_from_slice(b"$-1\r\n"),
            RespFrame::NullArray => dst.extend_from_slice(b"*-1\r\n"),
            RespFrame::Array(items) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(items.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in items {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

impl Decoder for RespCodec {
    type Item = RespFrame;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_frame(&mut bytes, 0) {
            Ok(frame) => {
                let consumed = src.len() - bytes.len();
                src.advance(consumed);
                Ok(Some(frame))
            }
            Err(RespError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn decode_frame(bytes: &mut &[u8], depth: usize) -> Result<RespFrame, RespError> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(RespError::Protocol("nesting too deep".into()));
    }
    let Some(&prefix) = bytes.first() else {
        return Err(RespError::Incomplete);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(read_text_line(bytes)?)),
        b'-' => Ok(RespFrame::Error(read_text_line(bytes)?)),
        b':' => Ok(RespFrame::Integer(read_length(bytes)?)),
        b'$' => {
            let Some(len) = checked_len(read_length(bytes)?, MAX_BULK_STRING_SIZE)? else {
                return Ok(RespFrame::Null);
            };
            if bytes.len() < len + CRLF_LEN {
                return Err(RespError::Incomplete);
            }
            if &bytes[len..len + CRLF_LEN] != CRLF {
                return Err(RespError::Protocol("bulk string not CRLF-terminated".into()));
            }
            let data = Bytes::copy_from_slice(&bytes[..len]);
            *bytes = &bytes[len + CRLF_LEN..];
            Ok(RespFrame::BulkString(data))
        }
        b'*' => {
            let Some(len) = checked_len(read_length(bytes)?, MAX_FRAME_ELEMENTS)? else {
                return Ok(RespFrame::NullArray);
            };
            let mut items = Vec::with_capacity(len.min(64));
            for _ in 0..len {
                items.push(decode_frame(bytes, depth + 1)?);
            }
            Ok(RespFrame::Array(items))
        }
        other => Err(RespError::Protocol(format!(
            "unexpected type byte {:?}",
            char::from(other)
        ))),
    }
}

/// `-1` means null; anything else must be a non-negative length within `max`.
fn checked_len(n: i64, max: usize) -> Result<Option<usize>, RespError> {
    if n == -1 {
        return Ok(None);
    }
    let len = usize::try_from(n).map_err(|_| RespError::Protocol(format!("bad length {n}")))?;
    if len > max {
        return Err(RespError::Protocol(format!("length {len} exceeds {max}")));
    }
    Ok(Some(len))
}

fn read_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], RespError> {
    let pos = find_crlf(bytes).ok_or(RespError::Incomplete)?;
    let line = &bytes[..pos];
    *bytes = &bytes[pos + CRLF_LEN..];
    Ok(line)
}

fn read_text_line(bytes: &mut &[u8]) -> Result<String, RespError> {
    Ok(String::from_utf8_lossy(read_line(bytes)?).into_owned())
}

fn read_length(bytes: &mut &[u8]) -> Result<i64, RespError> {
    let line = read_line(bytes)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| RespError::Protocol(format!("bad integer {:?}", String::from_utf8_lossy(line))))
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
