//! Content-Length framing for the session transport
//!
//! Each frame is a header block terminated by an empty line followed by a
//! JSON body of exactly `Content-Length` bytes:
//!
//! ```text
//! Content-Length: 119\r\n
//! \r\n
//! {"seq":1,"type":"request",...}
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{ProtocolError, ProtocolResult, MAX_FRAME_LENGTH, MAX_HEADER_LENGTH};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";

/// Frames JSON bodies with a Content-Length header
#[derive(Debug, Default)]
pub struct DapCodec {
    /// Body length of the frame currently being read
    content_length: Option<usize>,
}

impl DapCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for DapCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<String>> {
        let length = match self.content_length {
            Some(length) => length,
            None => {
                let Some(end) = find_header_end(src) else {
                    if src.len() > MAX_HEADER_LENGTH {
                        return Err(ProtocolError::InvalidMessage(format!(
                            "header block exceeds {} bytes",
                            MAX_HEADER_LENGTH
                        )));
                    }
                    return Ok(None);
                };

                let length = parse_content_length(&src[..end])?;
                src.advance(end + HEADER_TERMINATOR.len());
                self.content_length = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.content_length = None;
        let body = src.split_to(length);
        String::from_utf8(body.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::InvalidMessage("frame body is not valid UTF-8".to_string()))
    }
}

impl Encoder<String> for DapCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> ProtocolResult<()> {
        let header = format!("Content-Length: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

fn find_header_end(src: &[u8]) -> Option<usize> {
    src.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn parse_content_length(header: &[u8]) -> ProtocolResult<usize> {
    let header = std::str::from_utf8(header)
        .map_err(|_| ProtocolError::InvalidMessage("header is not valid UTF-8".to_string()))?;

    let value = header
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case(CONTENT_LENGTH))
        .map(|(_, value)| value.trim())
        .ok_or_else(|| ProtocolError::InvalidMessage("missing Content-Length header".to_string()))?;

    let length: usize = value.parse().map_err(|_| {
        ProtocolError::InvalidMessage(format!("invalid Content-Length '{}'", value))
    })?;
    if length > MAX_FRAME_LENGTH {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(length)
}
