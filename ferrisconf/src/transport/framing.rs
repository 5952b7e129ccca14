//! NETCONF message framing.
//!
//! Two framings exist: the base:1.0 end-of-message delimiter `]]>]]>` and
//! base:1.1 chunked framing (`\n#<len>\n<data>...\n##\n`). The hello
//! exchange always uses the delimiter; chunked framing applies afterwards
//! when both sides advertise base:1.1.

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;

use crate::error::TransportError;

/// End-of-message delimiter for base:1.0 framing.
pub const END_OF_MESSAGE: &[u8] = b"]]>]]>";

const MAX_CHUNK_SIZE: u64 = 4_294_967_295;
const MAX_CHUNK_HEADER_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    EndOfMessage,
    Chunked,
}

/// Encode one message for the wire.
pub fn encode(framing: Framing, message: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(message.len() + 16);
    match framing {
        Framing::EndOfMessage => {
            out.extend_from_slice(message.as_bytes());
            out.extend_from_slice(END_OF_MESSAGE);
        }
        Framing::Chunked => {
            out.extend_from_slice(format!("\n#{}\n", message.len()).as_bytes());
            out.extend_from_slice(message.as_bytes());
            out.extend_from_slice(b"\n##\n");
        }
    }
    out.freeze()
}

/// Accumulates inbound bytes and yields complete messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    framing: Framing,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            framing,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Switch framing. Bytes already buffered are decoded with the new framing.
    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<String>, TransportError> {
        let bytes = match self.framing {
            Framing::EndOfMessage => self.next_delimited(),
            Framing::Chunked => self.next_chunked()?,
        };
        match bytes {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| TransportError::Framing(format!("message is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    fn next_delimited(&mut self) -> Option<Vec<u8>> {
        let pos = memmem::find(&self.buffer, END_OF_MESSAGE)?;
        let message = self.buffer.split_to(pos);
        self.buffer.advance(END_OF_MESSAGE.len());
        Some(message.to_vec())
    }

    fn next_chunked(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let buf = &self.buffer[..];

        // Tolerate stray whitespace between messages.
        let skip = buf.iter().take_while(|b| b.is_ascii_whitespace()).count();
        let mut pos = if skip > 0 && buf[skip - 1] == b'\n' {
            skip - 1
        } else {
            skip
        };
        let mut chunks: Vec<(usize, usize)> = Vec::new();

        loop {
            if buf.len() < pos + 3 {
                return Ok(None);
            }
            if buf[pos] != b'\n' || buf[pos + 1] != b'#' {
                return Err(TransportError::Framing(format!(
                    "expected chunk header at offset {}",
                    pos
                )));
            }

            if buf[pos + 2] == b'#' {
                if buf.len() < pos + 4 {
                    return Ok(None);
                }
                if buf[pos + 3] != b'\n' {
                    return Err(TransportError::Framing("malformed end-of-chunks".into()));
                }
                if chunks.is_empty() {
                    return Err(TransportError::Framing("message has no chunks".into()));
                }
                let mut message = Vec::with_capacity(chunks.iter().map(|(_, len)| len).sum());
                for (start, len) in &chunks {
                    message.extend_from_slice(&buf[*start..*start + *len]);
                }
                self.buffer.advance(pos + 4);
                return Ok(Some(message));
            }

            let digits_start = pos + 2;
            let newline = match memchr::memchr(b'\n', &buf[digits_start..]) {
                Some(offset) => digits_start + offset,
                None => {
                    if buf.len() - digits_start > MAX_CHUNK_HEADER_DIGITS {
                        return Err(TransportError::Framing("chunk size too long".into()));
                    }
                    return Ok(None);
                }
            };
            let len = parse_chunk_size(&buf[digits_start..newline])?;
            let data_start = newline + 1;
            if buf.len() < data_start + len {
                return Ok(None);
            }
            chunks.push((data_start, len));
            pos = data_start + len;
        }
    }
}

fn parse_chunk_size(digits: &[u8]) -> Result<usize, TransportError> {
    if digits.is_empty()
        || digits.len() > MAX_CHUNK_HEADER_DIGITS
        || digits[0] == b'0'
        || !digits.iter().all(u8::is_ascii_digit)
    {
        return Err(TransportError::Framing(format!(
            "invalid chunk size {:?}",
            String::from_utf8_lossy(digits)
        )));
    }
    let size: u64 = digits
        .iter()
        .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
    if size > MAX_CHUNK_SIZE {
        return Err(TransportError::Framing(format!("chunk size {} too large", size)));
    }
    usize::try_from(size).map_err(|_| TransportError::Framing("chunk size overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_message_split_across_reads() {
        let mut decoder = FrameDecoder::new(Framing::EndOfMessage);
        decoder.extend(b"<hello/>]]>");
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.extend(b"]]><rpc-reply/>]]>]]>");
        assert_eq!(decoder.next_message().unwrap().as_deref(), Some("<hello/>"));
        assert_eq!(
            decoder.next_message().unwrap().as_deref(),
            Some("<rpc-reply/>")
        );
        assert_eq!(decoder.next_message().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_chunked_multiple_chunks() {
        let mut decoder = FrameDecoder::new(Framing::Chunked);
        decoder.extend(b"\n#4\n<rpc");
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.extend(b"\n#17\n message-id=\"1\"/>\n##\n");
        assert_eq!(
            decoder.next_message().unwrap().as_deref(),
            Some("<rpc message-id=\"1\"/>")
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_chunked_round_trip_through_encoder() {
        let mut decoder = FrameDecoder::new(Framing::Chunked);
        let frame = encode(Framing::Chunked, "<rpc-reply><ok/></rpc-reply>");
        // Feed one byte at a time.
        for byte in frame.iter() {
            decoder.extend(&[*byte]);
        }
        assert_eq!(
            decoder.next_message().unwrap().as_deref(),
            Some("<rpc-reply><ok/></rpc-reply>")
        );
    }

    #[test]
    fn test_chunked_rejects_garbage() {
        let mut decoder = FrameDecoder::new(Framing::Chunked);
        decoder.extend(b"\n#abc\n");
        assert!(matches!(
            decoder.next_message(),
            Err(TransportError::Framing(_))
        ));

        let mut decoder = FrameDecoder::new(Framing::Chunked);
        decoder.extend(b"\n#0\n\n##\n");
        assert!(decoder.next_message().is_err());

        let mut decoder = FrameDecoder::new(Framing::Chunked);
        decoder.extend(b"<rpc-reply/>");
        assert!(decoder.next_message().is_err());
    }

    #[test]
    fn test_switch_framing_after_hello() {
        let mut decoder = FrameDecoder::new(Framing::EndOfMessage);
        decoder.extend(b"<hello/>]]>]]>\n#3\n<a>\n##\n");
        assert_eq!(decoder.next_message().unwrap().as_deref(), Some("<hello/>"));
        decoder.set_framing(Framing::Chunked);
        assert_eq!(decoder.next_message().unwrap().as_deref(), Some("<a>"));
    }

    #[test]
    fn test_encode_end_of_message() {
        assert_eq!(
            &encode(Framing::EndOfMessage, "<a/>")[..],
            b"<a/>]]>]]>"
        );
    }
}
