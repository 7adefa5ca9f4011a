use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Cap on a single handshake line (spec.md §4.2: "suggested 4 KiB").
const MAX_LINE_LEN: usize = 4096;

/// One `\n`-terminated UTF-8 line exchanged during the handshake phase
/// (spec.md §4.2 "Frame Codec"). Retired once the handshake completes; the
/// mux takes over the raw channel afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line(pub String);

impl Line {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LineCodecError {
    #[error("handshake line exceeded {MAX_LINE_LEN} bytes")]
    TooLong,
    #[error("handshake line was not valid UTF-8")]
    InvalidUtf8,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = Line;
    type Error = LineCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(newline_pos) = src.iter().position(|&b| b == b'\n') {
            if newline_pos > MAX_LINE_LEN {
                return Err(LineCodecError::TooLong);
            }
            let mut line = src.split_to(newline_pos + 1);
            line.truncate(line.len() - 1); // drop the '\n'
            let trimmed = if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
                line
            } else {
                line
            };
            let text = String::from_utf8(trimmed.to_vec()).map_err(|_| LineCodecError::InvalidUtf8)?;
            return Ok(Some(Line(text)));
        }
        if src.len() > MAX_LINE_LEN {
            return Err(LineCodecError::TooLong);
        }
        Ok(None)
    }
}

impl Encoder<Line> for LineCodec {
    type Error = LineCodecError;

    fn encode(&mut self, item: Line, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.0.len() > MAX_LINE_LEN {
            return Err(LineCodecError::TooLong);
        }
        dst.reserve(item.0.len() + 1);
        dst.extend_from_slice(item.0.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

impl Encoder<&str> for LineCodec {
    type Error = LineCodecError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(Line(item.to_string()), dst)
    }
}

/// The three handshake line shapes (spec.md §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeLine {
    HelloExposer,
    HelloAccessor,
    Ok,
    Challenge(String),
    Auth(String),
    Json(String),
}

impl HandshakeLine {
    pub fn parse(line: &str) -> Self {
        match line {
            "HELLO:exposer" => HandshakeLine::HelloExposer,
            "HELLO:accessor" => HandshakeLine::HelloAccessor,
            "OK" => HandshakeLine::Ok,
            other if other.starts_with("CHAL:") => HandshakeLine::Challenge(other[5..].to_string()),
            other if other.starts_with("AUTH:") => HandshakeLine::Auth(other[5..].to_string()),
            other => HandshakeLine::Json(other.to_string()),
        }
    }
}

impl std::fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeLine::HelloExposer => write!(f, "HELLO:exposer"),
            HandshakeLine::HelloAccessor => write!(f, "HELLO:accessor"),
            HandshakeLine::Ok => write!(f, "OK"),
            HandshakeLine::Challenge(hex) => write!(f, "CHAL:{hex}"),
            HandshakeLine::Auth(hex) => write!(f, "AUTH:{hex}"),
            HandshakeLine::Json(json) => write!(f, "{json}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_fixed_literal() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"HELLO:exposer\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(HandshakeLine::parse(line.as_str()), HandshakeLine::HelloExposer);
    }

    #[test]
    fn decodes_a_tagged_challenge_line() {
        assert_eq!(
            HandshakeLine::parse("CHAL:deadbeef"),
            HandshakeLine::Challenge("deadbeef".to_string())
        );
    }

    #[test]
    fn rejects_lines_over_the_cap() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'a'; MAX_LINE_LEN + 10]);
        buf.extend_from_slice(b"\n");
        assert!(matches!(codec.decode(&mut buf), Err(LineCodecError::TooLong)));
    }

    #[test]
    fn buffers_until_newline_arrives() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(&b"HELLO:acces"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"sor\n");
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(HandshakeLine::parse(line.as_str()), HandshakeLine::HelloAccessor);
    }
}
