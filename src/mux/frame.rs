use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Header: 1 byte flags, 4 byte stream id, 2 byte payload length (spec.md
/// §4.3 "Mux Layer"). Payload follows immediately, no trailing delimiter.
const HEADER_LEN: usize = 1 + 4 + 2;

pub const FLAG_OPEN: u8 = 0x01;
pub const FLAG_DATA: u8 = 0x02;
pub const FLAG_CLOSE: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct RawFrame {
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn open(stream_id: u32) -> Self {
        Self {
            flags: FLAG_OPEN,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            flags: FLAG_DATA,
            stream_id,
            payload,
        }
    }

    pub fn close(stream_id: u32) -> Self {
        Self {
            flags: FLAG_CLOSE,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.flags & FLAG_OPEN != 0
    }

    pub fn is_data(&self) -> bool {
        self.flags & FLAG_DATA != 0
    }

    pub fn is_close(&self) -> bool {
        self.flags & FLAG_CLOSE != 0
    }
}

/// Frames `RawFrame`s onto a single peer channel. A substream's lifetime
/// never spans more than one `RawFrame` per write, so loss or reordering of
/// one substream's bytes (impossible within a reliable channel, but true by
/// construction) cannot corrupt another's.
#[derive(Default)]
pub struct MuxCodec;

impl Decoder for MuxCodec {
    type Item = RawFrame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let flags = src[0];
        let stream_id = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        let payload_len = u16::from_be_bytes([src[5], src[6]]) as usize;

        if src.len() < HEADER_LEN + payload_len {
            src.reserve(HEADER_LEN + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(RawFrame {
            flags,
            stream_id,
            payload,
        }))
    }
}

impl Encoder<RawFrame> for MuxCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: RawFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > u16::MAX as usize {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "mux frame payload exceeds 64KiB",
            ));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u8(item.flags);
        dst.put_u32(item.stream_id);
        dst.put_u16(item.payload.len() as u16);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_data_frame() {
        let mut codec = MuxCodec;
        let mut buf = BytesMut::new();
        let frame = RawFrame::data(7, Bytes::from_static(b"hello"));
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("one frame");
        assert_eq!(decoded.stream_id, 7);
        assert!(decoded.is_data());
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn returns_none_on_partial_header() {
        let mut codec = MuxCodec;
        let mut buf = BytesMut::from(&b"\x02\x00\x00"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn returns_none_until_payload_arrives() {
        let mut codec = MuxCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(RawFrame::data(1, Bytes::from_static(b"abcdef")), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(HEADER_LEN + 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
