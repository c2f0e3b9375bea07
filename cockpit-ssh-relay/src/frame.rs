//! Length-prefixed frame codec used on the broker/relay transport (§4.A).

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("corrupt frame length prefix")]
    CorruptLength,
}

/// A decoded frame: the channel id (empty for control messages) and payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub channel: String,
    pub payload: Bytes,
}

/// Incrementally decodes frames out of a growing byte buffer.
///
/// Mirrors the cockpit wire format: `<decimal length>\n<channel id>\n<payload>`,
/// where `length` counts the channel id, its trailing newline, and the
/// payload bytes.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pulls out as many complete frames as are currently buffered.
    pub fn decode_all(&mut self) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn decode_one(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(prefix_nl) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let length: usize = std::str::from_utf8(&self.buf[..prefix_nl])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(FrameError::CorruptLength)?;

        let total = prefix_nl + 1 + length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let rest = &self.buf[prefix_nl + 1..total];
        let channel_nl = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(FrameError::CorruptLength)?;
        let channel = String::from_utf8_lossy(&rest[..channel_nl]).into_owned();
        let payload = Bytes::copy_from_slice(&rest[channel_nl + 1..]);

        self.buf.advance(total);
        Ok(Some(Frame { channel, payload }))
    }
}

/// Encodes a single frame the way `decode_one` expects to read it back.
pub fn encode_frame(channel: &str, payload: &[u8]) -> Bytes {
    let length = channel.len() + 1 + payload.len();
    let mut out = BytesMut::with_capacity(length + 16);
    out.extend_from_slice(length.to_string().as_bytes());
    out.extend_from_slice(b"\n");
    out.extend_from_slice(channel.as_bytes());
    out.extend_from_slice(b"\n");
    out.extend_from_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_control_frame() {
        let encoded = encode_frame("", br#"{"command":"init"}"#);
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, "");
        assert_eq!(&frames[0].payload[..], br#"{"command":"init"}"#);
    }

    #[test]
    fn round_trips_a_channel_frame() {
        let encoded = encode_frame("4", b"hello");
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames[0].channel, "4");
        assert_eq!(&frames[0].payload[..], b"hello");
    }

    #[test]
    fn waits_for_more_data_on_partial_frame() {
        let encoded = encode_frame("1", b"abc");
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded[..encoded.len() - 1]);
        assert!(decoder.decode_all().unwrap().is_empty());
        decoder.feed(&encoded[encoded.len() - 1..]);
        assert_eq!(decoder.decode_all().unwrap().len(), 1);
    }

    #[test]
    fn decodes_multiple_frames_fed_at_once() {
        let mut encoded = encode_frame("1", b"a").to_vec();
        encoded.extend_from_slice(&encode_frame("2", b"b"));
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].channel, "1");
        assert_eq!(frames[1].channel, "2");
    }

    #[test]
    fn non_decimal_prefix_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"notanumber\nx\npayload");
        assert!(matches!(decoder.decode_all(), Err(FrameError::CorruptLength)));
    }

    #[test]
    fn zero_length_payload_round_trips() {
        // A zero-length seqpacket message is just an empty channel id and payload.
        let encoded = encode_frame("", b"");
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let frames = decoder.decode_all().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 0);
    }
}
