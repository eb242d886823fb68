//! Length-prefixed frame codec for the inter-node protocol.
//!
//! Wire format per frame:
//! - `len: u32` (big-endian)
//! - `len` bytes of MsgPack: the [`Frame`] (invocation slot plus message)
//!
//! The MsgPack encoding is produced with `rmp_serde::to_vec_named()`, so
//! identical frames always encode to identical bytes.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use skitter_core::Invocation;
use tokio_util::codec::{Decoder, Encoder};

use super::messages::NodeMessage;

/// One frame on the wire: `(message-kind, invocation-opt, payload)`. The
/// kind is the serde tag of [`NodeMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub invocation: Option<Invocation>,
    pub message: NodeMessage,
}

impl Frame {
    /// A frame with no invocation slot.
    #[must_use]
    pub fn plain(message: NodeMessage) -> Self {
        Self {
            invocation: None,
            message,
        }
    }

    /// A frame carrying a record's invocation.
    #[must_use]
    pub fn invoked(invocation: Invocation, message: NodeMessage) -> Self {
        Self {
            invocation: Some(invocation),
            message,
        }
    }
}

/// Codec enforcing the length prefix and a maximum frame size.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length without consuming it.
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > self.max_frame_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "frame too large: {frame_len} bytes (max: {} bytes)",
                    self.max_frame_len
                ),
            ));
        }
        if src.len() < 4 + frame_len {
            return Ok(None);
        }

        src.advance(4);
        let bytes = src.split_to(frame_len);
        let frame = rmp_serde::from_slice(&bytes).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed frame: {err}"),
            )
        })?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = rmp_serde::to_vec_named(&item).map_err(|err| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unencodable frame: {err}"),
            )
        })?;
        if bytes.len() > self.max_frame_len || bytes.len() > u32::MAX as usize {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "frame too large: {} bytes (max: {} bytes)",
                    bytes.len(),
                    self.max_frame_len
                ),
            ));
        }

        dst.reserve(4 + bytes.len());
        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32(bytes.len() as u32);
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::messages::{PingPayload, WorkerMsgBody, WorkerMsgPayload};
    use skitter_core::Value;

    fn sample_frame() -> Frame {
        Frame::invoked(
            Invocation::Ref {
                node: "w1".to_string(),
                seq: 4,
            },
            NodeMessage::WorkerMsg(WorkerMsgPayload {
                target: 12,
                body: WorkerMsgBody::Record {
                    value: Value::from("payload"),
                },
            }),
        )
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut codec = FrameCodec::new(1024 * 1024);
        let mut buf = BytesMut::new();
        codec.encode(sample_frame(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_frame());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_a_full_frame() {
        let mut codec = FrameCodec::new(1024 * 1024);
        let mut full = BytesMut::new();
        codec.encode(sample_frame(), &mut full).unwrap();

        // Feed the bytes in two chunks; the first decode sees a partial
        // frame and must not consume anything.
        let mut buf = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&full[5..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_frame());
    }

    #[test]
    fn decode_handles_back_to_back_frames() {
        let mut codec = FrameCodec::new(1024 * 1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::plain(NodeMessage::Ping(PingPayload { seq: 1 })), &mut buf)
            .unwrap();
        codec
            .encode(Frame::plain(NodeMessage::Ping(PingPayload { seq: 2 })), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.message, NodeMessage::Ping(PingPayload { seq: 1 }));
        assert_eq!(second.message, NodeMessage::Ping(PingPayload { seq: 2 }));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected_on_encode() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        let err = codec.encode(sample_frame(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn oversized_frame_is_rejected_on_decode() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::new();
        buf.put_u32(64);
        buf.put_slice(&[0u8; 64]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn garbage_payload_is_invalid_data() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_slice(&[0xC1, 0xC1, 0xC1, 0xC1]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut codec = FrameCodec::new(1024 * 1024);
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        codec.encode(sample_frame(), &mut a).unwrap();
        codec.encode(sample_frame(), &mut b).unwrap();
        assert_eq!(a, b);
    }
}
