//! Codec for framing wire messages over a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::Decoder;

use super::constants::{CLIENT_RESPONSE_TO, HEADER_LENGTH, MAX_MESSAGE_SIZE};
use super::header::{Header, OpCode};
use super::message::Message;
use super::reply::Reply;
use crate::error::{Error, Result};

/// Codec for the length-prefixed wire protocol.
///
/// Decoding implements [`tokio_util::codec::Decoder`], yielding one
/// [`Reply`] per server frame; any other inbound operation is stream
/// corruption. Encoding is exposed as [`MessageCodec::encode_message`]
/// because outgoing messages are borrowed and stamped with a
/// per-connection request id at send time.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self
    }

    /// Encodes a complete message, header included, into `dst`.
    pub fn encode_message(request_id: i32, message: &dyn Message, dst: &mut BytesMut) {
        let mut body = BytesMut::new();
        message.write_body(&mut body);

        let header = Header::new(
            (HEADER_LENGTH + body.len()) as i32,
            request_id,
            CLIENT_RESPONSE_TO,
            message.op(),
        );
        dst.reserve(HEADER_LENGTH + body.len());
        header.write_to(dst);
        dst.put_slice(&body);
    }
}

impl Decoder for MessageCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if (length as usize) < HEADER_LENGTH || length as usize > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "invalid message length {length}"
            )));
        }

        if src.len() < length as usize {
            src.reserve(length as usize - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length as usize);
        let header = Header::read_from(&frame[..HEADER_LENGTH])?;
        frame.advance(HEADER_LENGTH);

        match header.op {
            OpCode::Reply => Ok(Some(Reply::read_body(header, &mut frame)?)),
            other => Err(Error::Protocol(format!(
                "received a non-reply message: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Document;
    use crate::wire::message::Command;

    #[test]
    fn test_encode_prefixes_header() {
        let command = Command::is_master();
        let mut buf = BytesMut::new();
        MessageCodec::encode_message(9, &command, &mut buf);

        let header = Header::read_from(&buf[..HEADER_LENGTH]).unwrap();
        assert_eq!(header.length as usize, buf.len());
        assert_eq!(header.request_id, 9);
        assert_eq!(header.response_to, CLIENT_RESPONSE_TO);
        assert_eq!(header.op, OpCode::Query);
    }

    #[test]
    fn test_decode_single_reply() {
        let reply = Reply::new(50, 9, 0, 0, 0, vec![Document::new().with("ok", 1.0)]);
        let mut buf = BytesMut::new();
        reply.write_wire(&mut buf);

        let mut codec = MessageCodec::new();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.response_to(), 9);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let reply = Reply::new(50, 9, 0, 0, 0, vec![Document::new().with("ok", 1.0)]);
        let mut full = BytesMut::new();
        reply.write_wire(&mut full);

        let mut codec = MessageCodec::new();
        let split = full.len() / 2;
        let mut partial = full.split_to(split);

        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_decode_multiple_replies_in_one_buffer() {
        let mut buf = BytesMut::new();
        Reply::new(1, 8, 0, 0, 0, vec![]).write_wire(&mut buf);
        Reply::new(2, 9, 0, 0, 0, vec![]).write_wire(&mut buf);

        let mut codec = MessageCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().response_to(), 8);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().response_to(), 9);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_absurd_length() {
        let mut buf = BytesMut::new();
        buf.put_i32_le(2);
        buf.put_slice(&[0u8; 12]);
        let mut codec = MessageCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_rejects_non_reply_operation() {
        let command = Command::is_master();
        let mut buf = BytesMut::new();
        MessageCodec::encode_message(1, &command, &mut buf);

        let mut codec = MessageCodec::new();
        assert!(codec.decode(&mut buf).is_err());
    }
}
