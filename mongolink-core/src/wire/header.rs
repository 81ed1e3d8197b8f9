//! Message header handling.

use bytes::{BufMut, BytesMut};

use super::constants::HEADER_LENGTH;
use crate::error::{Error, Result};

/// Operation codes the driver handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    /// A server reply to a query-style request.
    Reply = 1,
    /// Update documents in a collection.
    Update = 2001,
    /// Insert documents into a collection.
    Insert = 2002,
    /// Query a collection (also carries commands).
    Query = 2004,
    /// Fetch more documents from an open cursor.
    GetMore = 2005,
    /// Delete documents from a collection.
    Delete = 2006,
    /// Release server-side cursors.
    KillCursors = 2007,
}

impl OpCode {
    /// Maps a wire value to an operation code.
    pub fn from_code(code: i32) -> Option<OpCode> {
        match code {
            1 => Some(OpCode::Reply),
            2001 => Some(OpCode::Update),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            2005 => Some(OpCode::GetMore),
            2006 => Some(OpCode::Delete),
            2007 => Some(OpCode::KillCursors),
            _ => None,
        }
    }

    /// Returns the wire value for this operation code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// The 16-byte header prefixed to every wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total message length in bytes, header included.
    pub length: i32,
    /// The sender-assigned request id.
    pub request_id: i32,
    /// The request id this message answers; zero for client requests.
    pub response_to: i32,
    /// The operation code.
    pub op: OpCode,
}

impl Header {
    /// Creates a header.
    pub fn new(length: i32, request_id: i32, response_to: i32, op: OpCode) -> Self {
        Self {
            length,
            request_id,
            response_to,
            op,
        }
    }

    /// Appends the header's wire form to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LENGTH);
        dst.put_i32_le(self.length);
        dst.put_i32_le(self.request_id);
        dst.put_i32_le(self.response_to);
        dst.put_i32_le(self.op.code());
    }

    /// Parses a header from exactly [`HEADER_LENGTH`] bytes.
    pub fn read_from(raw: &[u8]) -> Result<Header> {
        if raw.len() < HEADER_LENGTH {
            return Err(Error::Protocol("truncated message header".to_string()));
        }
        let length = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let request_id = i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let response_to = i32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let code = i32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);

        let op = OpCode::from_code(code)
            .ok_or_else(|| Error::Protocol(format!("unexpected operation code {code}")))?;

        Ok(Header::new(length, request_id, response_to, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header::new(1234, 7, 0, OpCode::Query);
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);

        assert_eq!(buf.len(), HEADER_LENGTH);
        assert_eq!(Header::read_from(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_little_endian_layout() {
        let header = Header::new(0x0102_0304, 1, 2, OpCode::Reply);
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);

        assert_eq!(&buf[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[12..16], &[0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_unknown_op_code_rejected() {
        let mut buf = BytesMut::new();
        Header::new(16, 1, 0, OpCode::Reply).write_to(&mut buf);
        buf[12] = 0x63; // 99 is not a known operation.

        assert!(Header::read_from(&buf).is_err());
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(Header::read_from(&[0u8; 8]).is_err());
    }

    #[test]
    fn test_op_code_values() {
        assert_eq!(OpCode::Reply.code(), 1);
        assert_eq!(OpCode::Update.code(), 2001);
        assert_eq!(OpCode::Insert.code(), 2002);
        assert_eq!(OpCode::Query.code(), 2004);
        assert_eq!(OpCode::GetMore.code(), 2005);
        assert_eq!(OpCode::Delete.code(), 2006);
        assert_eq!(OpCode::KillCursors.code(), 2007);
        assert_eq!(OpCode::from_code(2004), Some(OpCode::Query));
        assert_eq!(OpCode::from_code(0), None);
    }
}
