//! Server reply messages.

use bytes::{Buf, BufMut, BytesMut};

use super::constants::*;
use super::header::{Header, OpCode};
use crate::bson::Document;
use crate::error::{Error, ReplyError, ReplyErrorKind, Result};

/// A decoded server reply.
#[derive(Debug, Clone)]
pub struct Reply {
    header: Header,
    flags: u32,
    cursor_id: i64,
    starting_from: i32,
    documents: Vec<Document>,
}

impl Reply {
    /// Creates a reply, primarily for servers and tests. The header's
    /// length field is computed from the payload.
    pub fn new(
        request_id: i32,
        response_to: i32,
        flags: u32,
        cursor_id: i64,
        starting_from: i32,
        documents: Vec<Document>,
    ) -> Self {
        let body_len: usize = documents.iter().map(Document::encoded_len).sum();
        let length = (HEADER_LENGTH + 4 + 8 + 4 + 4 + body_len) as i32;
        Self {
            header: Header::new(length, request_id, response_to, OpCode::Reply),
            flags,
            cursor_id,
            starting_from,
            documents,
        }
    }

    /// Parses a reply body. `src` must hold exactly the message bytes
    /// following the header.
    pub fn read_body(header: Header, src: &mut BytesMut) -> Result<Reply> {
        if src.len() < 20 {
            return Err(Error::Protocol("truncated reply body".to_string()));
        }
        let flags = src.get_u32_le();
        let cursor_id = src.get_i64_le();
        let starting_from = src.get_i32_le();
        let number_returned = src.get_i32_le();

        if number_returned < 0 {
            return Err(Error::Protocol(format!(
                "reply claims {number_returned} documents"
            )));
        }

        let mut documents = Vec::with_capacity(number_returned as usize);
        for _ in 0..number_returned {
            documents.push(Document::read_from(src)?);
        }

        Ok(Self {
            header,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// Returns the reply's header.
    pub fn header(&self) -> Header {
        self.header
    }

    /// The request id this reply answers.
    pub fn response_to(&self) -> i32 {
        self.header.response_to
    }

    /// The server-side cursor id; zero when the cursor is exhausted.
    /// Exhaustion handling belongs to the cursor layer above the core.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    /// Index of the first returned document within the cursor.
    pub fn starting_from(&self) -> i32 {
        self.starting_from
    }

    /// The documents carried by the reply.
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Returns true if the requested cursor was not found.
    pub fn is_cursor_not_found(&self) -> bool {
        self.flags & REPLY_FLAG_CURSOR_NOT_FOUND != 0
    }

    /// Returns true if the query failed server-side.
    pub fn is_query_failed(&self) -> bool {
        self.flags & REPLY_FLAG_QUERY_FAILED != 0
    }

    /// Returns true if the routing tier's shard configuration is stale.
    pub fn is_shard_config_stale(&self) -> bool {
        self.flags & REPLY_FLAG_SHARD_CONFIG_STALE != 0
    }

    /// Returns true if the server supports awaiting on the cursor.
    pub fn is_await_capable(&self) -> bool {
        self.flags & REPLY_FLAG_AWAIT_CAPABLE != 0
    }

    /// Extracts the failure carried by the reply, if any.
    ///
    /// Header flags are checked first; otherwise a single result
    /// document is examined for an `ok: 0` command response or an error
    /// message field.
    pub fn error(&self) -> Option<Error> {
        let single = (self.documents.len() == 1).then(|| &self.documents[0]);

        if self.is_cursor_not_found() {
            return Some(self.flag_error(single, ReplyErrorKind::CursorNotFound));
        }
        if self.is_query_failed() {
            return Some(match single.and_then(|doc| ReplyError::from_document(doc, true)) {
                Some(parsed) if parsed.kind() != ReplyErrorKind::General => Error::Reply(parsed),
                Some(parsed) => Error::Reply(parsed.with_kind(ReplyErrorKind::QueryFailed)),
                None => Error::Reply(ReplyError::new(ReplyErrorKind::QueryFailed, -1, -1, "")),
            });
        }
        if self.is_shard_config_stale() {
            return Some(self.flag_error(single, ReplyErrorKind::ShardConfigStale));
        }

        single
            .and_then(|doc| ReplyError::from_document(doc, false))
            .map(Error::Reply)
    }

    /// Fails with the reply's error, or returns the reply untouched.
    pub fn verify(self) -> Result<Reply> {
        match self.error() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    fn flag_error(&self, single: Option<&Document>, kind: ReplyErrorKind) -> Error {
        let parsed = single
            .and_then(|doc| ReplyError::from_document(doc, true))
            .unwrap_or_else(|| ReplyError::new(kind, -1, -1, ""));
        Error::Reply(parsed.with_kind(kind))
    }

    /// Appends the reply's full wire form, header included, to `dst`.
    /// Used by in-process test servers.
    pub fn write_wire(&self, dst: &mut BytesMut) {
        self.header.write_to(dst);
        dst.put_u32_le(self.flags);
        dst.put_i64_le(self.cursor_id);
        dst.put_i32_le(self.starting_from);
        dst.put_i32_le(self.documents.len() as i32);
        for document in &self.documents {
            document.write_to(dst);
        }
    }
}
