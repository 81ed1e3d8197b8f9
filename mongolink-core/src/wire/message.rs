//! Client-originated wire messages.

use std::fmt;

use bytes::{BufMut, BytesMut};

use super::constants::*;
use super::header::OpCode;
use crate::bson::Document;
use crate::error::{Error, Result};
use crate::read_preference::ReadPreference;
use crate::version::{Version, VersionRange};

/// A message the client can place on the wire.
///
/// Implementations encode only the opcode-specific body; the sending
/// connection prepends the 16-byte header once it has assigned the
/// request id.
pub trait Message: fmt::Debug + Send + Sync {
    /// The message's operation code.
    fn op(&self) -> OpCode;

    /// A short name for the operation, used in errors and traces.
    fn operation_name(&self) -> &str;

    /// Returns true if the server sends a reply for this message.
    fn expects_reply(&self) -> bool;

    /// The server versions this message requires, if restricted.
    fn required_version_range(&self) -> Option<&VersionRange> {
        None
    }

    /// The read preference routing this message, if it is a read.
    fn read_preference(&self) -> Option<&ReadPreference> {
        None
    }

    /// The encoded size of the largest document carried by the message.
    fn largest_document_len(&self) -> usize;

    /// Appends the opcode-specific body to `dst`.
    fn write_body(&self, dst: &mut BytesMut);

    /// Validates the message against a server's limits before any bytes
    /// are written to the socket.
    fn validate(&self, max_document_size: usize, server_version: &Version) -> Result<()> {
        let size = self.largest_document_len();
        if size > max_document_size {
            return Err(Error::DocumentTooLarge {
                size,
                maximum: max_document_size,
            });
        }
        if let Some(required) = self.required_version_range() {
            if !required.contains(server_version) {
                return Err(Error::ServerVersion {
                    operation: self.operation_name().to_string(),
                    required: required.clone(),
                    actual: server_version.clone(),
                });
            }
        }
        Ok(())
    }
}

fn put_full_name(dst: &mut BytesMut, database: &str, collection: &str) {
    dst.put_slice(database.as_bytes());
    dst.put_u8(b'.');
    dst.put_slice(collection.as_bytes());
    dst.put_u8(0);
}

/// A query against a collection.
#[derive(Debug, Clone)]
pub struct Query {
    database: String,
    collection: String,
    query: Document,
    return_fields: Option<Document>,
    number_to_skip: i32,
    number_to_return: i32,
    read_preference: Option<ReadPreference>,
    tailable: bool,
    replica_ok: bool,
    no_cursor_timeout: bool,
    await_data: bool,
    exhaust: bool,
    partial: bool,
}

impl Query {
    /// Creates a query returning the server's default batch size.
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        query: Document,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            query,
            return_fields: None,
            number_to_skip: 0,
            number_to_return: 0,
            read_preference: None,
            tailable: false,
            replica_ok: false,
            no_cursor_timeout: false,
            await_data: false,
            exhaust: false,
            partial: false,
        }
    }

    /// Restricts the fields returned for each document.
    pub fn with_return_fields(mut self, fields: Document) -> Self {
        self.return_fields = Some(fields);
        self
    }

    /// Skips the first `count` matching documents.
    pub fn with_skip(mut self, count: i32) -> Self {
        self.number_to_skip = count;
        self
    }

    /// Limits the number of documents in the first reply batch.
    pub fn with_batch_size(mut self, count: i32) -> Self {
        self.number_to_return = count;
        self
    }

    /// Permits a non-writable server to answer the query.
    pub fn with_replica_ok(mut self, replica_ok: bool) -> Self {
        self.replica_ok = replica_ok;
        self
    }

    /// Routes the query per the given read preference. The wire-level
    /// replica-ok flag follows the preference.
    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.replica_ok = read_preference.allows_secondary();
        self.read_preference = Some(read_preference);
        self
    }

    /// Makes the cursor tailable, optionally blocking for new data.
    pub fn with_tailable(mut self, await_data: bool) -> Self {
        self.tailable = true;
        self.await_data = await_data;
        self
    }

    /// Returns the query document.
    pub fn query(&self) -> &Document {
        &self.query
    }

    fn flags(&self) -> i32 {
        let mut flags = 0;
        if self.tailable {
            flags |= QUERY_FLAG_TAILABLE;
        }
        if self.replica_ok {
            flags |= QUERY_FLAG_REPLICA_OK;
        }
        if self.no_cursor_timeout {
            flags |= QUERY_FLAG_NO_CURSOR_TIMEOUT;
        }
        if self.await_data {
            flags |= QUERY_FLAG_AWAIT_DATA;
        }
        if self.exhaust {
            flags |= QUERY_FLAG_EXHAUST;
        }
        if self.partial {
            flags |= QUERY_FLAG_PARTIAL;
        }
        flags
    }
}

impl Message for Query {
    fn op(&self) -> OpCode {
        OpCode::Query
    }

    fn operation_name(&self) -> &str {
        "query"
    }

    fn expects_reply(&self) -> bool {
        true
    }

    fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference.as_ref()
    }

    fn largest_document_len(&self) -> usize {
        self.query
            .encoded_len()
            .max(self.return_fields.as_ref().map_or(0, Document::encoded_len))
    }

    fn write_body(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.flags());
        put_full_name(dst, &self.database, &self.collection);
        dst.put_i32_le(self.number_to_skip);
        dst.put_i32_le(self.number_to_return);
        self.query.write_to(dst);
        if let Some(fields) = &self.return_fields {
            fields.write_to(dst);
        }
    }
}

/// A database command, carried as a single-document query against the
/// `$cmd` pseudo-collection.
#[derive(Debug, Clone)]
pub struct Command {
    database: String,
    command: Document,
    name: String,
    required_version: Option<VersionRange>,
    read_preference: Option<ReadPreference>,
    replica_ok: bool,
}

impl Command {
    /// Creates a command against the given database.
    pub fn new(database: impl Into<String>, command: Document) -> Self {
        let name = command
            .iter()
            .next()
            .map(|(key, _)| key.to_string())
            .unwrap_or_else(|| "command".to_string());
        Self {
            database: database.into(),
            command,
            name,
            required_version: None,
            read_preference: None,
            replica_ok: false,
        }
    }

    /// Restricts the command to a server version range.
    pub fn with_required_version(mut self, range: VersionRange) -> Self {
        self.required_version = Some(range);
        self
    }

    /// Routes the command per the given read preference.
    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.replica_ok = read_preference.allows_secondary();
        self.read_preference = Some(read_preference);
        self
    }

    /// Permits a non-writable server to answer the command.
    pub fn with_replica_ok(mut self, replica_ok: bool) -> Self {
        self.replica_ok = replica_ok;
        self
    }

    /// The server identity command. Answerable by any server role.
    pub fn is_master() -> Self {
        Self::new("admin", Document::new().with("ismaster", 1)).with_replica_ok(true)
    }

    /// The server status command, used as a liveness and latency probe.
    pub fn server_status() -> Self {
        Self::new("admin", Document::new().with("serverStatus", 1)).with_replica_ok(true)
    }

    /// Requests a nonce for the challenge-response authentication
    /// handshake.
    pub fn get_nonce(database: impl Into<String>) -> Self {
        Self::new(database, Document::new().with("getnonce", 1)).with_replica_ok(true)
    }

    /// Answers an authentication challenge.
    pub fn authenticate(
        database: impl Into<String>,
        user: impl Into<String>,
        nonce: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(
            database,
            Document::new()
                .with("authenticate", 1)
                .with("user", user.into())
                .with("nonce", nonce.into())
                .with("key", key.into()),
        )
        .with_replica_ok(true)
    }

    /// Asks for the outcome of the preceding write on this connection.
    pub fn get_last_error(database: impl Into<String>, durability: Document) -> Self {
        let mut command = Document::new().with("getlasterror", 1);
        for (key, value) in durability.iter() {
            command.insert(key, value.clone());
        }
        Self::new(database, command)
    }

    /// Returns the command document.
    pub fn command(&self) -> &Document {
        &self.command
    }

    /// Returns the target database.
    pub fn database(&self) -> &str {
        &self.database
    }
}

impl Message for Command {
    fn op(&self) -> OpCode {
        OpCode::Query
    }

    fn operation_name(&self) -> &str {
        &self.name
    }

    fn expects_reply(&self) -> bool {
        true
    }

    fn required_version_range(&self) -> Option<&VersionRange> {
        self.required_version.as_ref()
    }

    fn read_preference(&self) -> Option<&ReadPreference> {
        self.read_preference.as_ref()
    }

    fn largest_document_len(&self) -> usize {
        self.command.encoded_len()
    }

    fn write_body(&self, dst: &mut BytesMut) {
        let flags = if self.replica_ok {
            QUERY_FLAG_REPLICA_OK
        } else {
            0
        };
        dst.put_i32_le(flags);
        put_full_name(dst, &self.database, "$cmd");
        dst.put_i32_le(0);
        dst.put_i32_le(-1);
        self.command.write_to(dst);
    }
}

/// An insert of one or more documents.
#[derive(Debug, Clone)]
pub struct Insert {
    database: String,
    collection: String,
    documents: Vec<Document>,
    continue_on_error: bool,
}

impl Insert {
    /// Creates an insert message.
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        documents: Vec<Document>,
        continue_on_error: bool,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            documents,
            continue_on_error,
        }
    }
}

impl Message for Insert {
    fn op(&self) -> OpCode {
        OpCode::Insert
    }

    fn operation_name(&self) -> &str {
        "insert"
    }

    fn expects_reply(&self) -> bool {
        false
    }

    fn largest_document_len(&self) -> usize {
        self.documents
            .iter()
            .map(Document::encoded_len)
            .max()
            .unwrap_or(0)
    }

    fn write_body(&self, dst: &mut BytesMut) {
        let flags = if self.continue_on_error {
            INSERT_FLAG_CONTINUE_ON_ERROR
        } else {
            0
        };
        dst.put_i32_le(flags);
        put_full_name(dst, &self.database, &self.collection);
        for document in &self.documents {
            document.write_to(dst);
        }
    }
}

/// An update of matching documents.
#[derive(Debug, Clone)]
pub struct Update {
    database: String,
    collection: String,
    query: Document,
    update: Document,
    upsert: bool,
    multi: bool,
}

impl Update {
    /// Creates an update message.
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        query: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            query,
            update,
            upsert,
            multi,
        }
    }
}

impl Message for Update {
    fn op(&self) -> OpCode {
        OpCode::Update
    }

    fn operation_name(&self) -> &str {
        "update"
    }

    fn expects_reply(&self) -> bool {
        false
    }

    fn largest_document_len(&self) -> usize {
        self.query.encoded_len().max(self.update.encoded_len())
    }

    fn write_body(&self, dst: &mut BytesMut) {
        dst.put_i32_le(0);
        put_full_name(dst, &self.database, &self.collection);
        let mut flags = 0;
        if self.upsert {
            flags |= UPDATE_FLAG_UPSERT;
        }
        if self.multi {
            flags |= UPDATE_FLAG_MULTI;
        }
        dst.put_i32_le(flags);
        self.query.write_to(dst);
        self.update.write_to(dst);
    }
}

/// A delete of matching documents.
#[derive(Debug, Clone)]
pub struct Delete {
    database: String,
    collection: String,
    query: Document,
    single: bool,
}

impl Delete {
    /// Creates a delete message.
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        query: Document,
        single: bool,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            query,
            single,
        }
    }
}

impl Message for Delete {
    fn op(&self) -> OpCode {
        OpCode::Delete
    }

    fn operation_name(&self) -> &str {
        "delete"
    }

    fn expects_reply(&self) -> bool {
        false
    }

    fn largest_document_len(&self) -> usize {
        self.query.encoded_len()
    }

    fn write_body(&self, dst: &mut BytesMut) {
        dst.put_i32_le(0);
        put_full_name(dst, &self.database, &self.collection);
        let flags = if self.single { DELETE_FLAG_SINGLE } else { 0 };
        dst.put_i32_le(flags);
        self.query.write_to(dst);
    }
}

/// A request for the next batch from an open cursor.
#[derive(Debug, Clone)]
pub struct GetMore {
    database: String,
    collection: String,
    cursor_id: i64,
    number_to_return: i32,
}

impl GetMore {
    /// Creates a get-more message.
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        cursor_id: i64,
        number_to_return: i32,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            cursor_id,
            number_to_return,
        }
    }
}

impl Message for GetMore {
    fn op(&self) -> OpCode {
        OpCode::GetMore
    }

    fn operation_name(&self) -> &str {
        "getMore"
    }

    fn expects_reply(&self) -> bool {
        true
    }

    fn largest_document_len(&self) -> usize {
        0
    }

    fn write_body(&self, dst: &mut BytesMut) {
        dst.put_i32_le(0);
        put_full_name(dst, &self.database, &self.collection);
        dst.put_i32_le(self.number_to_return);
        dst.put_i64_le(self.cursor_id);
    }
}

/// A release of server-side cursors the client no longer needs.
#[derive(Debug, Clone)]
pub struct KillCursors {
    cursor_ids: Vec<i64>,
}

impl KillCursors {
    /// Creates a kill-cursors message.
    pub fn new(cursor_ids: Vec<i64>) -> Self {
        Self { cursor_ids }
    }
}

impl Message for KillCursors {
    fn op(&self) -> OpCode {
        OpCode::KillCursors
    }

    fn operation_name(&self) -> &str {
        "killCursors"
    }

    fn expects_reply(&self) -> bool {
        false
    }

    fn largest_document_len(&self) -> usize {
        0
    }

    fn write_body(&self, dst: &mut BytesMut) {
        dst.put_i32_le(0);
        dst.put_i32_le(self.cursor_ids.len() as i32);
        for cursor_id in &self.cursor_ids {
            dst.put_i64_le(*cursor_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_body_layout() {
        let query = Query::new("db", "coll", Document::new().with("x", 1))
            .with_skip(5)
            .with_batch_size(10)
            .with_replica_ok(true);

        let mut buf = BytesMut::new();
        query.write_body(&mut buf);

        assert_eq!(
            i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            QUERY_FLAG_REPLICA_OK
        );
        assert_eq!(&buf[4..12], b"db.coll\0");
        assert_eq!(i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]), 5);
        assert_eq!(i32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]), 10);
    }

    #[test]
    fn test_command_targets_cmd_collection() {
        let command = Command::is_master();
        let mut buf = BytesMut::new();
        command.write_body(&mut buf);

        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("admin.$cmd"));
        assert!(command.expects_reply());
        assert_eq!(command.operation_name(), "ismaster");

        // Commands ask for exactly one result document.
        let name_end = 4 + "admin.$cmd".len() + 1;
        let number_to_return = i32::from_le_bytes([
            buf[name_end + 4],
            buf[name_end + 5],
            buf[name_end + 6],
            buf[name_end + 7],
        ]);
        assert_eq!(number_to_return, -1);
    }

    #[test]
    fn test_get_last_error_merges_durability() {
        let command = Command::get_last_error(
            "db",
            Document::new().with("w", 2).with("wtimeout", 500),
        );
        let doc = command.command();
        assert_eq!(doc.get_int("getlasterror"), Some(1));
        assert_eq!(doc.get_int("w"), Some(2));
        assert_eq!(doc.get_int("wtimeout"), Some(500));
    }

    #[test]
    fn test_insert_carries_all_documents() {
        let insert = Insert::new(
            "db",
            "coll",
            vec![
                Document::new().with("a", 1),
                Document::new().with("b", 2),
            ],
            true,
        );
        assert!(!insert.expects_reply());

        let mut buf = BytesMut::new();
        insert.write_body(&mut buf);
        assert_eq!(
            i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            INSERT_FLAG_CONTINUE_ON_ERROR
        );

        let docs_start = 4 + "db.coll".len() + 1;
        let mut rest = BytesMut::from(&buf[docs_start..]);
        assert!(Document::read_from(&mut rest).is_ok());
        assert!(Document::read_from(&mut rest).is_ok());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_update_flags() {
        let update = Update::new(
            "db",
            "coll",
            Document::new(),
            Document::new().with("x", 1),
            true,
            true,
        );
        let mut buf = BytesMut::new();
        update.write_body(&mut buf);

        let flags_at = 4 + "db.coll".len() + 1;
        let flags = i32::from_le_bytes([
            buf[flags_at],
            buf[flags_at + 1],
            buf[flags_at + 2],
            buf[flags_at + 3],
        ]);
        assert_eq!(flags, UPDATE_FLAG_UPSERT | UPDATE_FLAG_MULTI);
    }

    #[test]
    fn test_kill_cursors_body() {
        let message = KillCursors::new(vec![7, 9]);
        let mut buf = BytesMut::new();
        message.write_body(&mut buf);

        assert_eq!(buf.len(), 4 + 4 + 16);
        assert_eq!(i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 2);
    }

    #[test]
    fn test_validate_rejects_oversized_document() {
        let insert = Insert::new(
            "db",
            "coll",
            vec![Document::new().with("padding", "x".repeat(64))],
            false,
        );
        let error = insert.validate(16, &Version::unknown()).unwrap_err();
        assert!(matches!(error, Error::DocumentTooLarge { .. }));
    }

    #[test]
    fn test_validate_rejects_old_server() {
        let command = Command::new("admin", Document::new().with("newThing", 1))
            .with_required_version(VersionRange::at_least("2.6".parse().unwrap()));

        let old = "2.4.1".parse().unwrap();
        let error = command.validate(usize::MAX, &old).unwrap_err();
        assert!(matches!(error, Error::ServerVersion { .. }));

        assert!(command
            .validate(usize::MAX, &"2.6.0".parse().unwrap())
            .is_ok());
        assert!(command.validate(usize::MAX, &Version::unknown()).is_ok());
    }
}
