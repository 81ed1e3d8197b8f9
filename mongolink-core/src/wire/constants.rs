//! Wire protocol constants.

/// Length of the message header in bytes.
pub const HEADER_LENGTH: usize = 16;

/// The response-to id carried by client-originated messages.
pub const CLIENT_RESPONSE_TO: i32 = 0;

/// Default maximum encoded document size, used until the server's
/// identity reply provides the real limit.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on a single wire message. Anything larger is treated as
/// stream corruption rather than a frame worth buffering.
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

/// Reply flag bit: the requested cursor id was not found.
pub const REPLY_FLAG_CURSOR_NOT_FOUND: u32 = 1 << 0;

/// Reply flag bit: the query failed; the reply holds one error document.
pub const REPLY_FLAG_QUERY_FAILED: u32 = 1 << 1;

/// Reply flag bit: the routing tier's shard configuration is stale.
pub const REPLY_FLAG_SHARD_CONFIG_STALE: u32 = 1 << 2;

/// Reply flag bit: the server supports blocking waits on the cursor.
pub const REPLY_FLAG_AWAIT_CAPABLE: u32 = 1 << 3;

/// Query flag bit: the cursor remains open after the initial data burst.
pub const QUERY_FLAG_TAILABLE: i32 = 1 << 1;

/// Query flag bit: reads may be served by a non-writable server.
pub const QUERY_FLAG_REPLICA_OK: i32 = 1 << 2;

/// Query flag bit: the server must not reap the cursor on inactivity.
pub const QUERY_FLAG_NO_CURSOR_TIMEOUT: i32 = 1 << 4;

/// Query flag bit: block briefly for data on an empty tailable cursor.
pub const QUERY_FLAG_AWAIT_DATA: i32 = 1 << 5;

/// Query flag bit: stream results in multiple reply messages.
pub const QUERY_FLAG_EXHAUST: i32 = 1 << 6;

/// Query flag bit: return partial results if a shard is down.
pub const QUERY_FLAG_PARTIAL: i32 = 1 << 7;

/// Insert flag bit: keep inserting after an individual failure.
pub const INSERT_FLAG_CONTINUE_ON_ERROR: i32 = 1 << 0;

/// Update flag bit: insert the document if no match exists.
pub const UPDATE_FLAG_UPSERT: i32 = 1 << 0;

/// Update flag bit: update every matching document.
pub const UPDATE_FLAG_MULTI: i32 = 1 << 1;

/// Delete flag bit: remove at most one matching document.
pub const DELETE_FLAG_SINGLE: i32 = 1 << 0;
