//! Wire protocol framing and message types.
//!
//! Every message on the wire starts with a 16-byte little-endian header:
//! total length, request id, response-to id, and operation code. Request
//! ids are assigned by the sending connection; the response-to id of an
//! incoming [`Reply`] drives correlation with the originating request.

mod codec;
mod constants;
mod header;
mod message;
mod reply;

pub use codec::MessageCodec;
pub use constants::{
    CLIENT_RESPONSE_TO, DEFAULT_MAX_DOCUMENT_SIZE, HEADER_LENGTH, MAX_MESSAGE_SIZE,
};
pub use header::{Header, OpCode};
pub use message::{Command, Delete, GetMore, Insert, KillCursors, Message, Query, Update};
pub use reply::Reply;
