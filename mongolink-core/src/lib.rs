//! Core types and wire protocol for the mongolink driver.

#![warn(missing_docs)]

pub mod bson;
pub mod error;
pub mod read_preference;
pub mod version;
pub mod wire;

pub use error::{Error, ReplyError, ReplyErrorKind, Result};
pub use read_preference::{ReadPreference, ReadPreferenceMode};
pub use version::{Version, VersionRange};
