//! Write durability levels.

use mongolink_core::bson::Document;

/// How hard the server must try before acknowledging a write.
///
/// Durability is enforced with a get-last-error request linked to the
/// write message; [`Durability::as_document`] yields the fields merged
/// into that request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Durability {
    /// Fire-and-forget; no acknowledgement is requested.
    None,
    /// The server received the write.
    #[default]
    Ack,
    /// The write reached the journal, waiting at most `wtimeout`
    /// milliseconds.
    Journal {
        /// Milliseconds to wait for the journal sync; zero waits
        /// indefinitely.
        wtimeout: i32,
    },
    /// The write replicated to `w` members, waiting at most `wtimeout`
    /// milliseconds.
    Replica {
        /// Number of members (including the primary) that must hold the
        /// write.
        w: i32,
        /// Milliseconds to wait for replication; zero waits
        /// indefinitely.
        wtimeout: i32,
    },
}

impl Durability {
    /// Returns true if the write wants an acknowledgement at all.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, Durability::None)
    }

    /// Returns the get-last-error fields for this durability, or `None`
    /// for fire-and-forget writes.
    pub fn as_document(&self) -> Option<Document> {
        match self {
            Durability::None => None,
            Durability::Ack => Some(Document::new()),
            Durability::Journal { wtimeout } => {
                let mut doc = Document::new().with("j", true);
                if *wtimeout > 0 {
                    doc.insert("wtimeout", *wtimeout);
                }
                Some(doc)
            }
            Durability::Replica { w, wtimeout } => {
                let mut doc = Document::new().with("w", *w);
                if *wtimeout > 0 {
                    doc.insert("wtimeout", *wtimeout);
                }
                Some(doc)
            }
        }
    }
}
