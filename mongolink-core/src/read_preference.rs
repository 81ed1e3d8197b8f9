//! Read preferences for routing queries across a cluster.

use crate::bson::Document;

/// Which server roles may answer a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadPreferenceMode {
    /// Only the writable primary.
    #[default]
    Primary,
    /// The primary when available, otherwise a secondary.
    PrimaryPreferred,
    /// Only a readable secondary.
    Secondary,
    /// A secondary when available, otherwise the primary.
    SecondaryPreferred,
    /// Whichever server answers fastest, regardless of role.
    Nearest,
}

impl ReadPreferenceMode {
    /// Returns true if a non-writable server may answer the read.
    pub fn allows_secondary(self) -> bool {
        !matches!(self, ReadPreferenceMode::Primary)
    }

    /// Returns true if the writable primary may answer the read.
    pub fn allows_primary(self) -> bool {
        !matches!(self, ReadPreferenceMode::Secondary)
    }
}

/// A read preference: a mode plus optional tag constraints.
///
/// Tag documents are matched in order; a server qualifies when every
/// field of at least one tag document appears in the server's tag set.
/// Tags constrain secondaries only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadPreference {
    mode: ReadPreferenceMode,
    tags: Vec<Document>,
}

impl ReadPreference {
    /// Creates a read preference with the given mode and no tags.
    pub fn new(mode: ReadPreferenceMode) -> Self {
        Self {
            mode,
            tags: Vec::new(),
        }
    }

    /// Reads go to the primary only.
    pub fn primary() -> Self {
        Self::new(ReadPreferenceMode::Primary)
    }

    /// Reads prefer the primary but tolerate secondaries.
    pub fn primary_preferred() -> Self {
        Self::new(ReadPreferenceMode::PrimaryPreferred)
    }

    /// Reads go to secondaries only.
    pub fn secondary() -> Self {
        Self::new(ReadPreferenceMode::Secondary)
    }

    /// Reads prefer secondaries but tolerate the primary.
    pub fn secondary_preferred() -> Self {
        Self::new(ReadPreferenceMode::SecondaryPreferred)
    }

    /// Reads go to the lowest-latency server of any role.
    pub fn nearest() -> Self {
        Self::new(ReadPreferenceMode::Nearest)
    }

    /// Adds a tag document constraint.
    pub fn with_tags(mut self, tags: Document) -> Self {
        self.tags.push(tags);
        self
    }

    /// Returns the mode.
    pub fn mode(&self) -> ReadPreferenceMode {
        self.mode
    }

    /// Returns the tag document constraints.
    pub fn tags(&self) -> &[Document] {
        &self.tags
    }

    /// Returns true if a non-writable server may answer the read.
    pub fn allows_secondary(&self) -> bool {
        self.mode.allows_secondary()
    }

    /// Returns true if a server's tag set satisfies the constraints.
    ///
    /// With no constraints every tag set matches.
    pub fn matches_tags(&self, server_tags: Option<&Document>) -> bool {
        if self.tags.is_empty() {
            return true;
        }
        let Some(server_tags) = server_tags else {
            return false;
        };
        self.tags.iter().any(|wanted| {
            wanted
                .iter()
                .all(|(key, value)| server_tags.get(key) == Some(value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_secondary_permissions() {
        assert!(!ReadPreferenceMode::Primary.allows_secondary());
        assert!(ReadPreferenceMode::PrimaryPreferred.allows_secondary());
        assert!(ReadPreferenceMode::Secondary.allows_secondary());
        assert!(!ReadPreferenceMode::Secondary.allows_primary());
        assert!(ReadPreferenceMode::Nearest.allows_secondary());
        assert!(ReadPreferenceMode::Nearest.allows_primary());
    }

    #[test]
    fn test_no_tags_matches_everything() {
        let preference = ReadPreference::secondary();
        assert!(preference.matches_tags(None));
        assert!(preference.matches_tags(Some(&Document::new().with("dc", "east"))));
    }

    #[test]
    fn test_tag_match_requires_all_fields_of_one_set() {
        let preference = ReadPreference::secondary()
            .with_tags(Document::new().with("dc", "east").with("rack", "a"));

        let full = Document::new().with("dc", "east").with("rack", "a");
        let partial = Document::new().with("dc", "east");

        assert!(preference.matches_tags(Some(&full)));
        assert!(!preference.matches_tags(Some(&partial)));
        assert!(!preference.matches_tags(None));
    }

    #[test]
    fn test_alternative_tag_sets() {
        let preference = ReadPreference::nearest()
            .with_tags(Document::new().with("dc", "east"))
            .with_tags(Document::new().with("dc", "west"));

        assert!(preference.matches_tags(Some(&Document::new().with("dc", "west"))));
        assert!(!preference.matches_tags(Some(&Document::new().with("dc", "north"))));
    }
}
