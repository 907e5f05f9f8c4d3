//! Content-change events and their origin tags.

use serde::{Deserialize, Serialize};

/// Where a content change came from.
///
/// Every mutation of the editor text carries one of these so consumers can
/// decide what to record or rebroadcast without a side-channel flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Typed by the local user.
    Local,
    /// Merged in from a collaborator.
    Remote,
    /// Restored by an undo or redo.
    HistoryReplay,
}

impl Origin {
    /// Whether the change should be recorded in the local undo history.
    pub fn records_history(self) -> bool {
        matches!(self, Origin::Local)
    }

    /// Whether the change must be propagated to peers.
    pub fn is_shared(self) -> bool {
        !matches!(self, Origin::Remote)
    }
}

/// A new text value tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub text: String,
    pub origin: Origin,
}

impl ContentChange {
    pub fn new(text: impl Into<String>, origin: Origin) -> Self {
        Self {
            text: text.into(),
            origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_local_records_history() {
        assert!(Origin::Local.records_history());
        assert!(!Origin::Remote.records_history());
        assert!(!Origin::HistoryReplay.records_history());
    }

    #[test]
    fn test_remote_changes_are_not_shared() {
        assert!(Origin::Local.is_shared());
        assert!(Origin::HistoryReplay.is_shared());
        assert!(!Origin::Remote.is_shared());
    }
}
