//! Identity directory lookup
//!
//! Used only to decorate what the client shows (names, avatars). Nothing in
//! call-state decisions depends on it.

use std::collections::HashMap;

use parking_lot::RwLock;

use callwire_signaling_transport::IdentityId;

/// Presentation details for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Resolves identity ids to presentation details.
///
/// Called on the client's event loop, so implementations should answer from
/// memory.
pub trait IdentityDirectory: Send + Sync {
    fn resolve(&self, id: &IdentityId) -> Option<DirectoryEntry>;
}

/// In-memory directory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    entries: RwLock<HashMap<IdentityId, DirectoryEntry>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<IdentityId>, display_name: impl Into<String>, avatar_url: Option<String>) {
        self.entries.write().insert(
            id.into(),
            DirectoryEntry {
                display_name: display_name.into(),
                avatar_url,
            },
        );
    }

    pub fn with_entry(self, id: impl Into<IdentityId>, display_name: impl Into<String>) -> Self {
        self.insert(id, display_name, None);
        self
    }
}

impl IdentityDirectory for StaticDirectory {
    fn resolve(&self, id: &IdentityId) -> Option<DirectoryEntry> {
        self.entries.read().get(id).cloned()
    }
}
