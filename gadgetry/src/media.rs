//! Media capture for gadget outputs.
//!
//! Gadgets that produce non-textual artifacts hand them to the
//! [`MediaStore`], which keeps the payloads out of the conversation and
//! exposes them to consumers by opaque id. The execution tree records
//! only the lightweight [`MediaRef`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A media payload produced by a gadget.
#[derive(Debug, Clone, Default)]
pub struct MediaItem {
    /// MIME-style kind tag, e.g. `image/png`.
    pub kind: String,
    /// Optional human description.
    pub description: Option<String>,
    /// Inline payload bytes, when the media is carried in-process.
    pub data: Option<Vec<u8>>,
    /// External location, when the media lives elsewhere.
    pub uri: Option<String>,
}

/// A lightweight reference to a stored media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Opaque store id.
    pub id: String,
    /// MIME-style kind tag.
    pub kind: String,
    /// Optional human description.
    pub description: Option<String>,
}

/// Process-local store of media items keyed by opaque id.
///
/// Cloning shares the underlying store.
#[derive(Debug, Clone, Default)]
pub struct MediaStore {
    items: Arc<Mutex<HashMap<String, MediaItem>>>,
}

impl MediaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an item, returning its reference.
    pub fn store(&self, item: MediaItem) -> MediaRef {
        let id = Uuid::new_v4().simple().to_string();
        let media_ref = MediaRef {
            id: id.clone(),
            kind: item.kind.clone(),
            description: item.description.clone(),
        };
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, item);
        media_ref
    }

    /// Fetch an item by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<MediaItem> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn store_and_fetch_roundtrip() {
        let store = MediaStore::new();
        let media_ref = store.store(MediaItem {
            kind: "image/png".into(),
            description: Some("a chart".into()),
            data: Some(vec![1, 2, 3]),
            uri: None,
        });
        assert_eq!(media_ref.kind, "image/png");
        let item = store.get(&media_ref.id).unwrap();
        assert_eq!(item.data.unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn clones_share_contents() {
        let store = MediaStore::new();
        let clone = store.clone();
        clone.store(MediaItem::default());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_id_is_none() {
        assert!(MediaStore::new().get("nope").is_none());
    }
}
