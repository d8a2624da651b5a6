//! Collection identity and descriptor types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a collection in the backing vector store.
///
/// Implements `Ord` so collection sets iterate deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    /// Create a collection id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CollectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lightweight listing entry produced by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    /// Collection id.
    pub id: CollectionId,
    /// Human-readable collection name.
    pub name: String,
    /// Number of stored items at listing time.
    pub item_count: u64,
}

impl CollectionDescriptor {
    /// Create a descriptor.
    pub fn new(id: impl Into<CollectionId>, name: impl Into<String>, item_count: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            item_count,
        }
    }
}

/// Handle returned by `get_collection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionHandle {
    /// Collection id.
    pub id: CollectionId,
    /// Collection name.
    pub name: String,
    /// Current number of stored items.
    pub item_count: u64,
    /// Collection-level metadata as stored.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Embedding vector dimension, when the store knows it.
    #[serde(default)]
    pub dimension: Option<usize>,
}

impl CollectionHandle {
    /// Reduce the handle to a listing descriptor.
    pub fn descriptor(&self) -> CollectionDescriptor {
        CollectionDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            item_count: self.item_count,
        }
    }
}

/// One page of a collection listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionPage {
    /// Descriptors on this page, in store order.
    pub descriptors: Vec<CollectionDescriptor>,
    /// Token for the next page, `None` on the last page.
    pub next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_id_ordering() {
        let mut ids = vec![CollectionId::from("c5"), CollectionId::from("c2"), CollectionId::from("c10")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "c10");
        assert_eq!(ids[1].as_str(), "c2");
    }

    #[test]
    fn test_collection_id_serializes_as_string() {
        let id = CollectionId::new("C1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"C1\"");
    }

    #[test]
    fn test_handle_descriptor() {
        let handle = CollectionHandle {
            id: CollectionId::new("C1"),
            name: "file-c1".to_string(),
            item_count: 3,
            metadata: BTreeMap::new(),
            dimension: None,
        };
        assert_eq!(handle.descriptor(), CollectionDescriptor::new("C1", "file-c1", 3));
    }
}
