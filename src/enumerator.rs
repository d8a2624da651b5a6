//! Paginated collection enumeration.
//!
//! [`CollectionEnumerator`] walks the store listing one page at a time and hands out
//! descriptors lazily, so memory stays bounded by the page size no matter how many
//! collections exist. An enumerator is single-use: once exhausted or failed it stays
//! that way, and a fresh one must be created to walk the listing again.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{CollectionStore, StoreError};
use crate::types::CollectionDescriptor;

/// Enumerator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratorConfig {
    /// Collections requested per listing call.
    pub page_size: usize,
}

impl Default for EnumeratorConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

impl EnumeratorConfig {
    /// Load from `REASSEMBLY_PAGE_SIZE` (default: 100).
    pub fn from_env() -> Self {
        Self {
            page_size: std::env::var("REASSEMBLY_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(100),
        }
    }
}

/// Errors that abort an enumeration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EnumerationError {
    /// The store could not be reached while listing.
    #[error("Store unreachable while listing page {page}: {message}")]
    StoreUnreachable {
        /// Zero-based page number.
        page: usize,
        /// Adapter message.
        message: String,
    },
    /// The store failed in some other way while listing.
    #[error("Listing page {page} failed: {source}")]
    Store {
        /// Zero-based page number.
        page: usize,
        /// Adapter error.
        source: StoreError,
    },
    /// The store returned the same page token twice in a row.
    #[error("Pagination stalled on token {token}")]
    PaginationStalled {
        /// Repeated token.
        token: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Fresh,
    More,
    Exhausted,
}

/// Lazy, single-pass collection listing.
pub struct CollectionEnumerator<S: CollectionStore + ?Sized> {
    store: Arc<S>,
    config: EnumeratorConfig,
    buffer: VecDeque<CollectionDescriptor>,
    next_token: Option<String>,
    state: CursorState,
    pages_fetched: usize,
    yielded: usize,
}

impl<S: CollectionStore + ?Sized> CollectionEnumerator<S> {
    /// Create an enumerator positioned before the first page.
    pub fn new(store: Arc<S>, config: EnumeratorConfig) -> Self {
        Self {
            store,
            config,
            buffer: VecDeque::new(),
            next_token: None,
            state: CursorState::Fresh,
            pages_fetched: 0,
            yielded: 0,
        }
    }

    /// Next descriptor, `None` once the listing is exhausted.
    ///
    /// An error ends the enumeration; later calls return `None`.
    pub async fn next(&mut self) -> Result<Option<CollectionDescriptor>, EnumerationError> {
        loop {
            if let Some(descriptor) = self.buffer.pop_front() {
                self.yielded += 1;
                return Ok(Some(descriptor));
            }
            if self.state == CursorState::Exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    /// Drain the remaining listing into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<CollectionDescriptor>, EnumerationError> {
        let mut all = Vec::new();
        while let Some(descriptor) = self.next().await? {
            all.push(descriptor);
        }
        Ok(all)
    }

    /// Pages fetched so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Descriptors handed out so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    async fn fetch_page(&mut self) -> Result<(), EnumerationError> {
        let page_number = self.pages_fetched;
        let token = self.next_token.take();

        let page = match self
            .store
            .list_collections(token.as_deref(), self.config.page_size)
            .await
        {
            Ok(page) => page,
            Err(error) => {
                self.state = CursorState::Exhausted;
                warn!(page = page_number, error = %error, "collection listing failed");
                return Err(match error {
                    StoreError::Unreachable(message) => EnumerationError::StoreUnreachable {
                        page: page_number,
                        message,
                    },
                    source => EnumerationError::Store {
                        page: page_number,
                        source,
                    },
                });
            }
        };

        self.pages_fetched += 1;
        debug!(
            page = page_number,
            descriptors = page.descriptors.len(),
            has_more = page.next_page_token.is_some(),
            "fetched collection page"
        );

        match page.next_page_token {
            Some(next) if token.as_deref() == Some(next.as_str()) => {
                self.state = CursorState::Exhausted;
                return Err(EnumerationError::PaginationStalled { token: next });
            }
            Some(next) if !page.descriptors.is_empty() => {
                self.next_token = Some(next);
                self.state = CursorState::More;
            }
            // An empty page that still claims more is treated as the end.
            _ => self.state = CursorState::Exhausted,
        }

        self.buffer.extend(page.descriptors);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCollectionStore;
    use crate::types::Chunk;

    fn store_with(n: usize) -> Arc<InMemoryCollectionStore> {
        let store = InMemoryCollectionStore::new();
        for i in 0..n {
            store.insert_chunk(&Chunk::new(format!("c{i:03}"), "f.txt", 0, 1, b"x".to_vec()));
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_enumerates_every_collection_in_order() {
        let store = store_with(23);
        let enumerator = CollectionEnumerator::new(store, EnumeratorConfig { page_size: 5 });

        let all = enumerator.collect_all().await.unwrap();
        assert_eq!(all.len(), 23);
        assert_eq!(all[0].id.as_str(), "c000");
        assert_eq!(all[22].id.as_str(), "c022");
    }

    #[tokio::test]
    async fn test_pages_are_fetched_lazily() {
        let store = store_with(10);
        let mut enumerator = CollectionEnumerator::new(store, EnumeratorConfig { page_size: 4 });

        assert_eq!(enumerator.pages_fetched(), 0);
        enumerator.next().await.unwrap();
        assert_eq!(enumerator.pages_fetched(), 1);
        for _ in 0..4 {
            enumerator.next().await.unwrap();
        }
        assert_eq!(enumerator.pages_fetched(), 2);
        assert_eq!(enumerator.yielded(), 5);
    }

    #[tokio::test]
    async fn test_empty_store() {
        let store = store_with(0);
        let mut enumerator = CollectionEnumerator::new(store, EnumeratorConfig::default());
        assert!(enumerator.next().await.unwrap().is_none());
        assert!(enumerator.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_store_aborts() {
        let store = store_with(3);
        store.set_unreachable(true);
        let mut enumerator = CollectionEnumerator::new(Arc::clone(&store), EnumeratorConfig::default());

        let err = enumerator.next().await.unwrap_err();
        assert!(matches!(err, EnumerationError::StoreUnreachable { page: 0, .. }));

        // Not restartable mid-stream, even once the store recovers.
        store.set_unreachable(false);
        assert!(enumerator.next().await.unwrap().is_none());
    }
}
