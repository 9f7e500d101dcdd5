//! Content addressed storage of schema documents.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    storage::{DocumentStorage, InsertOutcome, StorageError, StorageResult},
    REPORTING_TARGET,
};

/// A schema document, immutable once stored. `hash` is the hex SHA-256 of `content`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDocument {
    pub hash: String,
    pub content: String,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// This call stored the document; nobody had sent it before.
    pub was_new: bool,
}

/// Deduplicates schema documents by hash. At most one write ever happens per hash.
#[derive(Clone)]
pub struct ContentStore {
    storage: Arc<dyn DocumentStorage>,
    verify_content: bool,
}

impl ContentStore {
    pub fn new(storage: Arc<dyn DocumentStorage>) -> Self {
        Self {
            storage,
            verify_content: false,
        }
    }

    /// When on, storing a hash that already exists compares the stored content with the
    /// new one, at the cost of a read.
    #[must_use]
    pub fn with_content_verification(mut self, verify_content: bool) -> Self {
        self.verify_content = verify_content;
        self
    }

    /// Stores `content` under `hash` unless the hash is already known.
    ///
    /// Safe and cheap under concurrent identical writes: exactly one caller sees
    /// `was_new = true`, the others find the document present.
    pub async fn put_if_absent(&self, hash: &str, content: &str, now: DateTime<Utc>) -> StorageResult<PutOutcome> {
        let document = SchemaDocument {
            hash: hash.to_owned(),
            content: content.to_owned(),
            first_seen_at: now,
        };

        match self.storage.insert_if_absent(&document).await? {
            InsertOutcome::Inserted => {
                tracing::debug!(target: REPORTING_TARGET, hash, "stored new schema document");
                Ok(PutOutcome { was_new: true })
            }
            InsertOutcome::AlreadyPresent => {
                if self.verify_content {
                    self.verify(&document).await?;
                }

                Ok(PutOutcome { was_new: false })
            }
        }
    }

    pub async fn has(&self, hash: &str) -> StorageResult<bool> {
        self.storage.contains(hash).await
    }

    pub async fn get(&self, hash: &str) -> StorageResult<Option<SchemaDocument>> {
        self.storage.get(hash).await
    }

    async fn verify(&self, document: &SchemaDocument) -> StorageResult<()> {
        let Some(stored) = self.storage.get(&document.hash).await? else {
            // present a moment ago, so the backend evicted it: nothing to compare against
            return Ok(());
        };

        if stored.content != document.content {
            tracing::error!(
                target: REPORTING_TARGET,
                hash = document.hash,
                "stored schema document does not match reported content"
            );

            return Err(StorageError::Corrupted {
                hash: document.hash.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::{storage::memory::InMemoryStorage, validation::schema_hash};

    const SCHEMA: &str = "type Query { hello: String }";

    #[tokio::test]
    async fn put_if_absent_is_idempotent() {
        let store = ContentStore::new(Arc::new(InMemoryStorage::new()));
        let hash = schema_hash(SCHEMA);

        assert!(!store.has(&hash).await.unwrap());

        let first = store.put_if_absent(&hash, SCHEMA, Utc::now()).await.unwrap();
        let second = store.put_if_absent(&hash, SCHEMA, Utc::now()).await.unwrap();

        assert!(first.was_new);
        assert!(!second.was_new);
        assert!(store.has(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn first_write_wins() {
        let store = ContentStore::new(Arc::new(InMemoryStorage::new()));
        let hash = schema_hash(SCHEMA);
        let first_seen_at = Utc::now();

        store.put_if_absent(&hash, SCHEMA, first_seen_at).await.unwrap();
        store
            .put_if_absent(&hash, SCHEMA, first_seen_at + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let stored = store.get(&hash).await.unwrap().unwrap();
        assert_eq!(stored.first_seen_at, first_seen_at);
        assert_eq!(stored.content, SCHEMA);
    }

    #[tokio::test]
    async fn verification_detects_a_different_content_under_a_known_hash() {
        let store = ContentStore::new(Arc::new(InMemoryStorage::new())).with_content_verification(true);
        let hash = schema_hash(SCHEMA);

        store.put_if_absent(&hash, SCHEMA, Utc::now()).await.unwrap();

        let error = store
            .put_if_absent(&hash, "type Query { other: Int }", Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::Corrupted { .. }));
        assert!(!error.is_retryable());
        assert_eq!(store.get(&hash).await.unwrap().unwrap().content, SCHEMA);
    }

    #[tokio::test]
    async fn concurrent_identical_writes_store_once() {
        let store = ContentStore::new(Arc::new(InMemoryStorage::new())).with_content_verification(true);
        let hash = schema_hash(SCHEMA);

        let writes = (0..64).map(|_| {
            let store = store.clone();
            let hash = hash.clone();
            tokio::spawn(async move { store.put_if_absent(&hash, SCHEMA, Utc::now()).await.unwrap() })
        });

        let outcomes = futures_util::future::join_all(writes).await;
        let new_count = outcomes.into_iter().filter(|outcome| outcome.as_ref().unwrap().was_new).count();

        assert_eq!(new_count, 1);
    }
}
