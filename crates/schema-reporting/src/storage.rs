//! The storage boundary of the coordinator.
//!
//! Both storages are shared by every request handler of every coordinator instance. They
//! provide per-key atomicity themselves, so the handlers never take a lock of their own.

pub mod memory;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    content::SchemaDocument,
    fleet::{AgentRegistration, RegistrationUpdate, ServerClaim, SweepSummary},
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("gave up on {key} after {attempts} conflicting concurrent updates")]
    Contended { key: String, attempts: usize },
    #[error("stored document {hash} does not match its reported content")]
    Corrupted { hash: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether trying the same request again later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Contended { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Content addressed document storage.
#[async_trait::async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Stores the document unless its hash is already present, atomically.
    async fn insert_if_absent(&self, document: &SchemaDocument) -> StorageResult<InsertOutcome>;

    async fn get(&self, hash: &str) -> StorageResult<Option<SchemaDocument>>;

    async fn contains(&self, hash: &str) -> StorageResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The boot id was unknown and got registered.
    Created(AgentRegistration),
    /// The boot id was known and the report got merged into it.
    Updated {
        previous: AgentRegistration,
        current: AgentRegistration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Nobody owned the server id, the claimant does now.
    Vacant,
    /// The claimant already owned the server id.
    Held,
    /// An older boot owned the server id, the claimant does now.
    Replaced { previous: ServerClaim },
    /// A newer boot owns the server id and keeps it.
    Outdated { current: ServerClaim },
}

/// Storage of the fleet registry. Every method is atomic for the keys it touches.
#[async_trait::async_trait]
pub trait RegistryStorage: Send + Sync {
    /// Creates the registration of `(graph_ref, boot_id)` or merges the update into it with
    /// [`AgentRegistration::merge`].
    async fn merge_registration(&self, update: &RegistrationUpdate) -> StorageResult<MergeOutcome>;

    /// Claims `(graph_ref, server_id)` for a boot, deciding with [`ServerClaim::against`].
    async fn claim_server(&self, graph_ref: &str, server_id: &str, claim: &ServerClaim)
        -> StorageResult<ClaimOutcome>;

    /// Marks a registration as replaced by another boot. A missing registration is ignored.
    async fn supersede(&self, graph_ref: &str, boot_id: Uuid, by: Uuid) -> StorageResult<()>;

    async fn registration(&self, graph_ref: &str, boot_id: Uuid) -> StorageResult<Option<AgentRegistration>>;

    async fn registrations(&self, graph_ref: &str) -> StorageResult<Vec<AgentRegistration>>;

    /// Counts the registrations of the graph that are neither stale, superseded, nor silent
    /// since before `since`.
    async fn count_active(&self, graph_ref: &str, since: DateTime<Utc>) -> StorageResult<usize>;

    /// Marks registrations silent since before `stale_before` as stale and deletes the ones
    /// silent since before `purge_before`, with the server claims pointing at them.
    async fn sweep(&self, stale_before: DateTime<Utc>, purge_before: DateTime<Utc>) -> StorageResult<SweepSummary>;
}
