use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

use super::{ClaimOutcome, DocumentStorage, InsertOutcome, MergeOutcome, RegistryStorage, StorageError, StorageResult};
use crate::{
    content::SchemaDocument,
    fleet::{AgentRegistration, RegistrationState, RegistrationUpdate, ServerClaim, SweepSummary},
};

/// Storage living in the memory of one process. Suitable for a single coordinator instance
/// and for tests; horizontally scaled deployments need a shared backend.
///
/// Every key is updated through its own map entry, so reports of unrelated agents never wait
/// on each other.
#[derive(Default)]
pub struct InMemoryStorage {
    documents: DashMap<String, SchemaDocument>,
    registrations: DashMap<(String, Uuid), AgentRegistration>,
    claims: DashMap<(String, String), ServerClaim>,
    /// Boot ids registered per graph, so fleet reads only touch their own graph.
    fleets: DashMap<String, HashSet<Uuid>>,
    unavailable: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with [`StorageError::Unavailable`] until turned back on.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Relaxed);
    }

    fn check_available(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(StorageError::Unavailable("in-memory storage switched off".into()))
        } else {
            Ok(())
        }
    }

    // The index guard is released before any registration is read.
    fn boot_ids(&self, graph_ref: &str) -> Vec<Uuid> {
        self.fleets
            .get(graph_ref)
            .map(|boot_ids| boot_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn unindex(&self, graph_ref: &str, boot_id: &Uuid) {
        if let Some(mut boot_ids) = self.fleets.get_mut(graph_ref) {
            boot_ids.remove(boot_id);
        }

        self.fleets.remove_if(graph_ref, |_, boot_ids| boot_ids.is_empty());
    }
}

#[async_trait::async_trait]
impl DocumentStorage for InMemoryStorage {
    async fn insert_if_absent(&self, document: &SchemaDocument) -> StorageResult<InsertOutcome> {
        self.check_available()?;

        match self.documents.entry(document.hash.clone()) {
            Entry::Occupied(_) => Ok(InsertOutcome::AlreadyPresent),
            Entry::Vacant(entry) => {
                entry.insert(document.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn get(&self, hash: &str) -> StorageResult<Option<SchemaDocument>> {
        self.check_available()?;

        Ok(self.documents.get(hash).map(|document| document.value().clone()))
    }

    async fn contains(&self, hash: &str) -> StorageResult<bool> {
        self.check_available()?;

        Ok(self.documents.contains_key(hash))
    }
}

#[async_trait::async_trait]
impl RegistryStorage for InMemoryStorage {
    async fn merge_registration(&self, update: &RegistrationUpdate) -> StorageResult<MergeOutcome> {
        self.check_available()?;

        let outcome = match self.registrations.entry((update.graph_ref.clone(), update.boot_id)) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                entry.get_mut().merge(update);

                MergeOutcome::Updated {
                    previous,
                    current: entry.get().clone(),
                }
            }
            Entry::Vacant(entry) => {
                let registration = AgentRegistration::new(update);
                entry.insert(registration.clone());

                MergeOutcome::Created(registration)
            }
        };

        if let MergeOutcome::Created(_) = outcome {
            self.fleets
                .entry(update.graph_ref.clone())
                .or_default()
                .insert(update.boot_id);
        }

        Ok(outcome)
    }

    async fn claim_server(
        &self,
        graph_ref: &str,
        server_id: &str,
        claim: &ServerClaim,
    ) -> StorageResult<ClaimOutcome> {
        self.check_available()?;

        match self.claims.entry((graph_ref.to_owned(), server_id.to_owned())) {
            Entry::Occupied(mut entry) => {
                let (outcome, store) = claim.against(Some(entry.get()));

                if store {
                    entry.insert(*claim);
                }

                Ok(outcome)
            }
            Entry::Vacant(entry) => {
                let (outcome, _) = claim.against(None);
                entry.insert(*claim);

                Ok(outcome)
            }
        }
    }

    async fn supersede(&self, graph_ref: &str, boot_id: Uuid, by: Uuid) -> StorageResult<()> {
        self.check_available()?;

        if let Some(mut registration) = self.registrations.get_mut(&(graph_ref.to_owned(), boot_id)) {
            registration.supersede(by);
        }

        Ok(())
    }

    async fn registration(&self, graph_ref: &str, boot_id: Uuid) -> StorageResult<Option<AgentRegistration>> {
        self.check_available()?;

        Ok(self
            .registrations
            .get(&(graph_ref.to_owned(), boot_id))
            .map(|registration| registration.value().clone()))
    }

    async fn registrations(&self, graph_ref: &str) -> StorageResult<Vec<AgentRegistration>> {
        self.check_available()?;

        Ok(self
            .boot_ids(graph_ref)
            .into_iter()
            .filter_map(|boot_id| {
                self.registrations
                    .get(&(graph_ref.to_owned(), boot_id))
                    .map(|registration| registration.value().clone())
            })
            .collect())
    }

    async fn count_active(&self, graph_ref: &str, since: DateTime<Utc>) -> StorageResult<usize> {
        self.check_available()?;

        Ok(self
            .boot_ids(graph_ref)
            .into_iter()
            .filter(|boot_id| {
                self.registrations
                    .get(&(graph_ref.to_owned(), *boot_id))
                    .is_some_and(|registration| registration.is_active(since))
            })
            .count())
    }

    async fn sweep(&self, stale_before: DateTime<Utc>, purge_before: DateTime<Utc>) -> StorageResult<SweepSummary> {
        self.check_available()?;

        let mut summary = SweepSummary::default();
        let mut purged = Vec::new();

        self.registrations.retain(|key, registration| {
            if registration.should_purge(purge_before) {
                purged.push(key.clone());
                return false;
            }

            if registration.should_mark_stale(stale_before) {
                registration.state = RegistrationState::Stale;
                summary.marked_stale += 1;
            }

            true
        });

        summary.purged = purged.len();

        for (graph_ref, boot_id) in &purged {
            self.unindex(graph_ref, boot_id);
        }

        self.claims.retain(|(graph_ref, _), claim| {
            self.registrations.contains_key(&(graph_ref.clone(), claim.boot_id))
        });

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[tokio::test]
    async fn switched_off_storage_fails_every_call() {
        let storage = InMemoryStorage::new();
        storage.set_available(false);

        let error = storage.contains("abc").await.unwrap_err();
        assert!(error.is_retryable());

        storage.set_available(true);
        assert!(!storage.contains("abc").await.unwrap());
    }

    fn update(graph_ref: &str, boot_id: Uuid, reported_at: DateTime<Utc>) -> RegistrationUpdate {
        RegistrationUpdate {
            graph_ref: graph_ref.to_owned(),
            boot_id,
            reported_at,
            core_schema_hash: None,
            executable_schema_id: None,
            metadata: Default::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_a_single_winner() {
        let storage = std::sync::Arc::new(InMemoryStorage::new());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let claims = (0..32).map(|_| {
            let storage = storage.clone();

            tokio::spawn(async move {
                let claim = ServerClaim {
                    boot_id: Uuid::new_v4(),
                    first_reported_at: t0,
                };

                storage.claim_server("g@current", "pod", &claim).await.unwrap()
            })
        });

        let mut vacant = 0;

        for claim in claims.collect::<Vec<_>>() {
            if claim.await.unwrap() == ClaimOutcome::Vacant {
                vacant += 1;
            }
        }

        assert_eq!(vacant, 1);
    }

    #[tokio::test]
    async fn fleets_are_counted_per_graph() {
        let storage = InMemoryStorage::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        for _ in 0..3 {
            storage
                .merge_registration(&update("shop@prod", Uuid::new_v4(), t0))
                .await
                .unwrap();
        }

        let boot_id = Uuid::new_v4();
        storage.merge_registration(&update("shop@staging", boot_id, t0)).await.unwrap();
        storage.merge_registration(&update("shop@staging", boot_id, t0)).await.unwrap();

        let since = t0 - chrono::Duration::minutes(1);
        assert_eq!(storage.count_active("shop@prod", since).await.unwrap(), 3);
        assert_eq!(storage.count_active("shop@staging", since).await.unwrap(), 1);
        assert_eq!(storage.count_active("shop@dev", since).await.unwrap(), 0);
        assert_eq!(storage.registrations("shop@staging").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purged_registrations_leave_the_fleet() {
        let storage = InMemoryStorage::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = t0 + chrono::Duration::hours(2);

        storage
            .merge_registration(&update("g@current", Uuid::new_v4(), t0))
            .await
            .unwrap();

        let survivor = Uuid::new_v4();
        storage.merge_registration(&update("g@current", survivor, later)).await.unwrap();

        let summary = storage.sweep(later, later).await.unwrap();
        assert_eq!(summary.purged, 1);

        let registrations = storage.registrations("g@current").await.unwrap();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].boot_id, survivor);

        storage.sweep(later + chrono::Duration::hours(2), later + chrono::Duration::hours(2)).await.unwrap();
        assert!(storage.fleets.is_empty());
    }

    #[tokio::test]
    async fn sweep_drops_claims_of_purged_registrations() {
        let storage = InMemoryStorage::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let boot_id = Uuid::new_v4();

        let update = RegistrationUpdate {
            graph_ref: "g@current".to_owned(),
            boot_id,
            reported_at: t0,
            core_schema_hash: None,
            executable_schema_id: None,
            metadata: Default::default(),
        };

        storage.merge_registration(&update).await.unwrap();

        let claim = ServerClaim {
            boot_id,
            first_reported_at: t0,
        };
        storage.claim_server("g@current", "pod", &claim).await.unwrap();

        let later = t0 + chrono::Duration::hours(2);
        let summary = storage.sweep(later, later).await.unwrap();
        assert_eq!(summary.purged, 1);

        let newcomer = ServerClaim {
            boot_id: Uuid::new_v4(),
            first_reported_at: later,
        };
        let outcome = storage.claim_server("g@current", "pod", &newcomer).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Vacant);
    }
}
