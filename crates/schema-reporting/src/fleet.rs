//! Tracking of the agent processes that report for each graph.

mod registration;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use registration::*;

use crate::{
    storage::{ClaimOutcome, MergeOutcome, RegistryStorage, StorageResult},
    REPORTING_TARGET,
};

/// What a report meant for the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationEvent {
    /// First report of a boot id, and no other live process claimed its server id.
    NewBoot,
    /// Another report from an already registered boot id.
    Continuation,
    /// First report of a boot id whose server id was claimed by another live process.
    RestartDetected,
}

/// Time windows of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetSettings {
    /// A registration that did not report for this long no longer counts as active.
    pub stale_after: Duration,
    /// A registration that did not report for this long is purged by the sweep.
    pub retention: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Counters of one sweep run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SweepSummary {
    pub marked_stale: usize,
    pub purged: usize,
}

/// The registrations of one graph, as seen at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSnapshot {
    pub graph_ref: String,
    pub active_count: usize,
    pub agents: Vec<(AgentRegistration, RegistrationStatus)>,
}

/// Registry of agent processes keyed by `(graph_ref, boot_id)`.
#[derive(Clone)]
pub struct FleetRegistry {
    storage: Arc<dyn RegistryStorage>,
    settings: FleetSettings,
}

impl FleetRegistry {
    pub fn new(storage: Arc<dyn RegistryStorage>, settings: FleetSettings) -> Self {
        Self { storage, settings }
    }

    pub fn settings(&self) -> FleetSettings {
        self.settings
    }

    /// Records a report and classifies it.
    ///
    /// Every storage step is idempotent: a request abandoned half way is completed by the next
    /// report of the same boot id, which is why the server claim is checked on every report
    /// carrying a server id and not only on the first one.
    pub async fn upsert(&self, update: RegistrationUpdate) -> StorageResult<RegistrationEvent> {
        let now = update.reported_at;

        let (registration, base_event) = match self.storage.merge_registration(&update).await? {
            MergeOutcome::Created(registration) => (registration, RegistrationEvent::NewBoot),
            MergeOutcome::Updated { current, .. } => (current, RegistrationEvent::Continuation),
        };

        let Some(server_id) = registration.metadata.server_id.as_deref() else {
            return Ok(base_event);
        };

        let claim = ServerClaim {
            boot_id: registration.boot_id,
            first_reported_at: registration.first_reported_at,
        };

        let event = match self
            .storage
            .claim_server(&registration.graph_ref, server_id, &claim)
            .await?
        {
            ClaimOutcome::Vacant | ClaimOutcome::Held => base_event,
            ClaimOutcome::Replaced { previous } => {
                let previous_registration = self
                    .storage
                    .registration(&registration.graph_ref, previous.boot_id)
                    .await?;

                let was_active = previous_registration.is_some_and(|previous| self.is_active(&previous, now));

                self.storage
                    .supersede(&registration.graph_ref, previous.boot_id, registration.boot_id)
                    .await?;

                if was_active && base_event == RegistrationEvent::NewBoot {
                    tracing::info!(
                        target: REPORTING_TARGET,
                        graph_ref = %registration.graph_ref,
                        server_id,
                        previous_boot_id = %previous.boot_id,
                        boot_id = %registration.boot_id,
                        "agent restart detected"
                    );

                    RegistrationEvent::RestartDetected
                } else {
                    base_event
                }
            }
            ClaimOutcome::Outdated { current } => {
                // A newer process already claimed the server id: this report arrived late.
                self.storage
                    .supersede(&registration.graph_ref, registration.boot_id, current.boot_id)
                    .await?;

                if base_event == RegistrationEvent::NewBoot {
                    tracing::info!(
                        target: REPORTING_TARGET,
                        graph_ref = %registration.graph_ref,
                        server_id,
                        boot_id = %registration.boot_id,
                        current_boot_id = %current.boot_id,
                        "late first report from a process already replaced by a newer boot"
                    );

                    RegistrationEvent::RestartDetected
                } else {
                    base_event
                }
            }
        };

        Ok(event)
    }

    /// Number of registrations of the graph that are active at `now`.
    pub async fn active_count(&self, graph_ref: &str, now: DateTime<Utc>) -> StorageResult<usize> {
        self.storage
            .count_active(graph_ref, cutoff(now, self.settings.stale_after))
            .await
    }

    pub async fn registration(&self, graph_ref: &str, boot_id: Uuid) -> StorageResult<Option<AgentRegistration>> {
        self.storage.registration(graph_ref, boot_id).await
    }

    /// Every retained registration of the graph with its status at `now`, most recent first.
    pub async fn snapshot(&self, graph_ref: &str, now: DateTime<Utc>) -> StorageResult<FleetSnapshot> {
        let mut registrations = self.storage.registrations(graph_ref).await?;
        registrations.sort_by(|a, b| b.last_reported_at.cmp(&a.last_reported_at));

        let stale_before = cutoff(now, self.settings.stale_after);

        let agents: Vec<_> = registrations
            .into_iter()
            .map(|registration| {
                let status = registration.status(stale_before);
                (registration, status)
            })
            .collect();

        let active_count = agents
            .iter()
            .filter(|(_, status)| *status == RegistrationStatus::Active)
            .count();

        Ok(FleetSnapshot {
            graph_ref: graph_ref.to_owned(),
            active_count,
            agents,
        })
    }

    /// Moves silent registrations to the stale state and purges the ones past retention.
    pub async fn sweep(&self, now: DateTime<Utc>) -> StorageResult<SweepSummary> {
        let summary = self
            .storage
            .sweep(
                cutoff(now, self.settings.stale_after),
                cutoff(now, self.settings.retention),
            )
            .await?;

        if summary.marked_stale > 0 || summary.purged > 0 {
            tracing::debug!(
                target: REPORTING_TARGET,
                marked_stale = summary.marked_stale,
                purged = summary.purged,
                "fleet sweep"
            );
        }

        Ok(summary)
    }

    fn is_active(&self, registration: &AgentRegistration, now: DateTime<Utc>) -> bool {
        registration.status(cutoff(now, self.settings.stale_after)) == RegistrationStatus::Active
    }
}

/// `now - window`, saturating at the earliest representable instant.
pub(crate) fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
