use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::storage::ClaimOutcome;

/// Free-form description an agent gives of itself.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub server_id: Option<String>,
    pub library_version: Option<String>,
    pub platform: Option<String>,
    pub runtime_version: Option<String>,
    pub user_version: Option<String>,
}

impl AgentMetadata {
    /// Takes every value `other` carries.
    fn overwrite_with(&mut self, other: &AgentMetadata) {
        for (field, value) in self.fields_mut().into_iter().zip(other.fields()) {
            if value.is_some() {
                field.clone_from(value);
            }
        }
    }

    /// Takes the values of `other` only where nothing is known yet.
    fn fill_from(&mut self, other: &AgentMetadata) {
        for (field, value) in self.fields_mut().into_iter().zip(other.fields()) {
            if field.is_none() {
                field.clone_from(value);
            }
        }
    }

    fn fields(&self) -> [&Option<String>; 5] {
        [
            &self.server_id,
            &self.library_version,
            &self.platform,
            &self.runtime_version,
            &self.user_version,
        ]
    }

    fn fields_mut(&mut self) -> [&mut Option<String>; 5] {
        [
            &mut self.server_id,
            &mut self.library_version,
            &mut self.platform,
            &mut self.runtime_version,
            &mut self.user_version,
        ]
    }
}

/// Lifecycle state stored with a registration. `Stale` is terminal and only reached
/// through the sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationState {
    #[default]
    Active,
    Stale,
}

/// Status of a registration as observed at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Active,
    /// A newer boot of the same server id took over.
    Superseded,
    /// Silent for longer than the stale window, or swept.
    Stale,
}

/// One agent process of one graph.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub graph_ref: String,
    pub boot_id: Uuid,
    pub core_schema_hash: Option<String>,
    pub executable_schema_id: Option<String>,
    #[serde(flatten)]
    pub metadata: AgentMetadata,
    pub first_reported_at: DateTime<Utc>,
    pub last_reported_at: DateTime<Utc>,
    #[serde(default)]
    pub state: RegistrationState,
    #[serde(default)]
    pub superseded_by: Option<Uuid>,
}

/// The content of one report, as applied to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationUpdate {
    pub graph_ref: String,
    pub boot_id: Uuid,
    pub reported_at: DateTime<Utc>,
    pub core_schema_hash: Option<String>,
    pub executable_schema_id: Option<String>,
    pub metadata: AgentMetadata,
}

impl AgentRegistration {
    pub fn new(update: &RegistrationUpdate) -> Self {
        Self {
            graph_ref: update.graph_ref.clone(),
            boot_id: update.boot_id,
            core_schema_hash: update.core_schema_hash.clone(),
            executable_schema_id: update.executable_schema_id.clone(),
            metadata: update.metadata.clone(),
            first_reported_at: update.reported_at,
            last_reported_at: update.reported_at,
            state: RegistrationState::Active,
            superseded_by: None,
        }
    }

    /// Applies a later report of the same boot id.
    ///
    /// The newest report by timestamp wins, whatever the arrival order: an older report never
    /// moves `last_reported_at` back and only fills values that are still unknown.
    pub fn merge(&mut self, update: &RegistrationUpdate) {
        debug_assert_eq!(self.boot_id, update.boot_id);

        if update.reported_at >= self.last_reported_at {
            self.last_reported_at = update.reported_at;
            self.metadata.overwrite_with(&update.metadata);

            if update.core_schema_hash.is_some() {
                self.core_schema_hash.clone_from(&update.core_schema_hash);
            }

            if update.executable_schema_id.is_some() {
                self.executable_schema_id.clone_from(&update.executable_schema_id);
            }
        } else {
            self.metadata.fill_from(&update.metadata);

            if self.core_schema_hash.is_none() {
                self.core_schema_hash.clone_from(&update.core_schema_hash);
            }

            if self.executable_schema_id.is_none() {
                self.executable_schema_id.clone_from(&update.executable_schema_id);
            }
        }

        self.first_reported_at = self.first_reported_at.min(update.reported_at);
    }

    /// Marks the registration as replaced by `boot_id`. The first replacement is kept.
    pub fn supersede(&mut self, boot_id: Uuid) -> bool {
        if self.superseded_by.is_some() || self.boot_id == boot_id {
            return false;
        }

        self.superseded_by = Some(boot_id);
        true
    }

    /// Whether the sweep should move this registration to the stale state.
    pub fn should_mark_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.state == RegistrationState::Active && self.last_reported_at < stale_before
    }

    /// Whether the sweep should delete this registration.
    pub fn should_purge(&self, purge_before: DateTime<Utc>) -> bool {
        self.last_reported_at < purge_before
    }

    /// Counts towards the fleet size.
    pub fn is_active(&self, stale_before: DateTime<Utc>) -> bool {
        self.status(stale_before) == RegistrationStatus::Active
    }

    pub fn status(&self, stale_before: DateTime<Utc>) -> RegistrationStatus {
        if self.superseded_by.is_some() {
            RegistrationStatus::Superseded
        } else if self.state == RegistrationState::Stale || self.last_reported_at < stale_before {
            RegistrationStatus::Stale
        } else {
            RegistrationStatus::Active
        }
    }
}

/// Which boot id currently owns a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerClaim {
    pub boot_id: Uuid,
    pub first_reported_at: DateTime<Utc>,
}

impl ServerClaim {
    /// Decides a claim against the current owner. Returns the outcome and whether `self`
    /// must be stored as the new owner.
    ///
    /// The boot that reported first most recently is the newest process; ties go to the
    /// claimant.
    pub fn against(&self, current: Option<&ServerClaim>) -> (ClaimOutcome, bool) {
        match current {
            None => (ClaimOutcome::Vacant, true),
            Some(current) if current.boot_id == self.boot_id => (ClaimOutcome::Held, false),
            Some(current) if current.first_reported_at <= self.first_reported_at => {
                (ClaimOutcome::Replaced { previous: *current }, true)
            }
            Some(current) => (ClaimOutcome::Outdated { current: *current }, false),
        }
    }
}
