use std::sync::Arc;

use chrono::{DateTime, Utc};
use graph_ref::GraphRef;

use crate::{
    backoff::{BackoffPolicy, ReportOutcome},
    content::{ContentStore, SchemaDocument},
    fleet::{FleetRegistry, FleetSnapshot, RegistrationEvent, SweepSummary},
    report::{
        EdgeServerInfo, ReportSchemaError, ReportSchemaResponse, ReportSchemaResult, ReportServerInfoError,
        ReportServerInfoResponse, ReportServerInfoResult, SchemaReport,
    },
    storage::StorageResult,
    validation::{self, ReportValidationError, ValidatedReport},
    REPORTING_TARGET,
};

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Handles report mutations: validation, document deduplication, fleet tracking and the
/// advice on when to report next, in one request/response cycle.
///
/// Holds no state of its own besides the storages, so any number of coordinators can serve
/// the same fleet.
#[derive(Clone)]
pub struct ReportingCoordinator {
    content: ContentStore,
    fleet: FleetRegistry,
    backoff: Arc<dyn BackoffPolicy>,
    now: Clock,
}

/// What the pipeline learned from a report that passed validation.
struct Accepted {
    /// The storage does not have the document and the agent did not attach it.
    document_wanted: bool,
    in_seconds: u32,
}

impl ReportingCoordinator {
    pub fn new(content: ContentStore, fleet: FleetRegistry, backoff: Arc<dyn BackoffPolicy>) -> Self {
        Self {
            content,
            fleet,
            backoff,
            now: Arc::new(Utc::now),
        }
    }

    /// Replaces the wall clock used to timestamp reports.
    #[must_use]
    pub fn with_clock(mut self, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.now = Arc::new(now);
        self
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn fleet_registry(&self) -> &FleetRegistry {
        &self.fleet
    }

    /// `reportSchema`. Validation failures are returned as data; only storage failures are
    /// errors.
    pub async fn report_schema(
        &self,
        report: &SchemaReport,
        core_schema: Option<&str>,
    ) -> StorageResult<ReportSchemaResult> {
        match validation::validate_schema_report(report, core_schema) {
            Ok(validated) => {
                let accepted = self.accept(validated).await?;

                Ok(ReportSchemaResult::Response(ReportSchemaResponse {
                    in_seconds: accepted.in_seconds,
                    with_core_schema: accepted.document_wanted,
                }))
            }
            Err(error) => {
                let graph_ref = report.graph_ref.parse::<GraphRef>().ok();
                let in_seconds = self.rejection_interval(graph_ref.as_ref(), &error).await;

                Ok(ReportSchemaResult::Error(ReportSchemaError {
                    code: error.code,
                    message: error.message,
                    in_seconds,
                    with_core_schema: core_schema.is_some(),
                }))
            }
        }
    }

    /// `reportServerInfo`. The payload carries no graph id: the transport resolves it and
    /// passes it as `graph_id`.
    pub async fn report_server_info(
        &self,
        graph_id: Option<&str>,
        info: &EdgeServerInfo,
        executable_schema: Option<&str>,
    ) -> StorageResult<ReportServerInfoResult> {
        match validation::validate_server_info(graph_id, info, executable_schema) {
            Ok(validated) => {
                let accepted = self.accept(validated).await?;

                Ok(ReportServerInfoResult::Response(ReportServerInfoResponse {
                    in_seconds: accepted.in_seconds,
                    with_executable_schema: accepted.document_wanted,
                }))
            }
            Err(error) => {
                let graph_ref =
                    graph_id.and_then(|graph_id| GraphRef::new(graph_id, Some(info.graph_variant.as_str())).ok());
                let in_seconds = self.rejection_interval(graph_ref.as_ref(), &error).await;

                Ok(ReportServerInfoResult::Error(ReportServerInfoError {
                    code: error.code,
                    message: error.message,
                    in_seconds,
                    with_executable_schema: executable_schema.is_some(),
                }))
            }
        }
    }

    /// Seconds the agents of `graph_ref` should wait before reporting again.
    ///
    /// On the failure path a registry that cannot be read counts as a fleet of one, so a
    /// rejection never turns into a storage error.
    pub async fn next_interval_seconds(
        &self,
        graph_ref: Option<&GraphRef>,
        outcome: ReportOutcome,
    ) -> StorageResult<u32> {
        let fleet_size = match graph_ref {
            Some(graph_ref) => {
                match self
                    .fleet
                    .active_count(&graph_ref.to_string(), (self.now)())
                    .await
                {
                    Ok(count) => count,
                    Err(error) if outcome == ReportOutcome::Failure => {
                        tracing::warn!(target: REPORTING_TARGET, %graph_ref, "could not count the fleet: {error}");
                        1
                    }
                    Err(error) => return Err(error),
                }
            }
            None => 1,
        };

        Ok(self.backoff.next_interval_seconds(fleet_size.max(1), outcome))
    }

    pub async fn schema_document(&self, hash: &str) -> StorageResult<Option<SchemaDocument>> {
        self.content.get(&hash.to_ascii_lowercase()).await
    }

    pub async fn fleet(&self, graph_ref: &GraphRef) -> StorageResult<FleetSnapshot> {
        self.fleet.snapshot(&graph_ref.to_string(), (self.now)()).await
    }

    /// Runs one pass of the time based registry sweep.
    pub async fn sweep(&self) -> StorageResult<SweepSummary> {
        self.fleet.sweep((self.now)()).await
    }

    async fn accept(&self, report: ValidatedReport<'_>) -> StorageResult<Accepted> {
        let now = (self.now)();
        let hash = report.schema.hash();

        let document_wanted = match report.document {
            Some(document) => {
                self.content.put_if_absent(hash, document, now).await?;
                false
            }
            None => !self.content.has(hash).await?,
        };

        let event = self.fleet.upsert(report.registration_update(now)).await?;

        if event != RegistrationEvent::Continuation {
            tracing::debug!(
                target: REPORTING_TARGET,
                graph_ref = %report.graph_ref,
                boot_id = %report.boot_id,
                %event,
                "registered agent"
            );
        }

        let in_seconds = self
            .next_interval_seconds(Some(&report.graph_ref), ReportOutcome::Success)
            .await?;

        Ok(Accepted {
            document_wanted,
            in_seconds,
        })
    }

    async fn rejection_interval(&self, graph_ref: Option<&GraphRef>, error: &ReportValidationError) -> u32 {
        tracing::debug!(target: REPORTING_TARGET, code = %error.code, "rejected report: {}", error.message);

        // cannot fail on the failure path
        self.next_interval_seconds(graph_ref, ReportOutcome::Failure)
            .await
            .unwrap_or_else(|_| self.backoff.next_interval_seconds(1, ReportOutcome::Failure))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    };

    use chrono::{TimeZone, Utc};
    use indoc::indoc;
    use uuid::Uuid;

    use super::*;
    use crate::{
        backoff::JitteredBackoff, fleet::FleetSettings, report::ReportSchemaErrorCode,
        storage::memory::InMemoryStorage, validation::schema_hash, StorageError,
    };

    const SCHEMA: &str = indoc! {r#"
        type Query {
          products: [Product!]!
        }

        type Product {
          id: ID!
          name: String
        }
    "#};

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        coordinator: ReportingCoordinator,
        seconds: Arc<AtomicI64>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_backoff(Arc::new(JitteredBackoff::default()))
        }

        fn with_backoff(backoff: Arc<dyn BackoffPolicy>) -> Self {
            let storage = Arc::new(InMemoryStorage::new());
            let seconds = Arc::new(AtomicI64::new(0));

            let content = ContentStore::new(storage.clone()).with_content_verification(true);
            let fleet = FleetRegistry::new(storage.clone(), FleetSettings::default());

            let clock = seconds.clone();
            let coordinator = ReportingCoordinator::new(content, fleet, backoff).with_clock(move || {
                    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
                        + chrono::Duration::seconds(clock.load(Ordering::SeqCst))
                });

            Self {
                storage,
                coordinator,
                seconds,
            }
        }

        fn advance(&self, seconds: i64) {
            self.seconds.fetch_add(seconds, Ordering::SeqCst);
        }
    }

    /// Remembers the fleet size of every interval it was asked for.
    #[derive(Default)]
    struct RecordingBackoff {
        fleet_sizes: std::sync::Mutex<Vec<usize>>,
    }

    impl BackoffPolicy for RecordingBackoff {
        fn next_interval_seconds(&self, fleet_size: usize, _: ReportOutcome) -> u32 {
            self.fleet_sizes.lock().unwrap().push(fleet_size);
            60
        }
    }

    fn report(boot_id: Uuid) -> SchemaReport {
        SchemaReport {
            boot_id: boot_id.to_string(),
            core_schema_hash: schema_hash(SCHEMA),
            graph_ref: "shop@prod".to_owned(),
            server_id: Some("pod-1".to_owned()),
            library_version: Some("0.4.0".to_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn core_schema_round_trip() {
        let fixture = Fixture::new();
        let report = report(Uuid::new_v4());

        let result = fixture.coordinator.report_schema(&report, None).await.unwrap();
        assert!(result.with_core_schema());
        assert!(result.error_code().is_none());

        let result = fixture.coordinator.report_schema(&report, Some(SCHEMA)).await.unwrap();
        assert!(!result.with_core_schema());

        let result = fixture.coordinator.report_schema(&report, None).await.unwrap();
        assert!(!result.with_core_schema());

        let document = fixture
            .coordinator
            .schema_document(&schema_hash(SCHEMA).to_uppercase())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document.content, SCHEMA);
    }

    #[tokio::test]
    async fn success_interval_is_around_the_base() {
        let fixture = Fixture::new();

        let result = fixture
            .coordinator
            .report_schema(&report(Uuid::new_v4()), Some(SCHEMA))
            .await
            .unwrap();

        assert!((55..=65).contains(&result.in_seconds()), "{}", result.in_seconds());
    }

    #[tokio::test]
    async fn rejected_reports_change_nothing() {
        let fixture = Fixture::new();

        let mut report = report(Uuid::new_v4());
        report.boot_id = String::new();

        let result = fixture.coordinator.report_schema(&report, Some(SCHEMA)).await.unwrap();

        let ReportSchemaResult::Error(error) = result else {
            unreachable!("expected a rejection");
        };

        assert_eq!(error.code, ReportSchemaErrorCode::BootIdIsRequired);
        assert!(error.with_core_schema);
        assert!(error.in_seconds >= 300);

        assert!(!fixture.coordinator.content().has(&schema_hash(SCHEMA)).await.unwrap());

        let graph_ref: GraphRef = "shop@prod".parse().unwrap();
        let fleet = fixture.coordinator.fleet(&graph_ref).await.unwrap();
        assert!(fleet.agents.is_empty());
    }

    #[tokio::test]
    async fn invalid_document_is_rejected_without_being_stored() {
        let fixture = Fixture::new();
        let document = "type Query {";

        let mut report = report(Uuid::new_v4());
        report.core_schema_hash = schema_hash(document);

        let result = fixture.coordinator.report_schema(&report, Some(document)).await.unwrap();

        assert_eq!(result.error_code(), Some(ReportSchemaErrorCode::SchemaIsNotParsable));
        assert!(!fixture.coordinator.content().has(&schema_hash(document)).await.unwrap());
    }

    #[tokio::test]
    async fn restart_supersedes_the_previous_boot() {
        let fixture = Fixture::new();
        let graph_ref: GraphRef = "shop@prod".parse().unwrap();
        let old_boot = Uuid::new_v4();
        let new_boot = Uuid::new_v4();

        fixture
            .coordinator
            .report_schema(&report(old_boot), Some(SCHEMA))
            .await
            .unwrap();

        fixture.advance(45);

        fixture
            .coordinator
            .report_schema(&report(new_boot), None)
            .await
            .unwrap();

        let fleet = fixture.coordinator.fleet(&graph_ref).await.unwrap();
        assert_eq!(fleet.active_count, 1);
        assert_eq!(fleet.agents.len(), 2);

        let old = fixture
            .coordinator
            .fleet_registry()
            .registration(&graph_ref.to_string(), old_boot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.superseded_by, Some(new_boot));
    }

    #[tokio::test]
    async fn server_info_takes_the_graph_from_the_caller() {
        let fixture = Fixture::new();
        let executable_schema = "type Query { products: [String] }";

        let info = EdgeServerInfo {
            boot_id: Uuid::new_v4().to_string(),
            executable_schema_id: schema_hash(executable_schema),
            server_id: Some("edge-eu-1".to_owned()),
            ..Default::default()
        };

        let result = fixture
            .coordinator
            .report_server_info(None, &info, None)
            .await
            .unwrap();
        assert_eq!(result.error_code(), Some(ReportSchemaErrorCode::GraphRefIsRequired));
        assert!(!result.with_executable_schema());

        let result = fixture
            .coordinator
            .report_server_info(Some("shop"), &info, None)
            .await
            .unwrap();
        assert!(result.with_executable_schema());

        let result = fixture
            .coordinator
            .report_server_info(Some("shop"), &info, Some(executable_schema))
            .await
            .unwrap();
        assert!(!result.with_executable_schema());

        let fleet = fixture
            .coordinator
            .fleet(&"shop@current".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(fleet.active_count, 1);
        assert_eq!(
            fleet.agents[0].0.executable_schema_id.as_deref(),
            Some(schema_hash(executable_schema).as_str())
        );
    }

    #[tokio::test]
    async fn storage_failures_propagate() {
        let fixture = Fixture::new();
        fixture.storage.set_available(false);

        let error = fixture
            .coordinator
            .report_schema(&report(Uuid::new_v4()), Some(SCHEMA))
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::Unavailable(_)));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn rejections_are_answered_even_without_storage() {
        let fixture = Fixture::new();
        fixture.storage.set_available(false);

        let mut report = report(Uuid::new_v4());
        report.boot_id = "not-a-uuid".to_owned();

        let result = fixture.coordinator.report_schema(&report, None).await.unwrap();

        assert_eq!(result.error_code(), Some(ReportSchemaErrorCode::BootIdIsNotValidUuid));
        assert!(result.in_seconds() >= 300);
    }

    #[tokio::test]
    async fn sweep_uses_the_coordinator_clock() {
        let fixture = Fixture::new();

        fixture
            .coordinator
            .report_schema(&report(Uuid::new_v4()), Some(SCHEMA))
            .await
            .unwrap();

        assert_eq!(fixture.coordinator.sweep().await.unwrap().marked_stale, 0);

        fixture.advance(16 * 60);
        assert_eq!(fixture.coordinator.sweep().await.unwrap().marked_stale, 1);
    }

    #[tokio::test]
    async fn federated_supergraph_is_stored() {
        let fixture = Fixture::new();
        let supergraph = include_str!("../fixtures/supergraph.graphql");

        let mut report = report(Uuid::new_v4());
        report.core_schema_hash = schema_hash(supergraph);

        let result = fixture.coordinator.report_schema(&report, None).await.unwrap();
        assert!(result.with_core_schema());

        let result = fixture
            .coordinator
            .report_schema(&report, Some(supergraph))
            .await
            .unwrap();
        assert_eq!(result.error_code(), None);

        let result = fixture.coordinator.report_schema(&report, None).await.unwrap();
        assert!(!result.with_core_schema());

        let document = fixture
            .coordinator
            .schema_document(&schema_hash(supergraph))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(document.content, supergraph);
    }

    #[tokio::test]
    async fn interval_is_computed_for_the_active_fleet() {
        let backoff = Arc::new(RecordingBackoff::default());
        let fixture = Fixture::with_backoff(backoff.clone());

        for i in 0..25 {
            let mut report = report(Uuid::new_v4());
            report.server_id = Some(format!("pod-{i}"));

            fixture.coordinator.report_schema(&report, None).await.unwrap();
        }

        let mut other_graph = report(Uuid::new_v4());
        other_graph.graph_ref = "other@prod".to_owned();
        fixture.coordinator.report_schema(&other_graph, None).await.unwrap();

        let fleet_sizes = backoff.fleet_sizes.lock().unwrap().clone();
        assert_eq!(fleet_sizes, (1..=25).chain([1]).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn larger_fleets_get_more_spread_out_intervals() {
        async fn intervals(agents: usize) -> Vec<u32> {
            let fixture = Fixture::new();
            let mut intervals = Vec::with_capacity(agents);

            for i in 0..agents {
                let mut report = report(Uuid::new_v4());
                report.server_id = Some(format!("pod-{i}"));

                let result = fixture.coordinator.report_schema(&report, None).await.unwrap();
                intervals.push(result.in_seconds());
            }

            // the last few reports are all answered for the full fleet
            intervals.split_off(agents.saturating_sub(200))
        }

        let spread = |intervals: &[u32]| {
            let min = intervals.iter().min().copied().unwrap_or_default();
            let max = intervals.iter().max().copied().unwrap_or_default();
            max - min
        };

        let single = intervals(1).await;
        assert!((55..=65).contains(&single[0]), "{single:?}");

        let large = intervals(1000).await;

        assert!(large.iter().all(|seconds| (30..=90).contains(seconds)), "{large:?}");

        // a fleet of 1000 spreads over 60s, far more than a single agent's 8s window
        assert!(spread(&large) > 20, "{large:?}");
        assert!(spread(&large) > spread(&single));
    }
}
