#![cfg_attr(test, allow(unused_crate_dependencies))]
//! Coordination of schema reports sent periodically by a fleet of GraphQL edge agents.
//!
//! A report goes through [`validation`], the schema document is deduplicated by hash in the
//! [`content`] store, the sending process is tracked in the [`fleet`] registry, and the
//! [`backoff`] advisor decides when the agent should report again. The
//! [`coordinator::ReportingCoordinator`] composes these into a single request/response cycle.

pub mod backoff;
pub mod content;
pub mod coordinator;
pub mod fleet;
pub mod report;
pub mod storage;
pub mod validation;

pub use backoff::{BackoffPolicy, JitteredBackoff, ReportOutcome};
pub use content::{ContentStore, PutOutcome, SchemaDocument};
pub use coordinator::ReportingCoordinator;
pub use fleet::{AgentMetadata, AgentRegistration, FleetRegistry, FleetSettings, RegistrationEvent};
pub use report::*;
pub use storage::{StorageError, StorageResult};

/// Tracing target of every event emitted by the reporting pipeline.
pub const REPORTING_TARGET: &str = "schema_reporting";
