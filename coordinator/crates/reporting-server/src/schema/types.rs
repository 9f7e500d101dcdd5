use async_graphql::{Enum, InputObject, SimpleObject, Union};
use chrono::{DateTime, Utc};

#[derive(Debug, InputObject)]
#[graphql(name = "SchemaReport")]
pub struct SchemaReportInput {
    /// Identifies the reporting process for its whole lifetime. A UUID.
    pub boot_id: String,
    /// Lowercase hex SHA-256 of the core schema document.
    pub core_schema_hash: String,
    /// `graphId` or `graphId@variant`.
    pub graph_ref: String,
    pub library_version: Option<String>,
    pub platform: Option<String>,
    pub runtime_version: Option<String>,
    /// Stable across restarts of the same server, such as a hostname.
    pub server_id: Option<String>,
    pub user_version: Option<String>,
}

impl From<SchemaReportInput> for schema_reporting::SchemaReport {
    fn from(input: SchemaReportInput) -> Self {
        Self {
            boot_id: input.boot_id,
            core_schema_hash: input.core_schema_hash,
            graph_ref: input.graph_ref,
            library_version: input.library_version,
            platform: input.platform,
            runtime_version: input.runtime_version,
            server_id: input.server_id,
            user_version: input.user_version,
        }
    }
}

#[derive(Debug, InputObject)]
#[graphql(name = "EdgeServerInfo")]
pub struct EdgeServerInfoInput {
    pub boot_id: String,
    /// Lowercase hex SHA-256 of the executable schema document.
    pub executable_schema_id: String,
    #[graphql(default_with = "String::from(\"current\")")]
    pub graph_variant: String,
    pub library_version: Option<String>,
    pub platform: Option<String>,
    pub runtime_version: Option<String>,
    pub server_id: Option<String>,
    pub user_version: Option<String>,
}

impl From<EdgeServerInfoInput> for schema_reporting::EdgeServerInfo {
    fn from(input: EdgeServerInfoInput) -> Self {
        Self {
            boot_id: input.boot_id,
            executable_schema_id: input.executable_schema_id,
            graph_variant: input.graph_variant,
            library_version: input.library_version,
            platform: input.platform,
            runtime_version: input.runtime_version,
            server_id: input.server_id,
            user_version: input.user_version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[graphql(remote = "schema_reporting::ReportSchemaErrorCode")]
pub enum ReportSchemaErrorCode {
    BootIdIsNotValidUuid,
    BootIdIsRequired,
    #[graphql(name = "CORE_SCHEMA_HASH_IS_NOT_SCHEMA_SHA256")]
    CoreSchemaHashIsNotSchemaSha256,
    CoreSchemaHashIsRequired,
    CoreSchemaHashIsTooLong,
    #[graphql(name = "EXECUTABLE_SCHEMA_ID_IS_NOT_SCHEMA_SHA256")]
    ExecutableSchemaIdIsNotSchemaSha256,
    ExecutableSchemaIdIsRequired,
    ExecutableSchemaIdIsTooLong,
    GraphRefInvalidFormat,
    GraphRefIsRequired,
    GraphVariantDoesNotMatchRegex,
    GraphVariantIsRequired,
    LibraryVersionIsTooLong,
    PlatformIsTooLong,
    RuntimeVersionIsTooLong,
    SchemaIsNotParsable,
    SchemaIsNotValid,
    ServerIdIsTooLong,
    UserVersionIsTooLong,
}

#[derive(Debug, Union)]
pub enum ReportSchemaResult {
    ReportSchemaResponse(ReportSchemaResponse),
    ReportSchemaError(ReportSchemaError),
}

#[derive(Debug, SimpleObject)]
pub struct ReportSchemaResponse {
    /// Seconds to wait before the next report.
    pub in_seconds: u32,
    /// Attach the core schema to the next report.
    pub with_core_schema: bool,
}

#[derive(Debug, SimpleObject)]
pub struct ReportSchemaError {
    pub code: ReportSchemaErrorCode,
    pub message: String,
    pub in_seconds: u32,
    pub with_core_schema: bool,
}

impl From<schema_reporting::ReportSchemaResult> for ReportSchemaResult {
    fn from(result: schema_reporting::ReportSchemaResult) -> Self {
        match result {
            schema_reporting::ReportSchemaResult::Response(response) => {
                ReportSchemaResult::ReportSchemaResponse(ReportSchemaResponse {
                    in_seconds: response.in_seconds,
                    with_core_schema: response.with_core_schema,
                })
            }
            schema_reporting::ReportSchemaResult::Error(error) => {
                ReportSchemaResult::ReportSchemaError(ReportSchemaError {
                    code: error.code.into(),
                    message: error.message,
                    in_seconds: error.in_seconds,
                    with_core_schema: error.with_core_schema,
                })
            }
        }
    }
}

#[derive(Debug, Union)]
pub enum ReportServerInfoResult {
    ReportServerInfoResponse(ReportServerInfoResponse),
    ReportServerInfoError(ReportServerInfoError),
}

#[derive(Debug, SimpleObject)]
pub struct ReportServerInfoResponse {
    pub in_seconds: u32,
    /// Attach the executable schema to the next report.
    pub with_executable_schema: bool,
}

#[derive(Debug, SimpleObject)]
pub struct ReportServerInfoError {
    pub code: ReportSchemaErrorCode,
    pub message: String,
    pub in_seconds: u32,
    pub with_executable_schema: bool,
}

impl From<schema_reporting::ReportServerInfoResult> for ReportServerInfoResult {
    fn from(result: schema_reporting::ReportServerInfoResult) -> Self {
        match result {
            schema_reporting::ReportServerInfoResult::Response(response) => {
                ReportServerInfoResult::ReportServerInfoResponse(ReportServerInfoResponse {
                    in_seconds: response.in_seconds,
                    with_executable_schema: response.with_executable_schema,
                })
            }
            schema_reporting::ReportServerInfoResult::Error(error) => {
                ReportServerInfoResult::ReportServerInfoError(ReportServerInfoError {
                    code: error.code.into(),
                    message: error.message,
                    in_seconds: error.in_seconds,
                    with_executable_schema: error.with_executable_schema,
                })
            }
        }
    }
}

#[derive(Debug, SimpleObject)]
pub struct SchemaDocument {
    pub hash: String,
    pub content: String,
    pub first_seen_at: DateTime<Utc>,
}

impl From<schema_reporting::SchemaDocument> for SchemaDocument {
    fn from(document: schema_reporting::SchemaDocument) -> Self {
        Self {
            hash: document.hash,
            content: document.content,
            first_seen_at: document.first_seen_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[graphql(remote = "schema_reporting::fleet::RegistrationStatus")]
pub enum AgentStatus {
    Active,
    /// A newer boot of the same server took over.
    Superseded,
    /// Did not report for longer than the stale window.
    Stale,
}

#[derive(Debug, SimpleObject)]
pub struct Fleet {
    pub graph_ref: String,
    /// Agents that reported recently and were not replaced by a newer boot.
    pub active_count: u32,
    pub agents: Vec<Agent>,
}

impl From<schema_reporting::fleet::FleetSnapshot> for Fleet {
    fn from(snapshot: schema_reporting::fleet::FleetSnapshot) -> Self {
        Self {
            graph_ref: snapshot.graph_ref,
            active_count: u32::try_from(snapshot.active_count).unwrap_or(u32::MAX),
            agents: snapshot
                .agents
                .into_iter()
                .map(|(registration, status)| Agent {
                    boot_id: registration.boot_id.to_string(),
                    server_id: registration.metadata.server_id,
                    core_schema_hash: registration.core_schema_hash,
                    executable_schema_id: registration.executable_schema_id,
                    library_version: registration.metadata.library_version,
                    platform: registration.metadata.platform,
                    runtime_version: registration.metadata.runtime_version,
                    user_version: registration.metadata.user_version,
                    first_reported_at: registration.first_reported_at,
                    last_reported_at: registration.last_reported_at,
                    status: status.into(),
                    superseded_by: registration.superseded_by.map(|boot_id| boot_id.to_string()),
                })
                .collect(),
        }
    }
}

/// One agent process.
#[derive(Debug, SimpleObject)]
pub struct Agent {
    pub boot_id: String,
    pub server_id: Option<String>,
    pub core_schema_hash: Option<String>,
    pub executable_schema_id: Option<String>,
    pub library_version: Option<String>,
    pub platform: Option<String>,
    pub runtime_version: Option<String>,
    pub user_version: Option<String>,
    pub first_reported_at: DateTime<Utc>,
    pub last_reported_at: DateTime<Utc>,
    pub status: AgentStatus,
    pub superseded_by: Option<String>,
}
