//! Wire-level shapes of the two report mutations and their results.

use graph_ref::GraphRef;

/// A schema report sent by an edge agent: which core schema it runs and who it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaReport {
    /// Identifies one agent process for its whole lifetime. Must be a UUID.
    pub boot_id: String,
    /// Lowercase hex SHA-256 of the core schema document the agent runs.
    pub core_schema_hash: String,
    /// `graphId` or `graphId@variant`.
    pub graph_ref: String,
    pub library_version: Option<String>,
    pub platform: Option<String>,
    pub runtime_version: Option<String>,
    pub server_id: Option<String>,
    pub user_version: Option<String>,
}

/// Server information sent by an edge agent, keyed by the executable schema it serves.
///
/// The graph id is not part of the payload: the transport resolves it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeServerInfo {
    pub boot_id: String,
    pub executable_schema_id: String,
    #[serde(default = "default_graph_variant")]
    pub graph_variant: String,
    pub library_version: Option<String>,
    pub platform: Option<String>,
    pub runtime_version: Option<String>,
    pub server_id: Option<String>,
    pub user_version: Option<String>,
}

impl Default for EdgeServerInfo {
    fn default() -> Self {
        Self {
            boot_id: String::new(),
            executable_schema_id: String::new(),
            graph_variant: default_graph_variant(),
            library_version: None,
            platform: None,
            runtime_version: None,
            server_id: None,
            user_version: None,
        }
    }
}

fn default_graph_variant() -> String {
    GraphRef::DEFAULT_VARIANT.to_owned()
}

/// Every reason a report can be rejected with. Part of the wire contract: clients log and
/// alert on these, so the set only grows together with a client-compatible fallback.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportSchemaErrorCode {
    BootIdIsNotValidUuid,
    BootIdIsRequired,
    CoreSchemaHashIsNotSchemaSha256,
    CoreSchemaHashIsRequired,
    CoreSchemaHashIsTooLong,
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

/// Outcome of `reportSchema`. Rejections are data, not failures of the call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "__typename")]
pub enum ReportSchemaResult {
    #[serde(rename = "ReportSchemaResponse")]
    Response(ReportSchemaResponse),
    #[serde(rename = "ReportSchemaError")]
    Error(ReportSchemaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSchemaResponse {
    /// Seconds the agent should wait before its next report.
    pub in_seconds: u32,
    /// The backend does not have the core schema and wants it attached next time.
    pub with_core_schema: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSchemaError {
    pub code: ReportSchemaErrorCode,
    pub message: String,
    pub in_seconds: u32,
    pub with_core_schema: bool,
}

/// Outcome of `reportServerInfo`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "__typename")]
pub enum ReportServerInfoResult {
    #[serde(rename = "ReportServerInfoResponse")]
    Response(ReportServerInfoResponse),
    #[serde(rename = "ReportServerInfoError")]
    Error(ReportServerInfoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportServerInfoResponse {
    pub in_seconds: u32,
    pub with_executable_schema: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportServerInfoError {
    pub code: ReportSchemaErrorCode,
    pub message: String,
    pub in_seconds: u32,
    pub with_executable_schema: bool,
}

impl ReportSchemaResult {
    pub fn in_seconds(&self) -> u32 {
        match self {
            ReportSchemaResult::Response(response) => response.in_seconds,
            ReportSchemaResult::Error(error) => error.in_seconds,
        }
    }

    pub fn with_core_schema(&self) -> bool {
        match self {
            ReportSchemaResult::Response(response) => response.with_core_schema,
            ReportSchemaResult::Error(error) => error.with_core_schema,
        }
    }

    pub fn error_code(&self) -> Option<ReportSchemaErrorCode> {
        match self {
            ReportSchemaResult::Response(_) => None,
            ReportSchemaResult::Error(error) => Some(error.code),
        }
    }
}

impl ReportServerInfoResult {
    pub fn in_seconds(&self) -> u32 {
        match self {
            ReportServerInfoResult::Response(response) => response.in_seconds,
            ReportServerInfoResult::Error(error) => error.in_seconds,
        }
    }

    pub fn with_executable_schema(&self) -> bool {
        match self {
            ReportServerInfoResult::Response(response) => response.with_executable_schema,
            ReportServerInfoResult::Error(error) => error.with_executable_schema,
        }
    }

    pub fn error_code(&self) -> Option<ReportSchemaErrorCode> {
        match self {
            ReportServerInfoResult::Response(_) => None,
            ReportServerInfoResult::Error(error) => Some(error.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn error_codes_use_screaming_snake_case() {
        let code = ReportSchemaErrorCode::CoreSchemaHashIsNotSchemaSha256;

        assert_eq!(code.to_string(), "CORE_SCHEMA_HASH_IS_NOT_SCHEMA_SHA256");
        assert_eq!(
            serde_json::to_value(code).unwrap(),
            serde_json::json!("CORE_SCHEMA_HASH_IS_NOT_SCHEMA_SHA256")
        );
    }

    #[test]
    fn error_code_set_is_closed() {
        assert_eq!(ReportSchemaErrorCode::iter().count(), 19);

        for code in ReportSchemaErrorCode::iter() {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, serde_json::Value::String(code.to_string()));
            assert_eq!(serde_json::from_value::<ReportSchemaErrorCode>(wire).unwrap(), code);
        }
    }

    #[test]
    fn server_info_variant_defaults_to_current() {
        let info: EdgeServerInfo = serde_json::from_value(serde_json::json!({
            "bootId": "0b1c9a2e-4d0f-4a51-9a44-0c4c7b8b2a3e",
            "executableSchemaId": "ab",
        }))
        .unwrap();

        assert_eq!(info.graph_variant, "current");
        assert_eq!(info.server_id, None);
    }

    #[test]
    fn results_are_tagged_by_typename() {
        let result = ReportSchemaResult::Response(ReportSchemaResponse {
            in_seconds: 60,
            with_core_schema: true,
        });

        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({
                "__typename": "ReportSchemaResponse",
                "inSeconds": 60,
                "withCoreSchema": true,
            })
        );
    }
}
