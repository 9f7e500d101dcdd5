//! Validation of inbound reports.
//!
//! Checks run in a fixed order and stop at the first violation, so the same bad report
//! always produces the same error code: boot id, graph ref, schema hash, optional fields,
//! and finally the attached document.

use std::fmt;

use graph_ref::GraphRef;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    fleet::{AgentMetadata, RegistrationUpdate},
    report::{EdgeServerInfo, ReportSchemaErrorCode, SchemaReport},
};

/// Length of a hex encoded SHA-256 digest, which is also the maximum accepted length.
pub const SCHEMA_HASH_LENGTH: usize = 64;

/// Maximum length of every optional, free-form report field.
pub const MAX_OPTIONAL_FIELD_LENGTH: usize = 256;

// Only the first few schema errors are echoed back.
const MAX_REPORTED_SCHEMA_ERRORS: usize = 5;

/// A rejected report: the wire code and a human readable explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportValidationError {
    pub code: ReportSchemaErrorCode,
    pub message: String,
}

impl ReportValidationError {
    fn new(code: ReportSchemaErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ReportValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Which schema a report refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaReference {
    /// The supergraph/core schema, sent through `reportSchema`.
    Core(String),
    /// The API schema actually executed, sent through `reportServerInfo`.
    Executable(String),
}

impl SchemaReference {
    pub fn hash(&self) -> &str {
        match self {
            SchemaReference::Core(hash) | SchemaReference::Executable(hash) => hash,
        }
    }
}

/// A report that passed every check, with its fields parsed and normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedReport<'a> {
    pub graph_ref: GraphRef,
    pub boot_id: Uuid,
    pub schema: SchemaReference,
    pub metadata: AgentMetadata,
    /// The schema document attached to the report, if any. Its hash matches `schema`.
    pub document: Option<&'a str>,
}

impl ValidatedReport<'_> {
    pub fn registration_update(&self, reported_at: chrono::DateTime<chrono::Utc>) -> RegistrationUpdate {
        let (core_schema_hash, executable_schema_id) = match &self.schema {
            SchemaReference::Core(hash) => (Some(hash.clone()), None),
            SchemaReference::Executable(id) => (None, Some(id.clone())),
        };

        RegistrationUpdate {
            graph_ref: self.graph_ref.to_string(),
            boot_id: self.boot_id,
            reported_at,
            core_schema_hash,
            executable_schema_id,
            metadata: self.metadata.clone(),
        }
    }
}

type ValidationResult<T> = Result<T, ReportValidationError>;

/// Validates a `reportSchema` call.
pub fn validate_schema_report<'a>(
    report: &SchemaReport,
    core_schema: Option<&'a str>,
) -> ValidationResult<ValidatedReport<'a>> {
    let boot_id = validate_boot_id(&report.boot_id)?;
    let graph_ref = validate_graph_ref(&report.graph_ref)?;
    let hash = validate_hash(&report.core_schema_hash, HashField::CoreSchemaHash)?;

    let metadata = validate_metadata(OptionalFields {
        library_version: report.library_version.as_deref(),
        platform: report.platform.as_deref(),
        runtime_version: report.runtime_version.as_deref(),
        server_id: report.server_id.as_deref(),
        user_version: report.user_version.as_deref(),
    })?;

    if let Some(document) = core_schema {
        validate_document(document, &hash, HashField::CoreSchemaHash)?;
    }

    Ok(ValidatedReport {
        graph_ref,
        boot_id,
        schema: SchemaReference::Core(hash),
        metadata,
        document: core_schema,
    })
}

/// Validates a `reportServerInfo` call. `graph_id` is resolved by the transport.
pub fn validate_server_info<'a>(
    graph_id: Option<&str>,
    info: &EdgeServerInfo,
    executable_schema: Option<&'a str>,
) -> ValidationResult<ValidatedReport<'a>> {
    let boot_id = validate_boot_id(&info.boot_id)?;

    let graph_id = match graph_id {
        Some(graph_id) if !graph_id.is_empty() => graph_id,
        _ => {
            return Err(ReportValidationError::new(
                ReportSchemaErrorCode::GraphRefIsRequired,
                "The graph id could not be resolved for this request.",
            ))
        }
    };

    graph_ref::validate_graph_id(graph_id)
        .map_err(|message| ReportValidationError::new(ReportSchemaErrorCode::GraphRefInvalidFormat, message))?;

    if info.graph_variant.is_empty() {
        return Err(ReportValidationError::new(
            ReportSchemaErrorCode::GraphVariantIsRequired,
            "The graph variant is required.",
        ));
    }

    let graph_ref = GraphRef::new(graph_id, Some(info.graph_variant.as_str()))
        .map_err(|message| ReportValidationError::new(ReportSchemaErrorCode::GraphVariantDoesNotMatchRegex, message))?;

    let hash = validate_hash(&info.executable_schema_id, HashField::ExecutableSchemaId)?;

    let metadata = validate_metadata(OptionalFields {
        library_version: info.library_version.as_deref(),
        platform: info.platform.as_deref(),
        runtime_version: info.runtime_version.as_deref(),
        server_id: info.server_id.as_deref(),
        user_version: info.user_version.as_deref(),
    })?;

    if let Some(document) = executable_schema {
        validate_document(document, &hash, HashField::ExecutableSchemaId)?;
    }

    Ok(ValidatedReport {
        graph_ref,
        boot_id,
        schema: SchemaReference::Executable(hash),
        metadata,
        document: executable_schema,
    })
}

/// Lowercase hex SHA-256 of a schema document.
pub fn schema_hash(document: &str) -> String {
    hex::encode(Sha256::digest(document.as_bytes()))
}

fn validate_boot_id(boot_id: &str) -> ValidationResult<Uuid> {
    if boot_id.is_empty() {
        return Err(ReportValidationError::new(
            ReportSchemaErrorCode::BootIdIsRequired,
            "The boot id is required.",
        ));
    }

    Uuid::parse_str(boot_id).map_err(|_| {
        ReportValidationError::new(
            ReportSchemaErrorCode::BootIdIsNotValidUuid,
            format!("The boot id \"{}\" is not a valid UUID.", truncate(boot_id)),
        )
    })
}

fn validate_graph_ref(graph_ref: &str) -> ValidationResult<GraphRef> {
    if graph_ref.is_empty() {
        return Err(ReportValidationError::new(
            ReportSchemaErrorCode::GraphRefIsRequired,
            "The graph ref is required.",
        ));
    }

    graph_ref.parse().map_err(|message: std::borrow::Cow<'static, str>| {
        ReportValidationError::new(
            ReportSchemaErrorCode::GraphRefInvalidFormat,
            format!("Invalid graph ref \"{}\": {message}", truncate(graph_ref)),
        )
    })
}

#[derive(Clone, Copy)]
enum HashField {
    CoreSchemaHash,
    ExecutableSchemaId,
}

impl HashField {
    fn name(self) -> &'static str {
        match self {
            HashField::CoreSchemaHash => "core schema hash",
            HashField::ExecutableSchemaId => "executable schema id",
        }
    }

    fn required(self) -> ReportSchemaErrorCode {
        match self {
            HashField::CoreSchemaHash => ReportSchemaErrorCode::CoreSchemaHashIsRequired,
            HashField::ExecutableSchemaId => ReportSchemaErrorCode::ExecutableSchemaIdIsRequired,
        }
    }

    fn too_long(self) -> ReportSchemaErrorCode {
        match self {
            HashField::CoreSchemaHash => ReportSchemaErrorCode::CoreSchemaHashIsTooLong,
            HashField::ExecutableSchemaId => ReportSchemaErrorCode::ExecutableSchemaIdIsTooLong,
        }
    }

    fn not_sha256(self) -> ReportSchemaErrorCode {
        match self {
            HashField::CoreSchemaHash => ReportSchemaErrorCode::CoreSchemaHashIsNotSchemaSha256,
            HashField::ExecutableSchemaId => ReportSchemaErrorCode::ExecutableSchemaIdIsNotSchemaSha256,
        }
    }
}

fn validate_hash(hash: &str, field: HashField) -> ValidationResult<String> {
    if hash.is_empty() {
        return Err(ReportValidationError::new(
            field.required(),
            format!("The {} is required.", field.name()),
        ));
    }

    let length = hash.chars().count();

    if length > SCHEMA_HASH_LENGTH {
        return Err(ReportValidationError::new(
            field.too_long(),
            format!(
                "The {} is {length} characters long, the maximum is {SCHEMA_HASH_LENGTH}.",
                field.name()
            ),
        ));
    }

    if length != SCHEMA_HASH_LENGTH || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ReportValidationError::new(
            field.not_sha256(),
            format!(
                "The {} must be a hex encoded SHA-256 digest of {SCHEMA_HASH_LENGTH} characters.",
                field.name()
            ),
        ));
    }

    Ok(hash.to_ascii_lowercase())
}

struct OptionalFields<'a> {
    library_version: Option<&'a str>,
    platform: Option<&'a str>,
    runtime_version: Option<&'a str>,
    server_id: Option<&'a str>,
    user_version: Option<&'a str>,
}

fn validate_metadata(fields: OptionalFields<'_>) -> ValidationResult<AgentMetadata> {
    let checks = [
        (
            fields.library_version,
            "library version",
            ReportSchemaErrorCode::LibraryVersionIsTooLong,
        ),
        (fields.platform, "platform", ReportSchemaErrorCode::PlatformIsTooLong),
        (
            fields.runtime_version,
            "runtime version",
            ReportSchemaErrorCode::RuntimeVersionIsTooLong,
        ),
        (fields.server_id, "server id", ReportSchemaErrorCode::ServerIdIsTooLong),
        (
            fields.user_version,
            "user version",
            ReportSchemaErrorCode::UserVersionIsTooLong,
        ),
    ];

    for (value, name, code) in checks {
        let Some(value) = value else { continue };
        let length = value.chars().count();

        if length > MAX_OPTIONAL_FIELD_LENGTH {
            return Err(ReportValidationError::new(
                code,
                format!("The {name} is {length} characters long, the maximum is {MAX_OPTIONAL_FIELD_LENGTH}."),
            ));
        }
    }

    Ok(AgentMetadata {
        server_id: fields.server_id.map(ToOwned::to_owned),
        library_version: fields.library_version.map(ToOwned::to_owned),
        platform: fields.platform.map(ToOwned::to_owned),
        runtime_version: fields.runtime_version.map(ToOwned::to_owned),
        user_version: fields.user_version.map(ToOwned::to_owned),
    })
}

fn validate_document(document: &str, expected_hash: &str, field: HashField) -> ValidationResult<()> {
    let actual_hash = schema_hash(document);

    if actual_hash != expected_hash {
        return Err(ReportValidationError::new(
            field.not_sha256(),
            format!(
                "The {} {expected_hash} is not the SHA-256 of the attached schema ({actual_hash}).",
                field.name()
            ),
        ));
    }

    if let Err(error) = async_graphql_parser::parse_schema(document) {
        return Err(ReportValidationError::new(
            ReportSchemaErrorCode::SchemaIsNotParsable,
            format!("The attached schema could not be parsed: {error}"),
        ));
    }

    if let Err(invalid) = apollo_compiler::Schema::parse_and_validate(document, "schema.graphql") {
        let errors = invalid
            .errors
            .iter()
            .take(MAX_REPORTED_SCHEMA_ERRORS)
            .map(|diagnostic| diagnostic.error.to_string())
            .collect::<Vec<_>>()
            .join("; ");

        return Err(ReportValidationError::new(
            ReportSchemaErrorCode::SchemaIsNotValid,
            format!("The attached schema is not valid: {errors}"),
        ));
    }

    Ok(())
}

// Keeps echoed client input in messages bounded.
fn truncate(value: &str) -> &str {
    match value.char_indices().nth(MAX_OPTIONAL_FIELD_LENGTH) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}
