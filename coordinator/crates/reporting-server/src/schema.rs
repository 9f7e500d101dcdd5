//! The GraphQL schema served to edge agents.

mod types;

use async_graphql::{Context, EmptySubscription, ErrorExtensions, Object, Schema};
use graph_ref::GraphRef;
use schema_reporting::{ReportingCoordinator, StorageError, REPORTING_TARGET};

pub use types::*;

pub type ReportingSchema = Schema<Query, Mutation, EmptySubscription>;

/// The graph the request is made for, resolved by the transport. Server info reports do not
/// carry it in their payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphId(pub String);

pub fn build_schema(coordinator: ReportingCoordinator, introspection: bool) -> ReportingSchema {
    let mut builder = Schema::build(Query, Mutation, EmptySubscription).data(coordinator);

    if !introspection {
        builder = builder.disable_introspection();
    }

    builder.finish()
}

pub struct Query;

#[Object]
impl Query {
    /// A schema document previously attached to a report, by its SHA-256.
    async fn schema_document(&self, ctx: &Context<'_>, hash: String) -> async_graphql::Result<Option<SchemaDocument>> {
        let coordinator = ctx.data::<ReportingCoordinator>()?;
        let document = coordinator.schema_document(&hash).await.map_err(storage_error)?;

        Ok(document.map(Into::into))
    }

    /// The agents known for a graph variant.
    async fn fleet(
        &self,
        ctx: &Context<'_>,
        #[graphql(desc = "Graph reference following the format \"graph@variant\"")] graph_ref: String,
    ) -> async_graphql::Result<Fleet> {
        let graph_ref: GraphRef = graph_ref.parse().map_err(|message| {
            async_graphql::Error::new(format!("Invalid graph reference: {message}"))
                .extend_with(|_, extensions| extensions.set("code", "BAD_REQUEST"))
        })?;

        let coordinator = ctx.data::<ReportingCoordinator>()?;
        let snapshot = coordinator.fleet(&graph_ref).await.map_err(storage_error)?;

        Ok(snapshot.into())
    }
}

pub struct Mutation;

#[Object]
impl Mutation {
    /// Reports the core schema an agent runs. The document itself is only attached when a
    /// previous response asked for it.
    async fn report_schema(
        &self,
        ctx: &Context<'_>,
        report: SchemaReportInput,
        core_schema: Option<String>,
    ) -> async_graphql::Result<Option<ReportSchemaResult>> {
        let coordinator = ctx.data::<ReportingCoordinator>()?;

        let result = coordinator
            .report_schema(&report.into(), core_schema.as_deref())
            .await
            .map_err(storage_error)?;

        Ok(Some(result.into()))
    }

    /// Reports the executable schema an agent serves. The graph is identified by the
    /// `x-graph-id` header.
    async fn report_server_info(
        &self,
        ctx: &Context<'_>,
        info: EdgeServerInfoInput,
        executable_schema: Option<String>,
    ) -> async_graphql::Result<Option<ReportServerInfoResult>> {
        let coordinator = ctx.data::<ReportingCoordinator>()?;
        let graph_id = ctx.data_opt::<GraphId>().map(|GraphId(id)| id.as_str());

        let result = coordinator
            .report_server_info(graph_id, &info.into(), executable_schema.as_deref())
            .await
            .map_err(storage_error)?;

        Ok(Some(result.into()))
    }
}

fn storage_error(error: StorageError) -> async_graphql::Error {
    tracing::error!(target: REPORTING_TARGET, "storage failure: {error}");

    let code = match error {
        StorageError::Unavailable(_) | StorageError::Contended { .. } => "STORAGE_UNAVAILABLE",
        StorageError::Corrupted { .. } | StorageError::Serialization(_) => "INTERNAL_SERVER_ERROR",
    };

    let retryable = error.is_retryable();

    async_graphql::Error::new(error.to_string()).extend_with(|_, extensions| {
        extensions.set("code", code);
        extensions.set("retryable", retryable);
    })
}
