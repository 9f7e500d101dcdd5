#![cfg_attr(test, allow(unused_crate_dependencies))]
//! The GraphQL endpoint of the schema reporting coordinator.
//!
//! Exposes the `reportSchema` and `reportServerInfo` mutations sent by edge agents, a small
//! read API over the stored documents and fleets, and the HTTP server around them.

mod error;
pub mod schema;
mod server;

use std::sync::Arc;

use coordinator_config::Config;
use schema_reporting::{
    storage::{memory::InMemoryStorage, DocumentStorage, RegistryStorage},
    ContentStore, FleetRegistry, ReportingCoordinator,
};
use schema_reporting_redis::{RedisStorage, RedisStorageConfig, RedisTlsConfig};

pub use error::Error;
pub use schema::{build_schema, GraphId, ReportingSchema};
pub use server::{router, serve, ServerConfig, GRAPH_ID_HEADER};

/// The result type of the coordinator server
pub type Result<T> = std::result::Result<T, Error>;

/// Builds the coordinator with the storage and reporting settings of the configuration.
pub async fn coordinator(config: &Config) -> Result<ReportingCoordinator> {
    let reporting = &config.reporting;
    let fleet_settings = reporting.fleet_settings();

    let (documents, registry): (Arc<dyn DocumentStorage>, Arc<dyn RegistryStorage>) = if config.storage.kind.is_redis()
    {
        let redis = &config.storage.redis;

        let tls = redis.tls.as_ref().map(|tls| RedisTlsConfig {
            cert: tls.cert.as_deref(),
            key: tls.key.as_deref(),
            ca: tls.ca.as_deref(),
        });

        let storage = RedisStorage::new(RedisStorageConfig {
            url: redis.url.as_str(),
            key_prefix: &redis.key_prefix,
            retention: fleet_settings.retention,
            tls,
        })
        .await
        .map_err(|e| Error::Storage(format!("{e:#}")))?;

        tracing::info!("Storing reports in Redis");

        shared(storage)
    } else {
        tracing::info!("Storing reports in memory");

        shared(InMemoryStorage::new())
    };

    let content = ContentStore::new(documents).with_content_verification(reporting.verify_content);
    let fleet = FleetRegistry::new(registry, fleet_settings);

    Ok(ReportingCoordinator::new(content, fleet, Arc::new(reporting.backoff())))
}

fn shared<S>(storage: S) -> (Arc<dyn DocumentStorage>, Arc<dyn RegistryStorage>)
where
    S: DocumentStorage + RegistryStorage + 'static,
{
    let storage = Arc::new(storage);
    (storage.clone(), storage)
}
