mod health;
mod state;
mod sweep;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{extract::State, http::HeaderMap, routing::get, Router};
use coordinator_config::{Config, TlsConfig};
use schema_reporting::ReportingCoordinator;
use state::ServerState;
use tokio::signal;
use tower_http::{limit::RequestBodyLimitLayer, timeout::RequestBodyTimeoutLayer};

use crate::schema::{build_schema, GraphId};

/// Header carrying the graph id of `reportServerInfo` requests.
pub const GRAPH_ID_HEADER: &str = "x-graph-id";

const DEFAULT_LISTEN_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Start parameters of the coordinator.
pub struct ServerConfig {
    /// The GraphQL endpoint listen address. Takes precedence over the configuration.
    pub listen_addr: Option<SocketAddr>,
    /// The coordinator configuration.
    pub config: Config,
}

/// Starts the coordinator and serves reports until a termination signal is received.
pub async fn serve(ServerConfig { listen_addr, config }: ServerConfig) -> crate::Result<()> {
    let coordinator = crate::coordinator(&config).await?;

    let sweeper = sweep::spawn(coordinator.clone(), config.reporting.sweep_interval);

    let addr = listen_addr
        .or(config.network.listen_address)
        .unwrap_or(DEFAULT_LISTEN_ADDRESS);

    let result = bind(addr, &config.graph.path, router(&config, coordinator), config.tls.as_ref()).await;

    sweeper.abort();

    result
}

/// The HTTP routes of the coordinator: the GraphQL endpoint and the health check.
pub fn router(config: &Config, coordinator: ReportingCoordinator) -> Router {
    let schema = build_schema(coordinator, config.graph.introspection);
    let state = ServerState::new(schema);

    let body_limit = usize::try_from(config.request_body_limit.bytes()).unwrap_or_default();

    let mut router = Router::new()
        .route(&config.graph.path, get(graphql).post(graphql))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(RequestBodyTimeoutLayer::new(
            config.server.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        ));

    if config.health.enabled {
        router = router.route(&config.health.path, get(health::health));
    }

    router.with_state(state)
}

async fn bind(addr: SocketAddr, path: &str, router: Router<()>, tls: Option<&TlsConfig>) -> crate::Result<()> {
    let app = router.into_make_service();

    let handle = axum_server::Handle::new();

    tokio::spawn(graceful_shutdown(handle.clone()));

    match tls {
        Some(tls) => {
            tracing::info!("GraphQL endpoint exposed at https://{addr}{path}");

            let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.certificate, &tls.key)
                .await
                .map_err(crate::Error::CertificateError)?;

            axum_server::bind_rustls(addr, rustls_config)
                .handle(handle)
                .serve(app)
                .await
                .map_err(crate::Error::Server)?
        }
        None => {
            tracing::info!("GraphQL endpoint exposed at http://{addr}{path}");

            axum_server::bind(addr)
                .handle(handle)
                .serve(app)
                .await
                .map_err(crate::Error::Server)?
        }
    }

    Ok(())
}

/// Executes a GraphQL request, with the graph id header made available to the resolvers.
async fn graphql(State(state): State<ServerState>, headers: HeaderMap, request: GraphQLRequest) -> GraphQLResponse {
    let mut request = request.into_inner();

    if let Some(graph_id) = headers.get(GRAPH_ID_HEADER).and_then(|value| value.to_str().ok()) {
        request = request.data(GraphId(graph_id.to_owned()));
    }

    state.schema().execute(request).await.into()
}

/// Waits for Ctrl+C or SIGTERM, then lets in-flight requests finish before shutting down.
async fn graceful_shutdown(handle: axum_server::Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down gracefully...");
    handle.graceful_shutdown(Some(Duration::from_secs(3)));
}
