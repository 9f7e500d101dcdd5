//! Configuration of the schema reporting coordinator, read from a TOML file.

pub mod reporting;
pub mod storage;

use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub use reporting::*;
use serde_with::DisplayFromStr;
use size::Size;
pub use storage::*;

#[serde_with::serde_as]
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
/// Configuration of a coordinator instance.
pub struct Config {
    /// Server bind settings
    pub network: NetworkConfig,
    /// GraphQL endpoint settings, such as introspection
    pub graph: GraphConfig,
    /// General settings for the HTTP server
    pub server: ServerConfig,
    /// Maximum size of the request body in bytes. Reports may carry a whole schema document.
    #[serde_as(as = "DisplayFromStr")]
    pub request_body_limit: Size,
    /// Server TLS settings
    pub tls: Option<TlsConfig>,
    /// Health check endpoint configuration
    pub health: HealthConfig,
    /// Report handling: intervals advised to agents and fleet time windows
    pub reporting: ReportingConfig,
    /// Where documents and registrations are kept
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Default::default(),
            graph: Default::default(),
            server: Default::default(),
            request_body_limit: Size::from_mebibytes(8),
            tls: Default::default(),
            health: Default::default(),
            reporting: Default::default(),
            storage: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub listen_address: Option<SocketAddr>,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    pub path: String,
    pub introspection: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            path: String::from("/graphql"),
            introspection: true,
        }
    }
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Time allowed to receive a request body.
    #[serde(deserialize_with = "duration_str::deserialize_option_duration")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, serde::Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, serde::Deserialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: String::from("/health"),
        }
    }
}
