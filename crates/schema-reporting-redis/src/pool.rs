use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use deadpool::managed::{self, Metrics, RecycleError};
use redis::{aio::MultiplexedConnection, Client, ClientTlsConfig, RedisError, TlsCertificates};

use crate::{RedisStorageConfig, RedisTlsConfig};

/// Connections are reopened after this long, so a failover of the Redis primary is picked up
/// even by connections that never saw an error.
const MAX_CONNECTION_AGE: Duration = Duration::from_secs(10 * 60);

/// Hands out one connection per storage operation. Optimistic transactions put the
/// connection in a `WATCH` state, so a connection is never shared between two operations.
#[derive(Debug)]
pub(crate) struct Manager {
    client: Client,
}

impl Manager {
    pub fn new(config: &RedisStorageConfig<'_>) -> anyhow::Result<Self> {
        let client = match config.tls {
            Some(ref tls) => Client::build_with_tls(config.url, certificates(tls)?)?,
            None => Client::open(config.url)?,
        };

        Ok(Self { client })
    }
}

impl managed::Manager for Manager {
    type Type = MultiplexedConnection;
    type Error = RedisError;

    async fn create(&self) -> Result<MultiplexedConnection, Self::Error> {
        self.client.get_multiplexed_async_connection().await
    }

    async fn recycle(
        &self,
        conn: &mut MultiplexedConnection,
        metrics: &Metrics,
    ) -> managed::RecycleResult<Self::Error> {
        if metrics.age() > MAX_CONNECTION_AGE {
            return Err(RecycleError::message("connection reached its maximum age"));
        }

        // an operation that failed half way may have left keys watched
        let (pong,) = redis::Pipeline::with_capacity(2)
            .cmd("UNWATCH")
            .ignore()
            .cmd("PING")
            .query_async::<_, (String,)>(conn)
            .await?;

        match pong.as_str() {
            "PONG" => Ok(()),
            _ => Err(RecycleError::message(format!("unexpected PING response: {pong}"))),
        }
    }
}

/// Loads the PEM files of a TLS setup. A client certificate is only sent when both its
/// certificate and key are configured.
fn certificates(tls: &RedisTlsConfig<'_>) -> anyhow::Result<TlsCertificates> {
    let client_tls = match tls.cert.zip(tls.key) {
        Some((cert, key)) => Some(ClientTlsConfig {
            client_cert: read_pem(cert).context("loading the Redis client certificate")?,
            client_key: read_pem(key).context("loading the Redis client key")?,
        }),
        None => None,
    };

    let root_cert = match tls.ca {
        Some(path) => Some(read_pem(path).context("loading the Redis CA certificate")?),
        None => None,
    };

    Ok(TlsCertificates { client_tls, root_cert })
}

fn read_pem(path: &Path) -> anyhow::Result<Vec<u8>> {
    let mut contents = Vec::new();
    File::open(path)
        .and_then(|file| BufReader::new(file).read_to_end(&mut contents))
        .with_context(|| format!("reading {}", path.display()))?;

    Ok(contents)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn pem(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn client_certificate_needs_both_halves() {
        let cert = pem("-----BEGIN CERTIFICATE-----");
        let ca = pem("-----BEGIN CA-----");

        let certificates = certificates(&RedisTlsConfig {
            cert: Some(cert.path()),
            key: None,
            ca: Some(ca.path()),
        })
        .unwrap();

        assert!(certificates.client_tls.is_none());
        assert_eq!(certificates.root_cert.as_deref(), Some(b"-----BEGIN CA-----".as_slice()));
    }

    #[test]
    fn missing_files_name_what_was_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ca.pem");

        let error = certificates(&RedisTlsConfig {
            cert: None,
            key: None,
            ca: Some(missing.as_path()),
        })
        .err().unwrap();

        let message = format!("{error:#}");
        assert!(message.starts_with("loading the Redis CA certificate: reading"), "{message}");
    }
}
