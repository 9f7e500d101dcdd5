#![cfg_attr(test, allow(unused_crate_dependencies))]
//! Redis storage of schema documents and agent registrations, for coordinators running as
//! several instances.

mod key;
mod pool;

use std::{collections::HashSet, fmt, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use deadpool::managed::{Object, Pool};
use redis::aio::MultiplexedConnection;
use schema_reporting::{
    fleet::{AgentRegistration, RegistrationState, RegistrationUpdate, ServerClaim, SweepSummary},
    storage::{ClaimOutcome, DocumentStorage, InsertOutcome, MergeOutcome, RegistryStorage},
    SchemaDocument, StorageError, StorageResult, REPORTING_TARGET,
};
use uuid::Uuid;

use key::Key;

/// Number of times a transaction is retried when a concurrent writer touched its key.
const MAX_TRANSACTION_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisStorageConfig<'a> {
    pub url: &'a str,
    pub key_prefix: &'a str,
    /// Registrations that did not report for this long expire.
    pub retention: Duration,
    pub tls: Option<RedisTlsConfig<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedisTlsConfig<'a> {
    pub cert: Option<&'a Path>,
    pub key: Option<&'a Path>,
    pub ca: Option<&'a Path>,
}

/// Storage backed by Redis.
///
/// Documents are written with `SET NX`. Registrations and server claims are updated with
/// optimistic transactions (`WATCH`, `GET`, `MULTI`/`EXEC`), so concurrent reports never take
/// a lock and a lost race is simply retried. The active agents of a graph are indexed in a
/// sorted set scored by their last report, which makes counting the fleet a single `ZCOUNT`.
pub struct RedisStorage {
    pool: Pool<pool::Manager>,
    key_prefix: String,
    retention: Duration,
}

enum Write<T> {
    /// Nothing to change, the watched key is released.
    Skip(T),
    /// Execute the queued commands, retrying if the watched key changed in between.
    Commit(T),
}

enum Swept {
    Kept,
    MarkedStale,
    Purged,
}

impl RedisStorage {
    pub async fn new(config: RedisStorageConfig<'_>) -> anyhow::Result<RedisStorage> {
        let manager = match pool::Manager::new(&config) {
            Ok(manager) => manager,
            Err(e) => {
                tracing::error!(target: REPORTING_TARGET, "error creating a Redis pool: {e:#}");
                return Err(e);
            }
        };

        let pool = match Pool::builder(manager)
            .wait_timeout(Some(Duration::from_secs(5)))
            .create_timeout(Some(Duration::from_secs(10)))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!(target: REPORTING_TARGET, "error creating a Redis pool: {e}");
                return Err(e.into());
            }
        };

        Ok(Self {
            pool,
            key_prefix: config.key_prefix.to_string(),
            retention: config.retention,
        })
    }

    fn key(&self, key: Key<'_>) -> String {
        format!("{}:{key}", self.key_prefix)
    }

    async fn connection(&self) -> StorageResult<Object<pool::Manager>> {
        self.pool.get().await.map_err(|error| {
            tracing::error!(target: REPORTING_TARGET, "error fetching a Redis connection: {error}");
            StorageError::Unavailable(error.to_string())
        })
    }

    /// Queues the write of a registration and the matching update of the fleet index.
    fn write_registration(
        &self,
        pipe: &mut redis::Pipeline,
        registration: &AgentRegistration,
        refresh_expiry: bool,
    ) -> StorageResult<()> {
        let graph_ref = registration.graph_ref.as_str();
        let boot_id = registration.boot_id.to_string();

        let key = self.key(Key::Registration {
            graph_ref,
            boot_id: registration.boot_id,
        });

        let set = pipe.cmd("SET").arg(&key).arg(serde_json::to_string(registration)?);

        if refresh_expiry {
            set.arg("EX").arg(self.retention.as_secs().max(1));
        } else {
            set.arg("KEEPTTL");
        }

        set.ignore();

        let fleet = self.key(Key::Fleet { graph_ref });

        if registration.superseded_by.is_none() && registration.state == RegistrationState::Active {
            pipe.cmd("ZADD")
                .arg(&fleet)
                .arg("GT")
                .arg(registration.last_reported_at.timestamp_millis())
                .arg(&boot_id)
                .ignore();
        } else {
            pipe.cmd("ZREM").arg(&fleet).arg(&boot_id).ignore();
        }

        Ok(())
    }

    async fn sweep_graph(
        &self,
        conn: &mut MultiplexedConnection,
        graph_ref: &str,
        stale_before: DateTime<Utc>,
        purge_before: DateTime<Utc>,
    ) -> StorageResult<SweepSummary> {
        let mut summary = SweepSummary::default();
        let mut purged = HashSet::new();

        let boots_key = self.key(Key::Boots { graph_ref });
        let fleet_key = self.key(Key::Fleet { graph_ref });

        let boots: Vec<String> = query(redis::cmd("SMEMBERS").arg(&boots_key), conn).await?;

        for boot in boots {
            let Ok(boot_id) = Uuid::parse_str(&boot) else {
                query::<()>(redis::cmd("SREM").arg(&boots_key).arg(&boot), conn).await?;
                continue;
            };

            let key = self.key(Key::Registration { graph_ref, boot_id });

            let swept = transaction(conn, &key, |current, pipe| {
                let Some(current) = current else {
                    // expired on its own
                    pipe.cmd("SREM").arg(&boots_key).arg(&boot).ignore();
                    pipe.cmd("ZREM").arg(&fleet_key).arg(&boot).ignore();

                    return Ok(Write::Commit(Swept::Purged));
                };

                let mut registration: AgentRegistration = serde_json::from_str(&current)?;

                if registration.should_purge(purge_before) {
                    pipe.cmd("DEL").arg(&key).ignore();
                    pipe.cmd("SREM").arg(&boots_key).arg(&boot).ignore();
                    pipe.cmd("ZREM").arg(&fleet_key).arg(&boot).ignore();

                    Ok(Write::Commit(Swept::Purged))
                } else if registration.should_mark_stale(stale_before) {
                    registration.state = RegistrationState::Stale;
                    self.write_registration(pipe, &registration, false)?;

                    Ok(Write::Commit(Swept::MarkedStale))
                } else {
                    Ok(Write::Skip(Swept::Kept))
                }
            })
            .await?;

            match swept {
                Swept::Kept => (),
                Swept::MarkedStale => summary.marked_stale += 1,
                Swept::Purged => {
                    summary.purged += 1;
                    purged.insert(boot_id);
                }
            }
        }

        if purged.is_empty() {
            return Ok(summary);
        }

        let servers_key = self.key(Key::Servers { graph_ref });
        let servers: Vec<String> = query(redis::cmd("SMEMBERS").arg(&servers_key), conn).await?;

        for server_id in servers {
            let key = self.key(Key::Server {
                graph_ref,
                server_id: &server_id,
            });

            transaction(conn, &key, |current, pipe| {
                let orphaned = match current {
                    Some(current) => {
                        let claim: ServerClaim = serde_json::from_str(&current)?;
                        purged.contains(&claim.boot_id)
                    }
                    None => true,
                };

                if !orphaned {
                    return Ok(Write::Skip(()));
                }

                pipe.cmd("DEL").arg(&key).ignore();
                pipe.cmd("SREM").arg(&servers_key).arg(&server_id).ignore();

                Ok(Write::Commit(()))
            })
            .await?;
        }

        Ok(summary)
    }
}

#[async_trait::async_trait]
impl DocumentStorage for RedisStorage {
    async fn insert_if_absent(&self, document: &SchemaDocument) -> StorageResult<InsertOutcome> {
        let mut conn = self.connection().await?;
        let key = self.key(Key::Document { hash: &document.hash });

        let set: Option<String> = query(
            redis::cmd("SET")
                .arg(&key)
                .arg(serde_json::to_string(document)?)
                .arg("NX"),
            &mut conn,
        )
        .await?;

        Ok(match set {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::AlreadyPresent,
        })
    }

    async fn get(&self, hash: &str) -> StorageResult<Option<SchemaDocument>> {
        let mut conn = self.connection().await?;
        let key = self.key(Key::Document { hash });

        let document: Option<String> = query(redis::cmd("GET").arg(&key), &mut conn).await?;

        Ok(document.map(|document| serde_json::from_str(&document)).transpose()?)
    }

    async fn contains(&self, hash: &str) -> StorageResult<bool> {
        let mut conn = self.connection().await?;
        let key = self.key(Key::Document { hash });

        query(redis::cmd("EXISTS").arg(&key), &mut conn).await
    }
}

#[async_trait::async_trait]
impl RegistryStorage for RedisStorage {
    async fn merge_registration(&self, update: &RegistrationUpdate) -> StorageResult<MergeOutcome> {
        let mut conn = self.connection().await?;
        let graph_ref = update.graph_ref.as_str();

        let key = self.key(Key::Registration {
            graph_ref,
            boot_id: update.boot_id,
        });

        let boots_key = self.key(Key::Boots { graph_ref });
        let graphs_key = self.key(Key::Graphs);

        transaction(&mut conn, &key, |current, pipe| {
            let outcome = match current {
                Some(current) => {
                    let previous: AgentRegistration = serde_json::from_str(&current)?;
                    let mut current = previous.clone();
                    current.merge(update);

                    MergeOutcome::Updated { previous, current }
                }
                None => MergeOutcome::Created(AgentRegistration::new(update)),
            };

            let registration = match &outcome {
                MergeOutcome::Created(registration) => registration,
                MergeOutcome::Updated { current, .. } => current,
            };

            self.write_registration(pipe, registration, true)?;

            pipe.cmd("SADD").arg(&boots_key).arg(update.boot_id.to_string()).ignore();
            pipe.cmd("SADD").arg(&graphs_key).arg(graph_ref).ignore();

            Ok(Write::Commit(outcome))
        })
        .await
    }

    async fn claim_server(
        &self,
        graph_ref: &str,
        server_id: &str,
        claim: &ServerClaim,
    ) -> StorageResult<ClaimOutcome> {
        let mut conn = self.connection().await?;
        let key = self.key(Key::Server { graph_ref, server_id });
        let servers_key = self.key(Key::Servers { graph_ref });

        transaction(&mut conn, &key, |current, pipe| {
            let current: Option<ServerClaim> = current.map(|current| serde_json::from_str(&current)).transpose()?;
            let (outcome, store) = claim.against(current.as_ref());

            if !store {
                return Ok(Write::Skip(outcome));
            }

            pipe.cmd("SET").arg(&key).arg(serde_json::to_string(claim)?).ignore();
            pipe.cmd("SADD").arg(&servers_key).arg(server_id).ignore();

            Ok(Write::Commit(outcome))
        })
        .await
    }

    async fn supersede(&self, graph_ref: &str, boot_id: Uuid, by: Uuid) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        let key = self.key(Key::Registration { graph_ref, boot_id });

        transaction(&mut conn, &key, |current, pipe| {
            let Some(current) = current else {
                return Ok(Write::Skip(()));
            };

            let mut registration: AgentRegistration = serde_json::from_str(&current)?;

            if !registration.supersede(by) {
                return Ok(Write::Skip(()));
            }

            self.write_registration(pipe, &registration, false)?;

            Ok(Write::Commit(()))
        })
        .await
    }

    async fn registration(&self, graph_ref: &str, boot_id: Uuid) -> StorageResult<Option<AgentRegistration>> {
        let mut conn = self.connection().await?;
        let key = self.key(Key::Registration { graph_ref, boot_id });

        let registration: Option<String> = query(redis::cmd("GET").arg(&key), &mut conn).await?;

        Ok(registration
            .map(|registration| serde_json::from_str(&registration))
            .transpose()?)
    }

    async fn registrations(&self, graph_ref: &str) -> StorageResult<Vec<AgentRegistration>> {
        let mut conn = self.connection().await?;

        let boots_key = self.key(Key::Boots { graph_ref });
        let boots: Vec<String> = query(redis::cmd("SMEMBERS").arg(&boots_key), &mut conn).await?;

        let keys: Vec<String> = boots
            .iter()
            .filter_map(|boot| Uuid::parse_str(boot).ok())
            .map(|boot_id| self.key(Key::Registration { graph_ref, boot_id }))
            .collect();

        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let registrations: Vec<Option<String>> = query(redis::cmd("MGET").arg(&keys), &mut conn).await?;

        registrations
            .into_iter()
            .flatten()
            .map(|registration| serde_json::from_str(&registration).map_err(StorageError::from))
            .collect()
    }

    async fn count_active(&self, graph_ref: &str, since: DateTime<Utc>) -> StorageResult<usize> {
        let mut conn = self.connection().await?;

        query(
            redis::cmd("ZCOUNT")
                .arg(self.key(Key::Fleet { graph_ref }))
                .arg(since.timestamp_millis())
                .arg("+inf"),
            &mut conn,
        )
        .await
    }

    async fn sweep(&self, stale_before: DateTime<Utc>, purge_before: DateTime<Utc>) -> StorageResult<SweepSummary> {
        let mut conn = self.connection().await?;
        let graphs: Vec<String> = query(redis::cmd("SMEMBERS").arg(self.key(Key::Graphs)), &mut conn).await?;

        let mut summary = SweepSummary::default();

        for graph_ref in graphs {
            let graph = self
                .sweep_graph(&mut conn, &graph_ref, stale_before, purge_before)
                .await?;

            summary.marked_stale += graph.marked_stale;
            summary.purged += graph.purged;
        }

        Ok(summary)
    }
}

/// Runs an optimistic transaction on `key`: watches it, hands its current value to `build`
/// which queues the writes, and executes them unless another client modified the key in the
/// meantime. Gives up after [`MAX_TRANSACTION_ATTEMPTS`].
async fn transaction<T>(
    conn: &mut MultiplexedConnection,
    key: &str,
    mut build: impl FnMut(Option<String>, &mut redis::Pipeline) -> StorageResult<Write<T>>,
) -> StorageResult<T> {
    for _ in 0..MAX_TRANSACTION_ATTEMPTS {
        query::<()>(redis::cmd("WATCH").arg(key), conn).await?;
        let current: Option<String> = query(redis::cmd("GET").arg(key), conn).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();

        match build(current, &mut pipe)? {
            Write::Skip(value) => {
                query::<()>(&redis::cmd("UNWATCH"), conn).await?;
                return Ok(value);
            }
            Write::Commit(value) => {
                // a nil reply means EXEC was aborted by a concurrent write
                let committed: Option<()> = pipe.query_async(conn).await.map_err(unavailable)?;

                if committed.is_some() {
                    return Ok(value);
                }
            }
        }
    }

    tracing::warn!(target: REPORTING_TARGET, key, "giving up on a contended Redis transaction");

    Err(StorageError::Contended {
        key: key.to_owned(),
        attempts: MAX_TRANSACTION_ATTEMPTS,
    })
}

async fn query<T: redis::FromRedisValue>(cmd: &redis::Cmd, conn: &mut MultiplexedConnection) -> StorageResult<T> {
    cmd.query_async(conn).await.map_err(unavailable)
}

fn unavailable(error: impl fmt::Display) -> StorageError {
    tracing::error!(target: REPORTING_TARGET, "error with Redis query: {error}");
    StorageError::Unavailable(error.to_string())
}
