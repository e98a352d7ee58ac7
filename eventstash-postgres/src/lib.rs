//! PostgreSQL storage engine for `eventstash`
//!
//! [`PostgresRepository`] keeps events in `event_store_events` (global order
//! by serial id) and stream memberships in `event_store_streams`. Every write
//! runs in one transaction. Appends and links to a named stream hold a
//! transaction-scoped advisory lock on the stream name, so expected-version
//! checks and position assignment cannot interleave. Unique indexes back every
//! invariant; their violations are translated by constraint name.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod reads;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventstash::errors::{Operation, StoreError, StoreResult};
use eventstash::record::Record;
use eventstash::repository::EventRepository;
use eventstash::specification::SpecificationResult;
use eventstash::types::{EventId, EventType, ExpectedVersion, Stream, StreamName, Timestamp};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, Pool, Postgres, Row, Transaction};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub use config::{MaxConnections, PostgresConfig, MAX_CONNECTIONS_ENV};

use reads::{CursorKey, ReadQuery, COLUMNS};

const EVENT_ID_INDEX: &str = "index_event_store_events_on_event_id";
const STREAM_POSITION_INDEX: &str = "index_event_store_streams_on_stream_and_position";
const STREAM_EVENT_INDEX: &str = "index_event_store_streams_on_stream_and_event_id";

// Advisory lock key serializing appends when the global order lock is on.
const GLOBAL_ORDER_LOCK_KEY: i64 = 0x6576_656e_7473_7461;

/// Errors raised while setting up a [`PostgresRepository`].
#[derive(Debug, Error)]
pub enum PostgresRepositoryError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),
    /// The schema migrations failed.
    #[error("failed to run postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
    /// A configuration value is out of range.
    #[error("invalid postgres configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<PostgresRepositoryError> for StoreError {
    fn from(error: PostgresRepositoryError) -> Self {
        match error {
            PostgresRepositoryError::InvalidConfiguration(detail) => Self::Configuration(detail),
            PostgresRepositoryError::ConnectionFailed(source) => {
                Self::Configuration(format!("failed to connect to postgres: {source}"))
            }
            PostgresRepositoryError::MigrationFailed(source) => Self::StoreFailure {
                operation: Operation::Migrate,
                detail: source.to_string(),
            },
        }
    }
}

/// Event repository backed by PostgreSQL.
///
/// Clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: Pool<Postgres>,
    global_order_lock: bool,
}

impl PostgresRepository {
    /// Connects with default configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresRepositoryError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresRepositoryError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresRepositoryError::ConnectionFailed)?;
        info!(
            max_connections = %config.max_connections,
            global_order_lock = config.global_order_lock,
            "[postgres.connect] connection pool created"
        );
        Ok(Self {
            pool,
            global_order_lock: config.global_order_lock,
        })
    }

    /// Wraps an existing pool, with the global order lock on.
    ///
    /// Use this to share a pool with other components.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            global_order_lock: true,
        }
    }

    /// The underlying connection pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Creates or upgrades the event store tables.
    pub async fn migrate(&self) -> Result<(), PostgresRepositoryError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresRepositoryError::MigrationFailed)?;
        info!("[postgres.migrate] schema is up to date");
        Ok(())
    }

    /// Checks that the database answers.
    pub async fn ping(&self) -> StoreResult<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))
    }

    async fn cursor_key(
        &self,
        specification: &SpecificationResult,
        event_id: EventId,
    ) -> StoreResult<CursorKey> {
        let mut builder = reads::cursor(specification, event_id);
        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?
            .ok_or(StoreError::EventNotFound(event_id))?;
        Ok(CursorKey {
            ordinal: row
                .try_get("ordinal")
                .map_err(|error| map_sqlx_error(error, Operation::Read))?,
            time: row
                .try_get("sort_time")
                .map_err(|error| map_sqlx_error(error, Operation::Read))?,
        })
    }

    async fn plan<'a>(
        &self,
        specification: &'a SpecificationResult,
    ) -> StoreResult<ReadQuery<'a>> {
        specification.validate()?;
        let start = match specification.start {
            Some(event_id) => Some(self.cursor_key(specification, event_id).await?),
            None => None,
        };
        let stop = match specification.stop {
            Some(event_id) => Some(self.cursor_key(specification, event_id).await?),
            None => None,
        };
        Ok(ReadQuery::new(specification, start, stop))
    }
}

#[async_trait]
impl EventRepository for PostgresRepository {
    #[instrument(name = "postgres.append_to_stream", skip_all, fields(stream = %stream, expected_version = %expected_version, count = records.len()))]
    async fn append_to_stream(
        &self,
        records: Vec<Record>,
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        let expected_version = expected_version.validate_for(stream)?;
        let mut tx = self.begin().await?;

        if self.global_order_lock {
            query("SELECT pg_advisory_xact_lock($1)")
                .bind(GLOBAL_ORDER_LOCK_KEY)
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::AppendToStream))?;
        }

        let start = match stream {
            Stream::Global => None,
            Stream::Named(name) => {
                lock_stream(&mut tx, name, Operation::AppendToStream).await?;
                Some(
                    next_position(&mut tx, stream, name, expected_version, Operation::AppendToStream)
                        .await?,
                )
            }
        };

        for record in &records {
            query(
                "INSERT INTO event_store_events (event_id, event_type, data, metadata, created_at, valid_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(record.event_id.into_inner())
            .bind(record.event_type.to_string())
            .bind(record.data.as_slice())
            .bind(record.metadata.as_slice())
            .bind(record.created_at.into_datetime())
            .bind(record.valid_at.into_datetime())
            .execute(&mut *tx)
            .await
            .map_err(|error| {
                write_error(
                    error,
                    stream,
                    expected_version,
                    record.event_id,
                    Operation::AppendToStream,
                )
            })?;
        }

        if let (Stream::Named(name), Some(start)) = (stream, start) {
            for (position, record) in (start..).zip(&records) {
                insert_membership(&mut tx, name, position, record.event_id)
                    .await
                    .map_err(|error| {
                        write_error(
                            error,
                            stream,
                            expected_version,
                            record.event_id,
                            Operation::AppendToStream,
                        )
                    })?;
            }
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        info!(count = records.len(), "[postgres.append_to_stream] events appended");
        Ok(())
    }

    #[instrument(name = "postgres.link_to_stream", skip_all, fields(stream = %stream, expected_version = %expected_version, count = event_ids.len()))]
    async fn link_to_stream(
        &self,
        event_ids: &[EventId],
        stream: &Stream,
        expected_version: ExpectedVersion,
    ) -> StoreResult<()> {
        let name = stream.require_named()?;
        let mut tx = self.begin().await?;
        lock_stream(&mut tx, name, Operation::LinkToStream).await?;

        let wanted: Vec<Uuid> = event_ids.iter().map(|id| id.into_inner()).collect();
        let existing: HashSet<Uuid> =
            query("SELECT event_id FROM event_store_events WHERE event_id = ANY($1)")
                .bind(wanted.as_slice())
                .fetch_all(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::LinkToStream))?
                .iter()
                .map(|row| row.try_get::<Uuid, _>("event_id"))
                .collect::<Result<_, _>>()
                .map_err(|error| map_sqlx_error(error, Operation::LinkToStream))?;
        if let Some(missing) = event_ids
            .iter()
            .find(|event_id| !existing.contains(&event_id.into_inner()))
        {
            return Err(StoreError::EventNotFound(*missing));
        }

        let start = next_position(&mut tx, stream, name, expected_version, Operation::LinkToStream)
            .await?;
        for (position, event_id) in (start..).zip(event_ids) {
            insert_membership(&mut tx, name, position, *event_id)
                .await
                .map_err(|error| {
                    write_error(
                        error,
                        stream,
                        expected_version,
                        *event_id,
                        Operation::LinkToStream,
                    )
                })?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        info!(count = event_ids.len(), "[postgres.link_to_stream] events linked");
        Ok(())
    }

    #[instrument(name = "postgres.delete_stream", skip(self), fields(stream = %stream))]
    async fn delete_stream(&self, stream: &Stream) -> StoreResult<()> {
        let name = stream.require_named()?;
        let deleted = query("DELETE FROM event_store_streams WHERE stream = $1")
            .bind(name.to_string())
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::DeleteStream))?
            .rows_affected();
        if deleted > 0 {
            info!(memberships = deleted, "[postgres.delete_stream] stream deleted");
        }
        Ok(())
    }

    async fn has_event(&self, event_id: EventId) -> StoreResult<bool> {
        query("SELECT EXISTS (SELECT 1 FROM event_store_events WHERE event_id = $1) AS found")
            .bind(event_id.into_inner())
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("found"))
            .map_err(|error| map_sqlx_error(error, Operation::Read))
    }

    async fn read_event(&self, event_id: EventId) -> StoreResult<Record> {
        let row = query(&format!(
            "SELECT {COLUMNS} FROM event_store_events e WHERE e.event_id = $1"
        ))
        .bind(event_id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Read))?
        .ok_or(StoreError::EventNotFound(event_id))?;
        record_from_row(&row)
    }

    async fn last_stream_event(&self, stream: &Stream) -> StoreResult<Option<Record>> {
        let row = match stream {
            Stream::Global => {
                query(&format!(
                    "SELECT {COLUMNS} FROM event_store_events e ORDER BY e.id DESC LIMIT 1"
                ))
                .fetch_optional(&self.pool)
                .await
            }
            Stream::Named(name) => {
                query(&format!(
                    "SELECT {COLUMNS} FROM event_store_streams s
                     JOIN event_store_events e ON e.event_id = s.event_id
                     WHERE s.stream = $1 ORDER BY s.position DESC LIMIT 1"
                ))
                .bind(name.to_string())
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(name = "postgres.read", skip_all, fields(stream = %specification.stream))]
    async fn read(&self, specification: &SpecificationResult) -> StoreResult<Vec<Record>> {
        let plan = self.plan(specification).await?;
        let mut builder = plan.select();
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        rows.iter().map(record_from_row).collect()
    }

    #[instrument(name = "postgres.count", skip_all, fields(stream = %specification.stream))]
    async fn count(&self, specification: &SpecificationResult) -> StoreResult<usize> {
        let plan = self.plan(specification).await?;
        let mut builder = plan.count();
        let matched: i64 = builder
            .build()
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("matched"))
            .map_err(|error| map_sqlx_error(error, Operation::Count))?;
        usize::try_from(matched).map_err(|error| StoreError::StoreFailure {
            operation: Operation::Count,
            detail: error.to_string(),
        })
    }

    async fn streams_of(&self, event_id: EventId) -> StoreResult<Vec<Stream>> {
        let rows = query(
            "SELECT DISTINCT stream FROM event_store_streams WHERE event_id = $1 ORDER BY stream",
        )
        .bind(event_id.into_inner())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::StreamsOf))?;
        rows.iter()
            .map(|row| {
                let name: String = row
                    .try_get("stream")
                    .map_err(|error| map_sqlx_error(error, Operation::StreamsOf))?;
                Stream::named(name)
            })
            .collect()
    }

    #[instrument(name = "postgres.update_messages", skip_all, fields(count = records.len()))]
    async fn update_messages(&self, records: Vec<Record>) -> StoreResult<()> {
        let mut tx = self.begin().await?;
        for record in &records {
            let updated = query(
                "UPDATE event_store_events
                 SET event_type = $2, data = $3, metadata = $4, valid_at = $5
                 WHERE event_id = $1",
            )
            .bind(record.event_id.into_inner())
            .bind(record.event_type.to_string())
            .bind(record.data.as_slice())
            .bind(record.metadata.as_slice())
            .bind(record.valid_at.into_datetime())
            .execute(&mut *tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::UpdateMessages))?
            .rows_affected();
            if updated == 0 {
                warn!(event_id = %record.event_id, "[postgres.update_messages] unknown event, nothing updated");
                return Err(StoreError::EventNotFound(record.event_id));
            }
        }
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))?;

        info!(count = records.len(), "[postgres.update_messages] events updated");
        Ok(())
    }

    async fn position_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<u64> {
        let Stream::Named(name) = stream else {
            return self.global_position(event_id).await;
        };
        let position: Option<i64> = query(
            "SELECT position FROM event_store_streams WHERE stream = $1 AND event_id = $2",
        )
        .bind(name.to_string())
        .bind(event_id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::Read))?
        .map(|row| row.try_get::<Option<i64>, _>("position"))
        .transpose()
        .map_err(|error| map_sqlx_error(error, Operation::Read))?
        .flatten();
        position
            .ok_or(StoreError::EventNotFound(event_id))
            .and_then(to_position)
    }

    async fn global_position(&self, event_id: EventId) -> StoreResult<u64> {
        let id: i64 = query("SELECT id FROM event_store_events WHERE event_id = $1")
            .bind(event_id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Read))?
            .ok_or(StoreError::EventNotFound(event_id))?
            .try_get("id")
            .map_err(|error| map_sqlx_error(error, Operation::Read))?;
        to_position(id - 1)
    }

    async fn event_in_stream(&self, event_id: EventId, stream: &Stream) -> StoreResult<bool> {
        let Stream::Named(name) = stream else {
            return self.has_event(event_id).await;
        };
        query(
            "SELECT EXISTS (
                 SELECT 1 FROM event_store_streams WHERE stream = $1 AND event_id = $2
             ) AS found",
        )
        .bind(name.to_string())
        .bind(event_id.into_inner())
        .fetch_one(&self.pool)
        .await
        .and_then(|row| row.try_get("found"))
        .map_err(|error| map_sqlx_error(error, Operation::Read))
    }
}

async fn lock_stream(
    tx: &mut Transaction<'static, Postgres>,
    name: &StreamName,
    operation: Operation,
) -> StoreResult<()> {
    query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(name.to_string())
        .execute(&mut **tx)
        .await
        .map_err(|error| map_sqlx_error(error, operation))?;
    Ok(())
}

/// Resolves `expected_version` against the stream's last position and
/// returns the first position to write.
async fn next_position(
    tx: &mut Transaction<'static, Postgres>,
    stream: &Stream,
    name: &StreamName,
    expected_version: ExpectedVersion,
    operation: Operation,
) -> StoreResult<i64> {
    let last: Option<i64> =
        query("SELECT MAX(position) AS last FROM event_store_streams WHERE stream = $1")
            .bind(name.to_string())
            .fetch_one(&mut **tx)
            .await
            .and_then(|row| row.try_get("last"))
            .map_err(|error| map_sqlx_error(error, operation))?;
    let last = last.map(to_position).transpose()?;

    let Some(next) = expected_version.resolve(last) else {
        warn!(
            last_position = ?last,
            "[postgres.version_conflict] optimistic concurrency check failed"
        );
        return Err(StoreError::WrongExpectedEventVersion {
            stream: stream.clone(),
            expected: expected_version,
        });
    };
    i64::try_from(next).map_err(|error| StoreError::StoreFailure {
        operation,
        detail: error.to_string(),
    })
}

async fn insert_membership(
    tx: &mut Transaction<'static, Postgres>,
    name: &StreamName,
    position: i64,
    event_id: EventId,
) -> Result<(), sqlx::Error> {
    query("INSERT INTO event_store_streams (stream, position, event_id) VALUES ($1, $2, $3)")
        .bind(name.to_string())
        .bind(position)
        .bind(event_id.into_inner())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn to_position(value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|error| StoreError::StoreFailure {
        operation: Operation::Read,
        detail: format!("invalid stored position {value}: {error}"),
    })
}

fn record_from_row(row: &PgRow) -> StoreResult<Record> {
    let column = |error| map_sqlx_error(error, Operation::Read);
    let event_id = EventId::new(row.try_get::<Uuid, _>("event_id").map_err(column)?);
    let event_type: String = row.try_get("event_type").map_err(column)?;
    let event_type =
        EventType::try_new(event_type.clone()).map_err(|error| StoreError::DecodingFailed {
            event_id,
            event_type,
            detail: error.to_string(),
        })?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(column)?;
    let valid_at: DateTime<Utc> = row.try_get("valid_at").map_err(column)?;

    Ok(Record {
        event_id,
        event_type,
        data: row.try_get("data").map_err(column)?,
        metadata: row.try_get("metadata").map_err(column)?,
        created_at: Timestamp::new(created_at),
        valid_at: Timestamp::new(valid_at),
    })
}

/// Translates unique violations of a write into the store's own errors.
fn write_error(
    error: sqlx::Error,
    stream: &Stream,
    expected_version: ExpectedVersion,
    event_id: EventId,
    operation: Operation,
) -> StoreError {
    let constraint = match &error {
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505") => {
            db_error.constraint().map(ToOwned::to_owned)
        }
        _ => None,
    };

    match constraint.as_deref() {
        Some(EVENT_ID_INDEX | STREAM_EVENT_INDEX) => {
            warn!(
                event_id = %event_id,
                "[postgres.duplicate_event] event id already stored"
            );
            StoreError::EventDuplicatedInStream {
                stream: stream.clone(),
                event_id: Some(event_id),
            }
        }
        Some(STREAM_POSITION_INDEX) => {
            warn!("[postgres.version_conflict] stream position already taken");
            StoreError::WrongExpectedEventVersion {
                stream: stream.clone(),
                expected: expected_version,
            }
        }
        _ => map_sqlx_error(error, operation),
    }
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure {
        operation,
        detail: error.to_string(),
    }
}
