//! `PostgreSQL` backend for `tenantcore` repositories.
//!
//! Each entity gets one table. The audit fields are typed columns (with
//! `deleted_at` as `TIMESTAMPTZ`) and the remaining entity fields are kept in a
//! `body` JSONB column, so entity types can evolve without migrations.
//!
//! Writes can be grouped in a caller-owned transaction through
//! [`TransactionalBackend::begin`]; see [`PostgresTransaction`].
//!
//! ```ignore
//! let backend = PostgresBackend::from_settings(&config.postgres).await?;
//! backend.ensure_schema::<Label>().await?;
//! let labels = Repository::<Label, _>::new(backend)?;
//! ```

mod document;
mod sql;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{query, Connection, Pool, Postgres, QueryBuilder, Transaction};
use tenantcore::config::{PoolSize, PostgresSettings};
use tenantcore::criteria::{Filter, FindOptions, Patch};
use tenantcore::entity::fields;
use tenantcore::errors::{Operation, StoreError, StoreResult};
use tenantcore::repository::{BackendKind, QueryHandle, StoreBackend};
use tenantcore::transaction::{StoreTransaction, TransactionalBackend};
use tenantcore::types::CollectionName;
use tenantcore::{Document, Entity};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument};

use crate::document::RowValues;
use crate::sql::{quote_identifier, COLUMNS};

/// Configuration for the `PostgreSQL` connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: PoolSize,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        let max_connections =
            PoolSize::try_new(10).unwrap_or_else(|_| unreachable!("10 is a valid pool size"));

        Self {
            max_connections,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&PostgresSettings> for PostgresConfig {
    fn from(settings: &PostgresSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            ..Self::default()
        }
    }
}

/// Repository backend over a `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Pool<Postgres>,
}

impl PostgresBackend {
    /// Connects with the default pool configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> StoreResult<Self> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with a custom pool configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> StoreResult<Self> {
        let connection_string = connection_string.into();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.into_inner())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(|source| StoreError::ConnectionFailed {
                backend: "postgres",
                source: Box::new(source),
            })?;
        info!(
            max_connections = %config.max_connections,
            "[postgres.connect] connection pool ready"
        );
        Ok(Self { pool })
    }

    /// Connects using loaded settings.
    pub async fn from_settings(settings: &PostgresSettings) -> StoreResult<Self> {
        Self::with_config(settings.url.clone(), PostgresConfig::from(settings)).await
    }

    /// Wraps an existing pool.
    ///
    /// Use this to share one pool across several components.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Round-trips a trivial query.
    pub async fn ping(&self) -> StoreResult<()> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Connect))?;
        Ok(())
    }

    /// Creates the table for `E` if it does not exist.
    pub async fn ensure_schema<E: Entity>(&self) -> StoreResult<()> {
        let collection = CollectionName::try_new(E::COLLECTION)
            .map_err(|_| StoreError::InvalidCollection(E::COLLECTION.to_string()))?;
        self.ensure_table(&collection).await
    }

    /// Creates `collection`'s table and its active-rows tenant index.
    #[instrument(name = "postgres.ensure_table", skip(self))]
    pub async fn ensure_table(&self, collection: &CollectionName) -> StoreResult<()> {
        let table = quote_identifier(collection.as_ref());
        let index = quote_identifier(&format!("{collection}_tenant_active_idx"));
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id BIGINT PRIMARY KEY,
                    tenant_id BIGINT NOT NULL DEFAULT 0,
                    created_at BIGINT NOT NULL DEFAULT 0,
                    updated_at BIGINT NOT NULL DEFAULT 0,
                    created_by BIGINT NOT NULL DEFAULT 0,
                    updated_by BIGINT NOT NULL DEFAULT 0,
                    deleted_at TIMESTAMPTZ NULL,
                    deleted_by BIGINT NOT NULL DEFAULT 0,
                    body JSONB NOT NULL DEFAULT '{{}}'::jsonb
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} (tenant_id) WHERE deleted_at IS NULL"
            ),
        ];

        for statement in &statements {
            query(statement)
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::EnsureSchema))?;
        }
        debug!("[postgres.ensure_table] table ready");
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for PostgresBackend {
    type Handle = PostgresTable;

    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn query_handle(&self, collection: &CollectionName) -> Self::Handle {
        PostgresTable::new(Target::Pool(self.pool.clone()), collection)
    }

    async fn apply_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        patch: &Patch,
    ) -> StoreResult<u64> {
        self.query_handle(collection).update(filter, patch).await
    }
}

#[async_trait]
impl TransactionalBackend for PostgresBackend {
    type Transaction = PostgresTransaction;

    #[instrument(name = "postgres.begin", skip(self))]
    async fn begin(&self) -> StoreResult<PostgresTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Transaction))?;
        Ok(PostgresTransaction {
            tx: Arc::new(Mutex::new(Some(tx))),
        })
    }
}

type SharedTransaction = Arc<Mutex<Option<Transaction<'static, Postgres>>>>;

/// An open transaction on a [`PostgresBackend`] pool.
///
/// It holds one pooled connection until committed or rolled back. Statements
/// from clones run one at a time on that connection.
#[derive(Clone)]
pub struct PostgresTransaction {
    tx: SharedTransaction,
}

impl fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTransaction").finish_non_exhaustive()
    }
}

impl PostgresTransaction {
    async fn finish(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.tx.lock().await.take().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl StoreBackend for PostgresTransaction {
    type Handle = PostgresTable;

    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn query_handle(&self, collection: &CollectionName) -> Self::Handle {
        PostgresTable::new(Target::Transaction(Arc::clone(&self.tx)), collection)
    }

    async fn apply_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        patch: &Patch,
    ) -> StoreResult<u64> {
        self.query_handle(collection).update(filter, patch).await
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(name = "postgres.commit", skip(self))]
    async fn commit(self) -> StoreResult<()> {
        self.finish()
            .await?
            .commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Transaction))
    }

    #[instrument(name = "postgres.rollback", skip(self))]
    async fn rollback(self) -> StoreResult<()> {
        self.finish()
            .await?
            .rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Transaction))
    }
}

/// Where a table handle runs its statements.
#[derive(Clone)]
enum Target {
    Pool(Pool<Postgres>),
    Transaction(SharedTransaction),
}

/// A connection borrowed for one operation.
enum Lease<'a> {
    Pooled(PoolConnection<Postgres>),
    Transaction(MutexGuard<'a, Option<Transaction<'static, Postgres>>>),
}

impl Target {
    async fn lease(&self, operation: Operation) -> StoreResult<Lease<'_>> {
        match self {
            Self::Pool(pool) => pool
                .acquire()
                .await
                .map(Lease::Pooled)
                .map_err(|error| map_sqlx_error(error, operation)),
            Self::Transaction(tx) => Ok(Lease::Transaction(tx.lock().await)),
        }
    }
}

impl Lease<'_> {
    fn connection(&mut self) -> StoreResult<&mut PgConnection> {
        match self {
            Self::Pooled(connection) => Ok(&mut **connection),
            Self::Transaction(guard) => guard.as_deref_mut().ok_or(StoreError::TransactionClosed),
        }
    }
}

/// Handle on one entity table, either on the pool or inside a transaction.
#[derive(Clone)]
pub struct PostgresTable {
    target: Target,
    table: String,
}

impl fmt::Debug for PostgresTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_transaction = matches!(self.target, Target::Transaction(_));
        f.debug_struct("PostgresTable")
            .field("table", &self.table)
            .field("in_transaction", &in_transaction)
            .finish()
    }
}

impl PostgresTable {
    fn new(target: Target, collection: &CollectionName) -> Self {
        Self {
            target,
            table: quote_identifier(collection.as_ref()),
        }
    }

    fn select(&self) -> QueryBuilder<'static, Postgres> {
        QueryBuilder::new(format!("SELECT {COLUMNS} FROM {} WHERE ", self.table))
    }

    /// Sets audit columns and merges body fields on every matching row.
    #[instrument(name = "postgres.update", skip(self, filter, patch), fields(table = %self.table))]
    async fn update(&self, filter: &Filter, patch: &Patch) -> StoreResult<u64> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", self.table));
        let mut assignments = 0_usize;
        let mut body = Map::new();

        for (field, value) in patch.iter() {
            if field == fields::ID {
                continue;
            }
            if fields::is_audit_field(field) {
                if assignments > 0 {
                    builder.push(", ");
                }
                builder.push(format!("{} = ", quote_identifier(field)));
                sql::push_value(&mut builder, field, value);
                assignments += 1;
            } else {
                body.insert(field.to_string(), value.to_json());
            }
        }

        if !body.is_empty() {
            if assignments > 0 {
                builder.push(", ");
            }
            builder.push("body = body || ");
            builder.push_bind(Json(Value::Object(body)));
            assignments += 1;
        }
        if assignments == 0 {
            return Ok(0);
        }

        builder.push(" WHERE ");
        sql::push_filter(&mut builder, filter);

        let mut lease = self.target.lease(Operation::Update).await?;
        let result = builder
            .build()
            .execute(lease.connection()?)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Update))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QueryHandle for PostgresTable {
    #[instrument(name = "postgres.save", skip(self, documents), fields(table = %self.table, count = documents.len()))]
    async fn save(&self, documents: Vec<Document>) -> StoreResult<Vec<Document>> {
        let upsert = format!(
            "INSERT INTO {table} ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE SET
                tenant_id = EXCLUDED.tenant_id,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at,
                created_by = EXCLUDED.created_by,
                updated_by = EXCLUDED.updated_by,
                deleted_at = EXCLUDED.deleted_at,
                deleted_by = EXCLUDED.deleted_by,
                body = EXCLUDED.body
             RETURNING {COLUMNS}",
            table = self.table
        );

        // Inside a caller's transaction this opens a savepoint.
        let mut lease = self.target.lease(Operation::Save).await?;
        let mut tx = lease
            .connection()?
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Save))?;

        let mut saved = Vec::with_capacity(documents.len());
        for document in documents {
            let row = RowValues::split(document)?;
            let stored = query(&upsert)
                .bind(row.id)
                .bind(row.tenant_id)
                .bind(row.created_at)
                .bind(row.updated_at)
                .bind(row.created_by)
                .bind(row.updated_by)
                .bind(row.deleted_at)
                .bind(row.deleted_by)
                .bind(Json(row.body))
                .fetch_one(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::Save))?;
            saved.push(
                document::from_row(&stored).map_err(|error| map_sqlx_error(error, Operation::Save))?,
            );
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Save))?;
        Ok(saved)
    }

    #[instrument(name = "postgres.find", skip(self, options), fields(table = %self.table))]
    async fn find(&self, options: &FindOptions) -> StoreResult<Vec<Document>> {
        let mut builder = self.select();
        sql::push_filter(&mut builder, &options.filter);
        sql::push_order(&mut builder, &options.order);
        sql::push_window(&mut builder, options.skip, options.take);

        let mut lease = self.target.lease(Operation::Find).await?;
        let rows = builder
            .build()
            .fetch_all(lease.connection()?)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Find))?;
        rows.iter()
            .map(document::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| map_sqlx_error(error, Operation::Find))
    }

    #[instrument(name = "postgres.count", skip(self, filter), fields(table = %self.table))]
    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {} WHERE ", self.table));
        sql::push_filter(&mut builder, filter);

        let mut lease = self.target.lease(Operation::Count).await?;
        let total: i64 = builder
            .build_query_scalar()
            .fetch_one(lease.connection()?)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Count))?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    #[instrument(name = "postgres.delete", skip(self, filter), fields(table = %self.table))]
    async fn delete(&self, filter: &Filter) -> StoreResult<u64> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("DELETE FROM {} WHERE ", self.table));
        sql::push_filter(&mut builder, filter);

        let mut lease = self.target.lease(Operation::Delete).await?;
        let result = builder
            .build()
            .execute(lease.connection()?)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::Delete))?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::backend(operation, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantcore::config::TenantcoreConfig;

    #[test]
    fn default_config_matches_documented_pool() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections.into_inner(), 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn settings_override_pool_size() {
        let loaded = TenantcoreConfig::from_lookup(|name| {
            (name == "POSTGRES_MAX_CONNECTIONS").then(|| "25".to_string())
        })
        .unwrap();

        let config = PostgresConfig::from(&loaded.postgres);
        assert_eq!(config.max_connections.into_inner(), 25);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn database_errors_keep_the_operation() {
        let mapped = map_sqlx_error(sqlx::Error::RowNotFound, Operation::Find);
        assert_eq!(mapped.operation(), Some(Operation::Find));
    }
}
