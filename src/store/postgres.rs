//! PostgreSQL closure store for production use.
//!
//! ## Configuration
//!
//! [`PostgresConfig::from_env`] reads:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//! - `DB_SERIALIZABLE`: Run edge transactions at SERIALIZABLE isolation (default: true)
//!
//! Table and column names come from [`ClosureSchema::from_env`].
//!
//! ## Isolation
//!
//! Merge and prune read ancestor/descendant sets and then write rows derived
//! from them. Two transactions touching overlapping ancestry must not both
//! commit on stale reads, so transactions run at `SERIALIZABLE` unless
//! configured otherwise. Serialization failures surface as
//! [`PostgresError::Database`]; retrying is up to the host.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgHasArrayType, PgPool, PgPoolOptions, Postgres};
use sqlx::{Executor, Row, Transaction};

use crate::config::{ClosureSchema, SchemaError};
use crate::types::{ClosureEdge, DirectEdge, NodeKey};
use super::{ClosureStore, StoreTransaction};

/// Node keys that can be bound to and decoded from PostgreSQL, including as arrays.
///
/// Satisfied by `i16`, `i32`, `i64`, `String` and `uuid::Uuid`, among others.
pub trait PgNodeKey:
    NodeKey
    + Unpin
    + sqlx::Type<Postgres>
    + PgHasArrayType
    + for<'q> sqlx::Encode<'q, Postgres>
    + for<'r> sqlx::Decode<'r, Postgres>
{
}

impl<T> PgNodeKey for T where
    T: NodeKey
        + Unpin
        + sqlx::Type<Postgres>
        + PgHasArrayType
        + for<'q> sqlx::Encode<'q, Postgres>
        + for<'r> sqlx::Decode<'r, Postgres>
{
}

/// Pool and isolation settings for [`PostgresClosureStore`].
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string.
    pub database_url: String,
    /// Pool ceiling (default: 10).
    pub max_connections: u32,
    /// Connections held open while idle (default: 2).
    pub min_connections: u32,
    /// Seconds to wait for a free connection (default: 10).
    pub connect_timeout_secs: u64,
    /// Seconds before an idle connection is closed (default: 300).
    pub idle_timeout_secs: u64,
    /// Seconds before any connection is recycled (default: 1800).
    pub max_lifetime_secs: u64,
    /// Run every transaction at SERIALIZABLE isolation (default: true).
    pub serializable: bool,
    /// Relation naming.
    pub schema: ClosureSchema,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl PostgresConfig {
    /// Read settings from the environment, falling back to the defaults above.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/closure".to_string()),
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
            serializable: env_or("DB_SERIALIZABLE", true),
            schema: ClosureSchema::from_env(),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Failures of the PostgreSQL backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Query or connection failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Invalid relation naming.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),
    /// Release or rollback requested with no savepoint open.
    #[error("No savepoint is open")]
    NoSavepoint,
}

/// SQL text for every primitive, rendered once from a validated schema.
#[derive(Debug)]
struct Queries {
    has_direct: String,
    insert_direct: String,
    delete_direct: String,
    parents: String,
    children: String,
    children_of_all: String,
    all_direct: String,
    has_closure: String,
    has_ancestor: String,
    ancestors: String,
    descendants: String,
    ancestors_of_all: String,
    descendants_of_all: String,
    closure_between: String,
    insert_closure: String,
    delete_closure: String,
    all_closure: String,
}

impl Queries {
    fn new(schema: &ClosureSchema) -> Result<Self, SchemaError> {
        schema.validate()?;
        let ClosureSchema {
            direct_table: d,
            ancestry_table: t,
            parent_column: p,
            child_column: c,
            ancestor_column: a,
            descendant_column: n,
        } = schema;

        Ok(Self {
            has_direct: format!("SELECT EXISTS (SELECT 1 FROM {d} WHERE {p} = $1 AND {c} = $2)"),
            insert_direct: format!("INSERT INTO {d} ({p}, {c}) VALUES ($1, $2) ON CONFLICT DO NOTHING"),
            delete_direct: format!("DELETE FROM {d} WHERE {p} = $1 AND {c} = $2"),
            parents: format!("SELECT {p} FROM {d} WHERE {c} = $1 ORDER BY {p}"),
            children: format!("SELECT {c} FROM {d} WHERE {p} = $1 ORDER BY {c}"),
            children_of_all: format!("SELECT DISTINCT {c} FROM {d} WHERE {p} = ANY($1)"),
            all_direct: format!("SELECT {p}, {c} FROM {d} ORDER BY {p}, {c}"),
            has_closure: format!("SELECT EXISTS (SELECT 1 FROM {t} WHERE {a} = $1 AND {n} = $2)"),
            has_ancestor: format!("SELECT EXISTS (SELECT 1 FROM {t} WHERE {n} = $1 AND {a} = $2)"),
            ancestors: format!("SELECT {a} FROM {t} WHERE {n} = $1 ORDER BY {a}"),
            descendants: format!("SELECT {n} FROM {t} WHERE {a} = $1 ORDER BY {n}"),
            ancestors_of_all: format!("SELECT DISTINCT {a} FROM {t} WHERE {n} = ANY($1)"),
            descendants_of_all: format!("SELECT DISTINCT {n} FROM {t} WHERE {a} = ANY($1)"),
            closure_between: format!("SELECT {a}, {n} FROM {t} WHERE {a} = ANY($1) AND {n} = ANY($2)"),
            insert_closure: format!(
                "INSERT INTO {t} ({a}, {n}) SELECT * FROM UNNEST($1, $2) ON CONFLICT DO NOTHING"
            ),
            delete_closure: format!(
                "DELETE FROM {t} USING UNNEST($1, $2) AS doomed(a, d) \
                 WHERE {t}.{a} = doomed.a AND {t}.{n} = doomed.d"
            ),
            all_closure: format!("SELECT {a}, {n} FROM {t} ORDER BY {a}, {n}"),
        })
    }
}

/// PostgreSQL closure store.
///
/// Uses connection pooling with production-tuned settings. Cloning shares
/// the pool.
#[derive(Debug, Clone)]
pub struct PostgresClosureStore {
    pool: PgPool,
    queries: Arc<Queries>,
    schema: ClosureSchema,
    serializable: bool,
}

impl PostgresClosureStore {
    /// Open a pool and render queries for `config.schema`.
    pub async fn new(config: PostgresConfig) -> Result<Self, PostgresError> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            serializable = config.serializable,
            direct_table = %config.schema.direct_table,
            ancestry_table = %config.schema.ancestry_table,
            "Initializing PostgreSQL connection pool"
        );

        // Validate names before opening any connection.
        let queries = Queries::new(&config.schema)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self {
            pool,
            queries: Arc::new(queries),
            schema: config.schema,
            serializable: config.serializable,
        })
    }

    /// [`new`](Self::new) with [`PostgresConfig::from_env`].
    pub async fn from_env() -> Result<Self, PostgresError> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, schema: ClosureSchema, serializable: bool) -> Result<Self, PostgresError> {
        let queries = Queries::new(&schema)?;
        Ok(Self {
            pool,
            queries: Arc::new(queries),
            schema,
            serializable,
        })
    }

    /// Create both relations if they do not exist.
    ///
    /// `key_type` is the SQL type of node keys, e.g. `BIGINT` or `UUID`.
    pub async fn ensure_schema(&self, key_type: &str) -> Result<(), PostgresError> {
        let ddl = self.schema.create_tables_sql(key_type)?;
        self.pool.execute(ddl.as_str()).await?;
        tracing::info!(
            direct_table = %self.schema.direct_table,
            ancestry_table = %self.schema.ancestry_table,
            key_type,
            "Closure schema ensured"
        );
        Ok(())
    }

    /// Relation naming in use.
    pub fn schema(&self) -> &ClosureSchema {
        &self.schema
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether a trivial query succeeds.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Current pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }
}

/// Pool occupancy.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Open connections.
    pub size: u32,
    /// Open connections not in use.
    pub idle: usize,
    /// Configured ceiling.
    pub max: u32,
}

#[async_trait]
impl<N: PgNodeKey> ClosureStore<N> for PostgresClosureStore {
    type Error = PostgresError;
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Tx, Self::Error> {
        let mut tx = self.pool.begin().await?;
        if self.serializable {
            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;
        }
        Ok(PostgresTransaction {
            tx,
            queries: Arc::clone(&self.queries),
            savepoints: 0,
        })
    }
}

/// Transaction over a [`PostgresClosureStore`].
///
/// Dropping it without commit rolls back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    queries: Arc<Queries>,
    savepoints: usize,
}

impl PostgresTransaction {
    fn savepoint_name(depth: usize) -> String {
        format!("closure_kernel_sp{depth}")
    }
}

async fn exists<N: PgNodeKey>(conn: &mut PgConnection, sql: &str, a: &N, b: &N) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>(sql)
        .bind(a.clone())
        .bind(b.clone())
        .fetch_one(conn)
        .await
}

async fn affects<N: PgNodeKey>(conn: &mut PgConnection, sql: &str, a: &N, b: &N) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(sql)
        .bind(a.clone())
        .bind(b.clone())
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn node_set<N: PgNodeKey>(conn: &mut PgConnection, sql: &str, node: &N) -> Result<BTreeSet<N>, sqlx::Error> {
    let rows = sqlx::query(sql).bind(node.clone()).fetch_all(conn).await?;
    rows.iter().map(|row| row.try_get::<N, _>(0)).collect()
}

async fn node_set_any<N: PgNodeKey>(
    conn: &mut PgConnection,
    sql: &str,
    nodes: &BTreeSet<N>,
) -> Result<BTreeSet<N>, sqlx::Error> {
    if nodes.is_empty() {
        return Ok(BTreeSet::new());
    }
    let keys: Vec<N> = nodes.iter().cloned().collect();
    let rows = sqlx::query(sql).bind(keys).fetch_all(conn).await?;
    rows.iter().map(|row| row.try_get::<N, _>(0)).collect()
}

fn split_rows<N: PgNodeKey>(rows: &BTreeSet<ClosureEdge<N>>) -> (Vec<N>, Vec<N>) {
    rows.iter()
        .map(|row| (row.ancestor.clone(), row.descendant.clone()))
        .unzip()
}

#[async_trait]
impl<N: PgNodeKey> StoreTransaction<N> for PostgresTransaction {
    type Error = PostgresError;

    async fn has_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error> {
        Ok(exists(&mut self.tx, &self.queries.has_direct, &edge.parent, &edge.child).await?)
    }

    async fn insert_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error> {
        Ok(affects(&mut self.tx, &self.queries.insert_direct, &edge.parent, &edge.child).await?)
    }

    async fn delete_direct(&mut self, edge: &DirectEdge<N>) -> Result<bool, Self::Error> {
        Ok(affects(&mut self.tx, &self.queries.delete_direct, &edge.parent, &edge.child).await?)
    }

    async fn parents(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(node_set(&mut self.tx, &self.queries.parents, node).await?)
    }

    async fn children(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(node_set(&mut self.tx, &self.queries.children, node).await?)
    }

    async fn children_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error> {
        Ok(node_set_any(&mut self.tx, &self.queries.children_of_all, nodes).await?)
    }

    async fn all_direct(&mut self) -> Result<BTreeSet<DirectEdge<N>>, Self::Error> {
        let rows = sqlx::query(&self.queries.all_direct)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| -> Result<_, PostgresError> {
                Ok(DirectEdge::new(row.try_get::<N, _>(0)?, row.try_get::<N, _>(1)?))
            })
            .collect()
    }

    async fn has_closure(&mut self, edge: &ClosureEdge<N>) -> Result<bool, Self::Error> {
        Ok(exists(&mut self.tx, &self.queries.has_closure, &edge.ancestor, &edge.descendant).await?)
    }

    async fn has_ancestor(&mut self, node: &N, ancestor: &N) -> Result<bool, Self::Error> {
        Ok(exists(&mut self.tx, &self.queries.has_ancestor, node, ancestor).await?)
    }

    async fn ancestors(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(node_set(&mut self.tx, &self.queries.ancestors, node).await?)
    }

    async fn descendants(&mut self, node: &N) -> Result<BTreeSet<N>, Self::Error> {
        Ok(node_set(&mut self.tx, &self.queries.descendants, node).await?)
    }

    async fn ancestors_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error> {
        Ok(node_set_any(&mut self.tx, &self.queries.ancestors_of_all, nodes).await?)
    }

    async fn descendants_of_all(&mut self, nodes: &BTreeSet<N>) -> Result<BTreeSet<N>, Self::Error> {
        Ok(node_set_any(&mut self.tx, &self.queries.descendants_of_all, nodes).await?)
    }

    async fn closure_between(
        &mut self,
        sources: &BTreeSet<N>,
        targets: &BTreeSet<N>,
    ) -> Result<BTreeSet<ClosureEdge<N>>, Self::Error> {
        if sources.is_empty() || targets.is_empty() {
            return Ok(BTreeSet::new());
        }
        let sources: Vec<N> = sources.iter().cloned().collect();
        let targets: Vec<N> = targets.iter().cloned().collect();
        let rows = sqlx::query(&self.queries.closure_between)
            .bind(sources)
            .bind(targets)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| -> Result<_, PostgresError> {
                Ok(ClosureEdge::new(row.try_get::<N, _>(0)?, row.try_get::<N, _>(1)?))
            })
            .collect()
    }

    async fn insert_closure(&mut self, rows: &BTreeSet<ClosureEdge<N>>) -> Result<u64, Self::Error> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (ancestors, descendants) = split_rows(rows);
        let result = sqlx::query(&self.queries.insert_closure)
            .bind(ancestors)
            .bind(descendants)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_closure(&mut self, rows: &BTreeSet<ClosureEdge<N>>) -> Result<u64, Self::Error> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (ancestors, descendants) = split_rows(rows);
        let result = sqlx::query(&self.queries.delete_closure)
            .bind(ancestors)
            .bind(descendants)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn all_closure(&mut self) -> Result<BTreeSet<ClosureEdge<N>>, Self::Error> {
        let rows = sqlx::query(&self.queries.all_closure)
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter()
            .map(|row| -> Result<_, PostgresError> {
                Ok(ClosureEdge::new(row.try_get::<N, _>(0)?, row.try_get::<N, _>(1)?))
            })
            .collect()
    }

    async fn savepoint(&mut self) -> Result<(), Self::Error> {
        let name = Self::savepoint_name(self.savepoints);
        (&mut *self.tx).execute(format!("SAVEPOINT {name}").as_str()).await?;
        self.savepoints += 1;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<(), Self::Error> {
        let depth = self.savepoints.checked_sub(1).ok_or(PostgresError::NoSavepoint)?;
        let name = Self::savepoint_name(depth);
        (&mut *self.tx).execute(format!("RELEASE SAVEPOINT {name}").as_str()).await?;
        self.savepoints = depth;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> Result<(), Self::Error> {
        let depth = self.savepoints.checked_sub(1).ok_or(PostgresError::NoSavepoint)?;
        let name = Self::savepoint_name(depth);
        (&mut *self.tx)
            .execute(format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}").as_str())
            .await?;
        self.savepoints = depth;
        Ok(())
    }

    async fn commit(self) -> Result<(), Self::Error> {
        Ok(self.tx.commit().await?)
    }

    async fn rollback(self) -> Result<(), Self::Error> {
        Ok(self.tx.rollback().await?)
    }
}
