//! Source and destination database access for the retailer master sync.
//!
//! PostgreSQL is the production backend for both sides. SQLite (`sqlite:` URLs)
//! is accepted as well for local runs and tests. Both backends run the same SQL
//! text; `IS DISTINCT FROM` needs SQLite 3.39 or newer.

use std::fmt;

use chrono::{DateTime, Utc};
use retailer_core::{RetailerMasterRow, SourceRetailer, TouchPolicy, UpsertOutcome};
use sqlx::{Connection, PgConnection, Postgres, Row, Sqlite, SqliteConnection, Transaction};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_SOURCE_TABLE: &str = "retailer_metrics";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbRole {
    Source,
    Destination,
}

impl fmt::Display for DbRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Destination => f.write_str("destination"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    Sqlite,
}

impl Backend {
    /// Pick the backend from a connection string without touching the network.
    pub fn from_url(role: DbRole, url: &str) -> Result<Self, StorageError> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            let scheme = url.split(':').next().unwrap_or_default().to_string();
            Err(StorageError::UnsupportedUrl { role, scheme })
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported {role} database url scheme `{scheme}` (expected postgres:// or sqlite:)")]
    UnsupportedUrl { role: DbRole, scheme: String },
    #[error("invalid source table name `{0}`")]
    InvalidTableName(String),
    #[error("connecting to {role} database {target}")]
    Connect {
        role: DbRole,
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{operation} failed")]
    Query {
        operation: String,
        #[source]
        source: sqlx::Error,
    },
}

impl StorageError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnsupportedUrl { .. } | Self::InvalidTableName(_))
    }
}

fn query_err(operation: impl Into<String>) -> impl FnOnce(sqlx::Error) -> StorageError {
    let operation = operation.into();
    move |source| StorageError::Query { operation, source }
}

/// Mask the password of a connection string so it can be logged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

/// Accepts `table` or `schema.table` made of ASCII identifier characters.
pub fn validate_table_name(name: &str) -> Result<&str, StorageError> {
    let parts: Vec<&str> = name.split('.').collect();
    let valid_ident = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if parts.len() <= 2 && parts.iter().all(|p| valid_ident(p)) {
        Ok(name)
    } else {
        Err(StorageError::InvalidTableName(name.to_string()))
    }
}

fn source_query(table: &str) -> String {
    format!(
        r#"
        SELECT DISTINCT
               CAST(retailer_id AS TEXT) AS retailer_id,
               CAST(retailer_name AS TEXT) AS retailer_name,
               CAST(network AS TEXT) AS network
          FROM {table}
         WHERE retailer_id IS NOT NULL
         ORDER BY retailer_id
        "#
    )
}

// $4 is the run timestamp; RETURNING classifies the outcome against it.
const UPSERT_TOUCH_ALWAYS: &str = r#"
    INSERT INTO retailer_master
      (retailer_id, retailer_name, network, first_seen_date, last_seen_date, last_sync_datetime)
    VALUES ($1, $2, $3, $4, $4, $4)
    ON CONFLICT (retailer_id) DO UPDATE SET
      retailer_name = EXCLUDED.retailer_name,
      network = EXCLUDED.network,
      last_seen_date = EXCLUDED.last_seen_date,
      last_sync_datetime = EXCLUDED.last_sync_datetime,
      updated_at = CASE
        WHEN retailer_master.retailer_name IS DISTINCT FROM EXCLUDED.retailer_name
          OR retailer_master.network IS DISTINCT FROM EXCLUDED.network
        THEN EXCLUDED.last_seen_date
        ELSE retailer_master.updated_at
      END
    RETURNING
      CASE WHEN first_seen_date = $4 THEN 1 ELSE 0 END AS inserted,
      CASE WHEN updated_at = $4 THEN 1 ELSE 0 END AS changed
"#;

const UPSERT_ON_CHANGE: &str = r#"
    INSERT INTO retailer_master
      (retailer_id, retailer_name, network, first_seen_date, last_seen_date, last_sync_datetime)
    VALUES ($1, $2, $3, $4, $4, $4)
    ON CONFLICT (retailer_id) DO UPDATE SET
      retailer_name = EXCLUDED.retailer_name,
      network = EXCLUDED.network,
      last_seen_date = EXCLUDED.last_seen_date,
      last_sync_datetime = EXCLUDED.last_sync_datetime,
      updated_at = EXCLUDED.last_seen_date
    WHERE retailer_master.retailer_name IS DISTINCT FROM EXCLUDED.retailer_name
       OR retailer_master.network IS DISTINCT FROM EXCLUDED.network
    RETURNING
      CASE WHEN first_seen_date = $4 THEN 1 ELSE 0 END AS inserted,
      CASE WHEN updated_at = $4 THEN 1 ELSE 0 END AS changed
"#;

const SELECT_MASTER: &str = r#"
    SELECT retailer_id, retailer_name, network,
           first_seen_date, last_seen_date, last_sync_datetime, updated_at
      FROM retailer_master
"#;

fn upsert_sql(policy: TouchPolicy) -> &'static str {
    match policy {
        TouchPolicy::Always => UPSERT_TOUCH_ALWAYS,
        TouchPolicy::OnChange => UPSERT_ON_CHANGE,
    }
}

fn classify(returned: Option<(i32, i32)>) -> UpsertOutcome {
    match returned {
        None => UpsertOutcome::Unchanged,
        Some((1, _)) => UpsertOutcome::Inserted,
        Some((_, 1)) => UpsertOutcome::Updated,
        Some(_) => UpsertOutcome::Touched,
    }
}

// Expands `$body` once per backend so each arm is checked against its own driver types.
macro_rules! per_backend {
    ($value:expr, $inner:ident => $body:expr) => {
        match $value {
            Self::Postgres($inner) => $body,
            Self::Sqlite($inner) => $body,
        }
    };
}

macro_rules! decode_master_row {
    ($row:expr) => {
        RetailerMasterRow {
            retailer_id: $row.try_get("retailer_id")?,
            retailer_name: $row.try_get("retailer_name")?,
            network: $row.try_get("network")?,
            first_seen_date: $row.try_get("first_seen_date")?,
            last_seen_date: $row.try_get("last_seen_date")?,
            last_sync_datetime: $row.try_get("last_sync_datetime")?,
            updated_at: $row.try_get("updated_at")?,
        }
    };
}

async fn connect_pg(role: DbRole, url: &str) -> Result<PgConnection, StorageError> {
    PgConnection::connect(url)
        .await
        .map_err(|source| StorageError::Connect {
            role,
            target: redact_url(url),
            source,
        })
}

async fn connect_sqlite(role: DbRole, url: &str) -> Result<SqliteConnection, StorageError> {
    SqliteConnection::connect(url)
        .await
        .map_err(|source| StorageError::Connect {
            role,
            target: redact_url(url),
            source,
        })
}

/// Read-only connection to the source database.
pub enum SourceDb {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

impl SourceDb {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        match Backend::from_url(DbRole::Source, url)? {
            Backend::Postgres => Ok(Self::Postgres(connect_pg(DbRole::Source, url).await?)),
            Backend::Sqlite => Ok(Self::Sqlite(connect_sqlite(DbRole::Source, url).await?)),
        }
    }

    /// Distinct non-null retailer triples, ordered by `retailer_id`.
    pub async fn fetch_distinct_retailers(
        &mut self,
        table: &str,
    ) -> Result<Vec<SourceRetailer>, StorageError> {
        let sql = source_query(validate_table_name(table)?);
        let operation = format!("querying retailers from {table}");
        per_backend!(self, conn => {
            let rows = sqlx::query(&sql)
                .fetch_all(&mut *conn)
                .await
                .map_err(query_err(operation.clone()))?;
            rows.iter()
                .map(|row| -> Result<SourceRetailer, sqlx::Error> {
                    Ok(SourceRetailer {
                        retailer_id: row.try_get("retailer_id")?,
                        retailer_name: row.try_get("retailer_name")?,
                        network: row.try_get("network")?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_err(operation))
        })
    }

    pub async fn close(self) -> Result<(), StorageError> {
        per_backend!(self, conn => conn.close().await.map_err(query_err("closing source connection")))
    }
}

/// Read-write connection to the destination database holding `retailer_master`.
pub enum DestinationDb {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

impl DestinationDb {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        match Backend::from_url(DbRole::Destination, url)? {
            Backend::Postgres => Ok(Self::Postgres(connect_pg(DbRole::Destination, url).await?)),
            Backend::Sqlite => Ok(Self::Sqlite(connect_sqlite(DbRole::Destination, url).await?)),
        }
    }

    /// Start the run transaction. Dropping it without `commit` rolls back.
    pub async fn begin(&mut self) -> Result<DestinationTx<'_>, StorageError> {
        let op = "beginning destination transaction";
        Ok(match self {
            Self::Postgres(conn) => DestinationTx::Postgres(conn.begin().await.map_err(query_err(op))?),
            Self::Sqlite(conn) => DestinationTx::Sqlite(conn.begin().await.map_err(query_err(op))?),
        })
    }

    /// Exact id match first, otherwise a case-insensitive one.
    pub async fn fetch_retailer(
        &mut self,
        retailer_id: &str,
    ) -> Result<Option<RetailerMasterRow>, StorageError> {
        let sql = format!(
            "{SELECT_MASTER} WHERE retailer_id = $1 OR LOWER(retailer_id) = LOWER($1)
              ORDER BY CASE WHEN retailer_id = $1 THEN 0 ELSE 1 END, retailer_id
              LIMIT 1"
        );
        let operation = format!("loading retailer_master row {retailer_id}");
        per_backend!(self, conn => {
            let row = sqlx::query(&sql)
                .bind(retailer_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(query_err(operation.clone()))?;
            row.map(|row| -> Result<RetailerMasterRow, sqlx::Error> { Ok(decode_master_row!(row)) })
                .transpose()
                .map_err(query_err(operation))
        })
    }

    pub async fn fetch_all(&mut self) -> Result<Vec<RetailerMasterRow>, StorageError> {
        let sql = format!("{SELECT_MASTER} ORDER BY retailer_id");
        let operation = "loading retailer_master";
        per_backend!(self, conn => {
            let rows = sqlx::query(&sql)
                .fetch_all(&mut *conn)
                .await
                .map_err(query_err(operation))?;
            rows.iter()
                .map(|row| -> Result<RetailerMasterRow, sqlx::Error> { Ok(decode_master_row!(row)) })
                .collect::<Result<Vec<_>, _>>()
                .map_err(query_err(operation))
        })
    }

    pub async fn close(self) -> Result<(), StorageError> {
        per_backend!(self, conn => conn.close().await.map_err(query_err("closing destination connection")))
    }
}

/// The single destination transaction a sync run writes through.
pub enum DestinationTx<'c> {
    Postgres(Transaction<'c, Postgres>),
    Sqlite(Transaction<'c, Sqlite>),
}

impl DestinationTx<'_> {
    /// Atomic insert-or-update of one retailer keyed by `retailer_id`.
    pub async fn upsert_retailer(
        &mut self,
        retailer: &SourceRetailer,
        now: DateTime<Utc>,
        policy: TouchPolicy,
    ) -> Result<UpsertOutcome, StorageError> {
        let operation = format!("upserting retailer {}", retailer.retailer_id);
        let returned = per_backend!(self, tx => {
            let row = sqlx::query(upsert_sql(policy))
                .bind(&retailer.retailer_id)
                .bind(&retailer.retailer_name)
                .bind(&retailer.network)
                .bind(now)
                .fetch_optional(&mut **tx)
                .await
                .map_err(query_err(operation.clone()))?;
            row.map(|row| -> Result<(i32, i32), sqlx::Error> {
                Ok((row.try_get("inserted")?, row.try_get("changed")?))
            })
            .transpose()
            .map_err(query_err(operation))?
        });
        let outcome = classify(returned);
        debug!(retailer_id = %retailer.retailer_id, ?outcome, "upserted retailer");
        Ok(outcome)
    }

    pub async fn commit(self) -> Result<(), StorageError> {
        per_backend!(self, tx => tx.commit().await.map_err(query_err("committing destination transaction")))
    }

    pub async fn rollback(self) -> Result<(), StorageError> {
        per_backend!(self, tx => tx.rollback().await.map_err(query_err("rolling back destination transaction")))
    }
}
