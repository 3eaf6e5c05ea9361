//! Retailer master sync: copies distinct retailers from the source database into
//! the destination `retailer_master` table inside one all-or-nothing transaction.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SubsecRound, Utc};
use retailer_core::{dedupe_retailers, SyncCounts, TouchPolicy};
use retailer_storage::{
    redact_url, validate_table_name, Backend, DbRole, DestinationDb, SourceDb, StorageError,
    DEFAULT_SOURCE_TABLE,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const SOURCE_DATABASE_URL: &str = "SOURCE_DATABASE_URL";
pub const DESTINATION_DATABASE_URL: &str = "DESTINATION_DATABASE_URL";
pub const LEGACY_SOURCE_DATABASE_URL: &str = "RSR_DATABASE_URL";
pub const LEGACY_DESTINATION_DATABASE_URL: &str = "SV_DATABASE_URL";
pub const SOURCE_RETAILER_TABLE: &str = "SOURCE_RETAILER_TABLE";
pub const TOUCH_POLICY: &str = "RETAILER_SYNC_TOUCH_POLICY";
pub const SCHEDULER_ENABLED: &str = "RETAILER_SYNC_SCHEDULER_ENABLED";
pub const SYNC_CRON: &str = "RETAILER_SYNC_CRON";

pub const DEFAULT_SYNC_CRON: &str = "0 0 7 * * *";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variable(s): {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone)]
pub struct SyncConfig {
    pub source_database_url: String,
    pub destination_database_url: String,
    pub source_table: String,
    pub touch_policy: TouchPolicy,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("source_database_url", &redact_url(&self.source_database_url))
            .field("destination_database_url", &redact_url(&self.destination_database_url))
            .field("source_table", &self.source_table)
            .field("touch_policy", &self.touch_policy)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("sync_cron", &self.sync_cron)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Blank values count as unset.
    /// Everything is validated here, before any connection is attempted.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = non_blank(&lookup);

        let source = get(SOURCE_DATABASE_URL).or_else(|| get(LEGACY_SOURCE_DATABASE_URL));
        let destination = destination_url(&lookup);

        let (source_database_url, destination_database_url) = match (source, destination) {
            (Some(source), Some(destination)) => (source, destination),
            (source, destination) => {
                let mut missing = Vec::new();
                if source.is_none() {
                    missing.push(SOURCE_DATABASE_URL);
                }
                if destination.is_none() {
                    missing.push(DESTINATION_DATABASE_URL);
                }
                return Err(ConfigError::Missing(missing));
            }
        };

        Backend::from_url(DbRole::Source, &source_database_url).map_err(|e| ConfigError::Invalid {
            name: SOURCE_DATABASE_URL,
            reason: e.to_string(),
        })?;
        Backend::from_url(DbRole::Destination, &destination_database_url).map_err(|e| {
            ConfigError::Invalid {
                name: DESTINATION_DATABASE_URL,
                reason: e.to_string(),
            }
        })?;

        let source_table = get(SOURCE_RETAILER_TABLE)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| DEFAULT_SOURCE_TABLE.to_string());
        validate_table_name(&source_table).map_err(|e| ConfigError::Invalid {
            name: SOURCE_RETAILER_TABLE,
            reason: e.to_string(),
        })?;

        let touch_policy = match get(TOUCH_POLICY) {
            Some(raw) => raw.parse::<TouchPolicy>().map_err(|e| ConfigError::Invalid {
                name: TOUCH_POLICY,
                reason: e.to_string(),
            })?,
            None => TouchPolicy::default(),
        };

        let sync_cron = get(SYNC_CRON)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string());
        validate_cron(&sync_cron).map_err(|reason| ConfigError::Invalid {
            name: SYNC_CRON,
            reason,
        })?;

        Ok(Self {
            source_database_url,
            destination_database_url,
            source_table,
            touch_policy,
            scheduler_enabled: get(SCHEDULER_ENABLED)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false),
            sync_cron,
        })
    }
}

fn non_blank<F>(lookup: &F) -> impl Fn(&str) -> Option<String> + '_
where
    F: Fn(&str) -> Option<String>,
{
    move |key| lookup(key).filter(|v| !v.trim().is_empty())
}

/// Destination URL from `DESTINATION_DATABASE_URL`, falling back to the legacy
/// name. Blank values count as unset.
pub fn destination_url<F>(lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let get = non_blank(lookup);
    get(DESTINATION_DATABASE_URL).or_else(|| get(LEGACY_DESTINATION_DATABASE_URL))
}

/// Seconds-first cron, parsed the same way the scheduler parses it.
fn validate_cron(expr: &str) -> Result<(), String> {
    Job::new_async(expr, |_uuid, _l| Box::pin(async {}))
        .map(|_| ())
        .map_err(|e| format!("{expr:?} is not a seconds-first cron expression ({e})"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Run every statement, then roll back instead of committing.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    Configuration,
    Connectivity,
    Query,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Config(_) => SyncErrorKind::Configuration,
            Self::Storage(err) if err.is_configuration() => SyncErrorKind::Configuration,
            Self::Storage(err) if err.is_connectivity() => SyncErrorKind::Connectivity,
            Self::Storage(_) => SyncErrorKind::Query,
        }
    }
}

/// Render an error with its whole `source()` chain, outermost first.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut next = err.source();
    while let Some(cause) = next {
        parts.push(cause.to_string());
        next = cause.source();
    }
    parts.join(": ")
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Timestamp written to every row touched by this run.
    pub synced_at: DateTime<Utc>,
    pub touch_policy: TouchPolicy,
    pub dry_run: bool,
    pub committed: bool,
    pub counts: SyncCounts,
}

pub struct RetailerSync {
    config: SyncConfig,
    options: SyncOptions,
    clock: Box<dyn Clock>,
}

impl RetailerSync {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            options: SyncOptions::default(),
            clock: Box::<SystemClock>::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full run. Failures are logged with their cause chain before being returned.
    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("retailer_sync", %run_id);
        async {
            let result = self.run_inner(run_id).await;
            if let Err(err) = &result {
                error!(kind = ?err.kind(), error = %error_chain(err), "error syncing retailers");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<SyncRunSummary, SyncError> {
        let started_at = self.clock.now();
        let synced_at = started_at.trunc_subsecs(6);
        info!(
            source = %redact_url(&self.config.source_database_url),
            destination = %redact_url(&self.config.destination_database_url),
            table = %self.config.source_table,
            touch_policy = %self.config.touch_policy,
            dry_run = self.options.dry_run,
            "starting retailer sync"
        );

        let mut source = SourceDb::connect(&self.config.source_database_url).await?;
        let mut destination = match DestinationDb::connect(&self.config.destination_database_url).await {
            Ok(db) => db,
            Err(err) => {
                close_source(source).await;
                return Err(err.into());
            }
        };

        let result = self.apply(&mut source, &mut destination, synced_at).await;
        close_source(source).await;
        close_destination(destination).await;
        let counts = result?;

        let committed = !self.options.dry_run;
        info!(
            found = counts.found,
            distinct = counts.distinct,
            inserted = counts.inserted,
            updated = counts.updated,
            touched = counts.touched,
            unchanged = counts.unchanged,
            committed,
            "sync complete: {} inserted, {} updated",
            counts.inserted,
            counts.updated
        );

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: self.clock.now(),
            synced_at,
            touch_policy: self.config.touch_policy,
            dry_run: self.options.dry_run,
            committed,
            counts,
        })
    }

    async fn apply(
        &self,
        source: &mut SourceDb,
        destination: &mut DestinationDb,
        synced_at: DateTime<Utc>,
    ) -> Result<SyncCounts, StorageError> {
        let rows = source.fetch_distinct_retailers(&self.config.source_table).await?;
        let found = rows.len();
        let deduped = dedupe_retailers(rows);
        info!(found, distinct = deduped.retailers.len(), "found unique retailers in source");
        for conflict in &deduped.conflicts {
            warn!(
                retailer_id = %conflict.retailer_id,
                kept = ?conflict.kept,
                discarded = ?conflict.discarded,
                "contradictory duplicate retailer rows; keeping greatest name/network pair"
            );
        }

        let mut counts = SyncCounts {
            found,
            distinct: deduped.retailers.len(),
            ..SyncCounts::default()
        };
        let policy = self.config.touch_policy;

        let mut tx = destination.begin().await?;
        let applied = async {
            for retailer in &deduped.retailers {
                counts.record(tx.upsert_retailer(retailer, synced_at, policy).await?);
            }
            Ok::<_, StorageError>(())
        }
        .await;

        match applied {
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %error_chain(&rollback_err), "rollback after failed upsert also failed");
                }
                return Err(err);
            }
            Ok(()) if self.options.dry_run => {
                tx.rollback().await?;
                info!("dry run: destination transaction rolled back");
            }
            Ok(()) => tx.commit().await?,
        }
        Ok(counts)
    }
}

async fn close_source(source: SourceDb) {
    if let Err(err) = source.close().await {
        warn!(error = %error_chain(&err), "closing source connection failed");
    }
}

async fn close_destination(destination: DestinationDb) {
    if let Err(err) = destination.close().await {
        warn!(error = %error_chain(&err), "closing destination connection failed");
    }
}

/// Boolean form of a run: `true` only when the destination transaction committed
/// (or, for a dry run, when every statement succeeded).
pub async fn sync(config: SyncConfig, options: SyncOptions) -> bool {
    RetailerSync::new(config)
        .with_options(options)
        .run_once()
        .await
        .is_ok()
}

/// Load configuration through `lookup` and run once. Configuration errors are
/// logged and returned without opening any connection.
pub async fn run_sync_once_with<F>(lookup: F, options: SyncOptions) -> Result<SyncRunSummary, SyncError>
where
    F: Fn(&str) -> Option<String>,
{
    let config = match SyncConfig::from_lookup(lookup) {
        Ok(config) => config,
        Err(err) => {
            error!(kind = ?SyncErrorKind::Configuration, error = %err, "error syncing retailers");
            return Err(err.into());
        }
    };
    RetailerSync::new(config).with_options(options).run_once().await
}

pub async fn run_sync_once_from_env(options: SyncOptions) -> Result<SyncRunSummary, SyncError> {
    run_sync_once_with(|key| std::env::var(key).ok(), options).await
}

/// Lookup backed by a fixed map, for callers that assemble configuration in code.
pub fn map_lookup(map: HashMap<String, String>) -> impl Fn(&str) -> Option<String> {
    move |key| map.get(key).cloned()
}

/// One scheduler tick. Returns `false` when skipped because a run holds `in_flight`.
pub async fn run_tick(runner: &RetailerSync, in_flight: &Mutex<()>) -> bool {
    let Ok(_guard) = in_flight.try_lock() else {
        warn!("previous retailer sync still running; skipping this tick");
        return false;
    };
    // Failures are already logged inside run_once; the next tick retries.
    let _ = runner.run_once().await;
    true
}

/// Build the daily scheduler when enabled. Each tick runs one sync; a tick that
/// fires while the previous run is still going is skipped.
pub async fn maybe_build_scheduler(
    config: SyncConfig,
    options: SyncOptions,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let runner = Arc::new(RetailerSync::new(config).with_options(options));
    let in_flight = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        let in_flight = Arc::clone(&in_flight);
        Box::pin(async move {
            run_tick(&runner, &in_flight).await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %cron, "retailer sync scheduler configured");
    Ok(Some(sched))
}
