use std::collections::BTreeSet;

use anyhow::Context;
use async_trait::async_trait;
use bountyping_core::{Program, ProgramKey, ProgramStatus, ScrapeCounts, ScrapeLog, ScrapeOutcome};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{ProgramStore, StoreError, UpsertOutcome, UpsertResult};

const PROGRAM_COLUMNS: &str = "id, platform, slug, name, url, offers_bounties, bounty_min, bounty_max, \
     currency, asset_types, assets, accepts_submissions, managed, status, launched_at, \
     first_seen, last_updated, fingerprint, raw";

/// Postgres-backed store. The upsert is a single statement keyed on
/// `(platform, slug)`, so classification and write cannot interleave.
#[derive(Debug, Clone)]
pub struct PgProgramStore {
    pool: PgPool,
}

impl PgProgramStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        Ok(())
    }
}

/// Connection-level failures make the whole store unusable; anything else is
/// handed to `fallback`.
fn classify_sqlx(err: sqlx::Error, fallback: impl FnOnce(String) -> StoreError) -> StoreError {
    let unavailable = match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || code.starts_with("57P"))
            .unwrap_or(false),
        _ => false,
    };
    if unavailable {
        StoreError::Unavailable(err.to_string())
    } else {
        fallback(err.to_string())
    }
}

fn decode_err(err: sqlx::Error) -> StoreError {
    classify_sqlx(err, StoreError::Decode)
}

fn program_from_row(row: &PgRow) -> Result<Program, StoreError> {
    let status: String = row.try_get("status").map_err(decode_err)?;
    let asset_types: Json<Vec<String>> = row.try_get("asset_types").map_err(decode_err)?;
    let assets: Json<Vec<String>> = row.try_get("assets").map_err(decode_err)?;

    Ok(Program {
        id: row.try_get("id").map_err(decode_err)?,
        platform: row.try_get("platform").map_err(decode_err)?,
        slug: row.try_get("slug").map_err(decode_err)?,
        name: row.try_get("name").map_err(decode_err)?,
        url: row.try_get("url").map_err(decode_err)?,
        offers_bounties: row.try_get("offers_bounties").map_err(decode_err)?,
        bounty_min: row.try_get("bounty_min").map_err(decode_err)?,
        bounty_max: row.try_get("bounty_max").map_err(decode_err)?,
        currency: row.try_get("currency").map_err(decode_err)?,
        asset_types: asset_types.0.into_iter().collect::<BTreeSet<_>>(),
        assets: assets.0,
        accepts_submissions: row.try_get("accepts_submissions").map_err(decode_err)?,
        managed: row.try_get("managed").map_err(decode_err)?,
        status: ProgramStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown program status `{status}`")))?,
        launched_at: row.try_get("launched_at").map_err(decode_err)?,
        first_seen: row.try_get("first_seen").map_err(decode_err)?,
        last_updated: row.try_get("last_updated").map_err(decode_err)?,
        fingerprint: row.try_get("fingerprint").map_err(decode_err)?,
        raw: row.try_get::<Option<JsonValue>, _>("raw").map_err(decode_err)?,
    })
}

fn log_from_row(row: &PgRow) -> Result<ScrapeLog, StoreError> {
    let outcome: String = row.try_get("outcome").map_err(decode_err)?;
    let count = |column: &str| -> Result<usize, StoreError> {
        let value: i64 = row.try_get(column).map_err(decode_err)?;
        usize::try_from(value).map_err(|_| StoreError::Decode(format!("negative {column} count")))
    };

    Ok(ScrapeLog {
        id: Some(row.try_get("id").map_err(decode_err)?),
        platform: row.try_get("platform").map_err(decode_err)?,
        run_id: row.try_get::<Uuid, _>("run_id").map_err(decode_err)?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at").map_err(decode_err)?,
        finished_at: row.try_get::<DateTime<Utc>, _>("finished_at").map_err(decode_err)?,
        outcome: ScrapeOutcome::parse(&outcome)
            .ok_or_else(|| StoreError::Decode(format!("unknown scrape outcome `{outcome}`")))?,
        counts: ScrapeCounts {
            fetched: count("fetched")?,
            created: count("created")?,
            updated: count("updated")?,
            unchanged: count("unchanged")?,
            duplicates: count("duplicates")?,
            skipped: count("skipped")?,
            failed: count("failed")?,
        },
        error: row.try_get("error").map_err(decode_err)?,
    })
}

#[async_trait]
impl ProgramStore for PgProgramStore {
    async fn get(&self, key: &ProgramKey) -> Result<Option<Program>, StoreError> {
        let sql = format!("SELECT {PROGRAM_COLUMNS} FROM programs WHERE platform = $1 AND slug = $2");
        let row = sqlx::query(&sql)
            .bind(&key.platform)
            .bind(&key.slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(decode_err)?;
        row.as_ref().map(program_from_row).transpose()
    }

    async fn upsert(&self, program: Program) -> Result<UpsertResult, StoreError> {
        let key = program.key();
        let sql = format!(
            r#"
            INSERT INTO programs ({PROGRAM_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (platform, slug) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                offers_bounties = EXCLUDED.offers_bounties,
                bounty_min = EXCLUDED.bounty_min,
                bounty_max = EXCLUDED.bounty_max,
                currency = EXCLUDED.currency,
                asset_types = EXCLUDED.asset_types,
                assets = EXCLUDED.assets,
                accepts_submissions = EXCLUDED.accepts_submissions,
                managed = EXCLUDED.managed,
                status = EXCLUDED.status,
                launched_at = COALESCE(EXCLUDED.launched_at, programs.launched_at),
                first_seen = LEAST(programs.first_seen, EXCLUDED.first_seen),
                last_updated = GREATEST(programs.last_updated, EXCLUDED.last_updated),
                fingerprint = EXCLUDED.fingerprint,
                raw = EXCLUDED.raw
            WHERE programs.fingerprint IS DISTINCT FROM EXCLUDED.fingerprint
            RETURNING (xmax = 0) AS inserted, {PROGRAM_COLUMNS}
            "#
        );

        let row_error = |message: String| StoreError::Row {
            key: key.clone(),
            message,
        };

        let row = sqlx::query(&sql)
            .bind(key.program_id())
            .bind(&key.platform)
            .bind(&key.slug)
            .bind(&program.name)
            .bind(&program.url)
            .bind(program.offers_bounties)
            .bind(program.bounty_min)
            .bind(program.bounty_max)
            .bind(&program.currency)
            .bind(Json(program.asset_types.iter().cloned().collect::<Vec<_>>()))
            .bind(Json(&program.assets))
            .bind(program.accepts_submissions)
            .bind(program.managed)
            .bind(program.status.as_str())
            .bind(program.launched_at)
            .bind(program.first_seen)
            .bind(program.last_updated)
            .bind(&program.fingerprint)
            .bind(program.raw.as_ref().map(Json))
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| classify_sqlx(err, row_error))?;

        match row {
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(decode_err)?;
                let stored = program_from_row(&row)?;
                let outcome = if inserted {
                    UpsertOutcome::Created
                } else {
                    UpsertOutcome::Updated
                };
                debug!(program = %key, ?outcome, "program upserted");
                Ok(UpsertResult { outcome, stored })
            }
            None => {
                // The conflict guard suppressed the write: fingerprint unchanged.
                let stored = self
                    .get(&key)
                    .await?
                    .ok_or_else(|| StoreError::Row {
                        key: key.clone(),
                        message: "row vanished during upsert".to_string(),
                    })?;
                Ok(UpsertResult {
                    outcome: UpsertOutcome::Unchanged,
                    stored,
                })
            }
        }
    }

    async fn append_log(&self, mut log: ScrapeLog) -> Result<ScrapeLog, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scrape_logs
                (platform, run_id, started_at, finished_at, outcome,
                 fetched, created, updated, unchanged, duplicates, skipped, failed, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(&log.platform)
        .bind(log.run_id)
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.outcome.as_str())
        .bind(log.counts.fetched as i64)
        .bind(log.counts.created as i64)
        .bind(log.counts.updated as i64)
        .bind(log.counts.unchanged as i64)
        .bind(log.counts.duplicates as i64)
        .bind(log.counts.skipped as i64)
        .bind(log.counts.failed as i64)
        .bind(log.error.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| classify_sqlx(err, StoreError::Log))?;

        log.id = Some(id);
        Ok(log)
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<ScrapeLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, platform, run_id, started_at, finished_at, outcome,
                   fetched, created, updated, unchanged, duplicates, skipped, failed, error
              FROM scrape_logs
             ORDER BY id DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(decode_err)?;

        rows.iter().map(log_from_row).collect()
    }
}
