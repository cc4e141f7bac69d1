//! SQLite persistence layer.
//!
//! Printer CRUD, job CRUD, and the job list filters the dispatcher relies
//! on. Connects once at startup, runs idempotent `CREATE TABLE IF NOT
//! EXISTS` migrations inline, then hands out the pool to callers.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::models::{Job, JobCreate, JobRow, JobStatus, Printer, PrinterCreate};

pub async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open sqlite database")?;

    migrate(&pool).await?;

    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS printers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            display_name TEXT NOT NULL,
            host_address TEXT NOT NULL UNIQUE,
            access_code TEXT NOT NULL,
            serial TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_filename TEXT NOT NULL,
            stored_path TEXT NOT NULL,
            status TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            assigned_printer_id INTEGER,
            bed_levelling INTEGER NOT NULL DEFAULT 0,
            flow_calibration INTEGER NOT NULL DEFAULT 0,
            timelapse INTEGER NOT NULL DEFAULT 0,
            use_material_system INTEGER NOT NULL DEFAULT 0,
            thumbnail_ref TEXT,
            estimated_duration_seconds INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// --- Printers ---------------------------------------------------------

pub async fn create_printer(pool: &SqlitePool, printer: PrinterCreate) -> Result<Printer> {
    let created_at = Utc::now();
    let id = sqlx::query(
        "INSERT INTO printers (display_name, host_address, access_code, serial, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&printer.display_name)
    .bind(&printer.host_address)
    .bind(&printer.access_code)
    .bind(&printer.serial)
    .bind(created_at)
    .execute(pool)
    .await
    .context("failed to insert printer (host_address/serial must be unique)")?
    .last_insert_rowid();

    get_printer(pool, id)
        .await?
        .context("printer vanished immediately after insert")
}

pub async fn list_printers(pool: &SqlitePool) -> Result<Vec<Printer>> {
    Ok(sqlx::query_as::<_, Printer>("SELECT * FROM printers ORDER BY id ASC")
        .fetch_all(pool)
        .await?)
}

pub async fn get_printer(pool: &SqlitePool, id: i64) -> Result<Option<Printer>> {
    Ok(sqlx::query_as::<_, Printer>("SELECT * FROM printers WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

pub async fn delete_printer(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM printers WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// --- Jobs ---------------------------------------------------------------

fn row_query() -> &'static str {
    "SELECT id, source_filename, stored_path, status, priority, created_at, completed_at,
            assigned_printer_id, bed_levelling, flow_calibration, timelapse,
            use_material_system, thumbnail_ref, estimated_duration_seconds
     FROM jobs"
}

async fn one(pool: &SqlitePool, sql: String, id: i64) -> Result<Option<Job>> {
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(Job::try_from).transpose()
}

pub async fn create_job(pool: &SqlitePool, job: JobCreate) -> Result<Job> {
    let created_at = Utc::now();
    let id = sqlx::query(
        "INSERT INTO jobs (source_filename, stored_path, status, priority, created_at,
            bed_levelling, flow_calibration, timelapse, use_material_system,
            thumbnail_ref, estimated_duration_seconds)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&job.source_filename)
    .bind(&job.stored_path)
    .bind(JobStatus::Pending.as_str())
    .bind(job.priority)
    .bind(created_at)
    .bind(job.bed_levelling)
    .bind(job.flow_calibration)
    .bind(job.timelapse)
    .bind(job.use_material_system)
    .bind(&job.thumbnail_ref)
    .bind(job.estimated_duration_seconds)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_job(pool, id).await?.context("job vanished immediately after insert")
}

pub async fn get_job(pool: &SqlitePool, id: i64) -> Result<Option<Job>> {
    one(pool, format!("{} WHERE id = ?", row_query()), id).await
}

pub async fn delete_job(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_jobs(pool: &SqlitePool) -> Result<Vec<Job>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!("{} ORDER BY id ASC", row_query()))
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(Job::try_from).collect()
}

/// Jobs currently `printing` and assigned to `printer_id` (Dispatcher Step A).
pub async fn list_printing_for_printer(pool: &SqlitePool, printer_id: i64) -> Result<Vec<Job>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "{} WHERE status = ? AND assigned_printer_id = ?",
        row_query()
    ))
    .bind(JobStatus::Printing.as_str())
    .bind(printer_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Job::try_from).collect()
}

/// The single best pending candidate for `printer_id` (Dispatcher Step C).
pub async fn pending_candidate_for_printer(
    pool: &SqlitePool,
    printer_id: i64,
) -> Result<Option<Job>> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "{} WHERE status = ?
           AND (assigned_printer_id IS NULL OR assigned_printer_id = ?)
         ORDER BY priority DESC, id ASC
         LIMIT 1",
        row_query()
    ))
    .bind(JobStatus::Pending.as_str())
    .bind(printer_id)
    .fetch_optional(pool)
    .await?;
    row.map(Job::try_from).transpose()
}

/// Any job currently `uploading` with the same `stored_path` (Dispatcher Step D).
pub async fn uploading_with_path(pool: &SqlitePool, stored_path: &str) -> Result<Option<Job>> {
    let row = sqlx::query_as::<_, JobRow>(&format!(
        "{} WHERE status = ? AND stored_path = ? LIMIT 1",
        row_query()
    ))
    .bind(JobStatus::Uploading.as_str())
    .bind(stored_path)
    .fetch_optional(pool)
    .await?;
    row.map(Job::try_from).transpose()
}

/// Jobs other than `excluding_id` that still reference `stored_path` — used to
/// gate physical file deletion when multiple jobs share one archive.
pub async fn jobs_referencing_path(
    pool: &SqlitePool,
    stored_path: &str,
    excluding_id: i64,
) -> Result<Vec<Job>> {
    let rows = sqlx::query_as::<_, JobRow>(&format!(
        "{} WHERE stored_path = ? AND id != ?",
        row_query()
    ))
    .bind(stored_path)
    .bind(excluding_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Job::try_from).collect()
}

/// Atomically claims a pending job for a printer (Dispatcher Step E). Returns
/// `false` if the job was no longer pending by the time this executed, which
/// the caller treats as "someone else got there first" rather than an error.
pub async fn claim_job(pool: &SqlitePool, id: i64, printer_id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET status = ?, assigned_printer_id = ? WHERE id = ? AND status = ?",
    )
    .bind(JobStatus::Uploading.as_str())
    .bind(printer_id)
    .bind(id)
    .bind(JobStatus::Pending.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_status_printing(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = ?, completed_at = NULL WHERE id = ?")
        .bind(JobStatus::Printing.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_status_failed(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = ? WHERE id = ?")
        .bind(JobStatus::Failed.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_status_completed(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = ?, completed_at = ? WHERE id = ?")
        .bind(JobStatus::Completed.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_priority(pool: &SqlitePool, id: i64, priority: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE jobs SET priority = ? WHERE id = ?")
        .bind(priority)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Resets a `completed`/`failed` job back to `pending` (the user-triggered
/// retry operation).
pub async fn retry_job(pool: &SqlitePool, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE jobs SET status = ?, assigned_printer_id = NULL, completed_at = NULL
         WHERE id = ? AND status IN (?, ?)",
    )
    .bind(JobStatus::Pending.as_str())
    .bind(id)
    .bind(JobStatus::Completed.as_str())
    .bind(JobStatus::Failed.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobCreate, PrinterCreate};

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn claim_is_race_free_against_non_pending() {
        let pool = test_pool().await;
        let printer = create_printer(
            &pool,
            PrinterCreate {
                display_name: "P1".into(),
                host_address: "10.0.0.1".into(),
                access_code: "secret".into(),
                serial: "S1".into(),
            },
        )
        .await
        .unwrap();

        let job = create_job(
            &pool,
            JobCreate {
                source_filename: "a.3mf".into(),
                stored_path: "/tmp/a.3mf".into(),
                priority: 0,
                bed_levelling: true,
                flow_calibration: true,
                timelapse: false,
                use_material_system: false,
                thumbnail_ref: None,
                estimated_duration_seconds: None,
            },
        )
        .await
        .unwrap();

        assert!(claim_job(&pool, job.id, printer.id).await.unwrap());
        // Second claim attempt must fail: status is no longer pending.
        assert!(!claim_job(&pool, job.id, printer.id).await.unwrap());

        let reloaded = get_job(&pool, job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Uploading);
        assert_eq!(reloaded.assigned_printer_id, Some(printer.id));
    }

    #[tokio::test]
    async fn priority_then_id_ordering() {
        let pool = test_pool().await;
        let printer = create_printer(
            &pool,
            PrinterCreate {
                display_name: "P1".into(),
                host_address: "10.0.0.1".into(),
                access_code: "secret".into(),
                serial: "S1".into(),
            },
        )
        .await
        .unwrap();

        for (name, priority) in [("low", 0), ("high", 5), ("mid", 1)] {
            create_job(
                &pool,
                JobCreate {
                    source_filename: name.into(),
                    stored_path: format!("/tmp/{name}.3mf"),
                    priority,
                    bed_levelling: true,
                    flow_calibration: true,
                    timelapse: false,
                    use_material_system: false,
                    thumbnail_ref: None,
                    estimated_duration_seconds: None,
                },
            )
            .await
            .unwrap();
        }

        let mut order = vec![];
        loop {
            let Some(candidate) = pending_candidate_for_printer(&pool, printer.id).await.unwrap()
            else {
                break;
            };
            order.push(candidate.source_filename.clone());
            claim_job(&pool, candidate.id, printer.id).await.unwrap();
            set_status_failed(&pool, candidate.id).await.unwrap();
            retry_job(&pool, candidate.id).await.unwrap();
            // retry_job puts it back to pending without clearing priority, so
            // delete it before the next iteration to make forward progress.
            delete_job(&pool, candidate.id).await.unwrap();
        }

        assert_eq!(order, vec!["high", "mid", "low"]);
    }
}
