//! Dispatcher: the 2-second tick loop that reconciles completions, selects
//! the next job per ready printer, and hands jobs off to a bounded worker
//! pool shared across all printers.

use anyhow::Result;
use log::{error, warn};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::models::{Job, Printer, PrintParams};
use crate::notifier::Notifier;
use crate::telemetry::PrinterManager;
use crate::{db, transfer};

const TICK_PERIOD: Duration = Duration::from_secs(2);
const MAX_CONCURRENT_UPLOADS: usize = 5;

/// Shared handle used by the HTTP control surface to pause/resume the loop.
pub struct DispatcherHandle {
    paused: AtomicBool,
}

impl DispatcherHandle {
    pub fn new() -> Self {
        DispatcherHandle {
            paused: AtomicBool::new(false),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}

impl Default for DispatcherHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Dispatcher {
    pool: SqlitePool,
    printers: Arc<PrinterManager>,
    notifier: Notifier,
    handle: Arc<DispatcherHandle>,
    uploads_dir: PathBuf,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        pool: SqlitePool,
        printers: Arc<PrinterManager>,
        notifier: Notifier,
        handle: Arc<DispatcherHandle>,
        uploads_dir: PathBuf,
    ) -> Self {
        Dispatcher {
            pool,
            printers,
            notifier,
            handle,
            uploads_dir,
            permits: Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS)),
        }
    }

    /// Runs the tick loop forever. Intended to be spawned as its own task;
    /// the caller controls process lifetime (no graceful-stop signal is
    /// exposed beyond process exit).
    pub async fn run(self) {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Worker tasks outlive a single tick; track them so the dispatcher
        // doesn't need to wait on them before starting the next tick.
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            interval.tick().await;

            // Drain any finished workers so the JoinSet doesn't grow
            // unbounded; failures were already handled inside the worker.
            while workers.try_join_next().is_some() {}

            if self.handle.is_paused() {
                continue;
            }

            if let Err(err) = self.tick(&mut workers).await {
                error!("dispatcher tick failed: {err:#}");
            }
        }
    }

    async fn tick(&self, workers: &mut JoinSet<()>) -> Result<()> {
        let printers = db::list_printers(&self.pool).await?;

        for printer in printers {
            if let Err(err) = self.process_printer(&printer, workers).await {
                warn!("dispatcher: printer {} tick failed: {err:#}", printer.id);
            }
        }

        Ok(())
    }

    async fn process_printer(&self, printer: &Printer, workers: &mut JoinSet<()>) -> Result<()> {
        let Some(client) = self.printers.get(&printer.serial).await else {
            return Ok(());
        };

        // Step A — reconcile completions.
        let (safe, reason) = client.state().is_safe_to_print();
        if safe {
            let printing = db::list_printing_for_printer(&self.pool, printer.id).await?;
            for job in printing {
                db::set_status_completed(&self.pool, job.id).await?;
                self.notifier
                    .notify(&format!(
                        "Job {} ({}) completed on printer {}",
                        job.id, job.source_filename, printer.display_name
                    ))
                    .await;
            }
        } else {
            // Step B — gate.
            if let Some(reason) = reason {
                warn!("printer {} not safe to print: {reason}", printer.id);
            }
            return Ok(());
        }

        // Step C — select.
        let Some(candidate) = db::pending_candidate_for_printer(&self.pool, printer.id).await?
        else {
            return Ok(());
        };

        // Step D — concurrency guard.
        if db::uploading_with_path(&self.pool, &candidate.stored_path)
            .await?
            .is_some()
        {
            return Ok(());
        }

        // Step E — claim.
        if !db::claim_job(&self.pool, candidate.id, printer.id).await? {
            // Someone else claimed it between select and claim; fine.
            return Ok(());
        }

        // Step F — hand off.
        let pool = self.pool.clone();
        let printers = self.printers.clone();
        let notifier = self.notifier.clone();
        let uploads_dir = self.uploads_dir.clone();
        let permits = self.permits.clone();
        let printer_id = printer.id;
        let job_id = candidate.id;

        workers.spawn(async move {
            let _permit = permits.acquire().await;
            if let Err(err) =
                run_job(&pool, &printers, &notifier, &uploads_dir, printer_id, job_id).await
            {
                warn!("worker for job {job_id} on printer {printer_id} failed: {err:#}");
                let _ = db::set_status_failed(&pool, job_id).await;
            }
        });

        Ok(())
    }
}

/// The worker task body: upload, hash, publish, transition. Any failure
/// sets the job `failed`; success transitions it to `printing`.
async fn run_job(
    pool: &SqlitePool,
    printers: &PrinterManager,
    notifier: &Notifier,
    uploads_dir: &std::path::Path,
    printer_id: i64,
    job_id: i64,
) -> Result<()> {
    let printer = db::get_printer(pool, printer_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("printer {printer_id} vanished"))?;
    let job = db::get_job(pool, job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("job {job_id} vanished"))?;

    let local_path = resolve_local_path(uploads_dir, &job);

    let uploaded = transfer::upload(
        &local_path,
        &job.source_filename,
        &printer.host_address,
        &printer.access_code,
    )
    .await;

    if !uploaded {
        db::set_status_failed(pool, job.id).await?;
        notifier
            .notify(&format!(
                "Job {} failed to upload to printer {}",
                job.id, printer.display_name
            ))
            .await;
        return Ok(());
    }

    let md5 = transfer::md5_hex(&local_path).await?;
    let params = PrintParams::from(&job);

    let published = crate::telemetry::publish_print(
        printers,
        &printer.serial,
        &job.source_filename,
        &md5,
        params,
    )
    .await
    .unwrap_or(false);

    if !published {
        db::set_status_failed(pool, job.id).await?;
        return Ok(());
    }

    db::set_status_printing(pool, job.id).await?;
    notifier
        .notify(&format!(
            "Job {} dispatched to printer {}",
            job.id, printer.display_name
        ))
        .await;

    Ok(())
}

fn resolve_local_path(uploads_dir: &std::path::Path, job: &Job) -> PathBuf {
    let stored = std::path::Path::new(&job.stored_path);
    if stored.is_absolute() {
        stored.to_path_buf()
    } else {
        uploads_dir.join(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobCreate, PrinterCreate};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE printers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL,
                host_address TEXT NOT NULL UNIQUE,
                access_code TEXT NOT NULL,
                serial TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "CREATE TABLE jobs (
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
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn duplicate_path_guard_defers_second_claim() {
        let pool = test_pool().await;
        let p1 = db::create_printer(
            &pool,
            PrinterCreate {
                display_name: "P1".into(),
                host_address: "10.0.0.1".into(),
                access_code: "a".into(),
                serial: "S1".into(),
            },
        )
        .await
        .unwrap();
        let p2 = db::create_printer(
            &pool,
            PrinterCreate {
                display_name: "P2".into(),
                host_address: "10.0.0.2".into(),
                access_code: "a".into(),
                serial: "S2".into(),
            },
        )
        .await
        .unwrap();

        let shared_path = "/tmp/shared.3mf";
        let j1 = db::create_job(
            &pool,
            JobCreate {
                source_filename: "shared.3mf".into(),
                stored_path: shared_path.into(),
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
        let _j2 = db::create_job(
            &pool,
            JobCreate {
                source_filename: "shared.3mf".into(),
                stored_path: shared_path.into(),
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

        // Tick 1: P1 claims j1.
        assert!(db::claim_job(&pool, j1.id, p1.id).await.unwrap());

        // Tick 2: the candidate for P2 is j2, but j1 is still `uploading`
        // with the same stored_path, so it must be deferred.
        let candidate = db::pending_candidate_for_printer(&pool, p2.id).await.unwrap().unwrap();
        let blocked = db::uploading_with_path(&pool, &candidate.stored_path).await.unwrap();
        assert!(blocked.is_some());

        // Once j1 leaves `uploading`, j2 becomes claimable.
        db::set_status_printing(&pool, j1.id).await.unwrap();
        let blocked = db::uploading_with_path(&pool, &candidate.stored_path).await.unwrap();
        assert!(blocked.is_none());
        assert!(db::claim_job(&pool, candidate.id, p2.id).await.unwrap());
    }
}
