//! Persisted data model: printers and print jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fleet printer, as stored in the `printers` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Printer {
    pub id: i64,
    pub display_name: String,
    pub host_address: String,
    #[serde(skip_serializing)]
    pub access_code: String,
    pub serial: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for registering a new printer.
#[derive(Debug, Deserialize)]
pub struct PrinterCreate {
    pub display_name: String,
    pub host_address: String,
    pub access_code: String,
    pub serial: String,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Uploading,
    Printing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Uploading => "uploading",
            JobStatus::Printing => "printing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => JobStatus::Pending,
            "uploading" => JobStatus::Uploading,
            "printing" => JobStatus::Printing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            other => anyhow::bail!("unknown job status: {other}"),
        })
    }
}

/// A print job, as stored in the `jobs` table.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub source_filename: String,
    pub stored_path: String,
    pub status: JobStatus,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_printer_id: Option<i64>,
    pub bed_levelling: bool,
    pub flow_calibration: bool,
    pub timelapse: bool,
    pub use_material_system: bool,
    pub thumbnail_ref: Option<String>,
    pub estimated_duration_seconds: Option<i64>,
}

/// Raw row shape as it comes back from sqlite (status/timestamps as text).
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub source_filename: String,
    pub stored_path: String,
    pub status: String,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_printer_id: Option<i64>,
    pub bed_levelling: bool,
    pub flow_calibration: bool,
    pub timelapse: bool,
    pub use_material_system: bool,
    pub thumbnail_ref: Option<String>,
    pub estimated_duration_seconds: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            source_filename: row.source_filename,
            stored_path: row.stored_path,
            status: row.status.parse()?,
            priority: row.priority,
            created_at: row.created_at,
            completed_at: row.completed_at,
            assigned_printer_id: row.assigned_printer_id,
            bed_levelling: row.bed_levelling,
            flow_calibration: row.flow_calibration,
            timelapse: row.timelapse,
            use_material_system: row.use_material_system,
            thumbnail_ref: row.thumbnail_ref,
            estimated_duration_seconds: row.estimated_duration_seconds,
        })
    }
}

/// Request body for enqueueing a new job.
#[derive(Debug, Deserialize)]
pub struct JobCreate {
    pub source_filename: String,
    pub stored_path: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub bed_levelling: bool,
    #[serde(default = "default_true")]
    pub flow_calibration: bool,
    #[serde(default)]
    pub timelapse: bool,
    #[serde(default)]
    pub use_material_system: bool,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
    #[serde(default)]
    pub estimated_duration_seconds: Option<i64>,
}

fn default_true() -> bool {
    true
}

/// Job parameter flags, as handed to the telemetry client's `publish_print`.
#[derive(Debug, Clone, Copy)]
pub struct PrintParams {
    pub bed_levelling: bool,
    pub flow_calibration: bool,
    pub timelapse: bool,
    pub use_material_system: bool,
}

impl From<&Job> for PrintParams {
    fn from(job: &Job) -> Self {
        PrintParams {
            bed_levelling: job.bed_levelling,
            flow_calibration: job.flow_calibration,
            timelapse: job.timelapse,
            use_material_system: job.use_material_system,
        }
    }
}
