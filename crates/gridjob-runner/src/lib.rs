use anyhow::Result;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

pub mod axes;
pub mod cluster;
pub mod reconcile;
pub mod sacct;
pub mod scheduler;
pub mod sweep;

pub use axes::{ArgValue, Axis};
pub use cluster::{ClusterClient, CommandOutput, HistoryQuery, SlurmCli};
pub use reconcile::{run_restart, ReconcileOptions, RestartPlan, RestartReport};
pub use sacct::{HistoryRecord, JobState};
pub use scheduler::{JobRequest, Scheduler, SlurmScheduler, SlurmSettings, Submission};
pub use sweep::{generate_jobs, submit_sweep, SweepConfig, SweepPlan, SweepSummary};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:,=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
