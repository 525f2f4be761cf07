//! Batch-script rendering and submission for sweep jobs.
//!
//! Each queued job becomes one script under
//! `<log_home>/<log_folder>/scripts/<digest>.sh`, where the digest covers the
//! job's commands. The script's job name is its own path, which is what the
//! restart command later reads back from `sacct`.

use anyhow::Result;
use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cluster::{parse_sbatch_job_id, ClusterClient};
use crate::{atomic_write_bytes, sha256_hex};

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub log_folder: String,
    pub repo: String,
    pub working_dir: String,
    pub commands: Vec<String>,
    pub time_hours: u32,
    pub use_fp16: bool,
    pub cores: u32,
    /// Memory in GB.
    pub mem: u32,
    pub constraint: String,
    /// Comma-separated node list.
    pub exclude: String,
    pub time_minutes: u32,
    pub gpus: u32,
}

impl JobRequest {
    pub fn digest(&self) -> String {
        sha256_hex(self.commands.join("\n").as_bytes())
    }

    pub fn excluded_nodes(&self) -> Vec<String> {
        self.exclude
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Walltime as `H:MM:00`.
    pub fn walltime(&self) -> String {
        let total = self.time_hours * 60 + self.time_minutes;
        format!("{}:{:02}:00", total / 60, total % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub script: PathBuf,
    pub job_id: Option<u64>,
    pub error: Option<String>,
}

pub trait Scheduler {
    fn add_job(&mut self, job: JobRequest);
    fn run_jobs(&mut self, begin: Option<&str>, comment: Option<&str>) -> Result<Vec<Submission>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmSettings {
    pub partition: String,
    pub account: String,
    pub use_gres: bool,
    pub log_home: PathBuf,
    pub git_home: PathBuf,
}

pub struct SlurmScheduler<'a, C: ClusterClient> {
    settings: SlurmSettings,
    client: &'a C,
    queue: Vec<JobRequest>,
}

impl<'a, C: ClusterClient> SlurmScheduler<'a, C> {
    pub fn new(settings: SlurmSettings, client: &'a C) -> Self {
        Self {
            settings,
            client,
            queue: Vec::new(),
        }
    }

    pub fn queued(&self) -> &[JobRequest] {
        &self.queue
    }

    pub fn script_path(&self, job: &JobRequest) -> PathBuf {
        self.settings
            .log_home
            .join(&job.log_folder)
            .join("scripts")
            .join(format!("{}.sh", job.digest()))
    }

    pub fn render_script(
        &self,
        job: &JobRequest,
        script_path: &Path,
        begin: Option<&str>,
        comment: Option<&str>,
    ) -> String {
        let s = &self.settings;
        let log_dir = s.log_home.join(&job.log_folder);
        let mut out = String::with_capacity(1024);

        let _ = writeln!(out, "#!/bin/bash");
        let _ = writeln!(out, "#SBATCH --job-name={}", script_path.display());
        let _ = writeln!(
            out,
            "#SBATCH --output={}",
            log_dir.join(format!("{}.log", job.digest())).display()
        );
        if !s.partition.is_empty() {
            let _ = writeln!(out, "#SBATCH --partition={}", s.partition);
        }
        if !s.account.is_empty() {
            let _ = writeln!(out, "#SBATCH --account={}", s.account);
        }
        let _ = writeln!(out, "#SBATCH --time={}", job.walltime());
        let _ = writeln!(out, "#SBATCH --cpus-per-task={}", job.cores);
        let _ = writeln!(out, "#SBATCH --mem={}G", job.mem);
        if job.gpus > 0 {
            if s.use_gres {
                let _ = writeln!(out, "#SBATCH --gres=gpu:{}", job.gpus);
            } else {
                let _ = writeln!(out, "#SBATCH --gpus={}", job.gpus);
            }
        }
        if !job.constraint.is_empty() {
            let _ = writeln!(out, "#SBATCH --constraint={}", job.constraint);
        }
        if let Some(begin) = begin {
            let _ = writeln!(out, "#SBATCH --begin={}", begin);
        }
        if let Some(comment) = comment {
            let _ = writeln!(
                out,
                "#SBATCH --comment=\"{}\"",
                comment.trim_matches('"').replace('"', "'")
            );
        }
        let _ = writeln!(
            out,
            "# gridjob {} fp16={}",
            Utc::now().to_rfc3339(),
            job.use_fp16
        );
        let _ = writeln!(out);
        let workdir = s.git_home.join(&job.repo).join(&job.working_dir);
        let _ = writeln!(out, "cd {}", crate::shell_quote(&workdir.display().to_string()));
        for command in &job.commands {
            let _ = writeln!(out, "{}", command);
        }
        out
    }

    fn submit_one(
        &self,
        job: &JobRequest,
        begin: Option<&str>,
        comment: Option<&str>,
    ) -> Result<Submission> {
        let script = self.script_path(job);
        let body = self.render_script(job, &script, begin, comment);
        debug!(script = %script.display(), "rendered batch script:\n{}", body);
        atomic_write_bytes(&script, body.as_bytes())?;

        let submission = match self.client.submit(&script, &job.excluded_nodes()) {
            Ok(output) => match output.error() {
                Some(err) => Submission {
                    script,
                    job_id: None,
                    error: Some(err.to_string()),
                },
                None => Submission {
                    job_id: parse_sbatch_job_id(&output.stdout),
                    script,
                    error: None,
                },
            },
            Err(err) => Submission {
                script,
                job_id: None,
                error: Some(err.to_string()),
            },
        };
        match &submission.error {
            Some(err) => warn!(script = %submission.script.display(), "submission failed: {}", err),
            None => info!(
                script = %submission.script.display(),
                job_id = ?submission.job_id,
                "submitted"
            ),
        }
        Ok(submission)
    }
}

impl<C: ClusterClient> Scheduler for SlurmScheduler<'_, C> {
    fn add_job(&mut self, job: JobRequest) {
        self.queue.push(job);
    }

    /// Writes and submits every queued job. Failed submissions are reported
    /// in the result; only an unwritable script aborts the run.
    fn run_jobs(&mut self, begin: Option<&str>, comment: Option<&str>) -> Result<Vec<Submission>> {
        let jobs = std::mem::take(&mut self.queue);
        let mut submissions = Vec::with_capacity(jobs.len());
        for job in &jobs {
            submissions.push(self.submit_one(job, begin, comment)?);
        }
        Ok(submissions)
    }
}
