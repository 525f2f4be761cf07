use anyhow::{anyhow, Result};
use chrono::{Days, Local, NaiveDate};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Captured output of one scheduler command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Any non-empty error stream counts as a failure.
    pub fn error(&self) -> Option<&str> {
        let err = self.stderr.trim();
        if err.is_empty() {
            None
        } else {
            Some(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub user: Option<String>,
    pub days_back: u32,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            user: None,
            days_back: 1,
        }
    }
}

impl HistoryQuery {
    pub fn start_date(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(u64::from(self.days_back)))
            .unwrap_or(NaiveDate::MIN)
    }

    pub fn sacct_args(&self, today: NaiveDate) -> Vec<String> {
        let mut args = vec![
            "-X".to_string(),
            "--noheader".to_string(),
            "--parsable2".to_string(),
            "--starttime".to_string(),
            self.start_date(today).format("%Y-%m-%d").to_string(),
            "--format=JobID,State,JobName%250,NodeList".to_string(),
        ];
        if let Some(user) = &self.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        args
    }
}

pub fn sbatch_args(script: &Path, excluded_nodes: &[String]) -> Vec<String> {
    let mut args = vec!["--parsable".to_string()];
    if !excluded_nodes.is_empty() {
        args.push(format!("--exclude={}", excluded_nodes.join(",")));
    }
    args.push(script.display().to_string());
    args
}

/// Extracts the job id from `sbatch` output, either `--parsable`
/// (`123` or `123;cluster`) or the classic `Submitted batch job 123`.
pub fn parse_sbatch_job_id(stdout: &str) -> Option<u64> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let head = line.split(';').next().unwrap_or(line).trim();
    head.parse::<u64>()
        .ok()
        .or_else(|| line.split_whitespace().last()?.parse::<u64>().ok())
}

/// The cluster operations the tools need: one accounting query and
/// batch submission.
pub trait ClusterClient {
    fn query_history(&self, query: &HistoryQuery) -> Result<CommandOutput>;
    fn submit(&self, script: &Path, excluded_nodes: &[String]) -> Result<CommandOutput>;
}

/// Talks to SLURM through the `sacct` and `sbatch` executables.
#[derive(Debug, Clone)]
pub struct SlurmCli {
    pub sacct: String,
    pub sbatch: String,
}

impl Default for SlurmCli {
    fn default() -> Self {
        Self {
            sacct: "sacct".to_string(),
            sbatch: "sbatch".to_string(),
        }
    }
}

impl SlurmCli {
    fn run(program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!("running: {} {}", program, crate::shell_join(args));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow!("failed to spawn {}: {}", program, e))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl ClusterClient for SlurmCli {
    fn query_history(&self, query: &HistoryQuery) -> Result<CommandOutput> {
        let args = query.sacct_args(Local::now().date_naive());
        Self::run(&self.sacct, &args)
    }

    fn submit(&self, script: &Path, excluded_nodes: &[String]) -> Result<CommandOutput> {
        Self::run(&self.sbatch, &sbatch_args(script, excluded_nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn sacct_args_cover_window_and_user() {
        let query = HistoryQuery {
            user: Some("alice".to_string()),
            days_back: 3,
        };
        let today = NaiveDate::from_ymd_opt(2024, 3, 2).expect("date");
        let args = query.sacct_args(today);
        assert_eq!(args[4], "2024-02-28");
        assert!(args.contains(&"--parsable2".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--user", "alice"]);
    }

    #[test]
    fn sacct_args_without_user_query_everyone() {
        let args = HistoryQuery::default()
            .sacct_args(NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"));
        assert_eq!(args[4], "2023-12-31");
        assert!(!args.contains(&"--user".to_string()));
    }

    #[test]
    fn sbatch_args_omit_empty_exclusion() {
        let script = PathBuf::from("/jobs/a.sh");
        assert_eq!(sbatch_args(&script, &[]), vec!["--parsable", "/jobs/a.sh"]);
        assert_eq!(
            sbatch_args(&script, &["n1".to_string(), "n2".to_string()]),
            vec!["--parsable", "--exclude=n1,n2", "/jobs/a.sh"]
        );
    }

    #[test]
    fn sbatch_job_id_parses_both_output_styles() {
        assert_eq!(parse_sbatch_job_id("4711\n"), Some(4711));
        assert_eq!(parse_sbatch_job_id("4711;hyak"), Some(4711));
        assert_eq!(parse_sbatch_job_id("Submitted batch job 99"), Some(99));
        assert_eq!(parse_sbatch_job_id(""), None);
    }

    #[test]
    fn command_output_error_ignores_whitespace() {
        assert_eq!(CommandOutput::ok("x").error(), None);
        let failed = CommandOutput {
            stdout: String::new(),
            stderr: "  sbatch: error: invalid partition\n".to_string(),
        };
        assert_eq!(failed.error(), Some("sbatch: error: invalid partition"));
    }
}
