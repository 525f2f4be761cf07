use anyhow::Result;
use clap::{Parser, Subcommand};
use gridjob_runner::reconcile::RestartReport;
use gridjob_runner::sweep::{GeneratedJob, SweepSummary};
use gridjob_runner::{
    generate_jobs, run_restart, submit_sweep, HistoryQuery, ReconcileOptions, SlurmCli,
    SlurmScheduler, Submission, SweepConfig,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gridjob", version, about = "SLURM sweep submission and restart tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a sweep file into jobs and submit them
    Sweep {
        config: PathBuf,
        #[arg(long)]
        dry: bool,
        #[arg(long)]
        verbose: bool,
        /// Probability with which to select a configuration
        #[arg(long = "p", default_value_t = 1.0)]
        p: f64,
        #[arg(long)]
        json: bool,
    },
    /// Resubmit failed, timed-out or preempted jobs
    Restart {
        /// Restart jobs with this job id or greater
        #[arg(long)]
        startid: u64,
        #[arg(long)]
        endid: Option<u64>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        dry: bool,
        /// Do not exclude nodes that ran FAILED jobs
        #[arg(long)]
        no_exclude: bool,
        #[arg(long)]
        include_failed: bool,
        /// Only restart jobs in this state
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 1)]
        days_back: u32,
        #[arg(long)]
        restart_cancelled: bool,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(command_verbose(&cli.command));
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Sweep {
            config,
            dry,
            verbose: _,
            p,
            json,
        } => {
            let sweep = SweepConfig::load(&config)?;
            let plan = generate_jobs(&sweep, p)?;
            let summary = plan.summary(&sweep);
            info!(
                config = %config.display(),
                candidates = plan.candidates,
                jobs = plan.jobs.len(),
                "expanded sweep"
            );
            if dry {
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "sweep",
                        "dry": true,
                        "summary": sweep_summary_to_json(&summary),
                        "jobs": plan.jobs.iter().map(generated_job_to_json).collect::<Vec<_>>(),
                    })));
                }
                for (i, job) in plan.jobs.iter().enumerate() {
                    println!("{} {}", i, job.command);
                }
                println!();
                print_sweep_summary(&summary);
                return Ok(None);
            }

            let client = SlurmCli::default();
            let mut scheduler = SlurmScheduler::new(sweep.slurm_settings(), &client);
            let submissions = submit_sweep(&sweep, &plan, &mut scheduler)?;
            let failed = submissions.iter().filter(|s| s.error.is_some()).count();
            if json {
                return Ok(Some(json!({
                    "ok": failed == 0,
                    "command": "sweep",
                    "dry": false,
                    "summary": sweep_summary_to_json(&summary),
                    "submissions": submissions.iter().map(submission_to_json).collect::<Vec<_>>(),
                })));
            }
            for submission in &submissions {
                match (&submission.error, submission.job_id) {
                    (Some(err), _) => println!(
                        "error: {}: {}",
                        submission.script.display(),
                        err
                    ),
                    (None, Some(id)) => println!("submitted: {} ({})", id, submission.script.display()),
                    (None, None) => println!("submitted: {}", submission.script.display()),
                }
            }
            println!("total_jobs: {}", submissions.len());
            println!("failed: {}", failed);
        }
        Commands::Restart {
            startid,
            endid,
            user,
            dry,
            no_exclude,
            include_failed,
            state,
            days_back,
            restart_cancelled,
            verbose: _,
            json,
        } => {
            let query = HistoryQuery { user, days_back };
            let options = ReconcileOptions {
                start_id: startid,
                end_id: endid,
                state,
                include_failed,
                restart_cancelled,
                exclude_nodes: !no_exclude,
            };
            let report = run_restart(&SlurmCli::default(), &query, &options, dry)?;
            if json {
                return Ok(Some(restart_report_to_json(&report)));
            }
            print_restart_report(&report);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Sweep { json, .. } | Commands::Restart { json, .. } => *json,
    }
}

fn command_verbose(command: &Commands) -> bool {
    match command {
        Commands::Sweep { verbose, .. } | Commands::Restart { verbose, .. } => *verbose,
    }
}

fn generated_job_to_json(job: &GeneratedJob) -> Value {
    json!({
        "command": job.command,
        "save_dir": job.save_dir,
        "seed": job.seed,
    })
}

fn submission_to_json(submission: &Submission) -> Value {
    json!({
        "script": submission.script.display().to_string(),
        "job_id": submission.job_id,
        "error": submission.error,
    })
}

fn sweep_summary_to_json(summary: &SweepSummary) -> Value {
    json!({
        "total_jobs": summary.total_jobs,
        "candidates": summary.candidates,
        "time_hours": summary.time_hours,
        "time_minutes": summary.time_minutes,
        "gpus": summary.gpus,
        "gpu_hours": summary.gpu_hours,
        "begin": summary.begin,
        "log_dir": summary.log_dir.display().to_string(),
        "partition": summary.partition,
        "change_dir": summary.change_dir,
    })
}

fn print_sweep_summary(summary: &SweepSummary) {
    println!("Total jobs {}", summary.total_jobs);
    if summary.candidates != summary.total_jobs {
        println!("Sampled from: {} configurations", summary.candidates);
    }
    println!("Time hours: {}", summary.time_hours);
    if summary.time_minutes > 0 {
        println!("Time minutes: {}", summary.time_minutes);
    }
    println!("GPUs: {}", summary.gpus);
    println!("GPU hours: {:.1}", summary.gpu_hours);
    println!("begin: {}", summary.begin.as_deref().unwrap_or("None"));
    println!("Jobs will be written to: {}", summary.log_dir.display());
    println!("Jobs will be run on: {}", summary.partition);
    println!("Run in folder: {}", summary.change_dir);
}

fn restart_report_to_json(report: &RestartReport) -> Value {
    json!({
        "ok": report.failures() == 0,
        "command": "restart",
        "dry": report.dry,
        "records": report.records,
        "banned_nodes": report.plan.banned_nodes(),
        "handled": report.plan.handled.iter().map(|h| json!({
            "script": h.record.script,
            "job_id": h.record.display_id(),
            "state": h.record.state.as_str(),
            "settled_by": h.settled_by.as_str(),
        })).collect::<Vec<_>>(),
        "restarts": report.outcomes.iter().map(|o| json!({
            "script": o.script,
            "original_job_id": o.original.display_id(),
            "original_state": o.original.state.as_str(),
            "original_nodes": o.original.nodes,
            "command": o.command_line(),
            "job_id": o.job_id,
            "error": o.error,
        })).collect::<Vec<_>>(),
    })
}

fn print_restart_report(report: &RestartReport) {
    println!("Banned nodes: {}", report.plan.banned_nodes().join(","));
    for handled in &report.plan.handled {
        println!(
            "Already handled: {} (job {} {}, now {})",
            handled.record.script,
            handled.record.display_id(),
            handled.record.state,
            handled.settled_by
        );
    }
    println!();
    println!("{}", "=".repeat(80));
    println!(
        "{} the following {} jobs...",
        if report.dry { "Would restart" } else { "Restarting" },
        report.outcomes.len()
    );
    println!("{}", "=".repeat(80));
    println!();
    for outcome in &report.outcomes {
        let original = &outcome.original;
        if report.dry {
            println!(
                "Originally: Job {} with State {} on NodeList {}",
                original.display_id(),
                original.state,
                original.nodes
            );
            println!("{}", outcome.command_line());
            continue;
        }
        println!("Restarting script: {}", outcome.script);
        println!(
            "Originally: Job {} with State {} on NodeList {}",
            original.display_id(),
            original.state,
            original.nodes
        );
        match (&outcome.error, outcome.job_id) {
            (Some(err), _) => println!("Error in sbatch call: {}", err),
            (None, Some(id)) => println!("Submitted: {}", id),
            (None, None) => {}
        }
    }
    println!();
    println!("records: {}", report.records);
    println!("handled: {}", report.plan.handled.len());
    if report.dry {
        println!("would restart: {}", report.outcomes.len());
    } else {
        println!("restarted: {}", report.outcomes.len() - report.failures());
        println!("failed: {}", report.failures());
    }
}
