use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::axes::{cartesian, render_fixed, render_flag, ArgValue, Axis, AxisConfig};
use crate::scheduler::{JobRequest, Scheduler, Submission, SlurmSettings};
use crate::sha256_hex;

/// Extra jobs for commands containing a substring: one job per value of
/// `flag`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalRule {
    pub contains: String,
    pub flag: String,
    pub values: Vec<ArgValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default = "default_gpus")]
    pub gpus: u32,
    pub log_folder: String,
    #[serde(default)]
    pub checkpoint_name: Option<String>,
    pub checkpoint_base_dir: String,
    #[serde(default = "default_cores_per_job")]
    pub cores_per_job: u32,
    #[serde(default = "default_mem")]
    pub mem: u32,
    #[serde(default = "default_num_seeds")]
    pub num_seeds: u64,
    #[serde(default)]
    pub seed_offset: u64,
    #[serde(default = "default_time_hours")]
    pub time_hours: u32,
    #[serde(default)]
    pub time_minutes: u32,
    pub partition: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub constraint: String,
    #[serde(default)]
    pub exclude: String,
    #[serde(default)]
    pub begin: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub change_dir: String,
    pub repo: String,
    #[serde(default = "default_true")]
    pub fp16: bool,
    #[serde(default)]
    pub use_gres: bool,
    #[serde(default = "default_sample_seed")]
    pub sample_seed: u64,
    #[serde(default = "default_log_home")]
    pub log_home: PathBuf,
    #[serde(default = "default_git_home")]
    pub git_home: PathBuf,
    #[serde(default)]
    pub fixed: serde_yaml::Mapping,
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub conditional: Vec<ConditionalRule>,
}

fn default_gpus() -> u32 {
    1
}

fn default_cores_per_job() -> u32 {
    4
}

fn default_mem() -> u32 {
    24
}

fn default_num_seeds() -> u64 {
    1
}

fn default_time_hours() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_sample_seed() -> u64 {
    5345
}

fn default_log_home() -> PathBuf {
    PathBuf::from("logs")
}

fn default_git_home() -> PathBuf {
    PathBuf::from(".")
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read sweep file {}: {}", path.display(), e))?;
        Self::from_yaml(&raw)
            .map_err(|e| anyhow!("invalid sweep file {}: {}", path.display(), e))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: SweepConfig = serde_yaml::from_str(raw)?;
        // Surface flag/axis errors at load time rather than mid-generation.
        config.fixed_flags()?;
        config.axes()?;
        Ok(config)
    }

    pub fn checkpoint_name(&self) -> &str {
        self.checkpoint_name.as_deref().unwrap_or(&self.log_folder)
    }

    pub fn fixed_flags(&self) -> Result<Vec<(String, ArgValue)>> {
        self.fixed
            .iter()
            .map(|(key, value)| {
                let flag = key
                    .as_str()
                    .ok_or_else(|| anyhow!("fixed flag names must be strings: {:?}", key))?;
                let value: ArgValue = serde_yaml::from_value(value.clone())
                    .map_err(|e| anyhow!("fixed flag {}: {}", flag, e))?;
                Ok((flag.to_string(), value))
            })
            .collect()
    }

    pub fn axes(&self) -> Result<Vec<Axis>> {
        self.axes.iter().cloned().map(Axis::try_from).collect()
    }

    /// Base command with `{gpus}` substituted and fixed flags appended.
    pub fn base_command(&self) -> Result<String> {
        let mut cmd = self.command.replace("{gpus}", &self.gpus.to_string());
        cmd.push_str(&render_fixed(&self.fixed_flags()?));
        Ok(cmd)
    }

    pub fn slurm_settings(&self) -> SlurmSettings {
        SlurmSettings {
            partition: self.partition.clone(),
            account: self.account.clone(),
            use_gres: self.use_gres,
            log_home: self.log_home.clone(),
            git_home: self.git_home.clone(),
        }
    }

    pub fn job_request(&self, command: &str) -> JobRequest {
        JobRequest {
            log_folder: self.log_folder.clone(),
            repo: self.repo.clone(),
            working_dir: self.change_dir.clone(),
            commands: vec![command.to_string()],
            time_hours: self.time_hours,
            use_fp16: self.fp16,
            cores: self.cores_per_job,
            mem: self.mem,
            constraint: self.constraint.clone(),
            exclude: self.exclude.clone(),
            time_minutes: self.time_minutes,
            gpus: self.gpus,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedJob {
    pub command: String,
    pub save_dir: String,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    /// Number of configurations before subsampling.
    pub candidates: usize,
    pub jobs: Vec<GeneratedJob>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepSummary {
    pub total_jobs: usize,
    pub candidates: usize,
    pub time_hours: u32,
    pub time_minutes: u32,
    pub gpus: u32,
    pub gpu_hours: f64,
    pub begin: Option<String>,
    pub log_dir: PathBuf,
    pub partition: String,
    pub change_dir: String,
}

impl SweepPlan {
    pub fn summary(&self, config: &SweepConfig) -> SweepSummary {
        let hours = f64::from(config.time_hours) + f64::from(config.time_minutes) / 60.0;
        SweepSummary {
            total_jobs: self.jobs.len(),
            candidates: self.candidates,
            time_hours: config.time_hours,
            time_minutes: config.time_minutes,
            gpus: config.gpus,
            gpu_hours: self.jobs.len() as f64 * f64::from(config.gpus) * hours,
            begin: config.begin.clone(),
            log_dir: config.log_home.join(&config.log_folder),
            partition: config.partition.clone(),
            change_dir: config.change_dir.clone(),
        }
    }
}

/// Removes every whitespace-separated `flag` token, leaving the rest intact.
fn strip_flag(cmd: &str, flag: &str) -> String {
    cmd.split(' ')
        .filter(|token| *token != flag)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expands a sweep into concrete job commands.
///
/// Loop order is seeds, then prefixes, then axis combinations. Each candidate
/// draws once from a generator seeded with `sample_seed` and is kept when the
/// draw is `<= p`.
pub fn generate_jobs(config: &SweepConfig, p: f64) -> Result<SweepPlan> {
    if !(0.0..=1.0).contains(&p) {
        return Err(anyhow!("sampling probability must be within [0, 1], got {}", p));
    }
    let base = config.base_command()?;
    let combos = cartesian(&config.axes()?);
    let prefixes = if config.prefixes.is_empty() {
        vec![String::new()]
    } else {
        config.prefixes.clone()
    };
    let checkpoint_root = format!(
        "{}/{}",
        config.checkpoint_base_dir.trim_end_matches('/'),
        config.checkpoint_name().trim_matches('/')
    );

    let mut rng = StdRng::seed_from_u64(config.sample_seed);
    let mut candidates = 0usize;
    let mut jobs = Vec::new();
    for seed in config.seed_offset..config.seed_offset + config.num_seeds {
        for prefix in &prefixes {
            for combo in &combos {
                let mut cmd = format!("{}{}{}", base, prefix, combo.concat());
                if !config.fp16 {
                    cmd = strip_flag(&cmd, "--fp16");
                }

                let matching = config
                    .conditional
                    .iter()
                    .filter(|rule| cmd.contains(&rule.contains))
                    .collect::<Vec<_>>();
                let variants = if matching.is_empty() {
                    vec![cmd]
                } else {
                    matching
                        .iter()
                        .flat_map(|rule| {
                            rule.values
                                .iter()
                                .map(|v| format!("{}{}", cmd, render_flag(&rule.flag, v)))
                        })
                        .collect()
                };

                for variant in variants {
                    let seeded = format!("{} --seed {}", variant, seed);
                    let save_dir = format!("{}/{}", checkpoint_root, sha256_hex(seeded.as_bytes()));
                    let command = format!("{} --save-dir {}", seeded, save_dir);
                    candidates += 1;
                    let draw: f64 = rng.gen();
                    if draw <= p {
                        jobs.push(GeneratedJob {
                            command,
                            save_dir,
                            seed,
                        });
                    } else {
                        debug!(draw, p, "sampled out: {}", command);
                    }
                }
            }
        }
    }
    Ok(SweepPlan { candidates, jobs })
}

/// Queues every planned job on `scheduler` and submits them.
pub fn submit_sweep<S: Scheduler>(
    config: &SweepConfig,
    plan: &SweepPlan,
    scheduler: &mut S,
) -> Result<Vec<Submission>> {
    for job in &plan.jobs {
        scheduler.add_job(config.job_request(&job.command));
    }
    scheduler.run_jobs(config.begin.as_deref(), config.comment.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SWEEP: &str = r#"
name: butterfly1
command: "fairseq-train --task language_modeling --fp16 --distributed-world-size {gpus}"
gpus: 8
log_folder: experimental/cc_small/butterfly1
checkpoint_base_dir: /checkpoint/me/
partition: learnlab
repo: fairseq_private
change_dir: fairseq_private/
fixed:
  arch: transformer_lm
  fp16-no-flatten-grads: true
  weight-decay: 0.0
axes:
  - flag: butterfly-low-rank
    values: [0, 0.1, 0.2]
  - flag: butterfly-block-size
    values: [16, 32]
  - flags: [max-update, warmup-updates, ""]
    values:
      - [16000, 3000, /data/cc_small]
"#;

    fn config() -> SweepConfig {
        SweepConfig::from_yaml(SWEEP).expect("valid sweep")
    }

    #[test]
    fn generates_full_cartesian_product() {
        let plan = generate_jobs(&config(), 1.0).expect("plan");
        assert_eq!(plan.candidates, 3 * 2 * 1);
        assert_eq!(plan.jobs.len(), 6);
        let mut commands = plan.jobs.iter().map(|j| j.command.clone()).collect::<Vec<_>>();
        commands.sort();
        commands.dedup();
        assert_eq!(commands.len(), 6);
    }

    #[test]
    fn command_layout_matches_fragments() {
        let plan = generate_jobs(&config(), 1.0).expect("plan");
        let first = &plan.jobs[0];
        let expected_prefix = "fairseq-train --task language_modeling --fp16 --distributed-world-size 8 \
--arch transformer_lm --fp16-no-flatten-grads --weight-decay 0.0 \
--butterfly-low-rank 0 --butterfly-block-size 16 \
--max-update 16000 --warmup-updates 3000 /data/cc_small --seed 0 --save-dir ";
        assert!(
            first.command.starts_with(expected_prefix),
            "unexpected command: {}",
            first.command
        );
        assert!(first.save_dir.starts_with("/checkpoint/me/experimental/cc_small/butterfly1/"));
        assert!(first.command.ends_with(&first.save_dir));
    }

    #[test]
    fn save_dir_is_content_addressed() {
        let a = generate_jobs(&config(), 1.0).expect("plan");
        let b = generate_jobs(&config(), 1.0).expect("plan");
        assert_eq!(a, b);
        let mut dirs = a.jobs.iter().map(|j| j.save_dir.clone()).collect::<Vec<_>>();
        dirs.sort();
        dirs.dedup();
        assert_eq!(dirs.len(), a.jobs.len());
        let hash = a.jobs[0].save_dir.rsplit('/').next().expect("hash");
        let seeded = a.jobs[0]
            .command
            .split(" --save-dir ")
            .next()
            .expect("seeded command");
        assert_eq!(hash, sha256_hex(seeded.as_bytes()));
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let mut cfg = config();
        cfg.num_seeds = 20;
        let first = generate_jobs(&cfg, 0.5).expect("plan");
        let second = generate_jobs(&cfg, 0.5).expect("plan");
        assert_eq!(first.candidates, 120);
        assert_eq!(first.jobs, second.jobs);
        assert!(first.jobs.len() < 120, "p=0.5 should drop some jobs");
        assert!(!first.jobs.is_empty(), "p=0.5 should keep some jobs");

        let none = generate_jobs(&cfg, 0.0).expect("plan");
        assert!(none.jobs.len() <= 1, "p=0 keeps only exact-zero draws");
    }

    #[test]
    fn rejects_probability_out_of_range() {
        assert!(generate_jobs(&config(), 1.5).is_err());
        assert!(generate_jobs(&config(), -0.1).is_err());
    }

    #[test]
    fn seeds_prefixes_and_fp16_toggle() {
        let mut cfg = config();
        cfg.axes.clear();
        cfg.num_seeds = 2;
        cfg.seed_offset = 3;
        cfg.prefixes = vec![" data/wikitext-2".to_string(), " data/wikitext-103".to_string()];
        cfg.fp16 = false;
        let plan = generate_jobs(&cfg, 1.0).expect("plan");
        assert_eq!(plan.jobs.len(), 4);
        assert_eq!(
            plan.jobs.iter().map(|j| j.seed).collect::<Vec<_>>(),
            vec![3, 3, 4, 4]
        );
        assert!(plan.jobs[1].command.contains(" data/wikitext-103 --seed 3"));
        for job in &plan.jobs {
            assert!(!job.command.contains("--fp16 "), "{}", job.command);
            assert!(job.command.contains("--fp16-no-flatten-grads"));
        }
    }

    #[test]
    fn conditional_rules_fan_out_matching_commands() {
        let mut cfg = config();
        cfg.conditional = vec![ConditionalRule {
            contains: "--butterfly-low-rank 0 ".to_string(),
            flag: "lr".to_string(),
            values: vec![ArgValue::Float(0.001), ArgValue::Float(0.003)],
        }];
        let plan = generate_jobs(&cfg, 1.0).expect("plan");
        // 2 of 6 combinations match and each fans out into 2 jobs.
        assert_eq!(plan.jobs.len(), 4 + 2 * 2);
        assert!(plan
            .jobs
            .iter()
            .any(|j| j.command.contains("/data/cc_small --lr 0.003 --seed 0")));
    }

    #[test]
    fn summary_reports_gpu_hours_and_destination() {
        let mut cfg = config();
        cfg.time_hours = 6;
        cfg.time_minutes = 30;
        let plan = generate_jobs(&cfg, 1.0).expect("plan");
        let summary = plan.summary(&cfg);
        assert_eq!(summary.total_jobs, 6);
        assert!((summary.gpu_hours - 6.0 * 8.0 * 6.5).abs() < 1e-9);
        assert_eq!(summary.log_dir, PathBuf::from("logs/experimental/cc_small/butterfly1"));
        assert_eq!(summary.partition, "learnlab");
    }

    #[test]
    fn bundled_sample_config_expands() {
        let cfg = SweepConfig::from_yaml(include_str!("../../../configs/cc_small_butterfly.yaml"))
            .expect("sample sweep");
        let plan = generate_jobs(&cfg, 1.0).expect("plan");
        assert_eq!(plan.candidates, 3 * 3 + 3);
        assert!(plan.jobs[0]
            .command
            .contains("--distributed-world-size 32 --valid-subset valid --arch transformer_lm"));
        assert!(plan
            .jobs
            .iter()
            .any(|j| j.command.contains("--butterfly-block-size 64 --lr 0.001633 --warmup-init-lr 0.0 --update-freq-override 4")));
    }

    #[test]
    fn load_reports_arity_errors_with_path() {
        let dir = std::env::temp_dir().join(format!(
            "gridjob_sweep_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        crate::ensure_dir(&dir).expect("temp dir");
        let path = dir.join("bad.yaml");
        fs::write(
            &path,
            "command: x\nlog_folder: l\ncheckpoint_base_dir: /c\npartition: p\nrepo: r\naxes:\n  - flags: [a, b]\n    values: [[1]]\n",
        )
        .expect("write sweep");
        let err = SweepConfig::load(&path).expect_err("arity mismatch");
        let msg = err.to_string();
        assert!(msg.contains("bad.yaml"), "{}", msg);
        assert!(msg.contains("expected 2"), "{}", msg);
        let _ = fs::remove_dir_all(dir);
    }
}
