//! Parsing of `sacct` job-accounting lines.

use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Preempted,
    Cancelled,
    Other(String),
}

impl JobState {
    /// Any state mentioning CANCELLED (e.g. `CANCELLED by 1234`, `CANCELLED+`)
    /// collapses to [`JobState::Cancelled`].
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.contains("CANCELLED") {
            return JobState::Cancelled;
        }
        match raw {
            "PENDING" => JobState::Pending,
            "RUNNING" => JobState::Running,
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "TIMEOUT" => JobState::Timeout,
            "PREEMPTED" => JobState::Preempted,
            other => JobState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::Preempted => "PREEMPTED",
            JobState::Cancelled => "CANCELLED",
            JobState::Other(s) => s,
        }
    }

    /// The job is alive, queued or done; it never needs a restart.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            JobState::Running | JobState::Completed | JobState::Pending
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub job_id: u64,
    pub task_index: Option<usize>,
    pub state: JobState,
    /// Script path; for array tasks, the dispatch file until resolved.
    pub script: String,
    pub nodes: String,
}

impl HistoryRecord {
    pub fn display_id(&self) -> String {
        match self.task_index {
            Some(index) => format!("{}_{}", self.job_id, index),
            None => self.job_id.to_string(),
        }
    }

    /// Node list that actually names hosts (pending jobs report `None assigned`).
    pub fn assigned_nodes(&self) -> Option<&str> {
        let nodes = self.nodes.trim();
        if nodes.is_empty() || nodes.starts_with("None") {
            None
        } else {
            Some(nodes)
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("expected 4 columns (id, state, script, nodes), found {0}")]
    MissingColumns(usize),
    #[error("non-numeric job id: {0}")]
    InvalidJobId(String),
    #[error("non-numeric array task index: {0}")]
    InvalidTaskIndex(String),
}

fn split_columns(line: &str) -> Vec<String> {
    if line.contains('|') {
        return line.split('|').map(|c| c.trim().to_string()).collect();
    }
    let mut tokens = line.split_whitespace().map(str::to_string).collect::<Vec<_>>();
    // Fixed-width output prints `CANCELLED by <uid>` as three tokens.
    if tokens.len() >= 4 && tokens[1].starts_with("CANCELLED") && tokens[2] == "by" {
        let merged = tokens.drain(1..4).collect::<Vec<_>>().join(" ");
        tokens.insert(1, merged);
    }
    if tokens.len() > 4 {
        let nodes = tokens.split_off(3).join(" ");
        tokens.push(nodes);
    }
    tokens
}

/// Parses one accounting line. Array-job parent entries (`123_[0-15]`) yield
/// `Ok(None)`.
pub fn parse_record(line: &str) -> Result<Option<HistoryRecord>, RecordParseError> {
    let cols = split_columns(line);
    if cols.len() < 4 {
        return Err(RecordParseError::MissingColumns(cols.len()));
    }
    let raw_id = cols[0].as_str();
    if raw_id.contains('[') {
        return Ok(None);
    }
    let (base, task_index) = match raw_id.split_once('_') {
        Some((base, index)) => {
            let index = index
                .parse::<usize>()
                .map_err(|_| RecordParseError::InvalidTaskIndex(index.to_string()))?;
            (base, Some(index))
        }
        None => (raw_id, None),
    };
    let job_id = base
        .parse::<u64>()
        .map_err(|_| RecordParseError::InvalidJobId(raw_id.to_string()))?;
    Ok(Some(HistoryRecord {
        job_id,
        task_index,
        state: JobState::parse(&cols[1]),
        script: cols[2].clone(),
        nodes: cols[3].clone(),
    }))
}

/// Parses a full query output, skipping blank lines, array parents and
/// malformed records.
pub fn parse_history(output: &str) -> Vec<HistoryRecord> {
    let mut records = Vec::new();
    for (lineno, line) in output.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(line) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => debug!(line = lineno + 1, "skipping array parent entry"),
            Err(err) => warn!(line = lineno + 1, raw = line, "skipping record: {}", err),
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_parse_normalizes_cancelled_variants() {
        assert_eq!(JobState::parse("CANCELLED by 4242"), JobState::Cancelled);
        assert_eq!(JobState::parse("CANCELLED+"), JobState::Cancelled);
        assert_eq!(JobState::parse("TIMEOUT"), JobState::Timeout);
        assert_eq!(
            JobState::parse("OUT_OF_MEMORY"),
            JobState::Other("OUT_OF_MEMORY".to_string())
        );
        assert!(JobState::Pending.is_settled());
        assert!(!JobState::Preempted.is_settled());
    }

    #[test]
    fn parses_pipe_delimited_record() {
        let record = parse_record("1234|TIMEOUT|/home/me/jobs/a.sh|learnfair[001-002]")
            .expect("valid line")
            .expect("not an array parent");
        assert_eq!(record.job_id, 1234);
        assert_eq!(record.task_index, None);
        assert_eq!(record.state, JobState::Timeout);
        assert_eq!(record.script, "/home/me/jobs/a.sh");
        assert_eq!(record.nodes, "learnfair[001-002]");
    }

    #[test]
    fn parses_whitespace_record_with_cancelled_by() {
        let record = parse_record("  77_3   CANCELLED by 501   dispatch.txt   node07 ")
            .expect("valid line")
            .expect("not an array parent");
        assert_eq!(record.job_id, 77);
        assert_eq!(record.task_index, Some(3));
        assert_eq!(record.state, JobState::Cancelled);
        assert_eq!(record.script, "dispatch.txt");
        assert_eq!(record.nodes, "node07");
    }

    #[test]
    fn pending_node_list_keeps_both_words() {
        let record = parse_record("90 PENDING job.sh None assigned")
            .expect("valid line")
            .expect("record");
        assert_eq!(record.nodes, "None assigned");
        assert_eq!(record.assigned_nodes(), None);
    }

    #[test]
    fn array_parent_is_skipped() {
        assert_eq!(parse_record("42_[0-15]|PENDING|dispatch.txt|None assigned"), Ok(None));
    }

    #[test]
    fn malformed_records_report_reason() {
        assert_eq!(
            parse_record("abc|FAILED|x.sh|node1"),
            Err(RecordParseError::InvalidJobId("abc".to_string()))
        );
        assert_eq!(
            parse_record("12_x|FAILED|x.sh|node1"),
            Err(RecordParseError::InvalidTaskIndex("x".to_string()))
        );
        assert_eq!(
            parse_record("12 FAILED"),
            Err(RecordParseError::MissingColumns(2))
        );
    }

    #[test]
    fn parse_history_skips_bad_lines_without_aborting() {
        let output = "\n100|TIMEOUT|job1.sh|nodeA\nbogus\n42_[1-2]|PENDING|d.txt|None\n101|FAILED|job2.sh|nodeB\n";
        let records = parse_history(output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].script, "job1.sh");
        assert_eq!(records[1].state, JobState::Failed);
    }
}
