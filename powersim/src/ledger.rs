// Run ledger
//
// Append-only, line-delimited JSON record of every grid run and
// re-aggregation: what was run, with which configuration, and where the
// outputs went.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Unique identifier for a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> anyhow::Result<Self> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunKind {
    /// Full simulate-and-fit grid run
    Grid,
    /// Power table recomputed from a stored results file
    Reaggregate,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Grid => "grid",
            RunKind::Reaggregate => "reaggregate",
        }
    }
}

/// Task counts of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Complete record of a single run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Configuration snapshot as JSON
    pub config: serde_json::Value,
    pub counts: RunCounts,

    /// Files written by this run
    pub outputs: Vec<String>,
}

impl RunRecord {
    pub fn new(kind: RunKind) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            kind,
            started_at: now,
            finished_at: now,
            config: serde_json::json!({}),
            counts: RunCounts::default(),
            outputs: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_counts(mut self, counts: RunCounts) -> Self {
        self.counts = counts;
        self
    }

    pub fn with_output(mut self, path: &Path) -> Self {
        self.outputs.push(path.display().to_string());
        self
    }

    pub fn set_finished(&mut self) {
        self.finished_at = Utc::now();
    }

    /// True when the run stopped before every task was dispatched
    pub fn is_partial(&self) -> bool {
        self.counts.skipped > 0
    }
}

/// Ledger storage backed by a JSONL file
#[derive(Debug, Clone)]
pub struct RunLedger {
    root: PathBuf,
    runs_path: PathBuf,
}

impl RunLedger {
    pub fn new(root: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)?;
        let runs_path = root.join("runs.jsonl");
        Ok(Self { root, runs_path })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append a run record to runs.jsonl
    pub fn log_run(&self, run: &RunRecord) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.runs_path)?;

        let line = serde_json::to_string(run)?;
        writeln!(file, "{}", line)?;
        file.flush()?;

        Ok(())
    }

    /// Load all run records; malformed lines are skipped with a warning
    pub fn load_runs(&self) -> anyhow::Result<Vec<RunRecord>> {
        if !self.runs_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.runs_path)?;
        let reader = BufReader::new(file);

        let mut runs = Vec::new();
        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<RunRecord>(&line) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!(line = line_num + 1, error = %e, "skipping malformed run record");
                }
            }
        }

        Ok(runs)
    }

    pub fn find_run(&self, id: RunId) -> anyhow::Result<Option<RunRecord>> {
        let runs = self.load_runs()?;
        Ok(runs.into_iter().find(|r| r.id == id))
    }

    /// Most recent `n` runs, newest first
    pub fn recent_runs(&self, n: usize) -> anyhow::Result<Vec<RunRecord>> {
        let mut runs = self.load_runs()?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(n);
        Ok(runs)
    }
}
