//! Persistence of raw task results and power tables
//!
//! Raw results are a flat CSV, one row per completed replication:
//!
//! ```text
//! participant_count,trial_count,effect_size,replication_id,two_sided_ratio,one_sided_ratio,status,error
//! 40,100,0.2,0,31.4,inf,ok,
//! 40,100,0.2,1,NA,NA,failed,fit failed: sampler failed: chain 2 exited with status 70
//! ```
//!
//! Rows are flushed as they are written, so an interrupted run leaves a
//! readable partial file.

use crate::aggregate::PowerTable;
use crate::error::TaskFailure;
use crate::hypothesis::EvidenceRatios;
use crate::task::{DesignPoint, TaskResult};
use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const RESULTS_HEADER: &str = "participant_count,trial_count,effect_size,replication_id,two_sided_ratio,one_sided_ratio,status,error";

const POWER_HEADER: &str = "participant_count,trial_count,effect_size,n_attempted,n_succeeded,n_failed,two_sided_detections,two_sided_power,two_sided_se,one_sided_detections,one_sided_power,one_sided_se";

const MISSING: &str = "NA";

fn format_ratio(ratio: f64) -> String {
    if ratio.is_infinite() {
        "inf".to_string()
    } else {
        ratio.to_string()
    }
}

/// Error messages share the row with comma-separated fields
fn sanitize(message: &str) -> String {
    message
        .chars()
        .map(|c| match c {
            ',' => ';',
            '\n' | '\r' => ' ',
            c => c,
        })
        .collect()
}

fn format_row(point: &DesignPoint, result: &TaskResult) -> String {
    let (two, one, status, error) = match result {
        Ok(r) => (
            format_ratio(r.two_sided),
            format_ratio(r.one_sided),
            "ok",
            String::new(),
        ),
        Err(e) => (
            MISSING.to_string(),
            MISSING.to_string(),
            "failed",
            sanitize(&e.to_string()),
        ),
    };
    format!(
        "{},{},{},{},{},{},{},{}",
        point.participants, point.trials, point.effect_size, point.replication, two, one, status, error
    )
}

/// Streaming writer for raw results
pub struct ResultWriter {
    path: PathBuf,
    out: BufWriter<File>,
    rows: usize,
}

impl ResultWriter {
    /// Create (or truncate) `path` and write the header
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create results file: {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{}", RESULTS_HEADER)?;
        out.flush()?;

        Ok(Self {
            path: path.to_path_buf(),
            out,
            rows: 0,
        })
    }

    pub fn write(&mut self, point: &DesignPoint, result: &TaskResult) -> Result<()> {
        writeln!(self.out, "{}", format_row(point, result))
            .and_then(|_| self.out.flush())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write a complete result set in one go
pub fn write_results(path: &Path, results: &[(DesignPoint, TaskResult)]) -> Result<()> {
    let mut writer = ResultWriter::create(path)?;
    for (point, result) in results {
        writer.write(point, result)?;
    }
    Ok(())
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &str, line: usize) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    field
        .trim()
        .parse()
        .with_context(|| format!("line {}: invalid {} '{}'", line, name, field))
}

fn parse_row(line: &str, line_no: usize) -> Result<(DesignPoint, TaskResult)> {
    // The error message is last and may be empty
    let fields: Vec<&str> = line.splitn(8, ',').collect();
    if fields.len() < 7 {
        bail!("line {}: expected 8 columns, found {}", line_no, fields.len());
    }

    let point = DesignPoint {
        participants: parse_field(fields[0], "participant_count", line_no)?,
        trials: parse_field(fields[1], "trial_count", line_no)?,
        effect_size: parse_field(fields[2], "effect_size", line_no)?,
        replication: parse_field(fields[3], "replication_id", line_no)?,
    };

    let result = match fields[6].trim() {
        "ok" => Ok(EvidenceRatios {
            two_sided: parse_field(fields[4], "two_sided_ratio", line_no)?,
            one_sided: parse_field(fields[5], "one_sided_ratio", line_no)?,
        }),
        "failed" => {
            let message = fields.get(7).map(|m| m.trim()).unwrap_or("");
            Err(TaskFailure::Recorded(message.to_string()))
        }
        other => bail!("line {}: unknown status '{}'", line_no, other),
    };

    Ok((point, result))
}

/// Read a raw results CSV back for re-aggregation
pub fn read_results(path: &Path) -> Result<Vec<(DesignPoint, TaskResult)>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open results file: {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    match lines.next() {
        Some(header) => {
            let header = header?;
            if header.trim() != RESULTS_HEADER {
                bail!("{}: unexpected header '{}'", path.display(), header);
            }
        }
        None => bail!("{}: empty results file", path.display()),
    }

    let mut results = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        results.push(parse_row(&line, i + 2)?);
    }
    Ok(results)
}

/// Power table as CSV; cells without successful replications get NA power
pub fn write_power_table_csv(path: &Path, table: &PowerTable) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create power table: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{}", POWER_HEADER)?;

    for cell in &table.cells {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{:.4},{:.4},{},{:.4},{:.4}",
            cell.key.participants,
            cell.key.trials,
            cell.key.effect_size,
            cell.n_attempted,
            cell.n_succeeded,
            cell.n_failed,
            cell.two_sided.detections,
            cell.two_sided.power,
            cell.two_sided.std_error,
            cell.one_sided.detections,
            cell.one_sided.power,
            cell.one_sided.std_error
        )?;
    }
    for empty in &table.empty_cells {
        writeln!(
            out,
            "{},{},{},{},0,{},{m},{m},{m},{m},{m},{m}",
            empty.key.participants,
            empty.key.trials,
            empty.key.effect_size,
            empty.n_attempted,
            empty.n_attempted,
            m = MISSING
        )?;
    }

    out.flush()?;
    Ok(())
}

pub fn write_power_table_json(path: &Path, table: &PowerTable) -> Result<()> {
    let json = serde_json::to_string_pretty(table).context("Failed to serialize power table")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write power table: {}", path.display()))
}

pub fn print_power_table(table: &PowerTable) {
    println!("\n{}", "=".repeat(80));
    println!("Power Summary (evidence ratio >= {})", table.threshold);
    println!("{}", "=".repeat(80));

    println!(
        "\n{:>6} {:>6} {:>8} {:>9} {:>10} {:>8} {:>10} {:>8}",
        "N", "Trials", "Effect", "OK/Total", "Two-sided", "SE", "One-sided", "SE"
    );
    println!("{}", "-".repeat(80));

    for cell in &table.cells {
        println!(
            "{:>6} {:>6} {:>8.3} {:>9} {:>10.3} {:>8.3} {:>10.3} {:>8.3}",
            cell.key.participants,
            cell.key.trials,
            cell.key.effect_size,
            format!("{}/{}", cell.n_succeeded, cell.n_attempted),
            cell.two_sided.power,
            cell.two_sided.std_error,
            cell.one_sided.power,
            cell.one_sided.std_error
        );
    }

    println!("\n{}", "=".repeat(80));
    println!(
        "Replications: {} attempted, {} failed",
        table.total_attempted, table.total_failed
    );

    if !table.empty_cells.is_empty() {
        println!("\n⚠ Cells with no successful replications (no power estimate):");
        for empty in &table.empty_cells {
            println!("  {} ({} attempted)", empty.key, empty.n_attempted);
        }
    }
}
