//! CmdStan backend for the model fit adapter
//!
//! This module provides functionality to:
//! - Detect a cmdstan installation
//! - Compile the hierarchical binomial model once
//! - Re-run the compiled executable on new data, chains in parallel
//! - Parse chain CSV output into a `PosteriorSummary`

use super::diagnostics::compute_diagnostics;
use super::{ComputeBudget, ModelHandle, PosteriorSummary, PriorSpec};
use crate::error::FitFailure;
use crate::summary::BinomialTable;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Binomial-logit model with correlated participant effects on all four terms.
///
/// Priors are passed as data so one compiled executable serves any prior spec.
pub const STAN_PROGRAM: &str = r#"data {
  int<lower=1> N;
  int<lower=1> J;
  array[N] int<lower=1, upper=J> participant;
  vector[N] context;
  vector[N] task;
  array[N] int<lower=0> successes;
  array[N] int<lower=1> trials;
  vector<lower=0>[4] prior_b_sd;
  real<lower=0> prior_tau_scale;
  real<lower=0> prior_lkj_eta;
}
transformed data {
  matrix[N, 4] X;
  for (n in 1:N) {
    X[n] = [1, context[n], task[n], context[n] * task[n]];
  }
}
parameters {
  vector[4] b;
  vector<lower=0>[4] tau;
  cholesky_factor_corr[4] L_rho;
  matrix[4, J] z;
}
transformed parameters {
  matrix[J, 4] r = (diag_pre_multiply(tau, L_rho) * z)';
}
model {
  vector[N] eta = X * b + rows_dot_product(X, r[participant]);
  b ~ normal(0, prior_b_sd);
  tau ~ student_t(3, 0, prior_tau_scale);
  L_rho ~ lkj_corr_cholesky(prior_lkj_eta);
  to_vector(z) ~ std_normal();
  successes ~ binomial_logit(trials, eta);
}
"#;

const MODEL_NAME: &str = "binomial_glmm";

/// Locate a cmdstan installation.
///
/// `$CMDSTAN` wins when it names an existing directory. Otherwise the usual
/// install roots are searched and the highest versioned subdirectory of the
/// first root found is returned.
pub fn detect_cmdstan() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os("CMDSTAN").map(PathBuf::from) {
        if path.is_dir() {
            return Ok(path);
        }
        debug!(path = %path.display(), "CMDSTAN does not name a directory");
    }

    let mut roots = Vec::new();
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".cmdstan"));
        roots.push(home.join("cmdstan"));
    }
    roots.push(PathBuf::from("/usr/local/cmdstan"));
    roots.push(PathBuf::from("/opt/cmdstan"));

    roots
        .iter()
        .filter(|root| root.is_dir())
        .find_map(|root| latest_version_dir(root))
        .context("cmdstan not found; install it or set CMDSTAN")
}

fn latest_version_dir(root: &Path) -> Option<PathBuf> {
    fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .max()
}

/// Write the Stan program to `path`
pub fn write_stan_program(path: &Path) -> Result<()> {
    fs::write(path, STAN_PROGRAM)
        .with_context(|| format!("Failed to write Stan program: {}", path.display()))
}

/// Build `stan_file` with cmdstan's make, unless the executable next to it
/// is newer than the program
pub fn compile_stan_model(stan_file: &Path, cmdstan_path: &Path) -> Result<PathBuf> {
    let exe_path = stan_file.with_extension("");
    if is_up_to_date(&exe_path, stan_file)? {
        debug!(exe = %exe_path.display(), "reusing compiled model");
        return Ok(exe_path);
    }

    info!(model = %stan_file.display(), "compiling Stan model");
    let output = Command::new("make")
        .current_dir(cmdstan_path)
        .arg(&exe_path)
        .output()
        .with_context(|| format!("Failed to run make in {}", cmdstan_path.display()))?;
    if !output.status.success() {
        bail!(
            "Stan compilation failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    info!(exe = %exe_path.display(), "model compiled");
    Ok(exe_path)
}

fn is_up_to_date(exe_path: &Path, stan_file: &Path) -> Result<bool> {
    if !exe_path.exists() {
        return Ok(false);
    }
    let built = fs::metadata(exe_path)?.modified()?;
    let edited = fs::metadata(stan_file)?.modified()?;
    Ok(built > edited)
}

/// Compiled CmdStan executable for the binomial model.
///
/// Immutable after construction; every fit works in its own temporary
/// directory under `scratch_root`.
#[derive(Debug, Clone)]
pub struct CmdStanModel {
    exe_path: PathBuf,
    scratch_root: PathBuf,
    priors: PriorSpec,
}

impl CmdStanModel {
    /// Write and compile the model under `model_dir`
    pub fn compile(model_dir: &Path, cmdstan_path: &Path, priors: PriorSpec) -> Result<Self> {
        fs::create_dir_all(model_dir).with_context(|| {
            format!("Failed to create model directory: {}", model_dir.display())
        })?;

        let model_dir = model_dir
            .canonicalize()
            .with_context(|| format!("Invalid model directory: {}", model_dir.display()))?;
        let stan_file = model_dir.join(format!("{}.stan", MODEL_NAME));

        // Rewriting an identical program would force a rebuild
        let current = fs::read_to_string(&stan_file).unwrap_or_default();
        if current != STAN_PROGRAM {
            write_stan_program(&stan_file)?;
        }

        let exe_path = compile_stan_model(&stan_file, cmdstan_path)?;
        Self::from_executable(exe_path, model_dir.join("fits"), priors)
    }

    /// Wrap an already-compiled executable
    pub fn from_executable(
        exe_path: PathBuf,
        scratch_root: PathBuf,
        priors: PriorSpec,
    ) -> Result<Self> {
        if !exe_path.exists() {
            bail!("Stan executable not found: {}", exe_path.display());
        }
        fs::create_dir_all(&scratch_root).with_context(|| {
            format!("Failed to create scratch directory: {}", scratch_root.display())
        })?;
        Ok(Self {
            exe_path,
            scratch_root,
            priors,
        })
    }

    pub fn exe_path(&self) -> &Path {
        &self.exe_path
    }

    fn data_json(&self, data: &BinomialTable) -> serde_json::Value {
        let mut json = data.to_stan_json();
        json["prior_b_sd"] = serde_json::json!(self.priors.fixed_sd);
        json["prior_tau_scale"] = serde_json::json!(self.priors.tau_scale);
        json["prior_lkj_eta"] = serde_json::json!(self.priors.lkj_eta);
        json
    }

    fn chain_command(
        &self,
        data_file: &Path,
        output_file: &Path,
        chain_id: usize,
        budget: &ComputeBudget,
        seed: u32,
    ) -> Command {
        let mut cmd = Command::new(&self.exe_path);
        cmd.arg("sample")
            .arg(format!("num_warmup={}", budget.warmup))
            .arg(format!("num_samples={}", budget.samples))
            .arg("adapt")
            .arg(format!("delta={}", budget.adapt_delta))
            .arg("algorithm=hmc")
            .arg("engine=nuts")
            .arg(format!("max_depth={}", budget.max_treedepth))
            .arg(format!("id={}", chain_id))
            .arg("data")
            .arg(format!("file={}", data_file.display()))
            .arg("random")
            .arg(format!("seed={}", seed))
            .arg("output")
            .arg(format!("file={}", output_file.display()))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl ModelHandle for CmdStanModel {
    fn fit_or_update(
        &self,
        data: &BinomialTable,
        budget: &ComputeBudget,
        seed: u64,
    ) -> Result<PosteriorSummary, FitFailure> {
        let workdir = tempfile::Builder::new()
            .prefix("fit-")
            .tempdir_in(&self.scratch_root)?;

        let data_file = workdir.path().join("data.json");
        let json = serde_json::to_string(&self.data_json(data))
            .map_err(|e| FitFailure::Io(e.to_string()))?;
        fs::write(&data_file, json)?;

        let chain_files: Vec<PathBuf> = (1..=budget.chains)
            .map(|id| workdir.path().join(format!("output_{}.csv", id)))
            .collect();

        // CmdStan seeds are 32-bit
        let base_seed = (seed % u64::from(u32::MAX - budget.chains as u32)) as u32;

        let chain_ids: Vec<usize> = (1..=budget.chains).collect();
        for batch in chain_ids.chunks(budget.parallel_chains.max(1)) {
            let mut running: Vec<(usize, Child)> = Vec::with_capacity(batch.len());
            for &chain_id in batch {
                let spawned = self
                    .chain_command(
                        &data_file,
                        &chain_files[chain_id - 1],
                        chain_id,
                        budget,
                        base_seed + chain_id as u32,
                    )
                    .spawn();
                match spawned {
                    Ok(child) => running.push((chain_id, child)),
                    Err(e) => {
                        stop_chains(running);
                        return Err(FitFailure::SamplerFailed(format!(
                            "failed to start chain {}: {}",
                            chain_id, e
                        )));
                    }
                }
            }

            let mut pending = running.into_iter();
            while let Some((chain_id, child)) = pending.next() {
                let failure = match child.wait_with_output() {
                    Ok(output) if output.status.success() => continue,
                    Ok(output) => FitFailure::SamplerFailed(format!(
                        "chain {} failed: {}",
                        chain_id,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )),
                    Err(e) => FitFailure::from(e),
                };
                // siblings must not outlive the fit or its working directory
                stop_chains(pending);
                return Err(failure);
            }
        }

        let samples = parse_stan_output(&chain_files)?;
        summarize_fixed_effects(&samples, &self.priors, budget.max_rhat)
    }

    fn priors(&self) -> &PriorSpec {
        &self.priors
    }
}

/// Kill and reap chains that are still running
fn stop_chains(chains: impl IntoIterator<Item = (usize, Child)>) {
    for (chain_id, mut child) in chains {
        // kill only fails when the chain has already exited
        let _ = child.kill();
        if let Err(e) = child.wait() {
            warn!(chain = chain_id, error = %e, "failed to reap sampler chain");
        }
    }
}

/// Parse Stan CSV output files into parameter name -> per-chain samples
pub fn parse_stan_output(
    chain_files: &[PathBuf],
) -> Result<HashMap<String, Vec<Vec<f64>>>, FitFailure> {
    let mut all_samples: HashMap<String, Vec<Vec<f64>>> = HashMap::new();

    for chain_file in chain_files {
        let content = fs::read_to_string(chain_file)?;
        parse_chain_csv(&content, &mut all_samples)?;
    }

    Ok(all_samples)
}

/// Parse one chain's CSV, appending a chain to every column in `samples`
pub fn parse_chain_csv(
    content: &str,
    samples: &mut HashMap<String, Vec<Vec<f64>>>,
) -> Result<(), FitFailure> {
    let mut lines = content.lines().filter(|l| !l.starts_with('#'));

    let header = lines
        .next()
        .ok_or_else(|| FitFailure::OutputParse("missing header line".to_string()))?;
    let names: Vec<&str> = header.split(',').map(|s| s.trim()).collect();

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); names.len()];

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }

        let values: Vec<f64> = line
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();

        if values.len() != names.len() {
            continue; // Skip malformed lines
        }

        for (column, value) in columns.iter_mut().zip(values) {
            column.push(value);
        }
    }

    for (name, column) in names.into_iter().zip(columns) {
        samples.entry(name.to_string()).or_default().push(column);
    }

    Ok(())
}

/// Collect fixed-effect draws, compute diagnostics and check convergence
pub fn summarize_fixed_effects(
    samples: &HashMap<String, Vec<Vec<f64>>>,
    priors: &PriorSpec,
    max_rhat: f64,
) -> Result<PosteriorSummary, FitFailure> {
    let mut diagnostics = Vec::with_capacity(4);
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(4);

    for k in 1..=4 {
        let name = format!("b.{}", k);
        let chains = samples
            .get(&name)
            .ok_or_else(|| FitFailure::NoDraws(name.clone()))?;

        let diag = compute_diagnostics(&name, chains)?;
        if !(diag.rhat <= max_rhat) {
            return Err(FitFailure::NonConvergence {
                param: name,
                rhat: diag.rhat,
                limit: max_rhat,
            });
        }
        diagnostics.push(diag);
        columns.push(chains.iter().flatten().copied().collect());
    }

    let n_draws = columns.iter().map(|c| c.len()).min().unwrap_or(0);
    if n_draws == 0 {
        return Err(FitFailure::NoDraws("b".to_string()));
    }

    let draws = (0..n_draws)
        .map(|i| [columns[0][i], columns[1][i], columns[2][i], columns[3][i]])
        .collect();

    Ok(PosteriorSummary {
        draws,
        priors: priors.clone(),
        diagnostics,
    })
}
