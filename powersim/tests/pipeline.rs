// Pipeline integration tests
//
// Grid → task → aggregate → persistence, with an in-process model standing
// in for the external sampler.

use powersim::aggregate::{aggregate, CellKey};
use powersim::config::{ExecutionConfig, GridConfig, PowerStudyConfig, RandomEffectSds, SimulationParams};
use powersim::covariance::Correlations;
use powersim::datagen::generate;
use powersim::error::FitFailure;
use powersim::fit::{ComputeBudget, ModelHandle, PosteriorSummary, PriorSpec};
use powersim::grid::{build_grid, CancelToken, GridProgress, GridRunner};
use powersim::results::{read_results, ResultWriter};
use powersim::summary::{summarize, BinomialTable};
use powersim::task::derive_seed;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

/// Draws spread evenly around a multiple of the observed interaction contrast.
///
/// The sample contrast of rates is roughly a quarter of the logit-scale
/// interaction near p = 0.5, hence the scaling.
struct ContrastModel {
    priors: PriorSpec,
    fits: AtomicUsize,
    cancel_after_fits: Option<(usize, CancelToken)>,
    fail_every: Option<usize>,
}

impl ContrastModel {
    fn new() -> Self {
        Self {
            priors: PriorSpec::default(),
            fits: AtomicUsize::new(0),
            cancel_after_fits: None,
            fail_every: None,
        }
    }
}

impl ModelHandle for ContrastModel {
    fn fit_or_update(
        &self,
        data: &BinomialTable,
        _budget: &ComputeBudget,
        seed: u64,
    ) -> Result<PosteriorSummary, FitFailure> {
        let n = self.fits.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after_fits {
            if n >= *limit {
                token.cancel();
            }
        }
        if let Some(every) = self.fail_every {
            if seed % every as u64 == 0 {
                return Err(FitFailure::NonConvergence {
                    param: "b.4".to_string(),
                    rhat: 1.2,
                    limit: 1.05,
                });
            }
        }

        let centre = 4.0 * data.interaction_contrast();
        let draws = (0..200)
            .map(|i| [0.0, 0.0, 0.0, centre + (i as f64 - 100.0) * 0.001])
            .collect();
        Ok(PosteriorSummary {
            draws,
            priors: self.priors.clone(),
            diagnostics: vec![],
        })
    }

    fn priors(&self) -> &PriorSpec {
        &self.priors
    }
}

/// Only the interaction is non-zero and participants do not vary
fn noiseless_params() -> SimulationParams {
    SimulationParams {
        intercept: 0.0,
        context: 0.0,
        task: 0.0,
        random_effect_sds: RandomEffectSds::zero(),
        correlations: Correlations::independent(),
    }
}

fn scenario_grid() -> GridConfig {
    GridConfig {
        participant_counts: vec![40],
        trial_counts: vec![100],
        effect_sizes: vec![0.2],
        n_replications: 10,
        decision_threshold: 10.0,
        base_seed: 2024,
    }
}

fn runner(params: SimulationParams, workers: usize, base_seed: u64) -> GridRunner {
    let exec = ExecutionConfig {
        workers: Some(workers),
        cores_per_fit: 1,
        ..ExecutionConfig::default()
    };
    GridRunner::new(params, &exec, ComputeBudget::default(), base_seed).unwrap()
}

// =============================================================================
// End-to-end scenario
// =============================================================================

#[test]
fn test_scenario_datasets_show_positive_contrast() {
    let grid = scenario_grid();
    let params = noiseless_params();

    let contrasts: Vec<f64> = build_grid(&grid)
        .iter()
        .map(|point| {
            let data = generate(
                point.participants,
                point.trials,
                &params.fixed_effects(point.effect_size),
                &params.random_effect_sds,
                &params.correlations,
                derive_seed(grid.base_seed, point),
            )
            .unwrap();
            summarize(&data).interaction_contrast()
        })
        .collect();

    assert_eq!(contrasts.len(), 10);
    let mean = contrasts.iter().sum::<f64>() / contrasts.len() as f64;
    assert!(mean > 0.0, "mean contrast = {}", mean);
}

#[test]
fn test_scenario_grid_run_detects_effect() {
    let grid = scenario_grid();
    let points = build_grid(&grid);
    let model = ContrastModel::new();

    let run = runner(noiseless_params(), 2, grid.base_seed).run(
        &points,
        &model,
        &GridProgress::new(),
        &CancelToken::new(),
        |_, _| {},
    )
    .unwrap();
    assert_eq!(run.results.len(), 10);
    assert_eq!(run.n_failed(), 0);

    let table = aggregate(&run.results, grid.decision_threshold).unwrap();
    assert_eq!(table.cells.len(), 1);

    let cell = &table.cells[0];
    assert_eq!(cell.n_attempted, 10);
    assert_eq!(cell.n_succeeded, 10);
    assert!(cell.one_sided.power >= 0.7, "power = {}", cell.one_sided.power);
}

// =============================================================================
// Failure tolerance, cancellation and persistence
// =============================================================================

#[test]
fn test_failed_replications_are_counted_not_aggregated() {
    let grid = GridConfig {
        participant_counts: vec![10, 20],
        trial_counts: vec![10],
        effect_sizes: vec![0.0, 0.5],
        n_replications: 25,
        ..scenario_grid()
    };
    let points = build_grid(&grid);
    let model = ContrastModel {
        fail_every: Some(4),
        ..ContrastModel::new()
    };

    let run = runner(SimulationParams::default(), 3, 7).run(
        &points,
        &model,
        &GridProgress::new(),
        &CancelToken::new(),
        |_, _| {},
    )
    .unwrap();
    assert_eq!(run.results.len(), points.len());

    let table = aggregate(&run.results, 10.0).unwrap();
    assert_eq!(table.total_attempted, 100);
    assert_eq!(table.total_failed, run.n_failed());

    let succeeded: usize = table.cells.iter().map(|c| c.n_succeeded).sum();
    let failed: usize = table.cells.iter().map(|c| c.n_failed).sum::<usize>()
        + table.empty_cells.iter().map(|c| c.n_attempted).sum::<usize>();
    assert_eq!(succeeded + failed, 100);
    for cell in &table.cells {
        assert_eq!(cell.n_attempted, 25);
        assert_eq!(cell.n_succeeded + cell.n_failed, 25);
    }
}

#[test]
fn test_cancelled_run_streams_and_aggregates_partial_results() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("results.csv");

    let grid = GridConfig {
        participant_counts: vec![10, 20],
        trial_counts: vec![10, 20],
        effect_sizes: vec![0.0, 0.3],
        n_replications: 5,
        ..scenario_grid()
    };
    let points = build_grid(&grid);
    let cancel = CancelToken::new();
    let model = ContrastModel {
        cancel_after_fits: Some((7, cancel.clone())),
        ..ContrastModel::new()
    };
    let progress = GridProgress::new();

    let mut writer = ResultWriter::create(&path).unwrap();
    let run = runner(SimulationParams::default(), 1, 3).run(
        &points,
        &model,
        &progress,
        &cancel,
        |point, result| writer.write(point, result).unwrap(),
    )
    .unwrap();

    assert_eq!(run.results.len(), 7);
    assert_eq!(run.results.len() + run.skipped, points.len());
    assert_eq!(writer.rows(), 7);

    let snap = progress.snapshot();
    assert_eq!(snap.completed, 7);
    assert_eq!(snap.skipped, points.len() - 7);

    // the streamed file aggregates to the same table as the in-memory results
    let from_disk = read_results(&path).unwrap();
    assert_eq!(from_disk.len(), 7);
    let expected = aggregate(&run.results, 10.0).unwrap();
    assert_eq!(aggregate(&from_disk, 10.0).unwrap(), expected);
    assert_eq!(expected.total_attempted, 7);
}

#[test]
fn test_reruns_are_reproducible() {
    let grid = GridConfig {
        participant_counts: vec![15],
        trial_counts: vec![20],
        effect_sizes: vec![0.0, 0.4],
        n_replications: 4,
        ..scenario_grid()
    };
    let points = build_grid(&grid);

    let run_once = |workers| {
        let model = ContrastModel::new();
        let mut results = runner(SimulationParams::default(), workers, 11)
            .run(&points, &model, &GridProgress::new(), &CancelToken::new(), |_, _| {})
            .unwrap()
            .results;
        results.sort_by(|(a, _), (b, _)| {
            CellKey::from(a)
                .cmp(&CellKey::from(b))
                .then(a.replication.cmp(&b.replication))
        });
        results
    };

    assert_eq!(run_once(1), run_once(3));
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_config_file_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("powersim.json");

    let mut config = PowerStudyConfig::default();
    config.grid = scenario_grid();
    config.execution.workers = Some(2);
    config.write_json_file(&path).unwrap();

    let loaded = PowerStudyConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded, config);
    assert!(loaded.validate().is_ok());
    assert_eq!(loaded.grid.n_points(), 10);
}
