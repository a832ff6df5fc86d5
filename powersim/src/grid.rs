//! Design grid runner
//!
//! Expands the grid into independent design points and runs one
//! simulation-fit task per point on a bounded rayon pool. Results are sent
//! back to the calling thread as they complete, so persistence and progress
//! reporting happen in one place while fits run in parallel.

use crate::config::{ExecutionConfig, GridConfig, SimulationParams};
use crate::error::InputError;
use crate::fit::{ComputeBudget, ModelHandle};
use crate::task::{run_task, DesignPoint, TaskResult};
use anyhow::{Context, Result};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Cartesian product of the grid axes with replication innermost
pub fn build_grid(grid: &GridConfig) -> Vec<DesignPoint> {
    let mut points = Vec::with_capacity(grid.n_points());
    for &participants in &grid.participant_counts {
        for &trials in &grid.trial_counts {
            for &effect in &grid.effect_sizes {
                // -0.0 and 0.0 must share a cell key and a seed
                let effect_size = if effect == 0.0 { 0.0 } else { effect };
                for replication in 0..grid.n_replications {
                    points.push(DesignPoint {
                        participants,
                        trials,
                        effect_size,
                        replication,
                    });
                }
            }
        }
    }
    points
}

/// Shared stop flag for a grid run
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancel once `limit` has elapsed, from a detached timer thread
    pub fn cancel_after(&self, limit: Duration) {
        let token = self.clone();
        thread::spawn(move || {
            thread::sleep(limit);
            if !token.is_cancelled() {
                warn!(limit_secs = limit.as_secs_f64(), "time limit reached, stopping dispatch");
                token.cancel();
            }
        });
    }
}

#[derive(Debug)]
struct ProgressInner {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    started: Instant,
}

/// Progress counters readable from any thread while a run is in flight
#[derive(Debug, Clone)]
pub struct GridProgress {
    inner: Arc<ProgressInner>,
}

/// Point-in-time copy of the progress counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed + self.skipped)
    }

    /// Linear extrapolation from the mean time per completed task
    pub fn eta(&self) -> Option<Duration> {
        if self.completed == 0 {
            return None;
        }
        let per_task = self.elapsed.as_secs_f64() / self.completed as f64;
        Some(Duration::from_secs_f64(per_task * self.remaining() as f64))
    }
}

impl Default for GridProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl GridProgress {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                total: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                skipped: AtomicUsize::new(0),
                started: Instant::now(),
            }),
        }
    }

    fn set_total(&self, total: usize) {
        self.inner.total.store(total, Ordering::Relaxed);
    }

    fn record(&self, result: &TaskResult) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_skip(&self) {
        self.inner.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.inner.total.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            skipped: self.inner.skipped.load(Ordering::Relaxed),
            elapsed: self.inner.started.elapsed(),
        }
    }
}

/// Outcome of a grid run, possibly partial
#[derive(Debug, Clone)]
pub struct GridRun {
    /// Completed tasks in completion order
    pub results: Vec<(DesignPoint, TaskResult)>,
    /// Tasks never started because the run was cancelled
    pub skipped: usize,
    pub elapsed: Duration,
}

impl GridRun {
    pub fn n_failed(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_err()).count()
    }
}

/// Runs design points on a fixed-size worker pool
pub struct GridRunner {
    params: SimulationParams,
    budget: ComputeBudget,
    base_seed: u64,
    log_every: usize,
    workers: usize,
    pool: ThreadPool,
}

impl GridRunner {
    pub fn new(
        params: SimulationParams,
        exec: &ExecutionConfig,
        budget: ComputeBudget,
        base_seed: u64,
    ) -> Result<Self> {
        params.validate()?;
        budget.validate()?;

        let workers = exec.workers_for_host();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("powersim-worker-{}", i))
            .build()
            .context("Failed to build worker pool")?;

        Ok(Self {
            params,
            budget,
            base_seed,
            log_every: exec.log_every.max(1),
            workers,
            pool,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every point once.
    ///
    /// `on_result` is called on the calling thread for each completed task,
    /// in completion order. A failed task is reported like any other result
    /// and never stops the run. Malformed points are rejected before any
    /// task starts.
    pub fn run<F>(
        &self,
        points: &[DesignPoint],
        model: &dyn ModelHandle,
        progress: &GridProgress,
        cancel: &CancelToken,
        mut on_result: F,
    ) -> Result<GridRun, InputError>
    where
        F: FnMut(&DesignPoint, &TaskResult),
    {
        check_points(points)?;

        let started = Instant::now();
        progress.set_total(points.len());

        if points.iter().any(|p| p.effect_size < 0.0) {
            warn!("grid contains negative effect sizes; the directional test assumes effects >= 0");
        }

        info!(
            tasks = points.len(),
            workers = self.workers,
            chains_per_fit = self.budget.parallel_chains,
            "starting grid run"
        );

        let mut results = Vec::with_capacity(points.len());
        let mut skipped = 0;

        // None marks a point that was never started
        let (tx, rx) = mpsc::channel::<(DesignPoint, Option<TaskResult>)>();

        thread::scope(|scope| {
            scope.spawn(move || {
                self.pool.install(|| {
                    points.par_iter().for_each_with(tx, |tx, point| {
                        let outcome = if cancel.is_cancelled() {
                            None
                        } else {
                            Some(run_task(
                                point,
                                &self.params,
                                model,
                                &self.budget,
                                self.base_seed,
                            ))
                        };
                        // receiver lives until every sender is dropped
                        let _ = tx.send((*point, outcome));
                    });
                });
            });

            for (point, outcome) in rx {
                let result = match outcome {
                    Some(result) => result,
                    None => {
                        skipped += 1;
                        progress.record_skip();
                        continue;
                    }
                };

                if let Err(e) = &result {
                    warn!(%point, error = %e, "task failed");
                }
                progress.record(&result);
                on_result(&point, &result);
                results.push((point, result));

                let snap = progress.snapshot();
                if snap.completed % self.log_every == 0 {
                    info!(
                        completed = snap.completed,
                        total = snap.total,
                        failed = snap.failed,
                        elapsed_secs = snap.elapsed.as_secs(),
                        eta_secs = snap.eta().map(|d| d.as_secs()),
                        "progress"
                    );
                }
            }
        });

        let run = GridRun {
            results,
            skipped,
            elapsed: started.elapsed(),
        };

        if run.skipped > 0 {
            warn!(
                completed = run.results.len(),
                skipped = run.skipped,
                "grid run cancelled before completion"
            );
        }
        info!(
            completed = run.results.len(),
            failed = run.n_failed(),
            elapsed_secs = run.elapsed.as_secs_f64(),
            "grid run finished"
        );

        Ok(run)
    }
}

fn check_points(points: &[DesignPoint]) -> Result<(), InputError> {
    for point in points {
        if point.participants == 0 {
            return Err(InputError::NonPositiveCount {
                name: "participants",
                value: 0,
            });
        }
        if point.trials == 0 {
            return Err(InputError::NonPositiveCount {
                name: "trials per cell",
                value: 0,
            });
        }
        if !point.effect_size.is_finite() {
            return Err(InputError::NonFinite {
                name: "effect size",
                value: point.effect_size,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::Correlations;
    use crate::error::FitFailure;
    use crate::fit::{PosteriorSummary, PriorSpec};
    use crate::summary::BinomialTable;

    /// Posterior centred on the observed contrast; fails for 20-participant datasets
    struct StubModel {
        priors: PriorSpec,
        fits: AtomicUsize,
        cancel_at: Option<(usize, CancelToken)>,
    }

    impl StubModel {
        fn new() -> Self {
            Self {
                priors: PriorSpec::default(),
                fits: AtomicUsize::new(0),
                cancel_at: None,
            }
        }
    }

    impl ModelHandle for StubModel {
        fn fit_or_update(
            &self,
            data: &BinomialTable,
            _budget: &ComputeBudget,
            _seed: u64,
        ) -> Result<PosteriorSummary, FitFailure> {
            let n = self.fits.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((limit, token)) = &self.cancel_at {
                if n >= *limit {
                    token.cancel();
                }
            }
            if data.n_participants == 20 {
                return Err(FitFailure::SamplerFailed("stub".to_string()));
            }
            let centre = data.interaction_contrast();
            let draws = (0..100)
                .map(|i| [0.0, 0.0, 0.0, centre + (i as f64 - 50.0) * 0.01])
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

    fn small_grid() -> GridConfig {
        GridConfig {
            participant_counts: vec![10, 20],
            trial_counts: vec![10],
            effect_sizes: vec![0.0, 0.5],
            n_replications: 3,
            decision_threshold: 10.0,
            base_seed: 1,
        }
    }

    fn runner(workers: usize) -> GridRunner {
        let exec = ExecutionConfig {
            workers: Some(workers),
            ..ExecutionConfig::default()
        };
        GridRunner::new(SimulationParams::default(), &exec, ComputeBudget::default(), 1).unwrap()
    }

    #[test]
    fn test_build_grid_order_and_size() {
        let grid = small_grid();
        let points = build_grid(&grid);
        assert_eq!(points.len(), grid.n_points());
        assert_eq!(points.len(), 12);
        assert_eq!(
            points[0],
            DesignPoint {
                participants: 10,
                trials: 10,
                effect_size: 0.0,
                replication: 0
            }
        );
        assert_eq!(points[3].effect_size, 0.5);
        assert_eq!(points[6].participants, 20);
    }

    #[test]
    fn test_build_grid_folds_negative_zero() {
        let grid = GridConfig {
            effect_sizes: vec![-0.0, 0.0],
            ..small_grid()
        };
        let points = build_grid(&grid);
        assert!(points.iter().all(|p| p.effect_size.to_bits() == 0.0f64.to_bits()));
    }

    #[test]
    fn test_invalid_params_rejected_at_construction() {
        let params = SimulationParams {
            correlations: Correlations([0.9, 0.9, 0.0, -0.9, 0.0, 0.0]),
            ..SimulationParams::default()
        };
        let err = GridRunner::new(params, &ExecutionConfig::default(), ComputeBudget::default(), 1)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<InputError>(),
            Some(InputError::CorrelationNotPsd { .. })
        ));

        let budget = ComputeBudget {
            chains: 0,
            ..ComputeBudget::default()
        };
        let err = GridRunner::new(SimulationParams::default(), &ExecutionConfig::default(), budget, 1)
            .err()
            .unwrap();
        assert!(err.downcast_ref::<InputError>().is_some());
    }

    #[test]
    fn test_malformed_points_rejected_before_dispatch() {
        let model = StubModel::new();
        let progress = GridProgress::new();
        let mut points = build_grid(&small_grid());
        points[5].trials = 0;

        let err = runner(2)
            .run(&points, &model, &progress, &CancelToken::new(), |_, _| {})
            .unwrap_err();
        assert_eq!(
            err,
            InputError::NonPositiveCount {
                name: "trials per cell",
                value: 0
            }
        );
        assert_eq!(model.fits.load(Ordering::SeqCst), 0);
        assert_eq!(progress.snapshot().completed, 0);
    }

    #[test]
    fn test_failures_do_not_abort_run() {
        let points = build_grid(&small_grid());
        let model = StubModel::new();
        let progress = GridProgress::new();
        let mut seen = 0;

        let run = runner(2)
            .run(&points, &model, &progress, &CancelToken::new(), |_, _| seen += 1)
            .unwrap();

        assert_eq!(run.results.len(), 12);
        assert_eq!(run.skipped, 0);
        assert_eq!(seen, 12);
        assert_eq!(run.n_failed(), 6);
        for (point, result) in &run.results {
            assert_eq!(result.is_err(), point.participants == 20);
        }

        let snap = progress.snapshot();
        assert_eq!(snap.completed, 12);
        assert_eq!(snap.failed, 6);
        assert_eq!(snap.remaining(), 0);
    }

    #[test]
    fn test_results_independent_of_worker_count() {
        let points = build_grid(&small_grid());
        let model = StubModel::new();

        let mut one = runner(1)
            .run(&points, &model, &GridProgress::new(), &CancelToken::new(), |_, _| {})
            .unwrap()
            .results;
        let mut four = runner(4)
            .run(&points, &model, &GridProgress::new(), &CancelToken::new(), |_, _| {})
            .unwrap()
            .results;

        let key = |(p, _): &(DesignPoint, TaskResult)| {
            (p.participants, p.replication, p.effect_size.to_bits())
        };
        one.sort_by_key(key);
        four.sort_by_key(key);
        assert_eq!(one, four);
    }

    #[test]
    fn test_cancelled_before_start() {
        let points = build_grid(&small_grid());
        let cancel = CancelToken::new();
        cancel.cancel();

        let run = runner(2)
            .run(&points, &StubModel::new(), &GridProgress::new(), &cancel, |_, _| {})
            .unwrap();
        assert!(run.results.is_empty());
        assert_eq!(run.skipped, points.len());
    }

    #[test]
    fn test_cancel_mid_run_keeps_completed() {
        let points = build_grid(&small_grid());
        let cancel = CancelToken::new();
        let model = StubModel {
            cancel_at: Some((3, cancel.clone())),
            ..StubModel::new()
        };

        let run = runner(1)
            .run(&points, &model, &GridProgress::new(), &cancel, |_, _| {})
            .unwrap();
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.results.len() + run.skipped, points.len());
    }

    #[test]
    fn test_eta() {
        let snap = ProgressSnapshot {
            total: 10,
            completed: 2,
            failed: 0,
            skipped: 0,
            elapsed: Duration::from_secs(4),
        };
        assert_eq!(snap.remaining(), 8);
        assert_eq!(snap.eta(), Some(Duration::from_secs(16)));
    }
}
