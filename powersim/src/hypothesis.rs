//! Evidence ratios for linear hypotheses on the fixed effects
//!
//! - Directional hypotheses (`θ > c`): posterior odds P(θ > c) / P(θ ≤ c)
//! - Point hypotheses (`θ ≠ c` vs `θ = c`): Savage-Dickey density ratio,
//!   prior density at c over posterior density at c
//!
//! θ is a linear combination `w · b` of the four fixed effects.

use crate::error::TaskFailure;
use crate::fit::PosteriorSummary;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Kind of hypothesis tested against its complement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HypothesisKind {
    /// θ ≠ rhs versus θ = rhs
    PointNull,
    /// θ > rhs versus θ ≤ rhs
    Greater,
}

/// Linear hypothesis over (intercept, context, task, interaction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearHypothesis {
    pub name: String,
    pub weights: [f64; 4],
    pub rhs: f64,
    pub kind: HypothesisKind,
}

impl LinearHypothesis {
    /// Interaction coefficient differs from zero
    pub fn interaction_nonzero() -> Self {
        Self {
            name: "context:task != 0".to_string(),
            weights: [0.0, 0.0, 0.0, 1.0],
            rhs: 0.0,
            kind: HypothesisKind::PointNull,
        }
    }

    /// Interaction coefficient is positive
    pub fn interaction_positive() -> Self {
        Self {
            name: "context:task > 0".to_string(),
            weights: [0.0, 0.0, 0.0, 1.0],
            rhs: 0.0,
            kind: HypothesisKind::Greater,
        }
    }

    fn combine(&self, b: &[f64; 4]) -> f64 {
        self.weights.iter().zip(b).map(|(w, x)| w * x).sum()
    }
}

/// Evidence ratios for the interaction, the per-task test statistic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRatios {
    pub two_sided: f64,
    pub one_sided: f64,
}

fn normal_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    let z = (x - mean) / sd;
    (-0.5 * z * z).exp() / (sd * (2.0 * PI).sqrt())
}

fn sample_sd(xs: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// Gaussian kernel density estimate at `at`, Silverman bandwidth
pub fn kde_density(xs: &[f64], at: f64) -> Option<f64> {
    if xs.len() < 2 || xs.iter().any(|x| !x.is_finite()) {
        return None;
    }

    let sd = sample_sd(xs);
    let mut sorted = xs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q = |p: f64| sorted[((sorted.len() - 1) as f64 * p).round() as usize];
    let iqr = q(0.75) - q(0.25);

    let spread = if iqr > 0.0 { sd.min(iqr / 1.34) } else { sd };
    if !(spread > 0.0) {
        return None;
    }

    let n = xs.len() as f64;
    let h = 0.9 * spread * n.powf(-0.2);
    let density = xs.iter().map(|x| normal_pdf(at, *x, h)).sum::<f64>() / n;

    Some(density)
}

impl PosteriorSummary {
    /// Evidence ratio in favour of `hypothesis` over its complement.
    ///
    /// Returns `None` when the posterior cannot support the hypothesis:
    /// no draws, non-finite draws, a degenerate prior or posterior.
    pub fn evidence_ratio(&self, hypothesis: &LinearHypothesis) -> Option<f64> {
        if self.draws.is_empty() {
            return None;
        }

        let theta: Vec<f64> = self.draws.iter().map(|b| hypothesis.combine(b)).collect();
        if theta.iter().any(|x| !x.is_finite()) {
            return None;
        }

        let ratio = match hypothesis.kind {
            HypothesisKind::Greater => {
                let above = theta.iter().filter(|&&x| x > hypothesis.rhs).count();
                let below = theta.len() - above;
                if below == 0 {
                    f64::INFINITY
                } else {
                    above as f64 / below as f64
                }
            }
            HypothesisKind::PointNull => {
                let prior_var: f64 = hypothesis
                    .weights
                    .iter()
                    .zip(&self.priors.fixed_sd)
                    .map(|(w, s)| (w * s).powi(2))
                    .sum();
                if !(prior_var > 0.0) {
                    return None;
                }
                // Priors on the fixed effects are centred at zero
                let prior_density = normal_pdf(hypothesis.rhs, 0.0, prior_var.sqrt());
                let posterior_density = kde_density(&theta, hypothesis.rhs)?;
                if posterior_density > 0.0 {
                    prior_density / posterior_density
                } else {
                    f64::INFINITY
                }
            }
        };

        if ratio.is_nan() {
            None
        } else {
            Some(ratio)
        }
    }
}

/// Two-sided and directional evidence ratios for the interaction.
///
/// The directional ratio is only meaningful for non-negative true effects;
/// the evaluator does not check that.
pub fn evaluate(summary: &PosteriorSummary) -> Result<EvidenceRatios, TaskFailure> {
    let two = LinearHypothesis::interaction_nonzero();
    let one = LinearHypothesis::interaction_positive();

    let two_sided = summary
        .evidence_ratio(&two)
        .ok_or_else(|| TaskFailure::MissingEvidence(two.name.clone()))?;
    let one_sided = summary
        .evidence_ratio(&one)
        .ok_or_else(|| TaskFailure::MissingEvidence(one.name.clone()))?;

    Ok(EvidenceRatios {
        two_sided,
        one_sided,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datagen::SimRng;
    use crate::fit::PriorSpec;

    fn summary_with_interaction(mean: f64, sd: f64, n: usize, seed: u64) -> PosteriorSummary {
        let mut rng = SimRng::new(seed);
        let draws = (0..n)
            .map(|_| [0.5, 0.3, 0.3, mean + sd * rng.standard_normal()])
            .collect();
        PosteriorSummary {
            draws,
            priors: PriorSpec::default(),
            diagnostics: vec![],
        }
    }

    #[test]
    fn test_kde_matches_normal_density() {
        let mut rng = SimRng::new(5);
        let xs: Vec<f64> = (0..20_000).map(|_| rng.standard_normal()).collect();
        let d = kde_density(&xs, 0.0).unwrap();
        let expected = 1.0 / (2.0 * PI).sqrt();
        assert!((d - expected).abs() < 0.02, "density = {}", d);
    }

    #[test]
    fn test_kde_degenerate() {
        assert_eq!(kde_density(&[1.0, 1.0, 1.0], 1.0), None);
        assert_eq!(kde_density(&[1.0], 1.0), None);
    }

    #[test]
    fn test_directional_ratio() {
        // three of four draws above zero
        let summary = PosteriorSummary {
            draws: vec![
                [0.0, 0.0, 0.0, 0.4],
                [0.0, 0.0, 0.0, 0.1],
                [0.0, 0.0, 0.0, 0.2],
                [0.0, 0.0, 0.0, -0.1],
            ],
            priors: PriorSpec::default(),
            diagnostics: vec![],
        };
        let ratio = summary
            .evidence_ratio(&LinearHypothesis::interaction_positive())
            .unwrap();
        assert_eq!(ratio, 3.0);
    }

    #[test]
    fn test_directional_ratio_all_positive_is_infinite() {
        let summary = summary_with_interaction(5.0, 0.1, 1000, 1);
        let ratio = summary
            .evidence_ratio(&LinearHypothesis::interaction_positive())
            .unwrap();
        assert!(ratio.is_infinite() && ratio > 0.0);
    }

    #[test]
    fn test_savage_dickey_favours_null_when_centred() {
        // posterior tightly around zero: evidence against an effect
        let summary = summary_with_interaction(0.0, 0.05, 4000, 2);
        let ratio = summary
            .evidence_ratio(&LinearHypothesis::interaction_nonzero())
            .unwrap();
        assert!(ratio < 0.2, "ratio = {}", ratio);
    }

    #[test]
    fn test_savage_dickey_strong_effect() {
        // posterior N(0.6, 0.1): density at 0 is tiny relative to the N(0, 1) prior
        let summary = summary_with_interaction(0.6, 0.1, 4000, 3);
        let ratio = summary
            .evidence_ratio(&LinearHypothesis::interaction_nonzero())
            .unwrap();
        assert!(ratio > 100.0, "ratio = {}", ratio);
    }

    #[test]
    fn test_savage_dickey_against_analytic_value() {
        // prior N(0, 1), posterior N(0.2, 0.2): BF10 = φ(0;0,1) / φ(0;0.2,0.2) = e^{1/2} / 5
        let summary = summary_with_interaction(0.2, 0.2, 40_000, 4);
        let ratio = summary
            .evidence_ratio(&LinearHypothesis::interaction_nonzero())
            .unwrap();
        let expected = 0.5f64.exp() / 5.0;
        assert!((ratio - expected).abs() / expected < 0.05, "ratio = {}", ratio);
    }

    #[test]
    fn test_evaluate_missing_evidence() {
        let empty = PosteriorSummary {
            draws: vec![],
            priors: PriorSpec::default(),
            diagnostics: vec![],
        };
        assert!(matches!(
            evaluate(&empty),
            Err(TaskFailure::MissingEvidence(_))
        ));
    }

    #[test]
    fn test_evaluate_nan_draws() {
        let summary = PosteriorSummary {
            draws: vec![[0.0, 0.0, 0.0, f64::NAN]; 10],
            priors: PriorSpec::default(),
            diagnostics: vec![],
        };
        assert!(evaluate(&summary).is_err());
    }

    #[test]
    fn test_evaluate_returns_both_ratios() {
        let summary = summary_with_interaction(0.3, 0.15, 4000, 6);
        let ratios = evaluate(&summary).unwrap();
        assert!(ratios.two_sided > 0.0);
        assert!(ratios.one_sided > 10.0);
    }

    #[test]
    fn test_arbitrary_linear_hypothesis() {
        // context - task > 0 with context = 0.3 + noise, task = 0.3: about even odds
        let mut rng = SimRng::new(8);
        let draws = (0..10_000)
            .map(|_| [0.0, 0.3 + 0.1 * rng.standard_normal(), 0.3, 0.0])
            .collect();
        let summary = PosteriorSummary {
            draws,
            priors: PriorSpec::default(),
            diagnostics: vec![],
        };
        let h = LinearHypothesis {
            name: "context - task > 0".to_string(),
            weights: [0.0, 1.0, -1.0, 0.0],
            rhs: 0.0,
            kind: HypothesisKind::Greater,
        };
        let ratio = summary.evidence_ratio(&h).unwrap();
        assert!((ratio - 1.0).abs() < 0.1, "ratio = {}", ratio);
    }
}
