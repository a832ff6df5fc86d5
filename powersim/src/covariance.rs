//! Covariance structure of the participant random effects
//!
//! The four effects are ordered (intercept, context, task, interaction). The
//! correlation vector lists the upper triangle row by row:
//! (0,1), (0,2), (0,3), (1,2), (1,3), (2,3).

use crate::error::InputError;
use serde::{Deserialize, Serialize};

/// Number of correlated random effects per participant
pub const N_EFFECTS: usize = 4;

/// Number of pairwise correlations among the random effects
pub const N_CORRELATIONS: usize = N_EFFECTS * (N_EFFECTS - 1) / 2;

const PSD_TOLERANCE: f64 = 1e-10;

pub type Matrix4 = [[f64; N_EFFECTS]; N_EFFECTS];

/// Upper-triangle correlations among the random effects
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correlations(pub [f64; N_CORRELATIONS]);

impl Correlations {
    pub fn independent() -> Self {
        Self([0.0; N_CORRELATIONS])
    }

    /// Full symmetric correlation matrix with unit diagonal
    pub fn matrix(&self) -> Result<Matrix4, InputError> {
        let mut m = [[0.0; N_EFFECTS]; N_EFFECTS];
        let mut k = 0;
        for i in 0..N_EFFECTS {
            m[i][i] = 1.0;
            for j in (i + 1)..N_EFFECTS {
                let rho = self.0[k];
                if !rho.is_finite() || rho.abs() > 1.0 {
                    return Err(InputError::CorrelationOutOfRange { index: k, value: rho });
                }
                m[i][j] = rho;
                m[j][i] = rho;
                k += 1;
            }
        }
        Ok(m)
    }

    /// Lower-triangular factor `L` with `L Lᵀ = R`, rejecting non-PSD input
    pub fn cholesky(&self) -> Result<Matrix4, InputError> {
        semidefinite_cholesky(&self.matrix()?)
    }
}

impl Default for Correlations {
    fn default() -> Self {
        Self::independent()
    }
}

/// Cholesky factorisation that tolerates zero pivots.
///
/// A zero pivot is accepted only when the rest of its column is zero too;
/// the column of `L` is then left at zero.
pub fn semidefinite_cholesky(a: &Matrix4) -> Result<Matrix4, InputError> {
    let mut l = [[0.0; N_EFFECTS]; N_EFFECTS];

    for j in 0..N_EFFECTS {
        let diag = a[j][j] - (0..j).map(|k| l[j][k] * l[j][k]).sum::<f64>();

        if diag < -PSD_TOLERANCE {
            return Err(InputError::CorrelationNotPsd { pivot: j, value: diag });
        }

        if diag <= PSD_TOLERANCE {
            for i in (j + 1)..N_EFFECTS {
                let rem = a[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
                if rem.abs() > 1e-8 {
                    return Err(InputError::CorrelationNotPsd { pivot: j, value: diag });
                }
            }
            continue;
        }

        let pivot = diag.sqrt();
        l[j][j] = pivot;
        for i in (j + 1)..N_EFFECTS {
            let rem = a[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
            l[i][j] = rem / pivot;
        }
    }

    Ok(l)
}

/// Scale the rows of a correlation factor by standard deviations: `diag(sd) · L`
pub fn scale_factor(l: &Matrix4, sds: &[f64; N_EFFECTS]) -> Matrix4 {
    let mut out = *l;
    for (row, sd) in out.iter_mut().zip(sds.iter()) {
        for v in row.iter_mut() {
            *v *= sd;
        }
    }
    out
}

/// `L · z` for a lower-triangular `L`
pub fn lower_mul(l: &Matrix4, z: &[f64; N_EFFECTS]) -> [f64; N_EFFECTS] {
    let mut out = [0.0; N_EFFECTS];
    for i in 0..N_EFFECTS {
        out[i] = (0..=i).map(|k| l[i][k] * z[k]).sum();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(l: &Matrix4) -> Matrix4 {
        let mut m = [[0.0; N_EFFECTS]; N_EFFECTS];
        for i in 0..N_EFFECTS {
            for j in 0..N_EFFECTS {
                m[i][j] = (0..N_EFFECTS).map(|k| l[i][k] * l[j][k]).sum();
            }
        }
        m
    }

    #[test]
    fn test_identity_factor() {
        let l = Correlations::independent().cholesky().unwrap();
        for i in 0..N_EFFECTS {
            for j in 0..N_EFFECTS {
                assert_eq!(l[i][j], if i == j { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_factor_reconstructs_matrix() {
        let corr = Correlations([0.3, -0.2, 0.1, 0.25, 0.0, -0.1]);
        let r = corr.matrix().unwrap();
        let l = corr.cholesky().unwrap();
        let back = reconstruct(&l);
        for i in 0..N_EFFECTS {
            for j in 0..N_EFFECTS {
                assert!((back[i][j] - r[i][j]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_perfect_correlation_is_semidefinite() {
        // intercept and context perfectly correlated, others independent
        let corr = Correlations([1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let l = corr.cholesky().unwrap();
        assert_eq!(l[1][1], 0.0);
        assert!((l[1][0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_non_psd() {
        // rho01 = rho02 = 0.9, rho12 = -0.9 is not a valid correlation matrix
        let corr = Correlations([0.9, 0.9, 0.0, -0.9, 0.0, 0.0]);
        assert!(matches!(
            corr.cholesky(),
            Err(InputError::CorrelationNotPsd { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let corr = Correlations([0.0, 1.5, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(
            corr.matrix().unwrap_err(),
            InputError::CorrelationOutOfRange { index: 1, value: 1.5 }
        );
    }

    #[test]
    fn test_scale_and_multiply() {
        let l = Correlations::independent().cholesky().unwrap();
        let scaled = scale_factor(&l, &[2.0, 0.0, 1.0, 0.5]);
        let b = lower_mul(&scaled, &[1.0, 1.0, -1.0, 2.0]);
        assert_eq!(b, [2.0, 0.0, -1.0, 1.0]);
    }
}
