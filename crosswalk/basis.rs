//! B-spline basis evaluation for covariate terms.
//!
//! Unlike automatic knot placement, crosswalk covariate splines use
//! caller-supplied knots: the analyst chooses where the adjustment is
//! allowed to bend. The only structural requirement is that the knots
//! bracket the covariate's observed range, so every fitted record falls
//! inside the basis support.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape prior applied to a spline covariate term, enforced as linear
/// inequality constraints on the basis coefficients at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplineShape {
    Unconstrained,
    Increasing,
    Decreasing,
    Convex,
    Concave,
}

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("A spline needs at least 2 knots, but {0} were supplied.")]
    TooFewKnots(usize),

    #[error("Knots must be strictly increasing, but knot {index} ({value}) is not.")]
    UnsortedKnots { index: usize, value: f64 },

    #[error(
        "Knots [{knot_min}, {knot_max}] do not bracket the observed data range [{data_min}, {data_max}]."
    )]
    KnotsDoNotBracketData {
        knot_min: f64,
        knot_max: f64,
        data_min: f64,
        data_max: f64,
    },
}

/// A B-spline basis over a fixed, caller-supplied knot vector.
///
/// The basis is a value: it is built once at fit time, stored inside the
/// fitted model, and reused verbatim at adjustment time so predictions see
/// exactly the columns the coefficients were estimated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineBasis {
    /// Full knot vector with `degree + 1` repeated boundary knots.
    knots: Array1<f64>,
    degree: usize,
}

impl SplineBasis {
    /// Builds a basis from user knots spanning `[knots[0], knots[last]]`.
    ///
    /// `data_range` is the `(min, max)` of the covariate observed at fit
    /// time; the knots must bracket it or the model is invalid.
    pub fn new(
        user_knots: &[f64],
        degree: usize,
        data_range: (f64, f64),
    ) -> Result<Self, BasisError> {
        if degree < 1 {
            return Err(BasisError::InvalidDegree(degree));
        }
        if user_knots.len() < 2 {
            return Err(BasisError::TooFewKnots(user_knots.len()));
        }
        for (i, pair) in user_knots.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(BasisError::UnsortedKnots {
                    index: i + 1,
                    value: pair[1],
                });
            }
        }
        let (knot_min, knot_max) = (user_knots[0], user_knots[user_knots.len() - 1]);
        let (data_min, data_max) = data_range;
        if knot_min > data_min || knot_max < data_max {
            return Err(BasisError::KnotsDoNotBracketData {
                knot_min,
                knot_max,
                data_min,
                data_max,
            });
        }

        // B-splines require `degree + 1` repeated knots at each boundary.
        let mut full = Vec::with_capacity(user_knots.len() + 2 * degree);
        full.extend(std::iter::repeat(knot_min).take(degree + 1));
        full.extend_from_slice(&user_knots[1..user_knots.len() - 1]);
        full.extend(std::iter::repeat(knot_max).take(degree + 1));

        Ok(SplineBasis {
            knots: Array1::from_vec(full),
            degree,
        })
    }

    /// Number of basis functions: `interior_knots + degree + 1`.
    pub fn num_basis(&self) -> usize {
        self.knots.len() - self.degree - 1
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Support of the basis, `(first_knot, last_knot)`.
    pub fn support(&self) -> (f64, f64) {
        (self.knots[0], self.knots[self.knots.len() - 1])
    }

    /// Evaluates all basis functions at `x`.
    ///
    /// Points outside the knot support are clamped to the nearest boundary,
    /// so out-of-range adjustment rows see the boundary value of the fitted
    /// curve rather than an undefined extrapolation.
    pub fn evaluate(&self, x: f64) -> Array1<f64> {
        let x = self.clamp_to_support(x);
        internal::evaluate_splines_at_point(x, self.degree, self.knots.view())
    }

    /// Evaluates the first derivative of every basis function at `x`.
    pub fn derivative(&self, x: f64) -> Array1<f64> {
        let x = self.clamp_to_support(x);
        let d = self.degree;
        // B'_{i,d}(x) = d * ( B_{i,d-1}/(t_{i+d} - t_i) - B_{i+1,d-1}/(t_{i+d+1} - t_{i+1}) )
        let lower = internal::evaluate_splines_at_point(x, d - 1, self.knots.view());
        let num_basis = self.num_basis();
        let mut deriv = Array1::zeros(num_basis);
        for i in 0..num_basis {
            let mut value = 0.0;
            let denom_left = self.knots[i + d] - self.knots[i];
            if denom_left > 1e-12 {
                value += lower[i] / denom_left;
            }
            if i + 1 < lower.len() {
                let denom_right = self.knots[i + d + 1] - self.knots[i + 1];
                if denom_right > 1e-12 {
                    value -= lower[i + 1] / denom_right;
                }
            }
            deriv[i] = d as f64 * value;
        }
        deriv
    }

    fn clamp_to_support(&self, x: f64) -> f64 {
        let (lo, hi) = self.support();
        x.clamp(lo, hi)
    }
}

/// Builds the inequality rows encoding a shape prior over `num_coeffs`
/// spline coefficients, in the convention `row · beta <= 0`.
///
/// Monotonicity uses first differences of the coefficients (a sufficient
/// condition for a monotone B-spline curve); convexity uses second
/// differences.
pub fn shape_constraint_rows(shape: SplineShape, num_coeffs: usize) -> Vec<Array1<f64>> {
    let mut rows = Vec::new();
    match shape {
        SplineShape::Unconstrained => {}
        SplineShape::Increasing | SplineShape::Decreasing => {
            let sign = if shape == SplineShape::Increasing {
                1.0
            } else {
                -1.0
            };
            for i in 0..num_coeffs.saturating_sub(1) {
                let mut row = Array1::zeros(num_coeffs);
                row[i] = sign;
                row[i + 1] = -sign;
                rows.push(row);
            }
        }
        SplineShape::Convex | SplineShape::Concave => {
            let sign = if shape == SplineShape::Convex { -1.0 } else { 1.0 };
            for i in 0..num_coeffs.saturating_sub(2) {
                let mut row = Array1::zeros(num_coeffs);
                row[i] = sign;
                row[i + 1] = -2.0 * sign;
                row[i + 2] = sign;
                rows.push(row);
            }
        }
    }
    rows
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Evaluates all B-spline basis functions of `degree` at a single point
    /// `x` over `knots`, via the Cox-de Boor recurrence.
    pub(super) fn evaluate_splines_at_point(
        x: f64,
        degree: usize,
        knots: ArrayView1<f64>,
    ) -> Array1<f64> {
        let num_knots = knots.len();
        let num_basis = num_knots - degree - 1;

        // Find the knot interval `mu` containing x: `knots[mu] <= x < knots[mu+1]`.
        let mu = match knots.iter().rposition(|&k| k <= x) {
            Some(pos) => pos.min(num_basis - 1).max(degree),
            None => degree,
        };

        // Degree-0 seed.
        let mut b = Array1::zeros(degree + 1);
        b[0] = 1.0;

        for d in 1..=degree {
            let b_old = b.clone();
            b.fill(0.0);

            for i in 0..=d {
                let idx = mu - d + i;

                if i < d && b_old[i] > 0.0 {
                    let denom = knots[idx + d] - knots[idx];
                    if denom > 1e-12 {
                        let w = (x - knots[idx]) / denom;
                        b[i] += w * b_old[i];
                    }
                }

                if i > 0 && b_old[i - 1] > 0.0 {
                    let denom = knots[idx + d] - knots[idx];
                    if denom > 1e-12 {
                        let w = (knots[idx + d] - x) / denom;
                        b[i] += w * b_old[i - 1];
                    }
                }
            }
        }

        let mut basis_values = Array1::zeros(num_basis);
        let start_index = mu.saturating_sub(degree);
        for i in 0..=degree {
            let global_idx = start_index + i;
            if global_idx < num_basis {
                basis_values[global_idx] = b[i];
            }
        }
        basis_values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn basis_partitions_unity() {
        let basis = SplineBasis::new(&[0.0, 2.5, 5.0, 7.5, 10.0], 3, (0.0, 10.0)).unwrap();
        assert_eq!(basis.num_basis(), 3 + 3 + 1);
        for i in 0..100 {
            let x = 0.05 + 9.9 * (i as f64) / 99.0;
            let sum: f64 = basis.evaluate(x).sum();
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn knots_must_bracket_data() {
        match SplineBasis::new(&[0.0, 1.0], 2, (-0.5, 0.8)).unwrap_err() {
            BasisError::KnotsDoNotBracketData {
                knot_min, data_min, ..
            } => {
                assert_abs_diff_eq!(knot_min, 0.0);
                assert_abs_diff_eq!(data_min, -0.5);
            }
            other => panic!("Expected KnotsDoNotBracketData, got {other:?}"),
        }
        match SplineBasis::new(&[0.0, 1.0], 2, (0.0, 1.5)).unwrap_err() {
            BasisError::KnotsDoNotBracketData {
                knot_max, data_max, ..
            } => {
                assert_abs_diff_eq!(knot_max, 1.0);
                assert_abs_diff_eq!(data_max, 1.5);
            }
            other => panic!("Expected KnotsDoNotBracketData, got {other:?}"),
        }
    }

    #[test]
    fn rejects_degenerate_knot_vectors() {
        assert!(matches!(
            SplineBasis::new(&[0.0, 1.0], 0, (0.0, 1.0)).unwrap_err(),
            BasisError::InvalidDegree(0)
        ));
        assert!(matches!(
            SplineBasis::new(&[0.0], 2, (0.0, 0.0)).unwrap_err(),
            BasisError::TooFewKnots(1)
        ));
        assert!(matches!(
            SplineBasis::new(&[0.0, 1.0, 0.5], 2, (0.0, 1.0)).unwrap_err(),
            BasisError::UnsortedKnots { index: 2, .. }
        ));
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let basis = SplineBasis::new(&[0.0, 0.3, 0.6, 1.0], 3, (0.0, 1.0)).unwrap();
        let h = 1e-6;
        for &x in &[0.1, 0.35, 0.55, 0.82] {
            let analytic = basis.derivative(x);
            let plus = basis.evaluate(x + h);
            let minus = basis.evaluate(x - h);
            for k in 0..basis.num_basis() {
                let numeric = (plus[k] - minus[k]) / (2.0 * h);
                assert_abs_diff_eq!(analytic[k], numeric, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn evaluation_clamps_to_support() {
        let basis = SplineBasis::new(&[0.0, 1.0], 2, (0.0, 1.0)).unwrap();
        let below = basis.evaluate(-3.0);
        let at_lo = basis.evaluate(0.0);
        for k in 0..basis.num_basis() {
            assert_abs_diff_eq!(below[k], at_lo[k], epsilon = 1e-12);
        }
    }

    #[test]
    fn shape_rows_encode_monotonicity_and_curvature() {
        let inc = shape_constraint_rows(SplineShape::Increasing, 3);
        assert_eq!(inc.len(), 2);
        // beta_0 - beta_1 <= 0
        assert_abs_diff_eq!(inc[0][0], 1.0);
        assert_abs_diff_eq!(inc[0][1], -1.0);

        let dec = shape_constraint_rows(SplineShape::Decreasing, 3);
        assert_abs_diff_eq!(dec[0][0], -1.0);
        assert_abs_diff_eq!(dec[0][1], 1.0);

        let convex = shape_constraint_rows(SplineShape::Convex, 4);
        assert_eq!(convex.len(), 2);
        // -(beta_0 - 2 beta_1 + beta_2) <= 0
        assert_abs_diff_eq!(convex[0][0], -1.0);
        assert_abs_diff_eq!(convex[0][1], 2.0);
        assert_abs_diff_eq!(convex[0][2], -1.0);

        assert!(shape_constraint_rows(SplineShape::Unconstrained, 5).is_empty());
    }
}
