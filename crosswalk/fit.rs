//! # Model Fitting via Profiled Likelihood
//!
//! Estimates the crosswalk model with a nested optimization scheme:
//!
//! 1. **Outer loop (BFGS):** optimizes the log heterogeneity variance
//!    `rho = ln(gamma)` by minimizing the profiled Gaussian negative
//!    log-likelihood `0.5 * sum[ ln(se_i^2 + gamma) + r_i^2/(se_i^2 + gamma) ]`.
//!
//! 2. **Inner loop (constrained WLS):** for each trial `gamma`, solves the
//!    weighted least-squares problem for the fixed effects, enforcing order
//!    priors and spline shape priors with an active-set method over KKT
//!    systems.
//!
//! Robustness to contaminated matched pairs comes from a trimming pass: when
//! the inlier fraction is below 1, the fit is repeated on the lowest-residual
//! subset of records.

// External crate for the outer optimization
use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::basis::BasisError;
use crate::data::ObservationStore;
use crate::design::{BlockKind, CovariateTerm, DesignLayout};
use crate::model::{FittedModel, FittedTerm, FittedTermKind, TransformKind};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::{Inverse, Solve};
use thiserror::Error;

/// Inequality constraint between two definitions' fitted coefficients:
/// the coefficient for `lower` must be <= the coefficient for `upper`.
/// Naming the gold definition on either side pins that side to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPrior {
    pub lower: String,
    pub upper: String,
}

/// Everything the fitter needs beyond the observation store itself.
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Space the difference observations live in (log or logit).
    pub transform: TransformKind,
    /// The atomic definition treated as bias-free.
    pub gold_definition: String,
    /// Ordered terms of the linear predictor.
    pub terms: Vec<CovariateTerm>,
    /// Optional order priors between definition coefficients.
    pub order_priors: Vec<OrderPrior>,
    /// Fraction of records retained in the final fit, in (0, 1]. Values
    /// below 1 trim the highest-residual records.
    pub inlier_fraction: f64,
    /// Iteration cap for the outer BFGS optimization.
    pub max_heterogeneity_iterations: u64,
    /// Convergence tolerance for the outer BFGS optimization.
    pub heterogeneity_tolerance: f64,
}

impl FitConfig {
    /// A default configuration: intercept-only model, no priors, no
    /// trimming.
    pub fn new(transform: TransformKind, gold_definition: &str) -> Self {
        FitConfig {
            transform,
            gold_definition: gold_definition.to_string(),
            terms: vec![CovariateTerm::Intercept],
            order_priors: Vec::new(),
            inlier_fraction: 1.0,
            max_heterogeneity_iterations: 200,
            heterogeneity_tolerance: 1e-6,
        }
    }
}

/// A comprehensive error type for the model fitting process.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Invalid spline knots for covariate '{covariate}': {source}")]
    InvalidKnot {
        covariate: String,
        #[source]
        source: BasisError,
    },

    #[error(
        "The term or order prior references '{0}', which names no covariate column and no non-gold definition coefficient."
    )]
    UnknownTerm(String),

    #[error(
        "The model is not identifiable from the data: {0}. Every coefficient must be informed by at least one comparison record."
    )]
    UnidentifiableModel(String),

    #[error("Heterogeneity optimization failed to converge: {0}")]
    OptimizationFailed(String),

    #[error("Inlier fraction must lie in (0, 1], but was {0}.")]
    InvalidInlierFraction(f64),

    #[error("An internal error occurred during model layout or coefficient mapping: {0}")]
    LayoutError(String),
}

/// The main entry point for model fitting.
pub fn fit_model(store: &ObservationStore, config: &FitConfig) -> Result<FittedModel, FitError> {
    if !(config.inlier_fraction > 0.0 && config.inlier_fraction <= 1.0) {
        return Err(FitError::InvalidInlierFraction(config.inlier_fraction));
    }

    let n = store.n_records();
    log::info!(
        "Starting crosswalk fit: {} records, gold definition '{}', {} space.",
        n,
        config.gold_definition,
        config.transform.name()
    );

    // The registry carries the gold label even when it never appears in the
    // data; identifiability is then decided by the design matrix itself.
    let registry = store.registry.with_label(&config.gold_definition);
    let layout = DesignLayout::new(&registry, &config.gold_definition, &config.terms, store)?;
    let x = layout.build_fit_matrix(store)?;

    if let Some(block) = layout.find_zero_information_column(&x) {
        return Err(FitError::UnidentifiableModel(format!(
            "term '{}' is not informed by any comparison record",
            block.name
        )));
    }

    let constraints =
        internal::assemble_constraints(&layout, &config.order_priors, &config.gold_definition)?;
    log::info!(
        "Model structure: {} coefficients across {} terms, {} inequality constraints.",
        layout.total_coeffs,
        layout.blocks.len(),
        constraints.len()
    );

    let mut mask = Array1::ones(n);
    let (mut gamma, mut beta) = internal::optimize(
        x.view(),
        store.diff.view(),
        store.diff_se.view(),
        &constraints,
        &mask,
        config,
    )?;

    if config.inlier_fraction < 1.0 {
        let n_keep = ((config.inlier_fraction * n as f64).ceil() as usize)
            .max(layout.total_coeffs + 1)
            .min(n);
        mask = internal::inlier_mask(
            x.view(),
            store.diff.view(),
            store.diff_se.view(),
            &beta,
            gamma,
            n_keep,
        );
        log::info!(
            "Trimming pass: retaining {} of {} records, refitting.",
            n_keep,
            n
        );
        (gamma, beta) = internal::optimize(
            x.view(),
            store.diff.view(),
            store.diff_se.view(),
            &constraints,
            &mask,
            config,
        )?;
    }

    let standard_errors = internal::coefficient_standard_errors(
        x.view(),
        store.diff.view(),
        store.diff_se.view(),
        gamma,
        &constraints,
        &mask,
    )?;
    let terms = internal::map_coefficients(&layout, &beta, &standard_errors);

    log::info!(
        "Fit complete: heterogeneity variance gamma = {:.6e}.",
        gamma
    );

    Ok(FittedModel {
        transform: config.transform,
        gold_definition: config.gold_definition.clone(),
        delimiter: store.delimiter.clone(),
        heterogeneity_variance: gamma,
        registry,
        terms,
    })
}

/// Internal module for the estimation machinery.
mod internal {
    use super::*;

    /// Bounds on `rho = ln(gamma)`; outside this range the likelihood is
    /// numerically flat and line searches stall.
    const RHO_BOUNDS: (f64, f64) = (-30.0, 10.0);
    const CONSTRAINT_TOLERANCE: f64 = 1e-9;

    /// Builds the inequality rows (`row . beta <= 0`) for the order priors
    /// and for every spline shape prior in the layout.
    pub(super) fn assemble_constraints(
        layout: &DesignLayout,
        order_priors: &[OrderPrior],
        gold: &str,
    ) -> Result<Vec<Array1<f64>>, FitError> {
        let p = layout.total_coeffs;
        let mut rows = Vec::new();

        for prior in order_priors {
            let mut row = Array1::zeros(p);
            let mut touched = false;
            for (label, sign) in [(&prior.lower, 1.0), (&prior.upper, -1.0)] {
                if label.as_str() == gold {
                    continue; // the gold coefficient is identically zero
                }
                let col = layout
                    .definition_col(label)
                    .ok_or_else(|| FitError::UnknownTerm(label.clone()))?;
                row[col] += sign;
                touched = true;
            }
            if !touched {
                return Err(FitError::LayoutError(
                    "order prior relates the gold definition to itself".to_string(),
                ));
            }
            rows.push(row);
        }

        for block in &layout.blocks {
            if let BlockKind::Spline { shape, .. } = &block.kind {
                for local in crate::basis::shape_constraint_rows(*shape, block.cols.len()) {
                    let mut row = Array1::zeros(p);
                    row.slice_mut(s![block.cols.clone()]).assign(&local);
                    rows.push(row);
                }
            }
        }

        Ok(rows)
    }

    /// Outer BFGS over `rho = ln(gamma)`, profiling the fixed effects out
    /// through the constrained WLS solve at each trial value.
    pub(super) fn optimize(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        se: ArrayView1<f64>,
        constraints: &[Array1<f64>],
        mask: &Array1<f64>,
        config: &FitConfig,
    ) -> Result<(f64, Array1<f64>), FitError> {
        // Data-driven starting point: gamma on the scale of the sampling
        // variances.
        let mask_total: f64 = mask.sum();
        let mean_var = se
            .iter()
            .zip(mask.iter())
            .map(|(&s, &m)| m * s * s)
            .sum::<f64>()
            / mask_total.max(1.0);
        let initial_rho = mean_var.max(1e-8).ln().clamp(RHO_BOUNDS.0, RHO_BOUNDS.1);

        // A non-finite or failing initial cost means the design itself is
        // defective; surface that before optimizing.
        let initial_cost = profiled_cost(x, y, se, constraints, mask, initial_rho.exp())?;
        if !initial_cost.is_finite() {
            return Err(FitError::OptimizationFailed(format!(
                "initial cost is not finite: {initial_cost}"
            )));
        }
        log::info!("Initial profiled likelihood cost: {initial_cost:.6}");

        let cost_at = |rho: f64| -> f64 {
            let rho = rho.clamp(RHO_BOUNDS.0, RHO_BOUNDS.1);
            match profiled_cost(x, y, se, constraints, mask, rho.exp()) {
                Ok(cost) if cost.is_finite() => cost,
                Ok(cost) => {
                    log::warn!("Non-finite cost {cost} at rho {rho}; substituting large value");
                    1e10
                }
                Err(e) => {
                    log::warn!("Cost computation failed at rho {rho}: {e}; substituting large value");
                    1e10
                }
            }
        };

        let cost_and_grad = move |rho_bfgs: &Array1<f64>| -> (f64, Array1<f64>) {
            let rho = rho_bfgs[0];
            let cost = cost_at(rho);
            // Central-difference gradient; the profiled objective is smooth
            // in rho away from active-set changes.
            let h = 1e-4;
            let grad = (cost_at(rho + h) - cost_at(rho - h)) / (2.0 * h);
            (cost, Array1::from_vec(vec![grad]))
        };

        let BfgsSolution {
            final_point: final_rho,
            final_value,
            iterations,
            ..
        } = Bfgs::new(Array1::from_vec(vec![initial_rho]), cost_and_grad)
            .with_tolerance(config.heterogeneity_tolerance)
            .with_max_iterations(config.max_heterogeneity_iterations as usize)
            .run()
            .map_err(|e| FitError::OptimizationFailed(format!("BFGS failed: {e:?}")))?;

        let gamma = final_rho[0].clamp(RHO_BOUNDS.0, RHO_BOUNDS.1).exp();
        log::info!(
            "Heterogeneity optimization finished in {iterations} iterations (cost {final_value:.6}, gamma {gamma:.6e})."
        );

        let (beta, _active) = solve_active_set(x, y, se, gamma, constraints, mask)?;
        Ok((gamma, beta))
    }

    /// The profiled negative log-likelihood at a fixed gamma.
    fn profiled_cost(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        se: ArrayView1<f64>,
        constraints: &[Array1<f64>],
        mask: &Array1<f64>,
        gamma: f64,
    ) -> Result<f64, FitError> {
        let (beta, _active) = solve_active_set(x, y, se, gamma, constraints, mask)?;
        let fitted = x.dot(&beta);
        let mut cost = 0.0;
        for i in 0..y.len() {
            if mask[i] == 0.0 {
                continue;
            }
            let v = se[i] * se[i] + gamma;
            let r = y[i] - fitted[i];
            cost += 0.5 * (v.ln() + r * r / v);
        }
        Ok(cost)
    }

    /// Weighted normal equations `(X' W X, X' W y)` with weights
    /// `mask_i / (se_i^2 + gamma)`.
    fn normal_equations(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        se: ArrayView1<f64>,
        gamma: f64,
        mask: &Array1<f64>,
    ) -> (Array2<f64>, Array1<f64>) {
        let weights = Array1::from_iter(
            se.iter()
                .zip(mask.iter())
                .map(|(&s, &m)| m / (s * s + gamma)),
        );
        let xw = &x * &weights.view().insert_axis(Axis(1));
        let a = x.t().dot(&xw);
        let b = xw.t().dot(&y);
        (a, b)
    }

    /// Solves the inequality-constrained WLS problem by an active-set
    /// method: equality-constrained KKT solves, adding the most violated
    /// constraint and dropping constraints with negative multipliers until
    /// the KKT conditions hold.
    fn solve_active_set(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        se: ArrayView1<f64>,
        gamma: f64,
        constraints: &[Array1<f64>],
        mask: &Array1<f64>,
    ) -> Result<(Array1<f64>, Vec<usize>), FitError> {
        let (a, b) = normal_equations(x, y, se, gamma, mask);
        let mut active: Vec<usize> = Vec::new();

        for _ in 0..(3 * constraints.len() + 10) {
            let (beta, multipliers) = solve_kkt(&a, &b, constraints, &active)?;

            // Drop the constraint with the most negative multiplier, if any.
            if let Some((drop_pos, _)) = multipliers
                .iter()
                .enumerate()
                .filter(|&(_, &m)| m < -CONSTRAINT_TOLERANCE)
                .min_by(|l, r| l.1.partial_cmp(r.1).unwrap_or(std::cmp::Ordering::Equal))
            {
                active.remove(drop_pos);
                continue;
            }

            // Add the most violated inactive constraint, if any.
            let violation = constraints
                .iter()
                .enumerate()
                .filter(|(idx, _)| !active.contains(idx))
                .map(|(idx, c)| (idx, c.dot(&beta)))
                .filter(|(_, v)| *v > CONSTRAINT_TOLERANCE)
                .max_by(|l, r| l.1.partial_cmp(&r.1).unwrap_or(std::cmp::Ordering::Equal));
            match violation {
                Some((idx, _)) => active.push(idx),
                None => return Ok((beta, active)),
            }
        }

        Err(FitError::OptimizationFailed(
            "the active-set iteration did not settle".to_string(),
        ))
    }

    /// Solves the equality-constrained system for the given active set.
    /// Returns the coefficients and the constraint multipliers.
    fn solve_kkt(
        a: &Array2<f64>,
        b: &Array1<f64>,
        constraints: &[Array1<f64>],
        active: &[usize],
    ) -> Result<(Array1<f64>, Array1<f64>), FitError> {
        let p = a.nrows();
        if active.is_empty() {
            let beta = a
                .solve(b)
                .map_err(|e| singular(&format!("normal equations solve failed: {e}")))?;
            return Ok((beta, Array1::zeros(0)));
        }

        let k = active.len();
        let dim = p + k;
        let mut kkt = Array2::zeros((dim, dim));
        kkt.slice_mut(s![..p, ..p]).assign(a);
        for (j, &ci) in active.iter().enumerate() {
            let c = &constraints[ci];
            kkt.slice_mut(s![..p, p + j]).assign(c);
            kkt.slice_mut(s![p + j, ..p]).assign(c);
        }
        let mut rhs = Array1::zeros(dim);
        rhs.slice_mut(s![..p]).assign(b);

        let solution = kkt
            .solve(&rhs)
            .map_err(|e| singular(&format!("constrained KKT solve failed: {e}")))?;
        let beta = solution.slice(s![..p]).to_owned();
        let multipliers = solution.slice(s![p..]).to_owned();
        Ok((beta, multipliers))
    }

    fn singular(detail: &str) -> FitError {
        FitError::UnidentifiableModel(detail.to_string())
    }

    /// Mask retaining the `n_keep` records with the smallest standardized
    /// residuals.
    pub(super) fn inlier_mask(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        se: ArrayView1<f64>,
        beta: &Array1<f64>,
        gamma: f64,
        n_keep: usize,
    ) -> Array1<f64> {
        let fitted = x.dot(beta);
        let mut scored: Vec<(usize, f64)> = (0..y.len())
            .map(|i| {
                let v = se[i] * se[i] + gamma;
                (i, (y[i] - fitted[i]).abs() / v.sqrt())
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut mask = Array1::zeros(y.len());
        for &(i, _) in scored.iter().take(n_keep) {
            mask[i] = 1.0;
        }
        mask
    }

    /// Standard errors from the (constrained) normal-matrix inverse at the
    /// final gamma: the top-left block of the KKT inverse when constraints
    /// are active, the plain inverse otherwise.
    pub(super) fn coefficient_standard_errors(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        se: ArrayView1<f64>,
        gamma: f64,
        constraints: &[Array1<f64>],
        mask: &Array1<f64>,
    ) -> Result<Array1<f64>, FitError> {
        let (_beta, active) = solve_active_set(x, y, se, gamma, constraints, mask)?;
        let (a, _b) = normal_equations(x, y, se, gamma, mask);
        let p = a.nrows();

        let covariance = if active.is_empty() {
            a.inv()
                .map_err(|e| singular(&format!("normal-matrix inversion failed: {e}")))?
        } else {
            let k = active.len();
            let dim = p + k;
            let mut kkt = Array2::zeros((dim, dim));
            kkt.slice_mut(s![..p, ..p]).assign(&a);
            for (j, &ci) in active.iter().enumerate() {
                let c = &constraints[ci];
                kkt.slice_mut(s![..p, p + j]).assign(c);
                kkt.slice_mut(s![p + j, ..p]).assign(c);
            }
            let full = kkt
                .inv()
                .map_err(|e| singular(&format!("KKT inversion failed: {e}")))?;
            full.slice(s![..p, ..p]).to_owned()
        };

        Ok(Array1::from_iter(
            (0..p).map(|j| covariance[[j, j]].max(0.0).sqrt()),
        ))
    }

    /// Maps the flat coefficient vector back onto the named terms.
    pub(super) fn map_coefficients(
        layout: &DesignLayout,
        beta: &Array1<f64>,
        standard_errors: &Array1<f64>,
    ) -> Vec<FittedTerm> {
        layout
            .blocks
            .iter()
            .map(|block| {
                let estimates = beta.slice(s![block.cols.clone()]).to_vec();
                let ses = standard_errors.slice(s![block.cols.clone()]).to_vec();
                let kind = match &block.kind {
                    BlockKind::Definition { label } => FittedTermKind::Definition {
                        label: label.clone(),
                    },
                    BlockKind::Linear { name } => FittedTermKind::Linear {
                        covariate: name.clone(),
                    },
                    BlockKind::Spline { name, basis, .. } => FittedTermKind::Spline {
                        covariate: name.clone(),
                        basis: basis.clone(),
                    },
                };
                FittedTerm {
                    name: block.name.clone(),
                    kind,
                    estimates,
                    standard_errors: ses,
                }
            })
            .collect()
    }
}
