//! # Adjustment of Raw Observations
//!
//! Applies a fitted crosswalk model to a table of raw, potentially biased
//! observations. Each row is independent, so the map runs in parallel over
//! a shared, immutable [`FittedModel`]; output order matches input order.
//!
//! The sign convention follows the fit: the predicted adjustment is the
//! alternative-minus-gold difference in transform space, so subtracting it
//! removes the alternative-definition bias.

use crate::data::RawObservations;
use crate::model::{FittedModel, FittedTermKind};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::Write;
use thiserror::Error;

/// A comprehensive error type for the adjustment process. All variants are
/// hard validation failures; no row is silently skipped.
#[derive(Error, Debug)]
pub enum AdjustError {
    #[error(
        "Row {row} ('{row_id}'): value {value} is at or beyond the boundary of the {transform} transform's domain."
    )]
    DomainBoundary {
        row: usize,
        row_id: String,
        value: f64,
        transform: &'static str,
    },

    #[error(
        "Row {row} ('{row_id}'): definition component '{label}' was never seen when the model was fit."
    )]
    UnknownDefinition {
        row: usize,
        row_id: String,
        label: String,
    },

    #[error("The model requires covariate '{0}', which the adjustment data does not carry.")]
    MissingCovariateColumn(String),

    #[error("Failed to write adjusted observations as CSV: {0}")]
    CsvError(#[from] csv::Error),
}

/// One adjusted row. `adjustment` and `adjustment_se` are in transform
/// space; `adjusted_value` and `adjusted_se` are in linear space.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustedObservation {
    pub row_id: String,
    pub adjusted_value: f64,
    pub adjusted_se: f64,
    pub adjustment: f64,
    pub adjustment_se: f64,
}

/// Adjusts every raw observation against the fitted model.
///
/// Rows already at the gold-standard definition pass through untouched
/// with a zero adjustment.
pub fn adjust_observations(
    model: &FittedModel,
    data: &RawObservations,
) -> Result<Vec<AdjustedObservation>, AdjustError> {
    // Covariate requirements are a table-level property; fail before
    // touching any row.
    for needed in model.required_covariates() {
        if data.covariate_index(needed).is_none() {
            return Err(AdjustError::MissingCovariateColumn(needed.to_string()));
        }
    }

    log::info!(
        "Adjusting {} observations against gold definition '{}'.",
        data.n_rows(),
        model.gold_definition
    );

    (0..data.n_rows())
        .into_par_iter()
        .map(|row| adjust_row(model, data, row))
        .collect()
}

/// Writes adjusted observations as CSV, preserving row order.
pub fn write_adjusted_csv<W: Write>(
    rows: &[AdjustedObservation],
    writer: W,
) -> Result<(), AdjustError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(csv::Error::from)?;
    Ok(())
}

fn adjust_row(
    model: &FittedModel,
    data: &RawObservations,
    row: usize,
) -> Result<AdjustedObservation, AdjustError> {
    let value = data.values[row];
    let value_se = data.value_se[row];
    let row_id = data.row_ids[row].clone();
    let labels = &data.definitions[row];

    // Domain validation applies to every row, gold included: a boundary
    // value is malformed input, not a passthrough candidate.
    if !model.transform.domain_contains(value) {
        return Err(AdjustError::DomainBoundary {
            row,
            row_id,
            value,
            transform: model.transform.name(),
        });
    }

    for label in labels {
        if !model.registry.contains(label) {
            return Err(AdjustError::UnknownDefinition {
                row,
                row_id,
                label: label.clone(),
            });
        }
    }

    if is_gold(labels, &model.gold_definition) {
        return Ok(AdjustedObservation {
            row_id,
            adjusted_value: value,
            adjusted_se: value_se,
            adjustment: 0.0,
            adjustment_se: 0.0,
        });
    }

    let (adjustment, adjustment_se) = predict_adjustment(model, data, row, labels)?;

    let t = model.transform.apply(value);
    let se_t = value_se * model.transform.derivative(value).abs();
    let t_adjusted = t - adjustment;
    let adjusted_value = model.transform.invert(t_adjusted);

    // Three independent variance sources in transform space: the original
    // observation, the predicted adjustment, and the unexplained
    // between-group heterogeneity.
    let var_t = se_t * se_t + adjustment_se * adjustment_se + model.heterogeneity_variance;
    let adjusted_se = var_t.sqrt() * model.transform.inverse_derivative(t_adjusted).abs();

    Ok(AdjustedObservation {
        row_id,
        adjusted_value,
        adjusted_se,
        adjustment,
        adjustment_se,
    })
}

/// Whether a decomposed definition is exactly the gold standard.
fn is_gold(labels: &[String], gold: &str) -> bool {
    let set: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
    set.len() == 1 && set.contains(gold)
}

/// Sums the model's term contributions for one row: definition indicators
/// for every non-gold atomic label present, plus covariate terms evaluated
/// at the row's covariate values. Standard errors add in quadrature.
fn predict_adjustment(
    model: &FittedModel,
    data: &RawObservations,
    row: usize,
    labels: &[String],
) -> Result<(f64, f64), AdjustError> {
    let mut adjustment = 0.0;
    let mut variance = 0.0;

    for term in &model.terms {
        match &term.kind {
            FittedTermKind::Definition { label } => {
                if labels.iter().any(|l| l == label) {
                    adjustment += term.estimates[0];
                    variance += term.standard_errors[0] * term.standard_errors[0];
                }
            }
            FittedTermKind::Linear { covariate } => {
                let x = covariate_value(data, covariate, row)?;
                adjustment += term.estimates[0] * x;
                let se = term.standard_errors[0] * x;
                variance += se * se;
            }
            FittedTermKind::Spline { covariate, basis } => {
                let x = covariate_value(data, covariate, row)?;
                let values = basis.evaluate(x);
                for (k, &weight) in values.iter().enumerate() {
                    adjustment += weight * term.estimates[k];
                    let se = weight * term.standard_errors[k];
                    variance += se * se;
                }
            }
        }
    }

    Ok((adjustment, variance.sqrt()))
}

fn covariate_value(
    data: &RawObservations,
    covariate: &str,
    row: usize,
) -> Result<f64, AdjustError> {
    let idx = data
        .covariate_index(covariate)
        .ok_or_else(|| AdjustError::MissingCovariateColumn(covariate.to_string()))?;
    Ok(data.covariates[[row, idx]])
}
