//! Design-matrix construction and term layout.
//!
//! Maps the ordered covariate term specification onto columns of the fit
//! design matrix and records which columns belong to which named term. The
//! layout is the contract between fitting and coefficient mapping: the
//! fitter solves over anonymous columns, then reads coefficients back out
//! through the named blocks.

use crate::basis::{SplineBasis, SplineShape};
use crate::data::{DefinitionRegistry, ObservationStore};
use crate::fit::FitError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One term of the linear predictor, in caller order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CovariateTerm {
    /// One signed indicator column per non-gold atomic definition. This is
    /// the network term: a record's predicted difference is the sum of the
    /// atomic coefficients present in its alternative definition minus
    /// those in its reference definition.
    Intercept,
    /// A single linear column for the named covariate.
    Linear { name: String },
    /// A spline block for the named covariate, with user knots that must
    /// bracket the covariate's observed range.
    Spline {
        name: String,
        knots: Vec<f64>,
        degree: usize,
        shape: SplineShape,
    },
}

/// What a contiguous block of design columns represents.
#[derive(Debug, Clone)]
pub enum BlockKind {
    /// Signed indicator for one non-gold atomic definition.
    Definition { label: String },
    /// Linear covariate column.
    Linear { name: String },
    /// Spline covariate block.
    Spline {
        name: String,
        basis: SplineBasis,
        shape: SplineShape,
    },
}

/// A named, contiguous block of design-matrix columns.
#[derive(Debug, Clone)]
pub struct TermBlock {
    pub name: String,
    pub cols: Range<usize>,
    pub kind: BlockKind,
}

/// The layout of the fit design matrix `X`.
#[derive(Debug, Clone)]
pub struct DesignLayout {
    pub blocks: Vec<TermBlock>,
    pub total_coeffs: usize,
}

impl DesignLayout {
    /// Builds the layout for a term specification against the store.
    ///
    /// Spline terms are validated here: their knots must bracket the
    /// covariate's observed range, and every named covariate must exist in
    /// the store.
    pub fn new(
        registry: &DefinitionRegistry,
        gold: &str,
        terms: &[CovariateTerm],
        store: &ObservationStore,
    ) -> Result<Self, FitError> {
        if terms.is_empty() {
            return Err(FitError::LayoutError(
                "the term specification is empty; nothing to estimate".to_string(),
            ));
        }

        let mut blocks = Vec::new();
        let mut current_col = 0;

        for term in terms {
            match term {
                CovariateTerm::Intercept => {
                    for label in registry.non_gold(gold) {
                        blocks.push(TermBlock {
                            name: label.to_string(),
                            cols: current_col..current_col + 1,
                            kind: BlockKind::Definition {
                                label: label.to_string(),
                            },
                        });
                        current_col += 1;
                    }
                }
                CovariateTerm::Linear { name } => {
                    store
                        .covariate_index(name)
                        .ok_or_else(|| FitError::UnknownTerm(name.clone()))?;
                    blocks.push(TermBlock {
                        name: name.clone(),
                        cols: current_col..current_col + 1,
                        kind: BlockKind::Linear { name: name.clone() },
                    });
                    current_col += 1;
                }
                CovariateTerm::Spline {
                    name,
                    knots,
                    degree,
                    shape,
                } => {
                    let idx = store
                        .covariate_index(name)
                        .ok_or_else(|| FitError::UnknownTerm(name.clone()))?;
                    let column = store.covariates.column(idx);
                    let data_min = column.iter().cloned().fold(f64::INFINITY, f64::min);
                    let data_max = column.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    let basis = SplineBasis::new(knots, *degree, (data_min, data_max))
                        .map_err(|source| FitError::InvalidKnot {
                            covariate: name.clone(),
                            source,
                        })?;
                    let width = basis.num_basis();
                    blocks.push(TermBlock {
                        name: name.clone(),
                        cols: current_col..current_col + width,
                        kind: BlockKind::Spline {
                            name: name.clone(),
                            basis,
                            shape: *shape,
                        },
                    });
                    current_col += width;
                }
            }
        }

        Ok(DesignLayout {
            blocks,
            total_coeffs: current_col,
        })
    }

    /// Column index of the signed indicator for a non-gold definition, if
    /// the layout carries an intercept term.
    pub fn definition_col(&self, label: &str) -> Option<usize> {
        self.blocks.iter().find_map(|b| match &b.kind {
            BlockKind::Definition { label: l } if l == label => Some(b.cols.start),
            _ => None,
        })
    }

    /// Builds the fit design matrix, one row per comparison record.
    pub fn build_fit_matrix(&self, store: &ObservationStore) -> Result<Array2<f64>, FitError> {
        let n = store.n_records();
        let mut x = Array2::zeros((n, self.total_coeffs));

        for block in &self.blocks {
            match &block.kind {
                BlockKind::Definition { label } => {
                    let col = block.cols.start;
                    for i in 0..n {
                        let in_alt = store.alt_defs[i].iter().any(|l| l == label);
                        let in_ref = store.ref_defs[i].iter().any(|l| l == label);
                        x[[i, col]] = (in_alt as i8 - in_ref as i8) as f64;
                    }
                }
                BlockKind::Linear { name } => {
                    let idx = store
                        .covariate_index(name)
                        .ok_or_else(|| FitError::UnknownTerm(name.clone()))?;
                    let col = block.cols.start;
                    for i in 0..n {
                        x[[i, col]] = store.covariates[[i, idx]];
                    }
                }
                BlockKind::Spline { name, basis, .. } => {
                    let idx = store
                        .covariate_index(name)
                        .ok_or_else(|| FitError::UnknownTerm(name.clone()))?;
                    for i in 0..n {
                        let values = basis.evaluate(store.covariates[[i, idx]]);
                        for (k, col) in block.cols.clone().enumerate() {
                            x[[i, col]] = values[k];
                        }
                    }
                }
            }
        }

        Ok(x)
    }

    /// Finds the first design column carrying no information (all zeros),
    /// which makes the owning term inestimable.
    pub fn find_zero_information_column(&self, x: &Array2<f64>) -> Option<&TermBlock> {
        for block in &self.blocks {
            for col in block.cols.clone() {
                let norm: f64 = x.column(col).iter().map(|v| v.abs()).sum();
                if norm < 1e-12 {
                    return Some(block);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ColumnRoles;
    use approx::assert_abs_diff_eq;
    use polars::prelude::*;

    fn store() -> ObservationStore {
        let df = df!(
            "obs" => [0.5, 0.3, 0.8, -0.2],
            "obs_se" => [0.1, 0.1, 0.1, 0.1],
            "alt" => ["b", "c", "b_c", "c"],
            "ref" => ["a", "a", "a", "b"],
            "x" => [0.0, 0.5, 1.0, 0.25],
            "group" => ["g1", "g2", "g3", "g4"],
        )
        .unwrap();
        let roles = ColumnRoles {
            observation: "obs".to_string(),
            standard_error: "obs_se".to_string(),
            alt_definition: "alt".to_string(),
            ref_definition: "ref".to_string(),
            covariates: vec!["x".to_string()],
            group_id: "group".to_string(),
        };
        ObservationStore::from_dataframe(&df, &roles, "_").unwrap()
    }

    #[test]
    fn intercept_yields_signed_indicators_per_non_gold_label() {
        let store = store();
        let layout = DesignLayout::new(
            &store.registry,
            "a",
            &[CovariateTerm::Intercept],
            &store,
        )
        .unwrap();
        assert_eq!(layout.total_coeffs, 2); // b and c; gold a has no column

        let x = layout.build_fit_matrix(&store).unwrap();
        let b_col = layout.definition_col("b").unwrap();
        let c_col = layout.definition_col("c").unwrap();

        // Row 0: b vs a -> b=+1, c=0.
        assert_abs_diff_eq!(x[[0, b_col]], 1.0);
        assert_abs_diff_eq!(x[[0, c_col]], 0.0);
        // Row 2: composite b_c vs a -> both +1 (additive network term).
        assert_abs_diff_eq!(x[[2, b_col]], 1.0);
        assert_abs_diff_eq!(x[[2, c_col]], 1.0);
        // Row 3: c vs b -> c=+1, b=-1.
        assert_abs_diff_eq!(x[[3, b_col]], -1.0);
        assert_abs_diff_eq!(x[[3, c_col]], 1.0);
    }

    #[test]
    fn linear_term_copies_covariate_column() {
        let store = store();
        let layout = DesignLayout::new(
            &store.registry,
            "a",
            &[
                CovariateTerm::Intercept,
                CovariateTerm::Linear {
                    name: "x".to_string(),
                },
            ],
            &store,
        )
        .unwrap();
        assert_eq!(layout.total_coeffs, 3);
        let x = layout.build_fit_matrix(&store).unwrap();
        assert_abs_diff_eq!(x[[1, 2]], 0.5);
    }

    #[test]
    fn unknown_covariate_is_rejected() {
        let store = store();
        let err = DesignLayout::new(
            &store.registry,
            "a",
            &[CovariateTerm::Linear {
                name: "bmi".to_string(),
            }],
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::UnknownTerm(name) if name == "bmi"));
    }

    #[test]
    fn spline_knots_must_bracket_covariate_range() {
        let store = store();
        let err = DesignLayout::new(
            &store.registry,
            "a",
            &[CovariateTerm::Spline {
                name: "x".to_string(),
                knots: vec![0.2, 0.6, 1.0],
                degree: 2,
                shape: SplineShape::Unconstrained,
            }],
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::InvalidKnot { covariate, .. } if covariate == "x"));
    }

    #[test]
    fn zero_information_column_is_detected() {
        let store = store();
        // Registry extended with a label never observed in any record.
        let registry = store.registry.with_label("ward");
        let layout =
            DesignLayout::new(&registry, "a", &[CovariateTerm::Intercept], &store).unwrap();
        let x = layout.build_fit_matrix(&store).unwrap();
        let block = layout.find_zero_information_column(&x).unwrap();
        assert_eq!(block.name, "ward");
    }
}
