//! The fitted crosswalk model artifact.
//!
//! A [`FittedModel`] is a value: immutable once fit, safe to share across
//! threads, and serialized to a human-readable TOML file so a fit can be
//! reused long after the process that produced it. Everything adjustment
//! needs travels inside it: the transform, the gold definition, the
//! definition registry, the fit-time delimiter, the per-term coefficients
//! with their standard errors, and the heterogeneity variance.

use crate::basis::SplineBasis;
use crate::data::DefinitionRegistry;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

/// The difference transform the comparison observations were expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Log-space differences; raw values must be strictly positive.
    Log,
    /// Logit-space differences; raw values must lie strictly in (0, 1).
    Logit,
}

impl TransformKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransformKind::Log => "log",
            TransformKind::Logit => "logit",
        }
    }

    /// Whether `value` lies strictly inside the transform's domain.
    pub fn domain_contains(&self, value: f64) -> bool {
        match self {
            TransformKind::Log => value > 0.0,
            TransformKind::Logit => value > 0.0 && value < 1.0,
        }
    }

    /// Maps a linear-space value into transform space. The caller must have
    /// checked `domain_contains` first.
    pub fn apply(&self, value: f64) -> f64 {
        match self {
            TransformKind::Log => value.ln(),
            TransformKind::Logit => (value / (1.0 - value)).ln(),
        }
    }

    /// Maps a transform-space value back to linear space.
    pub fn invert(&self, t: f64) -> f64 {
        match self {
            TransformKind::Log => t.exp(),
            TransformKind::Logit => {
                // Clamp to prevent overflow in exp(), as in the raw-value path.
                let t = t.clamp(-700.0, 700.0);
                1.0 / (1.0 + (-t).exp())
            }
        }
    }

    /// Derivative of the forward transform at a linear-space value, used to
    /// push a linear-space standard error into transform space.
    pub fn derivative(&self, value: f64) -> f64 {
        match self {
            TransformKind::Log => 1.0 / value,
            TransformKind::Logit => 1.0 / (value * (1.0 - value)),
        }
    }

    /// Derivative of the inverse transform at a transform-space value, used
    /// to map a transform-space standard error back to linear space.
    pub fn inverse_derivative(&self, t: f64) -> f64 {
        match self {
            TransformKind::Log => t.exp(),
            TransformKind::Logit => {
                let p = self.invert(t);
                p * (1.0 - p)
            }
        }
    }
}

/// What a fitted term's coefficients mean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FittedTermKind {
    /// The fixed adjustment of one non-gold atomic definition relative to
    /// the gold standard.
    Definition { label: String },
    /// A linear covariate effect.
    Linear { covariate: String },
    /// A spline covariate effect; the basis is stored so adjustment rows
    /// are evaluated against exactly the fit-time columns.
    Spline {
        covariate: String,
        basis: SplineBasis,
    },
}

/// One named term with its coefficient estimates and standard errors.
/// Definition and linear terms carry a single coefficient; spline terms
/// carry one per basis function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedTerm {
    pub name: String,
    pub kind: FittedTermKind,
    pub estimates: Vec<f64>,
    pub standard_errors: Vec<f64>,
}

/// The top-level, self-contained fitted model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub transform: TransformKind,
    pub gold_definition: String,
    /// Delimiter used to decompose composite definitions at fit time; the
    /// same decomposition is applied to adjustment rows.
    pub delimiter: String,
    /// Between-group heterogeneity variance (gamma), always >= 0.
    pub heterogeneity_variance: f64,
    pub registry: DefinitionRegistry,
    pub terms: Vec<FittedTerm>,
}

/// One row of the fixed-effects table exposed for external persistence.
#[derive(Debug, Clone, Serialize)]
pub struct FixedEffect {
    pub term: String,
    pub coefficient: String,
    pub estimate: f64,
    pub standard_error: f64,
}

/// Custom error type for model loading, saving, and export.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to write CSV output: {0}")]
    CsvError(#[from] csv::Error),
}

impl FittedModel {
    /// Saves the fitted model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }

    /// Covariate names the model needs to see on every adjustment row.
    pub fn required_covariates(&self) -> Vec<&str> {
        self.terms
            .iter()
            .filter_map(|t| match &t.kind {
                FittedTermKind::Linear { covariate } => Some(covariate.as_str()),
                FittedTermKind::Spline { covariate, .. } => Some(covariate.as_str()),
                FittedTermKind::Definition { .. } => None,
            })
            .collect()
    }

    /// The fixed-effects table: one row per coefficient, named by term.
    pub fn fixed_effects(&self) -> Vec<FixedEffect> {
        let mut rows = Vec::new();
        for term in &self.terms {
            let single = term.estimates.len() == 1;
            for (k, (&estimate, &standard_error)) in term
                .estimates
                .iter()
                .zip(term.standard_errors.iter())
                .enumerate()
            {
                let coefficient = if single {
                    term.name.clone()
                } else {
                    format!("{}[{}]", term.name, k)
                };
                rows.push(FixedEffect {
                    term: term.name.clone(),
                    coefficient,
                    estimate,
                    standard_error,
                });
            }
        }
        rows
    }

    /// Writes the fixed-effects table as CSV.
    pub fn write_fixed_effects_csv<W: Write>(&self, writer: W) -> Result<(), ModelError> {
        let mut wtr = csv::Writer::from_writer(writer);
        for row in self.fixed_effects() {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn toy_model() -> FittedModel {
        FittedModel {
            transform: TransformKind::Logit,
            gold_definition: "measured".to_string(),
            delimiter: "+".to_string(),
            heterogeneity_variance: 0.02,
            registry: DefinitionRegistry::from_labels(["measured", "self_report"]),
            terms: vec![
                FittedTerm {
                    name: "self_report".to_string(),
                    kind: FittedTermKind::Definition {
                        label: "self_report".to_string(),
                    },
                    estimates: vec![0.42],
                    standard_errors: vec![0.05],
                },
                FittedTerm {
                    name: "age_mid".to_string(),
                    kind: FittedTermKind::Spline {
                        covariate: "age_mid".to_string(),
                        basis: SplineBasis::new(&[20.0, 50.0, 80.0], 2, (20.0, 80.0)).unwrap(),
                    },
                    estimates: vec![0.1, 0.2, 0.3, 0.4],
                    standard_errors: vec![0.01, 0.01, 0.02, 0.02],
                },
            ],
        }
    }

    #[test]
    fn transform_round_trip_is_identity_inside_domain() {
        for &v in &[1e-6, 0.25, 0.5, 0.75, 1.0 - 1e-6] {
            let t = TransformKind::Logit.apply(v);
            assert_abs_diff_eq!(TransformKind::Logit.invert(t), v, epsilon = 1e-10);
        }
        for &v in &[1e-8, 0.5, 3.0, 1e6] {
            let t = TransformKind::Log.apply(v);
            assert_abs_diff_eq!(TransformKind::Log.invert(t), v, epsilon = 1e-8 * v.max(1.0));
        }
    }

    #[test]
    fn domain_excludes_boundaries() {
        assert!(!TransformKind::Log.domain_contains(0.0));
        assert!(!TransformKind::Log.domain_contains(-1.0));
        assert!(TransformKind::Log.domain_contains(1e-12));
        assert!(!TransformKind::Logit.domain_contains(0.0));
        assert!(!TransformKind::Logit.domain_contains(1.0));
        assert!(TransformKind::Logit.domain_contains(0.5));
    }

    #[test]
    fn derivatives_are_consistent_with_transforms() {
        let h = 1e-7;
        for &v in &[0.2, 0.5, 0.9] {
            let numeric =
                (TransformKind::Logit.apply(v + h) - TransformKind::Logit.apply(v - h)) / (2.0 * h);
            assert_abs_diff_eq!(TransformKind::Logit.derivative(v), numeric, epsilon = 1e-4);
        }
        for &t in &[-1.0, 0.0, 2.0] {
            let numeric =
                (TransformKind::Logit.invert(t + h) - TransformKind::Logit.invert(t - h))
                    / (2.0 * h);
            assert_abs_diff_eq!(
                TransformKind::Logit.inverse_derivative(t),
                numeric,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn save_load_round_trip() {
        let model = toy_model();
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        model.save(path).unwrap();
        let loaded = FittedModel::load(path).unwrap();

        assert_eq!(loaded.transform, TransformKind::Logit);
        assert_eq!(loaded.gold_definition, "measured");
        assert_eq!(loaded.delimiter, "+");
        assert_abs_diff_eq!(loaded.heterogeneity_variance, 0.02, epsilon = 1e-12);
        assert_eq!(loaded.terms.len(), 2);
        assert_abs_diff_eq!(loaded.terms[0].estimates[0], 0.42, epsilon = 1e-12);
        match &loaded.terms[1].kind {
            FittedTermKind::Spline { basis, .. } => assert_eq!(basis.num_basis(), 4),
            other => panic!("Expected spline term, got {other:?}"),
        }
    }

    #[test]
    fn fixed_effects_table_names_every_coefficient() {
        let model = toy_model();
        let rows = model.fixed_effects();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].coefficient, "self_report");
        assert_eq!(rows[1].coefficient, "age_mid[0]");
        assert_eq!(rows[4].coefficient, "age_mid[3]");
        assert_abs_diff_eq!(rows[0].estimate, 0.42, epsilon = 1e-12);

        let mut buf = Vec::new();
        model.write_fixed_effects_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("term,coefficient,estimate,standard_error"));
        assert!(text.contains("age_mid,age_mid[2],0.3,0.02"));
    }

    #[test]
    fn required_covariates_lists_covariate_terms_only() {
        let model = toy_model();
        assert_eq!(model.required_covariates(), vec!["age_mid"]);
    }
}
