//! # Data Loading and Validation Module
//!
//! This module is the exclusive entry point for user-provided data. It reads
//! tabular data (TSV files or in-memory Polars DataFrames), validates it
//! against the column-role mapping supplied by the caller, and transforms it
//! into the clean `ndarray` structures required by the statistical core.
//!
//! - Typed roles: callers name their columns through [`ColumnRoles`] /
//!   [`RawColumnRoles`] rather than positional conventions, so the same
//!   engine works across differently shaped extraction sheets.
//! - User-centric errors: failures are assumed to be user-input errors. The
//!   `DataError` enum is designed to give actionable feedback, including the
//!   offending row indices for record-level violations.

use ndarray::{Array1, Array2, ShapeBuilder};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Names the columns that hold each role in a matched-comparison table.
#[derive(Debug, Clone)]
pub struct ColumnRoles {
    /// Column holding the transformed difference (alternative minus reference).
    pub observation: String,
    /// Column holding the standard error of the difference.
    pub standard_error: String,
    /// Column holding the (possibly composite) alternative definition label.
    pub alt_definition: String,
    /// Column holding the (possibly composite) reference definition label.
    pub ref_definition: String,
    /// Covariate columns, in the order the model should see them.
    pub covariates: Vec<String>,
    /// Column identifying the shared-heterogeneity group of each record.
    pub group_id: String,
}

/// Names the columns that hold each role in a table of raw observations
/// awaiting adjustment.
#[derive(Debug, Clone)]
pub struct RawColumnRoles {
    /// Column holding the raw measured value (linear space).
    pub value: String,
    /// Column holding the standard error of the raw value.
    pub standard_error: String,
    /// Column holding the (possibly composite) definition label.
    pub definition: String,
    /// Covariate columns, in the order the model should see them.
    pub covariates: Vec<String>,
    /// Optional row-identifier column. When absent, sequential 1-based ids
    /// are generated.
    pub row_id: Option<String>,
}

/// The set of distinct atomic definition labels observed in a comparison
/// table. Built once at store construction and immutable afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionRegistry {
    labels: Vec<String>,
}

impl DefinitionRegistry {
    /// Builds a registry from an iterator of atomic labels. Labels are
    /// deduplicated and stored sorted so the registry is deterministic.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        DefinitionRegistry {
            labels: set.into_iter().collect(),
        }
    }

    /// Returns a registry containing this registry's labels plus `label`.
    pub fn with_label(&self, label: &str) -> Self {
        DefinitionRegistry::from_labels(
            self.labels
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(label)),
        )
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.binary_search_by(|l| l.as_str().cmp(label)).is_ok()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Iterates over the labels other than `gold`, in sorted order.
    pub fn non_gold<'a>(&'a self, gold: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.labels
            .iter()
            .map(String::as_str)
            .filter(move |l| *l != gold)
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("Malformed input: {reason} (rows: {rows:?})")]
    MalformedInput { reason: String, rows: Vec<usize> },
    #[error("The input table contains no data rows.")]
    NoRecords,
}

/// Validated matched-comparison records, ready for model fitting.
///
/// Composite definition labels have already been decomposed into atomic
/// sub-definition sets using the caller's delimiter.
#[derive(Debug)]
pub struct ObservationStore {
    /// Transformed differences (alternative minus reference).
    pub diff: Array1<f64>,
    /// Standard errors of the differences. All strictly positive.
    pub diff_se: Array1<f64>,
    /// Atomic sub-definition labels of each record's alternative definition.
    pub alt_defs: Vec<Vec<String>>,
    /// Atomic sub-definition labels of each record's reference definition.
    pub ref_defs: Vec<Vec<String>>,
    /// Covariate matrix, shape `[n_records, covariate_names.len()]`.
    pub covariates: Array2<f64>,
    /// Covariate column names, matching the columns of `covariates`.
    pub covariate_names: Vec<String>,
    /// Group identifier of each record. Carried for provenance and export;
    /// the likelihood treats records individually, with one heterogeneity
    /// variance shared across all of them.
    pub group_ids: Vec<String>,
    /// Distinct atomic labels observed across both definition roles.
    pub registry: DefinitionRegistry,
    /// Delimiter used to decompose composite labels. Recorded so the same
    /// decomposition applies at adjustment time.
    pub delimiter: String,
}

impl ObservationStore {
    /// Validates a comparison table and builds the store.
    pub fn from_dataframe(
        df: &DataFrame,
        roles: &ColumnRoles,
        delimiter: &str,
    ) -> Result<Self, DataError> {
        let n = df.height();
        if n == 0 {
            return Err(DataError::NoRecords);
        }

        let diff = Array1::from_vec(internal::extract_numeric_column(df, &roles.observation)?);
        let diff_se =
            Array1::from_vec(internal::extract_numeric_column(df, &roles.standard_error)?);
        let alt_raw = internal::extract_string_column(df, &roles.alt_definition)?;
        let ref_raw = internal::extract_string_column(df, &roles.ref_definition)?;
        let group_ids = internal::extract_string_column(df, &roles.group_id)?;
        let (covariates, covariate_names) =
            internal::extract_covariates(df, &roles.covariates, n)?;

        let alt_defs = internal::decompose_all(&alt_raw, delimiter, &roles.alt_definition)?;
        let ref_defs = internal::decompose_all(&ref_raw, delimiter, &roles.ref_definition)?;

        // Record-level invariants. Collect every offending row so the caller
        // can fix the whole file in one pass.
        let identical: Vec<usize> = (0..n)
            .filter(|&i| internal::same_label_set(&alt_defs[i], &ref_defs[i]))
            .collect();
        if !identical.is_empty() {
            return Err(DataError::MalformedInput {
                reason: format!(
                    "'{}' and '{}' are identical; a comparison record must compare two distinct definitions",
                    roles.alt_definition, roles.ref_definition
                ),
                rows: identical,
            });
        }

        let bad_se: Vec<usize> = (0..n).filter(|&i| diff_se[i] <= 0.0).collect();
        if !bad_se.is_empty() {
            return Err(DataError::MalformedInput {
                reason: format!("'{}' must be strictly positive", roles.standard_error),
                rows: bad_se,
            });
        }

        let registry = DefinitionRegistry::from_labels(
            alt_defs
                .iter()
                .chain(ref_defs.iter())
                .flatten()
                .map(String::as_str),
        );

        log::info!(
            "Observation store built: {} records, {} atomic definitions, {} covariates.",
            n,
            registry.labels().len(),
            covariate_names.len()
        );

        Ok(ObservationStore {
            diff,
            diff_se,
            alt_defs,
            ref_defs,
            covariates,
            covariate_names,
            group_ids,
            registry,
            delimiter: delimiter.to_string(),
        })
    }

    pub fn n_records(&self) -> usize {
        self.diff.len()
    }

    /// Returns the column index of a covariate by name.
    pub fn covariate_index(&self, name: &str) -> Option<usize> {
        self.covariate_names.iter().position(|c| c == name)
    }
}

/// Raw observations awaiting adjustment, validated against the column roles.
#[derive(Debug)]
pub struct RawObservations {
    pub values: Array1<f64>,
    /// Standard errors of the raw values. All strictly positive.
    pub value_se: Array1<f64>,
    /// Atomic sub-definition labels of each row's definition.
    pub definitions: Vec<Vec<String>>,
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
    pub row_ids: Vec<String>,
}

impl RawObservations {
    pub fn from_dataframe(
        df: &DataFrame,
        roles: &RawColumnRoles,
        delimiter: &str,
    ) -> Result<Self, DataError> {
        let n = df.height();
        if n == 0 {
            return Err(DataError::NoRecords);
        }

        let values = Array1::from_vec(internal::extract_numeric_column(df, &roles.value)?);
        let value_se =
            Array1::from_vec(internal::extract_numeric_column(df, &roles.standard_error)?);
        let def_raw = internal::extract_string_column(df, &roles.definition)?;
        let definitions = internal::decompose_all(&def_raw, delimiter, &roles.definition)?;
        let (covariates, covariate_names) =
            internal::extract_covariates(df, &roles.covariates, n)?;

        let bad_se: Vec<usize> = (0..n).filter(|&i| value_se[i] <= 0.0).collect();
        if !bad_se.is_empty() {
            return Err(DataError::MalformedInput {
                reason: format!("'{}' must be strictly positive", roles.standard_error),
                rows: bad_se,
            });
        }

        let row_ids = match &roles.row_id {
            Some(col) => internal::extract_string_column(df, col)?,
            None => (1..=n).map(|i| i.to_string()).collect(),
        };

        Ok(RawObservations {
            values,
            value_se,
            definitions,
            covariates,
            covariate_names,
            row_ids,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.values.len()
    }

    pub fn covariate_index(&self, name: &str) -> Option<usize> {
        self.covariate_names.iter().position(|c| c == name)
    }
}

/// Loads and validates a matched-comparison TSV file.
pub fn load_comparison_data(
    path: &str,
    roles: &ColumnRoles,
    delimiter: &str,
) -> Result<ObservationStore, DataError> {
    let df = internal::read_tsv(path)?;
    ObservationStore::from_dataframe(&df, roles, delimiter)
}

/// Loads and validates a TSV file of raw observations to adjust.
pub fn load_adjustment_data(
    path: &str,
    roles: &RawColumnRoles,
    delimiter: &str,
) -> Result<RawObservations, DataError> {
    let df = internal::read_tsv(path)?;
    RawObservations::from_dataframe(&df, roles, delimiter)
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    pub(super) fn read_tsv(path: &str) -> Result<DataFrame, DataError> {
        log::info!("Loading data from '{path}'");
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;
        Ok(df)
    }

    fn require_column<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Column, DataError> {
        df.column(name)
            .map_err(|_| DataError::ColumnNotFound(name.to_string()))
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = require_column(df, column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(DataError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|&v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_string_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        let series = require_column(df, column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let mut out = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            let value = series.get(i).unwrap_or(AnyValue::Null);
            match value {
                AnyValue::Null => {
                    return Err(DataError::MissingValuesFound(column_name.to_string()));
                }
                AnyValue::String(s) => out.push(s.to_string()),
                AnyValue::StringOwned(s) => out.push(s.to_string()),
                other => out.push(other.to_string()),
            }
        }
        Ok(out)
    }

    pub(super) fn extract_covariates(
        df: &DataFrame,
        names: &[String],
        n: usize,
    ) -> Result<(Array2<f64>, Vec<String>), DataError> {
        if names.is_empty() {
            return Ok((Array2::zeros((n, 0)), Vec::new()));
        }
        let mut buffer = Vec::with_capacity(n * names.len());
        for name in names {
            let mut column = extract_numeric_column(df, name)?;
            buffer.append(&mut column);
        }
        let matrix = Array2::from_shape_vec((n, names.len()).f(), buffer)
            .expect("covariate columns share the row count that produced them");
        Ok((matrix, names.to_vec()))
    }

    /// Splits a composite label into its atomic components.
    pub(super) fn decompose(label: &str, delimiter: &str) -> Vec<String> {
        label
            .split(delimiter)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub(super) fn decompose_all(
        raw: &[String],
        delimiter: &str,
        column_name: &str,
    ) -> Result<Vec<Vec<String>>, DataError> {
        let decomposed: Vec<Vec<String>> =
            raw.iter().map(|l| decompose(l, delimiter)).collect();
        let empty: Vec<usize> = decomposed
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_empty())
            .map(|(i, _)| i)
            .collect();
        if !empty.is_empty() {
            return Err(DataError::MalformedInput {
                reason: format!("'{column_name}' contains empty definition labels"),
                rows: empty,
            });
        }
        Ok(decomposed)
    }

    /// Set equality between two atomic label lists.
    pub(super) fn same_label_set(a: &[String], b: &[String]) -> bool {
        let sa: BTreeSet<&str> = a.iter().map(String::as_str).collect();
        let sb: BTreeSet<&str> = b.iter().map(String::as_str).collect();
        sa == sb
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn roles() -> ColumnRoles {
        ColumnRoles {
            observation: "log_diff".to_string(),
            standard_error: "log_diff_se".to_string(),
            alt_definition: "alt".to_string(),
            ref_definition: "ref".to_string(),
            covariates: vec!["age_mid".to_string()],
            group_id: "study".to_string(),
        }
    }

    fn comparison_frame() -> DataFrame {
        df!(
            "log_diff" => [0.5, 0.3, -0.1],
            "log_diff_se" => [0.1, 0.2, 0.1],
            "alt" => ["self_report", "claims", "self_report_claims"],
            "ref" => ["measured", "measured", "measured"],
            "age_mid" => [40.0, 55.0, 62.5],
            "study" => ["s1", "s1", "s2"],
        )
        .unwrap()
    }

    #[test]
    fn builds_store_and_registry() {
        let store = ObservationStore::from_dataframe(&comparison_frame(), &roles(), "_").unwrap();
        assert_eq!(store.n_records(), 3);
        assert_abs_diff_eq!(store.diff[0], 0.5, epsilon = 1e-12);
        assert_eq!(store.alt_defs[2], vec!["self", "report", "claims"]);
        // Registry is the sorted union of atomic labels from both roles.
        assert_eq!(
            store.registry.labels(),
            &["claims", "measured", "report", "self"]
        );
        assert!(store.registry.contains("measured"));
        assert!(!store.registry.contains("ward"));
        assert_eq!(store.covariate_index("age_mid"), Some(0));
    }

    #[test]
    fn identical_definitions_rejected_with_row_indices() {
        let df = df!(
            "log_diff" => [0.5, 0.3],
            "log_diff_se" => [0.1, 0.2],
            "alt" => ["measured", "claims"],
            "ref" => ["measured", "measured"],
            "age_mid" => [40.0, 55.0],
            "study" => ["s1", "s1"],
        )
        .unwrap();
        match ObservationStore::from_dataframe(&df, &roles(), "_").unwrap_err() {
            DataError::MalformedInput { rows, .. } => assert_eq!(rows, vec![0]),
            other => panic!("Expected MalformedInput, got {other:?}"),
        }
    }

    #[test]
    fn composite_order_does_not_hide_identical_definitions() {
        // "a_b" vs "b_a" decompose to the same atomic set and must be rejected.
        let df = df!(
            "log_diff" => [0.5],
            "log_diff_se" => [0.1],
            "alt" => ["a_b"],
            "ref" => ["b_a"],
            "age_mid" => [40.0],
            "study" => ["s1"],
        )
        .unwrap();
        assert!(matches!(
            ObservationStore::from_dataframe(&df, &roles(), "_").unwrap_err(),
            DataError::MalformedInput { .. }
        ));
    }

    #[test]
    fn non_positive_standard_errors_rejected() {
        let df = df!(
            "log_diff" => [0.5, 0.3, 0.1],
            "log_diff_se" => [0.1, 0.0, -0.2],
            "alt" => ["a", "b", "a"],
            "ref" => ["g", "g", "g"],
            "age_mid" => [40.0, 55.0, 60.0],
            "study" => ["s1", "s1", "s2"],
        )
        .unwrap();
        match ObservationStore::from_dataframe(&df, &roles(), "_").unwrap_err() {
            DataError::MalformedInput { rows, .. } => assert_eq!(rows, vec![1, 2]),
            other => panic!("Expected MalformedInput, got {other:?}"),
        }
    }

    #[test]
    fn missing_covariate_column_rejected() {
        let mut r = roles();
        r.covariates = vec!["bmi".to_string()];
        match ObservationStore::from_dataframe(&comparison_frame(), &r, "_").unwrap_err() {
            DataError::ColumnNotFound(col) => assert_eq!(col, "bmi"),
            other => panic!("Expected ColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_observation_rejected() {
        let df = df!(
            "log_diff" => [0.5, f64::NAN],
            "log_diff_se" => [0.1, 0.2],
            "alt" => ["a", "b"],
            "ref" => ["g", "g"],
            "age_mid" => [40.0, 55.0],
            "study" => ["s1", "s1"],
        )
        .unwrap();
        match ObservationStore::from_dataframe(&df, &roles(), "_").unwrap_err() {
            DataError::NonFiniteValuesFound(col) => assert_eq!(col, "log_diff"),
            other => panic!("Expected NonFiniteValuesFound, got {other:?}"),
        }
    }

    #[test]
    fn empty_frame_rejected() {
        let df = df!(
            "log_diff" => Vec::<f64>::new(),
            "log_diff_se" => Vec::<f64>::new(),
            "alt" => Vec::<String>::new(),
            "ref" => Vec::<String>::new(),
            "age_mid" => Vec::<f64>::new(),
            "study" => Vec::<String>::new(),
        )
        .unwrap();
        assert!(matches!(
            ObservationStore::from_dataframe(&df, &roles(), "_").unwrap_err(),
            DataError::NoRecords
        ));
    }

    #[test]
    fn raw_observations_generate_sequential_row_ids() {
        let df = df!(
            "mean" => [0.2, 0.4],
            "mean_se" => [0.05, 0.05],
            "definition" => ["self_report", "measured"],
            "age_mid" => [40.0, 50.0],
        )
        .unwrap();
        let raw_roles = RawColumnRoles {
            value: "mean".to_string(),
            standard_error: "mean_se".to_string(),
            definition: "definition".to_string(),
            covariates: vec!["age_mid".to_string()],
            row_id: None,
        };
        let raw = RawObservations::from_dataframe(&df, &raw_roles, "_").unwrap();
        assert_eq!(raw.row_ids, vec!["1", "2"]);
        assert_eq!(raw.definitions[0], vec!["self", "report"]);
        assert_eq!(raw.n_rows(), 2);
    }

    #[test]
    fn raw_observations_use_row_id_column_when_named() {
        let df = df!(
            "mean" => [0.2],
            "mean_se" => [0.05],
            "definition" => ["claims"],
            "seq" => ["row-7"],
        )
        .unwrap();
        let raw_roles = RawColumnRoles {
            value: "mean".to_string(),
            standard_error: "mean_se".to_string(),
            definition: "definition".to_string(),
            covariates: vec![],
            row_id: Some("seq".to_string()),
        };
        let raw = RawObservations::from_dataframe(&df, &raw_roles, "_").unwrap();
        assert_eq!(raw.row_ids, vec!["row-7"]);
        assert_eq!(raw.covariates.shape(), &[1, 0]);
    }

    #[test]
    fn load_comparison_data_reads_tsv() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_diff\tlog_diff_se\talt\tref\tage_mid\tstudy").unwrap();
        writeln!(file, "0.5\t0.1\tself_report\tmeasured\t40.0\ts1").unwrap();
        writeln!(file, "0.3\t0.2\tclaims\tmeasured\t55.0\ts2").unwrap();
        file.flush().unwrap();

        let store =
            load_comparison_data(file.path().to_str().unwrap(), &roles(), "_").unwrap();
        assert_eq!(store.n_records(), 2);
        assert_eq!(store.group_ids, vec!["s1", "s2"]);
    }
}
