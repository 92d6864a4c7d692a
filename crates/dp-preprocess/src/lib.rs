#![forbid(unsafe_code)]

use dp_dataset::{DataPoint, Dataset};
use dp_types::{FieldType, FieldValue, boolean_coercion, display_text, numeric_coercion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const IMPUTATION_REASON: &str = "missing_value_replacement";
const OUTLIER_REASON: &str = "iqr_detection";
const OUTLIER_METHOD: &str = "iqr";
const COLUMNS_SECTION: &str = "columns";
const STATUS_SECTION: &str = "status";
const IMPUTATION_SECTION: &str = "imputation";

/// Minimum numeric sample size for a column to take part in outlier
/// detection.
const MIN_IQR_SAMPLES: usize = 4;

pub const DEFAULT_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreprocessError {
    #[error("outlier multiplier must be strictly positive, got {0}")]
    InvalidMultiplier(f64),
}

/// Summary of one preprocessing run, rendered verbatim in responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessReport {
    pub input_row_count: usize,
    pub output_row_count: usize,
    pub outliers_removed: usize,
    pub missing_values_replaced: usize,
    pub normalized_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessOutcome {
    pub cleaned: Dataset,
    pub outliers: Dataset,
    pub report: PreprocessReport,
}

/// Per-column analysis result: the elected type and, for numeric columns,
/// the surviving samples keyed by source row index.
#[derive(Debug, Clone)]
struct ColumnProfile {
    field_type: FieldType,
    numeric_samples: Vec<(usize, f64)>,
}

impl ColumnProfile {
    fn unknown() -> Self {
        Self {
            field_type: FieldType::Unknown,
            numeric_samples: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Observation {
    missing: bool,
    numeric: Option<f64>,
    boolean: Option<bool>,
    text: Option<String>,
}

/// Non-destructive cleaning pipeline: type normalization, IQR outlier
/// separation, then per-type imputation, with provenance written into each
/// touched row's `_meta`.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    multiplier: f64,
}

impl Preprocessor {
    pub fn new(multiplier: f64) -> Result<Self, PreprocessError> {
        if multiplier <= 0.0 || multiplier.is_nan() {
            return Err(PreprocessError::InvalidMultiplier(multiplier));
        }
        Ok(Self { multiplier })
    }

    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Runs the full pipeline. The input dataset is read only; cleaned and
    /// outlier rows are new datasets sharing the input column order.
    #[must_use]
    pub fn process(&self, dataset: &Dataset) -> PreprocessOutcome {
        let mut cleaned = dataset.clone();
        let mut outliers = Dataset::with_columns(dataset.columns().to_vec());
        let mut report = PreprocessReport {
            input_row_count: dataset.row_count(),
            ..PreprocessReport::default()
        };

        let mut profiles = Vec::with_capacity(dataset.column_count());
        for column in dataset.columns().to_vec() {
            let profile = profile_and_normalize(dataset, &mut cleaned, &column, &mut report);
            profiles.push((column, profile));
        }

        let mask = self.build_outlier_mask(&profiles, dataset.row_count());
        let moved = split_outliers(&mask, &mut cleaned, &mut outliers);
        report.outliers_removed += moved;

        report.missing_values_replaced += impute_missing_values(&profiles, &mut cleaned);
        report.output_row_count = cleaned.row_count();

        PreprocessOutcome {
            cleaned,
            outliers,
            report,
        }
    }

    /// Marks every row holding a sample outside `[Q1 − k·IQR, Q3 + k·IQR]`
    /// in any qualifying numeric column.
    fn build_outlier_mask(
        &self,
        profiles: &[(String, ColumnProfile)],
        row_count: usize,
    ) -> Vec<bool> {
        let mut mask = vec![false; row_count];
        for (_, profile) in profiles {
            if profile.field_type != FieldType::Numeric
                || profile.numeric_samples.len() < MIN_IQR_SAMPLES
            {
                continue;
            }

            let mut values: Vec<f64> = profile
                .numeric_samples
                .iter()
                .map(|(_, value)| *value)
                .collect();
            values.sort_by(f64::total_cmp);

            let (q1, q3) = quartiles(&values);
            let iqr = q3 - q1;
            let lower = q1 - self.multiplier * iqr;
            let upper = q3 + self.multiplier * iqr;

            for (row, value) in &profile.numeric_samples {
                if (*value < lower || *value > upper) && *row < mask.len() {
                    mask[*row] = true;
                }
            }
        }
        mask
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

/// Stage A for one column: count the tentative coercions, elect the column
/// type, and write the normalized values into the cleaned dataset.
fn profile_and_normalize(
    source: &Dataset,
    cleaned: &mut Dataset,
    column: &str,
    report: &mut PreprocessReport,
) -> ColumnProfile {
    let row_count = source.row_count();
    if row_count == 0 {
        return ColumnProfile::unknown();
    }

    let mut observations = Vec::with_capacity(row_count);
    let mut numeric_convertible = 0usize;
    let mut boolean_convertible = 0usize;
    let mut text_only = 0usize;

    for point in source.points() {
        let mut observation = Observation::default();
        match point.field(column) {
            None | Some(FieldValue::Null) => observation.missing = true,
            Some(value) => {
                observation.numeric = numeric_coercion(value);
                if observation.numeric.is_some() {
                    numeric_convertible += 1;
                }
                observation.boolean = boolean_coercion(value);
                if observation.boolean.is_some() {
                    boolean_convertible += 1;
                }
                match value {
                    FieldValue::Text(text) => {
                        observation.text = Some(text.clone());
                        if observation.numeric.is_none() && observation.boolean.is_none() {
                            text_only += 1;
                        }
                    }
                    _ => observation.text = Some(display_text(value)),
                }
            }
        }
        observations.push(observation);
    }

    let field_type = elect_type(numeric_convertible, boolean_convertible, text_only);
    let mut profile = ColumnProfile {
        field_type,
        numeric_samples: Vec::new(),
    };

    if field_type != FieldType::Unknown {
        report.normalized_fields.push(column.to_owned());
    }

    for (row, observation) in observations.iter().enumerate() {
        let Some(point) = cleaned.points_mut().get_mut(row) else {
            continue;
        };
        match field_type {
            FieldType::Numeric => match observation.numeric {
                Some(value) => {
                    point.set_field(column, value);
                    profile.numeric_samples.push((row, value));
                }
                None => point.set_field(column, FieldValue::Null),
            },
            FieldType::Boolean => match observation.boolean {
                Some(value) => point.set_field(column, value),
                None => point.set_field(column, FieldValue::Null),
            },
            FieldType::Text => {
                if observation.missing {
                    point.set_field(column, FieldValue::Null);
                } else if let Some(text) = &observation.text {
                    point.set_field(column, text.clone());
                } else if let Some(value) = observation.numeric {
                    point.set_field(column, value.to_string());
                } else if let Some(value) = observation.boolean {
                    point.set_field(column, value.to_string());
                } else {
                    point.set_field(column, String::new());
                }
            }
            FieldType::Unknown => point.set_field(column, FieldValue::Null),
        }
    }

    profile
}

/// Type election: no observations at all or text mixed with convertible
/// values yield Unknown; otherwise the largest count wins, ties broken in the
/// order Numeric > Boolean > Text.
fn elect_type(numeric: usize, boolean: usize, text_only: usize) -> FieldType {
    if numeric == 0 && boolean == 0 && text_only == 0 {
        return FieldType::Unknown;
    }
    if text_only > 0 && (numeric > 0 || boolean > 0) {
        return FieldType::Unknown;
    }
    if numeric >= boolean && numeric >= text_only {
        FieldType::Numeric
    } else if boolean >= text_only {
        FieldType::Boolean
    } else {
        FieldType::Text
    }
}

/// Stage B split: marked rows move to the outliers dataset, both sides
/// preserving their relative order.
fn split_outliers(mask: &[bool], cleaned: &mut Dataset, outliers: &mut Dataset) -> usize {
    if cleaned.is_empty() {
        return 0;
    }

    let points = std::mem::take(cleaned.points_mut());
    let mut moved = 0usize;
    for (index, mut point) in points.into_iter().enumerate() {
        if mask.get(index).copied().unwrap_or(false) {
            annotate_outlier(&mut point);
            outliers.push(point);
            moved += 1;
        } else {
            cleaned.push(point);
        }
    }
    moved
}

/// Stage C: replace the remaining nulls per column type, in dataset column
/// order, annotating each replacement.
fn impute_missing_values(profiles: &[(String, ColumnProfile)], cleaned: &mut Dataset) -> usize {
    let mut total = 0usize;
    for (column, profile) in profiles {
        total += match profile.field_type {
            FieldType::Numeric => impute_numeric_column(cleaned, column),
            FieldType::Boolean => impute_boolean_column(cleaned, column),
            FieldType::Text => impute_text_column(cleaned, column),
            FieldType::Unknown => 0,
        };
    }
    total
}

fn impute_numeric_column(cleaned: &mut Dataset, column: &str) -> usize {
    let mut values: Vec<f64> = cleaned
        .points()
        .iter()
        .filter_map(|point| point.field(column).and_then(FieldValue::as_float))
        .collect();
    if values.is_empty() {
        values.push(0.0);
    }
    let median = median_of(&mut values);

    let mut imputed = 0usize;
    for point in cleaned.points_mut() {
        if point.is_missing(column) {
            point.set_field(column, median);
            annotate_imputation(point, column, "median", FieldValue::Float(median));
            imputed += 1;
        }
    }
    imputed
}

fn impute_boolean_column(cleaned: &mut Dataset, column: &str) -> usize {
    let mut true_count = 0usize;
    let mut false_count = 0usize;
    for point in cleaned.points() {
        match point.field(column).and_then(FieldValue::as_bool) {
            Some(true) => true_count += 1,
            Some(false) => false_count += 1,
            None => {}
        }
    }
    let value = true_count >= false_count;

    let mut imputed = 0usize;
    for point in cleaned.points_mut() {
        if point.is_missing(column) {
            point.set_field(column, value);
            annotate_imputation(point, column, "mode_boolean", FieldValue::Bool(value));
            imputed += 1;
        }
    }
    imputed
}

fn impute_text_column(cleaned: &mut Dataset, column: &str) -> usize {
    let mut frequencies = std::collections::BTreeMap::<&str, usize>::new();
    for point in cleaned.points() {
        if let Some(text) = point.field(column).and_then(FieldValue::as_text) {
            *frequencies.entry(text).or_insert(0) += 1;
        }
    }

    // ascending key iteration makes `>` resolve count ties to the
    // lexicographic minimum
    let mut value = String::new();
    let mut best = 0usize;
    for (text, count) in frequencies {
        if count > best {
            value = text.to_owned();
            best = count;
        }
    }

    let mut imputed = 0usize;
    for point in cleaned.points_mut() {
        if point.is_missing(column) {
            point.set_field(column, value.clone());
            annotate_imputation(point, column, "mode_text", FieldValue::Text(value.clone()));
            imputed += 1;
        }
    }
    imputed
}

fn annotate_outlier(point: &mut DataPoint) {
    let status = point.meta_mut().ensure_section(STATUS_SECTION);
    status.set_leaf("outlier", true);
    status.set_leaf("reason", OUTLIER_REASON);
    status.set_leaf("method", OUTLIER_METHOD);
}

fn annotate_imputation(point: &mut DataPoint, column: &str, strategy: &str, value: FieldValue) {
    let imputation = point
        .meta_mut()
        .ensure_section(COLUMNS_SECTION)
        .ensure_section(column)
        .ensure_section(IMPUTATION_SECTION);
    imputation.set_leaf("imputed", true);
    imputation.set_leaf("reason", IMPUTATION_REASON);
    imputation.set_leaf("strategy", strategy);
    imputation.set_leaf("value", value);
}

fn median_of(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Q1/Q3 as medians of the lower and upper halves of the sorted sample; an
/// odd sample size excludes the middle element from both halves.
fn quartiles(sorted: &[f64]) -> (f64, f64) {
    if sorted.is_empty() {
        return (0.0, 0.0);
    }
    let mid = sorted.len() / 2;
    let upper_start = if sorted.len() % 2 == 0 { mid } else { mid + 1 };
    (
        median_of_sorted(&sorted[..mid]),
        median_of_sorted(&sorted[upper_start..]),
    )
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
