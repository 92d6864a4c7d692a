#![forbid(unsafe_code)]

use dp_dataset::Dataset;
use dp_types::FieldValue;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StatsError {
    #[error("column \"{column}\" does not exist in the dataset")]
    UnknownColumn { column: String },
    #[error("column \"{column}\" holds non-numeric values")]
    NonNumericColumn { column: String },
    #[error("column \"{column}\" holds no usable numeric values")]
    NoNumericValues { column: String },
    #[error("at least two numeric values are required in column \"{column}\"")]
    InsufficientValues { column: String },
    #[error("at least two aligned numeric pairs are required")]
    InsufficientPairs,
    #[error("column \"{column}\" has zero variance")]
    ZeroVariance { column: String },
    #[error("percentile must lie between 0 and 100, got {value}")]
    InvalidPercentile { value: f64 },
}

/// Numeric values of one column, in row order. Nulls and absent fields are
/// skipped; any non-null non-numeric value fails.
fn numeric_column(dataset: &Dataset, column: &str) -> Result<Vec<f64>, StatsError> {
    if !dataset.has_column(column) {
        return Err(StatsError::UnknownColumn {
            column: column.to_owned(),
        });
    }

    let mut values = Vec::with_capacity(dataset.row_count());
    for point in dataset.points() {
        match point.field(column) {
            None | Some(FieldValue::Null) => {}
            Some(FieldValue::Float(v)) => values.push(*v),
            Some(_) => {
                return Err(StatsError::NonNumericColumn {
                    column: column.to_owned(),
                });
            }
        }
    }

    if values.is_empty() {
        return Err(StatsError::NoNumericValues {
            column: column.to_owned(),
        });
    }

    Ok(values)
}

/// Row-aligned numeric pairs of two columns. A row contributes iff both
/// columns hold a numeric value; a numeric paired with a non-null non-numeric
/// value fails.
fn numeric_pairs(
    dataset: &Dataset,
    column_x: &str,
    column_y: &str,
) -> Result<(Vec<f64>, Vec<f64>), StatsError> {
    for column in [column_x, column_y] {
        if !dataset.has_column(column) {
            return Err(StatsError::UnknownColumn {
                column: column.to_owned(),
            });
        }
    }

    let mut values_x = Vec::with_capacity(dataset.row_count());
    let mut values_y = Vec::with_capacity(dataset.row_count());
    for point in dataset.points() {
        let field_x = point.field(column_x);
        let field_y = point.field(column_y);
        match (field_x, field_y) {
            (Some(FieldValue::Float(x)), Some(FieldValue::Float(y))) => {
                values_x.push(*x);
                values_y.push(*y);
            }
            (None | Some(FieldValue::Null), _) | (_, None | Some(FieldValue::Null)) => {}
            (Some(FieldValue::Float(_)), Some(_)) => {
                return Err(StatsError::NonNumericColumn {
                    column: column_y.to_owned(),
                });
            }
            (Some(_), _) => {
                return Err(StatsError::NonNumericColumn {
                    column: column_x.to_owned(),
                });
            }
        }
    }

    Ok((values_x, values_y))
}

fn mean_of(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn mean(dataset: &Dataset, column: &str) -> Result<f64, StatsError> {
    let values = numeric_column(dataset, column)?;
    Ok(mean_of(&values))
}

/// Sorted middle value; an even sample size averages the two middle values.
pub fn median(dataset: &Dataset, column: &str) -> Result<f64, StatsError> {
    let mut values = numeric_column(dataset, column)?;
    values.sort_by(f64::total_cmp);

    let size = values.len();
    if size % 2 == 0 {
        Ok((values[size / 2 - 1] + values[size / 2]) / 2.0)
    } else {
        Ok(values[size / 2])
    }
}

/// Population variance (divide by n), requiring at least two values.
pub fn variance(dataset: &Dataset, column: &str) -> Result<f64, StatsError> {
    let values = numeric_column(dataset, column)?;
    if values.len() < 2 {
        return Err(StatsError::InsufficientValues {
            column: column.to_owned(),
        });
    }

    let mean_value = mean_of(&values);
    let square_sum = values
        .iter()
        .map(|value| {
            let diff = value - mean_value;
            diff * diff
        })
        .sum::<f64>();
    Ok(square_sum / values.len() as f64)
}

pub fn stddev(dataset: &Dataset, column: &str) -> Result<f64, StatsError> {
    Ok(variance(dataset, column)?.sqrt())
}

pub fn min(dataset: &Dataset, column: &str) -> Result<f64, StatsError> {
    let values = numeric_column(dataset, column)?;
    Ok(values.iter().copied().fold(f64::INFINITY, f64::min))
}

pub fn max(dataset: &Dataset, column: &str) -> Result<f64, StatsError> {
    let values = numeric_column(dataset, column)?;
    Ok(values.iter().copied().fold(f64::NEG_INFINITY, f64::max))
}

/// Pearson correlation over row-aligned numeric pairs.
pub fn correlation(
    dataset: &Dataset,
    column_x: &str,
    column_y: &str,
) -> Result<f64, StatsError> {
    let (values_x, values_y) = numeric_pairs(dataset, column_x, column_y)?;
    if values_x.len() < 2 {
        return Err(StatsError::InsufficientPairs);
    }

    let mean_x = mean_of(&values_x);
    let mean_y = mean_of(&values_y);

    let mut numerator = 0.0;
    let mut denominator_x = 0.0;
    let mut denominator_y = 0.0;
    for (x, y) in values_x.iter().zip(&values_y) {
        let diff_x = x - mean_x;
        let diff_y = y - mean_y;
        numerator += diff_x * diff_y;
        denominator_x += diff_x * diff_x;
        denominator_y += diff_y * diff_y;
    }

    if denominator_x == 0.0 {
        return Err(StatsError::ZeroVariance {
            column: column_x.to_owned(),
        });
    }
    if denominator_y == 0.0 {
        return Err(StatsError::ZeroVariance {
            column: column_y.to_owned(),
        });
    }

    Ok(numerator / (denominator_x * denominator_y).sqrt())
}

/// Linear-interpolation percentile: rank = (p/100)·(n−1), interpolated
/// between the surrounding sorted values; p = 100 returns the maximum.
pub fn percentile(dataset: &Dataset, column: &str, p: f64) -> Result<f64, StatsError> {
    if !(0.0..=100.0).contains(&p) {
        return Err(StatsError::InvalidPercentile { value: p });
    }

    let mut values = numeric_column(dataset, column)?;
    values.sort_by(f64::total_cmp);

    if p == 100.0 {
        return Ok(values[values.len() - 1]);
    }

    let rank = (p / 100.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Ok(values[lower]);
    }

    let weight = rank - lower as f64;
    Ok(values[lower] + weight * (values[upper] - values[lower]))
}
