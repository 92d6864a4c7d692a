#![forbid(unsafe_code)]

use dp_dataset::Dataset;
use dp_stats::StatsError;
use dp_types::FieldValue;
use thiserror::Error;

mod program;
mod substitution;

use program::Program;
pub use substitution::ensure_allowed_characters;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("the expression is empty")]
    EmptyExpression,
    #[error("forbidden character in expression: '{0}'")]
    ForbiddenCharacter(char),
    #[error("unbalanced parentheses in expression")]
    UnbalancedParentheses,
    #[error("{function} expects exactly {expected} column argument(s), got {found}")]
    AggregateArity {
        function: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("the second argument of percentile must be a number, got \"{0}\"")]
    InvalidPercentileArgument(String),
    #[error("function not authorized: {0}")]
    UnauthorizedFunction(String),
    #[error("reference to an unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("the dataset no longer matches the columns the expression was compiled against (expected {expected}, got {found})")]
    ColumnCountMismatch { expected: usize, found: usize },
    #[error("column \"{column}\" holds a missing or non-numeric value")]
    MissingNumericValue { column: String },
    #[error("the expression produced a non-finite value")]
    NonFiniteResult,
    #[error("expression program is malformed")]
    MalformedProgram,
    #[error(transparent)]
    Stats(#[from] StatsError),
}

/// Result of evaluating a compiled expression: a single folded value when no
/// columns are referenced, otherwise one value per dataset row.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Scalar(f64),
    Rows(Vec<f64>),
}

/// Executable form of one expression, bound to the column layout of the
/// dataset it was compiled against.
///
/// The artifact owns the mutable slot vector used during row-wise
/// evaluation, so it must not be shared between threads; compile separately
/// per thread instead.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    normalized: String,
    column_names: Vec<String>,
    slots: Vec<f64>,
    referenced: Vec<usize>,
    program: Program,
}

impl CompiledExpression {
    /// Validates, substitutes aggregates against `dataset`, and compiles the
    /// remaining arithmetic into an executable program.
    pub fn compile(expr: &str, dataset: &Dataset) -> Result<Self, ExprError> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(ExprError::EmptyExpression);
        }

        substitution::ensure_allowed_characters(trimmed)?;
        let normalized = substitution::substitute_aggregates(trimmed, dataset)?;
        substitution::ensure_allowed_characters(&normalized)?;

        let referenced = program::collect_referenced_columns(&normalized, dataset)?;
        let program = program::compile(&normalized, dataset)?;

        Ok(Self {
            normalized,
            column_names: dataset.columns().to_vec(),
            slots: vec![0.0; dataset.column_count()],
            referenced,
            program,
        })
    }

    #[must_use]
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Indices of the reference-dataset columns the expression reads,
    /// ascending and duplicate-free.
    #[must_use]
    pub fn referenced_columns(&self) -> &[usize] {
        &self.referenced
    }

    /// True when the expression folds to a single scalar.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.referenced.is_empty()
    }

    /// Evaluates against a dataset with the same column layout as the
    /// compilation reference: once for scalar folds, otherwise per row with
    /// every referenced column required to hold a numeric value.
    pub fn evaluate(&mut self, dataset: &Dataset) -> Result<EvalValue, ExprError> {
        if dataset.column_count() != self.slots.len() {
            return Err(ExprError::ColumnCountMismatch {
                expected: self.slots.len(),
                found: dataset.column_count(),
            });
        }

        if self.referenced.is_empty() {
            return Ok(EvalValue::Scalar(self.run_once()?));
        }

        let mut rows = Vec::with_capacity(dataset.row_count());
        for point in dataset.points() {
            for &index in &self.referenced {
                let column = &self.column_names[index];
                match point.field(column) {
                    Some(FieldValue::Float(value)) => self.slots[index] = *value,
                    _ => {
                        return Err(ExprError::MissingNumericValue {
                            column: column.clone(),
                        });
                    }
                }
            }
            rows.push(self.run_once()?);
        }
        Ok(EvalValue::Rows(rows))
    }

    fn run_once(&self) -> Result<f64, ExprError> {
        let value = program::run(&self.program, &self.slots)?;
        if !value.is_finite() {
            return Err(ExprError::NonFiniteResult);
        }
        Ok(value)
    }
}
