#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::Utc;
use dp_dataset::Dataset;
use dp_expr::{CompiledExpression, EvalValue, ExprError};
use dp_stats::StatsError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Builtin names accepted in the direct-call form `<name>(<args>)`.
const BUILTIN_NAMES: &[&str] = &[
    "mean",
    "median",
    "variance",
    "stddev",
    "correlation",
    "min",
    "max",
    "percentile",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("{0} expects exactly one column argument")]
    UnaryBuiltinArity(&'static str),
    #[error("correlation expects exactly two column arguments")]
    CorrelationArity,
    #[error("percentile expects one or two arguments")]
    PercentileArity,
    #[error("percentile requires a second argument or a `percentile` parameter")]
    MissingPercentileParam,
    #[error("cannot interpret \"{0}\" as a number for percentile")]
    InvalidPercentileParam(String),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// One analytic operation as supplied by the caller. `alias`, when present
/// and non-empty, becomes the reported identity of the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDefinition {
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<BTreeMap<String, String>>,
}

impl OperationDefinition {
    #[must_use]
    pub fn from_expr(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            alias: None,
            params: None,
        }
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .as_ref()
            .and_then(|params| params.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Success,
    Error,
}

/// Computed value of one operation: a scalar for folds and builtin calls, a
/// row sequence for column-wise expressions, nothing after a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OperationValue {
    None,
    Scalar(f64),
    Rows(Vec<f64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub expr: String,
    pub status: OperationStatus,
    #[serde(rename = "result")]
    pub value: OperationValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub executed_at: String,
}

/// Evaluates a list of operations against a cleaned dataset. Operations are
/// independent: a failure is captured into its own result and the remaining
/// operations still run, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndicatorEngine;

impl IndicatorEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn execute(
        &self,
        dataset: &Dataset,
        operations: &[OperationDefinition],
    ) -> Vec<OperationResult> {
        operations
            .iter()
            .map(|operation| self.execute_one(dataset, operation))
            .collect()
    }

    fn execute_one(&self, dataset: &Dataset, operation: &OperationDefinition) -> OperationResult {
        let expr = operation
            .alias
            .as_deref()
            .filter(|alias| !alias.is_empty())
            .unwrap_or(&operation.expr)
            .to_owned();
        let executed_at = iso_timestamp_utc();

        match evaluate_operation(dataset, operation) {
            Ok(value) => OperationResult {
                expr,
                status: OperationStatus::Success,
                value,
                error_message: None,
                executed_at,
            },
            Err(error) => OperationResult {
                expr,
                status: OperationStatus::Error,
                value: OperationValue::None,
                error_message: Some(error.to_string()),
                executed_at,
            },
        }
    }
}

fn evaluate_operation(
    dataset: &Dataset,
    operation: &OperationDefinition,
) -> Result<OperationValue, EngineError> {
    if let Some(call) = detect_builtin_call(&operation.expr) {
        let value = execute_builtin(dataset, operation, &call)?;
        return Ok(OperationValue::Scalar(value));
    }

    let mut compiled = CompiledExpression::compile(&operation.expr, dataset)?;
    match compiled.evaluate(dataset)? {
        EvalValue::Scalar(value) => Ok(OperationValue::Scalar(value)),
        EvalValue::Rows(values) => Ok(OperationValue::Rows(values)),
    }
}

struct BuiltinCall {
    function: &'static str,
    arguments: Vec<String>,
}

/// Recognizes the direct built-in call form: a known builtin name followed by
/// one parenthesized argument list spanning the rest of the expression.
/// `mean(a) + max(b)` does not match and falls through to the compiler.
fn detect_builtin_call(expr: &str) -> Option<BuiltinCall> {
    let trimmed = expr.trim();
    let bytes = trimmed.as_bytes();

    let first = *bytes.first()?;
    if !first.is_ascii_alphabetic() && first != b'_' {
        return None;
    }
    let mut i = 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    let name = &trimmed[..i];
    let function = *BUILTIN_NAMES.iter().find(|known| **known == name)?;

    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'(' {
        return None;
    }

    let mut depth = 0usize;
    let open = i;
    let mut close = None;
    for (offset, byte) in bytes.iter().enumerate().skip(open) {
        match byte {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(offset);
                    break;
                }
            }
            _ => {}
        }
    }
    // the call is direct only when its closing parenthesis ends the
    // expression
    let close = close?;
    if close != bytes.len() - 1 {
        return None;
    }

    let mut arguments = Vec::new();
    let inner = &trimmed[open + 1..close];
    let mut depth = 0usize;
    let mut start = 0;
    for (offset, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                let token = inner[start..offset].trim();
                if !token.is_empty() {
                    arguments.push(token.to_owned());
                }
                start = offset + 1;
            }
            _ => {}
        }
    }
    let last = inner[start..].trim();
    if !last.is_empty() {
        arguments.push(last.to_owned());
    }

    Some(BuiltinCall {
        function,
        arguments,
    })
}

fn execute_builtin(
    dataset: &Dataset,
    operation: &OperationDefinition,
    call: &BuiltinCall,
) -> Result<f64, EngineError> {
    let args = &call.arguments;
    match call.function {
        "mean" | "median" | "variance" | "stddev" | "min" | "max" => {
            if args.len() != 1 {
                return Err(EngineError::UnaryBuiltinArity(call.function));
            }
            let column = &args[0];
            let value = match call.function {
                "mean" => dp_stats::mean(dataset, column)?,
                "median" => dp_stats::median(dataset, column)?,
                "variance" => dp_stats::variance(dataset, column)?,
                "stddev" => dp_stats::stddev(dataset, column)?,
                "min" => dp_stats::min(dataset, column)?,
                _ => dp_stats::max(dataset, column)?,
            };
            Ok(value)
        }
        "correlation" => {
            if args.len() != 2 {
                return Err(EngineError::CorrelationArity);
            }
            Ok(dp_stats::correlation(dataset, &args[0], &args[1])?)
        }
        "percentile" => {
            if args.is_empty() || args.len() > 2 {
                return Err(EngineError::PercentileArity);
            }
            let p = if args.len() == 2 {
                parse_percentile(&args[1])?
            } else {
                // positional argument wins; the parameter is only consulted
                // in its absence
                let param = operation
                    .param("percentile")
                    .or_else(|| operation.param("p"))
                    .ok_or(EngineError::MissingPercentileParam)?;
                parse_percentile(param)?
            };
            Ok(dp_stats::percentile(dataset, &args[0], p)?)
        }
        _ => Err(EngineError::UnaryBuiltinArity(call.function)),
    }
}

fn parse_percentile(value: &str) -> Result<f64, EngineError> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::InvalidPercentileParam(value.to_owned()))
}

/// Current UTC time as ISO-8601 with millisecond precision and trailing `Z`.
#[must_use]
pub fn iso_timestamp_utc() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::DateTime;
    use dp_dataset::{DataPoint, Dataset};
    use dp_types::FieldValue;

    use super::{
        IndicatorEngine, OperationDefinition, OperationStatus, OperationValue, detect_builtin_call,
    };

    fn dataset(columns: &[(&str, &[f64])]) -> Dataset {
        let mut out = Dataset::new();
        for (name, _) in columns {
            out.ensure_column(name).expect("column");
        }
        let rows = columns.first().map_or(0, |(_, values)| values.len());
        for row in 0..rows {
            let mut point = DataPoint::new();
            for (name, values) in columns {
                point.set_field(*name, values[row]);
            }
            out.push(point);
        }
        out
    }

    fn operation(expr: &str) -> OperationDefinition {
        OperationDefinition::from_expr(expr)
    }

    #[test]
    fn builtin_calls_report_under_their_alias() {
        let data = dataset(&[("price", &[10.0, 20.0])]);
        let mut op = operation("mean(price)");
        op.alias = Some("avg_price".to_owned());

        let results = IndicatorEngine::new().execute(&data, &[op]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].expr, "avg_price");
        assert_eq!(results[0].status, OperationStatus::Success);
        assert_eq!(results[0].value, OperationValue::Scalar(15.0));
        assert_eq!(results[0].error_message, None);
    }

    #[test]
    fn failures_are_isolated_per_operation() {
        let data = dataset(&[("price", &[1.0, 2.0])]);
        let results = IndicatorEngine::new().execute(
            &data,
            &[operation("mean(undefined)"), operation("price * 2")],
        );

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, OperationStatus::Error);
        assert_eq!(results[0].value, OperationValue::None);
        assert!(results[0]
            .error_message
            .as_deref()
            .is_some_and(|message| !message.is_empty()));

        assert_eq!(results[1].status, OperationStatus::Success);
        assert_eq!(results[1].value, OperationValue::Rows(vec![2.0, 4.0]));
    }

    #[test]
    fn direct_call_detection_requires_a_single_call() {
        assert!(detect_builtin_call(" median( price ) ").is_some());
        assert!(detect_builtin_call("percentile(price, 90)").is_some());
        assert!(detect_builtin_call("mean(a) + max(b)").is_none());
        assert!(detect_builtin_call("(mean(a))").is_none());
        assert!(detect_builtin_call("unknown(a)").is_none());
        assert!(detect_builtin_call("mean").is_none());
    }

    #[test]
    fn compound_aggregate_expressions_take_the_compiler_path() {
        let data = dataset(&[("a", &[1.0, 3.0]), ("b", &[5.0, 7.0])]);
        let results = IndicatorEngine::new().execute(&data, &[operation("mean(a) + max(b)")]);
        assert_eq!(results[0].status, OperationStatus::Success);
        assert_eq!(results[0].value, OperationValue::Scalar(9.0));
    }

    #[test]
    fn percentile_reads_params_when_the_argument_is_missing() {
        let data = dataset(&[("price", &[10.0, 20.0, 30.0])]);

        let mut op = operation("percentile(price)");
        op.params = Some(BTreeMap::from([("p".to_owned(), "50".to_owned())]));
        let results = IndicatorEngine::new().execute(&data, &[op]);
        assert_eq!(results[0].value, OperationValue::Scalar(20.0));

        let bare = operation("percentile(price)");
        let results = IndicatorEngine::new().execute(&data, &[bare]);
        assert_eq!(results[0].status, OperationStatus::Error);
    }

    #[test]
    fn positional_percentile_wins_over_params() {
        let data = dataset(&[("price", &[10.0, 20.0, 30.0])]);
        let mut op = operation("percentile(price, 100)");
        op.params = Some(BTreeMap::from([("percentile".to_owned(), "0".to_owned())]));

        let results = IndicatorEngine::new().execute(&data, &[op]);
        assert_eq!(results[0].value, OperationValue::Scalar(30.0));
    }

    #[test]
    fn executed_at_is_iso_8601_with_milliseconds() {
        let data = dataset(&[("price", &[1.0])]);
        let results = IndicatorEngine::new().execute(&data, &[operation("mean(price)")]);
        let stamp = &results[0].executed_at;

        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.len(), "2026-01-01T00:00:00.000Z".len());
        DateTime::parse_from_rfc3339(stamp).expect("valid timestamp");
    }

    #[test]
    fn results_serialize_with_the_wire_field_names() {
        let data = dataset(&[("price", &[1.0, 2.0])]);
        let results = IndicatorEngine::new().execute(
            &data,
            &[operation("price * 2"), operation("mean(missing)")],
        );

        let json = serde_json::to_value(&results).expect("encode");
        assert_eq!(json[0]["status"], "success");
        assert_eq!(json[0]["result"], serde_json::json!([2.0, 4.0]));
        assert!(json[0]["error_message"].is_null());
        assert_eq!(json[1]["status"], "error");
        assert!(json[1]["result"].is_null());
        assert!(json[1]["error_message"].is_string());
    }

    #[test]
    fn empty_operation_lists_produce_empty_results() {
        let data = dataset(&[("price", &[1.0])]);
        let results = IndicatorEngine::new().execute(&data, &[]);
        assert!(results.is_empty());
    }

    #[test]
    fn null_fields_fail_row_wise_operations_with_a_named_column() {
        let mut data = dataset(&[("price", &[1.0, 2.0])]);
        data.points_mut()[0].set_field("price", FieldValue::Null);

        let results = IndicatorEngine::new().execute(&data, &[operation("price + 1")]);
        assert_eq!(results[0].status, OperationStatus::Error);
        assert!(results[0]
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("price")));
    }
}
