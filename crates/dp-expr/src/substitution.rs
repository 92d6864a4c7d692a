use dp_dataset::Dataset;
use dp_stats::StatsError;

use crate::ExprError;

/// Characters permitted anywhere in an expression. The set is ASCII-only;
/// non-ASCII identifiers are rejected even though the tokenizer could read
/// them.
pub fn ensure_allowed_characters(expr: &str) -> Result<(), ExprError> {
    for c in expr.chars() {
        if c.is_ascii_alphanumeric() || "_+-*/%^(),. \t\n\r".contains(c) {
            continue;
        }
        return Err(ExprError::ForbiddenCharacter(c));
    }
    Ok(())
}

/// Replaces every aggregate call with its value computed against `dataset`,
/// formatted as a numeric literal. Each pass rescans the output of the
/// previous one, so aggregate arguments produced by an earlier substitution
/// are picked up by the later functions.
pub fn substitute_aggregates(expr: &str, dataset: &Dataset) -> Result<String, ExprError> {
    let mut out = expr.to_owned();

    substitute_unary(&mut out, "mean", dataset, false, dp_stats::mean)?;
    substitute_unary(&mut out, "median", dataset, false, dp_stats::median)?;
    substitute_unary(&mut out, "variance", dataset, false, dp_stats::variance)?;
    substitute_unary(&mut out, "stddev", dataset, false, dp_stats::stddev)?;
    // min/max double as variadic intrinsics: they are aggregates only when
    // called on exactly one column of the reference dataset
    substitute_unary(&mut out, "min", dataset, true, dp_stats::min)?;
    substitute_unary(&mut out, "max", dataset, true, dp_stats::max)?;
    substitute_correlation(&mut out, dataset)?;
    substitute_percentile(&mut out, dataset)?;

    Ok(out)
}

fn substitute_unary(
    expr: &mut String,
    function: &'static str,
    dataset: &Dataset,
    column_gated: bool,
    stat: fn(&Dataset, &str) -> Result<f64, StatsError>,
) -> Result<(), ExprError> {
    let mut pos = 0;
    while let Some(start) = find_call(expr, pos, function) {
        let Some(open) = open_paren_after(expr, start + function.len()) else {
            pos = start + function.len();
            continue;
        };

        let (arguments, closing) = extract_arguments(expr, open)?;
        if column_gated && !(arguments.len() == 1 && dataset.has_column(&arguments[0])) {
            pos = start + function.len();
            continue;
        }
        if arguments.len() != 1 {
            return Err(ExprError::AggregateArity {
                function,
                expected: 1,
                found: arguments.len(),
            });
        }

        let value = stat(dataset, &arguments[0])?;
        let replacement = format_aggregate(value);
        expr.replace_range(start..=closing, &replacement);
        pos = start + replacement.len();
    }
    Ok(())
}

fn substitute_correlation(expr: &mut String, dataset: &Dataset) -> Result<(), ExprError> {
    const FUNCTION: &str = "correlation";
    let mut pos = 0;
    while let Some(start) = find_call(expr, pos, FUNCTION) {
        let Some(open) = open_paren_after(expr, start + FUNCTION.len()) else {
            pos = start + FUNCTION.len();
            continue;
        };

        let (arguments, closing) = extract_arguments(expr, open)?;
        if arguments.len() != 2 {
            return Err(ExprError::AggregateArity {
                function: FUNCTION,
                expected: 2,
                found: arguments.len(),
            });
        }

        let value = dp_stats::correlation(dataset, &arguments[0], &arguments[1])?;
        let replacement = format_aggregate(value);
        expr.replace_range(start..=closing, &replacement);
        pos = start + replacement.len();
    }
    Ok(())
}

fn substitute_percentile(expr: &mut String, dataset: &Dataset) -> Result<(), ExprError> {
    const FUNCTION: &str = "percentile";
    let mut pos = 0;
    while let Some(start) = find_call(expr, pos, FUNCTION) {
        let Some(open) = open_paren_after(expr, start + FUNCTION.len()) else {
            pos = start + FUNCTION.len();
            continue;
        };

        let (arguments, closing) = extract_arguments(expr, open)?;
        if arguments.len() != 2 {
            return Err(ExprError::AggregateArity {
                function: FUNCTION,
                expected: 2,
                found: arguments.len(),
            });
        }

        let p: f64 = arguments[1]
            .parse()
            .map_err(|_| ExprError::InvalidPercentileArgument(arguments[1].clone()))?;

        let value = dp_stats::percentile(dataset, &arguments[0], p)?;
        let replacement = format_aggregate(value);
        expr.replace_range(start..=closing, &replacement);
        pos = start + replacement.len();
    }
    Ok(())
}

/// Next occurrence of `function` at an identifier boundary, scanning from
/// `pos`. The caller still has to check for the opening parenthesis.
fn find_call(expr: &str, mut pos: usize, function: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    while let Some(found) = expr[pos..].find(function) {
        let start = pos + found;
        let boundary_before = start == 0 || !is_identifier_byte(bytes[start - 1]);
        let end = start + function.len();
        let boundary_after = end >= bytes.len() || !is_identifier_byte(bytes[end]);
        if boundary_before && boundary_after {
            return Some(start);
        }
        pos = start + function.len();
    }
    None
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// Position of the `(` following the identifier, allowing only whitespace in
/// between; anything else means the identifier is not a call.
fn open_paren_after(expr: &str, mut index: usize) -> Option<usize> {
    let bytes = expr.as_bytes();
    while index < bytes.len() && bytes[index].is_ascii_whitespace() {
        index += 1;
    }
    (index < bytes.len() && bytes[index] == b'(').then_some(index)
}

/// Splits the parenthesized argument list starting at `open` on top-level
/// commas, returning the trimmed arguments and the index of the closing
/// parenthesis.
fn extract_arguments(expr: &str, open: usize) -> Result<(Vec<String>, usize), ExprError> {
    let bytes = expr.as_bytes();
    let mut depth = 1usize;
    let mut cursor = open + 1;
    let mut token_start = cursor;
    let mut arguments = Vec::new();

    while cursor < bytes.len() {
        match bytes[cursor] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    let token = expr[token_start..cursor].trim();
                    if !token.is_empty() {
                        arguments.push(token.to_owned());
                    }
                    return Ok((arguments, cursor));
                }
            }
            b',' if depth == 1 => {
                let token = expr[token_start..cursor].trim();
                if !token.is_empty() {
                    arguments.push(token.to_owned());
                }
                token_start = cursor + 1;
            }
            _ => {}
        }
        cursor += 1;
    }

    Err(ExprError::UnbalancedParentheses)
}

/// Formats an aggregate value as a plain decimal literal with 15 significant
/// digits, never using scientific notation so the result stays within the
/// allowed character set.
fn format_aggregate(value: f64) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }
    let rounded = format!("{value:.14e}").parse::<f64>().unwrap_or(value);
    rounded.to_string()
}

#[cfg(test)]
mod tests {
    use dp_dataset::{DataPoint, Dataset};

    use super::{
        ensure_allowed_characters, extract_arguments, format_aggregate, substitute_aggregates,
    };
    use crate::ExprError;

    fn price_dataset(values: &[f64]) -> Dataset {
        let mut dataset = Dataset::new();
        dataset.ensure_column("price").expect("column");
        for value in values {
            let mut point = DataPoint::new();
            point.set_field("price", *value);
            dataset.push(point);
        }
        dataset
    }

    #[test]
    fn unary_aggregates_are_replaced_by_literals() {
        let dataset = price_dataset(&[10.0, 20.0]);
        let out = substitute_aggregates("mean(price) * 2", &dataset).expect("substitute");
        assert_eq!(out, "15 * 2");
    }

    #[test]
    fn substitution_respects_identifier_boundaries() {
        let mut dataset = price_dataset(&[10.0, 20.0]);
        dataset.ensure_column("demean").expect("column");
        for point in dataset.points_mut() {
            point.set_field("demean", 1.0);
        }
        let out = substitute_aggregates("demean + mean(price)", &dataset).expect("substitute");
        assert_eq!(out, "demean + 15");
    }

    #[test]
    fn min_on_a_column_is_an_aggregate() {
        let dataset = price_dataset(&[10.0, 20.0]);
        let out = substitute_aggregates("min(price)", &dataset).expect("substitute");
        assert_eq!(out, "10");
    }

    #[test]
    fn min_on_expressions_passes_through() {
        let dataset = price_dataset(&[10.0, 20.0]);
        let out = substitute_aggregates("min(price, 11)", &dataset).expect("substitute");
        assert_eq!(out, "min(price, 11)");
    }

    #[test]
    fn percentile_requires_a_numeric_second_argument() {
        let dataset = price_dataset(&[10.0, 20.0]);
        let err = substitute_aggregates("percentile(price, high)", &dataset).expect_err("bad arg");
        assert_eq!(
            err,
            ExprError::InvalidPercentileArgument("high".to_owned())
        );
    }

    #[test]
    fn wrong_arity_is_reported_with_the_function_name() {
        let dataset = price_dataset(&[10.0, 20.0]);
        let err = substitute_aggregates("mean(price, price)", &dataset).expect_err("arity");
        assert_eq!(
            err,
            ExprError::AggregateArity {
                function: "mean",
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn unbalanced_argument_lists_fail() {
        let dataset = price_dataset(&[10.0, 20.0]);
        let err = substitute_aggregates("mean(price", &dataset).expect_err("unbalanced");
        assert_eq!(err, ExprError::UnbalancedParentheses);
    }

    #[test]
    fn argument_extraction_splits_on_top_level_commas_only() {
        let (arguments, closing) =
            extract_arguments("f(a, g(b, c), d)", 1).expect("arguments");
        assert_eq!(arguments, vec!["a", "g(b, c)", "d"]);
        assert_eq!(closing, 15);
    }

    #[test]
    fn aggregate_formatting_stays_in_the_allowed_charset() {
        for value in [15.0, -2.5, 1.0 / 3.0, 1e-7, 123456789.123] {
            let formatted = format_aggregate(value);
            ensure_allowed_characters(&formatted).expect("charset");
            let parsed: f64 = formatted.parse().expect("parse back");
            assert!((parsed - value).abs() <= value.abs() * 1e-14);
        }
        assert_eq!(format_aggregate(0.0), "0");
        assert_eq!(format_aggregate(15.0), "15");
    }
}
