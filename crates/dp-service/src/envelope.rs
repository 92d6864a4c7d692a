use std::collections::BTreeMap;

use dp_dataset::{DataPoint, Dataset, MetaTree};
use dp_engine::OperationDefinition;
use dp_types::FieldValue;
use serde::Deserialize;

use crate::error::ServiceError;

/// Outer request shape, generic over the wire value type so the same
/// envelope serves both body formats. Missing required fields surface as
/// parse errors.
#[derive(Debug, Deserialize)]
pub(crate) struct RequestEnvelope<V> {
    pub data_descriptor: DataDescriptor,
    #[serde(default)]
    pub options: AnalysisOptions<V>,
    pub data: Vec<V>,
    #[serde(default)]
    pub operations: Vec<RawOperation<V>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DataDescriptor {
    pub origin: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub autodetect: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AnalysisOptions<V> {
    #[serde(default)]
    pub drop_outliers_percent: Option<V>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawOperation<V> {
    pub expr: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub params: Option<BTreeMap<String, V>>,
}

/// Fully validated request, ready for the core.
#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub origin: String,
    pub declared_content_type: Option<String>,
    pub autodetect: bool,
    pub multiplier: Option<f64>,
    pub dataset: Dataset,
    pub operations: Vec<OperationDefinition>,
}

pub(crate) fn parse_json_request(body: &str) -> Result<ParsedRequest, ServiceError> {
    let envelope: RequestEnvelope<serde_json::Value> =
        serde_json::from_str(body).map_err(|error| ServiceError::MalformedBody {
            format: "JSON",
            detail: error.to_string(),
        })?;

    let dataset = dataset_from_rows(
        envelope.data,
        json_row_entries,
        json_field_value,
        json_meta_tree,
    )?;
    let operations = operations_from_raw(envelope.operations, json_param)?;
    let multiplier = multiplier_from(envelope.options, json_multiplier)?;
    finalize(envelope.data_descriptor, multiplier, dataset, operations)
}

pub(crate) fn parse_yaml_request(body: &str) -> Result<ParsedRequest, ServiceError> {
    let envelope: RequestEnvelope<serde_yaml::Value> =
        serde_yaml::from_str(body).map_err(|error| ServiceError::MalformedBody {
            format: "YAML",
            detail: error.to_string(),
        })?;

    let dataset = dataset_from_rows(
        envelope.data,
        yaml_row_entries,
        yaml_field_value,
        yaml_meta_tree,
    )?;
    let operations = operations_from_raw(envelope.operations, yaml_param)?;
    let multiplier = multiplier_from(envelope.options, yaml_multiplier)?;
    finalize(envelope.data_descriptor, multiplier, dataset, operations)
}

fn finalize(
    descriptor: DataDescriptor,
    multiplier: Option<f64>,
    dataset: Dataset,
    operations: Vec<OperationDefinition>,
) -> Result<ParsedRequest, ServiceError> {
    let origin = descriptor.origin.trim().to_owned();
    if origin.is_empty() {
        return Err(ServiceError::MissingOrigin);
    }

    Ok(ParsedRequest {
        origin,
        declared_content_type: descriptor.content_type,
        autodetect: descriptor.autodetect,
        multiplier,
        dataset,
        operations,
    })
}

/// A supplied multiplier must read as a number; a null entry counts as
/// absent.
fn multiplier_from<V>(
    options: AnalysisOptions<V>,
    convert: impl Fn(V) -> Result<Option<f64>, ServiceError>,
) -> Result<Option<f64>, ServiceError> {
    match options.drop_outliers_percent {
        None => Ok(None),
        Some(value) => convert(value),
    }
}

/// Builds the dataset from the raw rows, registering columns in first
/// appearance order. The reserved `_meta` key feeds the row's provenance
/// tree instead of becoming a data field.
fn dataset_from_rows<V>(
    rows: Vec<V>,
    row_entries: impl Fn(V) -> Result<Vec<(String, V)>, ServiceError>,
    field_value: impl Fn(V) -> Result<FieldValue, ServiceError>,
    meta_tree: impl Fn(V) -> Result<MetaTree, ServiceError>,
) -> Result<Dataset, ServiceError> {
    let mut dataset = Dataset::new();
    for row in rows {
        let mut point = DataPoint::new();
        for (key, value) in row_entries(row)? {
            if key == "_meta" {
                *point.meta_mut() = meta_tree(value)?;
                continue;
            }
            dataset.ensure_column(&key)?;
            point.set_field(key, field_value(value)?);
        }
        dataset.push(point);
    }
    Ok(dataset)
}

fn operations_from_raw<V>(
    raw: Vec<RawOperation<V>>,
    param: impl Fn(V) -> Result<String, ServiceError>,
) -> Result<Vec<OperationDefinition>, ServiceError> {
    raw.into_iter()
        .map(|operation| {
            let expr = operation.expr.trim().to_owned();
            if expr.is_empty() {
                return Err(ServiceError::EmptyOperationExpr);
            }

            let alias = operation.alias.and_then(|alias| {
                let trimmed = alias.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_owned())
            });

            let params = match operation.params {
                Some(map) if !map.is_empty() => {
                    let mut out = BTreeMap::new();
                    for (key, value) in map {
                        out.insert(key, param(value)?);
                    }
                    Some(out)
                }
                _ => None,
            };

            Ok(OperationDefinition {
                expr,
                alias,
                params,
            })
        })
        .collect()
}

// ── JSON value mapping ─────────────────────────────────────────────────

fn json_row_entries(
    value: serde_json::Value,
) -> Result<Vec<(String, serde_json::Value)>, ServiceError> {
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(ServiceError::NonObjectRow),
    }
}

fn json_field_value(value: serde_json::Value) -> Result<FieldValue, ServiceError> {
    match value {
        serde_json::Value::Null => Ok(FieldValue::Null),
        serde_json::Value::Bool(flag) => Ok(FieldValue::Bool(flag)),
        serde_json::Value::Number(number) => {
            Ok(FieldValue::Float(number.as_f64().unwrap_or_default()))
        }
        serde_json::Value::String(text) => Ok(FieldValue::Text(text)),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            Err(ServiceError::NestedValue)
        }
    }
}

fn json_meta_tree(value: serde_json::Value) -> Result<MetaTree, ServiceError> {
    if !value.is_object() {
        return Err(ServiceError::InvalidMeta);
    }
    serde_json::from_value(value).map_err(|_| ServiceError::InvalidMeta)
}

fn json_multiplier(value: serde_json::Value) -> Result<Option<f64>, ServiceError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(number) => Ok(Some(number.as_f64().unwrap_or_default())),
        serde_json::Value::String(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ServiceError::InvalidMultiplierOption),
        _ => Err(ServiceError::InvalidMultiplierOption),
    }
}

fn json_param(value: serde_json::Value) -> Result<String, ServiceError> {
    match value {
        serde_json::Value::String(text) => Ok(text),
        serde_json::Value::Number(number) => Ok(number.to_string()),
        serde_json::Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(ServiceError::InvalidParam),
    }
}

// ── YAML value mapping ─────────────────────────────────────────────────
//
// YAML string scalars keep the loose reading of the boolean and numeric
// spellings, so quoted "yes" still becomes a boolean; JSON strings are never
// reinterpreted.

fn yaml_key(value: serde_yaml::Value) -> Result<String, ServiceError> {
    match value {
        serde_yaml::Value::String(text) => Ok(text),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        serde_yaml::Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(ServiceError::NonObjectRow),
    }
}

fn yaml_row_entries(
    value: serde_yaml::Value,
) -> Result<Vec<(String, serde_yaml::Value)>, ServiceError> {
    match value {
        serde_yaml::Value::Mapping(map) => map
            .into_iter()
            .map(|(key, value)| Ok((yaml_key(key)?, value)))
            .collect(),
        _ => Err(ServiceError::NonObjectRow),
    }
}

fn yaml_field_value(value: serde_yaml::Value) -> Result<FieldValue, ServiceError> {
    match value {
        serde_yaml::Value::Null => Ok(FieldValue::Null),
        serde_yaml::Value::Bool(flag) => Ok(FieldValue::Bool(flag)),
        serde_yaml::Value::Number(number) => {
            Ok(FieldValue::Float(number.as_f64().unwrap_or_default()))
        }
        serde_yaml::Value::String(text) => Ok(yaml_text_scalar(text)),
        _ => Err(ServiceError::NestedValue),
    }
}

fn yaml_text_scalar(text: String) -> FieldValue {
    match text.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => return FieldValue::Bool(true),
        "false" | "no" | "0" | "off" => return FieldValue::Bool(false),
        _ => {}
    }
    if let Ok(value) = text.parse::<f64>() {
        return FieldValue::Float(value);
    }
    FieldValue::Text(text)
}

fn yaml_meta_tree(value: serde_yaml::Value) -> Result<MetaTree, ServiceError> {
    let serde_yaml::Value::Mapping(map) = value else {
        return Err(ServiceError::InvalidMeta);
    };

    let mut tree = MetaTree::new();
    for (key, value) in map {
        let key = yaml_key(key).map_err(|_| ServiceError::InvalidMeta)?;
        match value {
            serde_yaml::Value::Mapping(_) => {
                *tree.ensure_section(key) = yaml_meta_tree(value)?;
            }
            serde_yaml::Value::Sequence(_) | serde_yaml::Value::Tagged(_) => {
                return Err(ServiceError::InvalidMeta);
            }
            scalar => {
                let leaf = yaml_field_value(scalar).map_err(|_| ServiceError::InvalidMeta)?;
                tree.set_leaf(key, leaf);
            }
        }
    }
    Ok(tree)
}

fn yaml_multiplier(value: serde_yaml::Value) -> Result<Option<f64>, ServiceError> {
    match value {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Number(number) => Ok(Some(number.as_f64().unwrap_or_default())),
        serde_yaml::Value::String(text) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ServiceError::InvalidMultiplierOption),
        _ => Err(ServiceError::InvalidMultiplierOption),
    }
}

fn yaml_param(value: serde_yaml::Value) -> Result<String, ServiceError> {
    match value {
        serde_yaml::Value::String(text) => Ok(text),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        serde_yaml::Value::Bool(flag) => Ok(flag.to_string()),
        _ => Err(ServiceError::InvalidParam),
    }
}

#[cfg(test)]
mod tests {
    use dp_types::FieldValue;

    use super::{parse_json_request, parse_yaml_request};
    use crate::error::ServiceError;

    #[test]
    fn json_rows_register_columns_in_document_order() {
        let body = r#"{
            "data_descriptor": {"origin": "test"},
            "data": [
                {"value": 10, "flag": true},
                {"flag": false, "value": 12, "extra": "x"}
            ]
        }"#;
        let parsed = parse_json_request(body).expect("parse");
        assert_eq!(
            parsed.dataset.columns(),
            &["value".to_owned(), "flag".to_owned(), "extra".to_owned()]
        );
        assert_eq!(parsed.dataset.row_count(), 2);
        assert_eq!(
            parsed.dataset.points()[0].field("value"),
            Some(&FieldValue::Float(10.0))
        );
    }

    #[test]
    fn json_meta_is_reserved_and_never_a_column() {
        let body = r#"{
            "data_descriptor": {"origin": "test"},
            "data": [{"value": 1, "_meta": {"source": "sensor", "nested": {"ok": true}}}]
        }"#;
        let parsed = parse_json_request(body).expect("parse");
        assert_eq!(parsed.dataset.columns(), &["value".to_owned()]);
        let meta = parsed.dataset.points()[0].meta();
        assert!(meta.get_path(&["nested", "ok"]).is_some());
    }

    #[test]
    fn nested_json_data_values_are_rejected() {
        let body = r#"{
            "data_descriptor": {"origin": "test"},
            "data": [{"value": [1, 2]}]
        }"#;
        assert_eq!(
            parse_json_request(body).expect_err("nested"),
            ServiceError::NestedValue
        );
    }

    #[test]
    fn meta_sequences_are_rejected() {
        let body = r#"{
            "data_descriptor": {"origin": "test"},
            "data": [{"value": 1, "_meta": {"bad": [1]}}]
        }"#;
        assert_eq!(
            parse_json_request(body).expect_err("sequence"),
            ServiceError::InvalidMeta
        );
    }

    #[test]
    fn missing_envelope_fields_are_parse_failures() {
        let err = parse_json_request(r#"{"data": []}"#).expect_err("descriptor");
        assert!(matches!(err, ServiceError::MalformedBody { .. }));

        let err =
            parse_json_request(r#"{"data_descriptor": {"origin": "x"}}"#).expect_err("data");
        assert!(matches!(err, ServiceError::MalformedBody { .. }));
    }

    #[test]
    fn blank_origin_is_rejected() {
        let body = r#"{"data_descriptor": {"origin": "  "}, "data": []}"#;
        assert_eq!(
            parse_json_request(body).expect_err("origin"),
            ServiceError::MissingOrigin
        );
    }

    #[test]
    fn operations_trim_expr_and_alias() {
        let body = r#"{
            "data_descriptor": {"origin": "test"},
            "data": [{"price": 1}],
            "operations": [
                {"expr": " mean(price) ", "alias": "  "},
                {"expr": "price * 2", "alias": " doubled ", "params": {"p": 50}}
            ]
        }"#;
        let parsed = parse_json_request(body).expect("parse");
        assert_eq!(parsed.operations[0].expr, "mean(price)");
        assert_eq!(parsed.operations[0].alias, None);
        assert_eq!(parsed.operations[1].alias, Some("doubled".to_owned()));
        assert_eq!(
            parsed.operations[1]
                .params
                .as_ref()
                .and_then(|params| params.get("p").cloned()),
            Some("50".to_owned())
        );
    }

    #[test]
    fn empty_operation_expr_is_rejected() {
        let body = r#"{
            "data_descriptor": {"origin": "test"},
            "data": [],
            "operations": [{"expr": "   "}]
        }"#;
        assert_eq!(
            parse_json_request(body).expect_err("expr"),
            ServiceError::EmptyOperationExpr
        );
    }

    #[test]
    fn yaml_scalars_keep_the_loose_boolean_and_numeric_reading() {
        let body = "
data_descriptor:
  origin: test
data:
  - value: \"12.5\"
    flag: \"yes\"
    label: plain
";
        let parsed = parse_yaml_request(body).expect("parse");
        let point = &parsed.dataset.points()[0];
        assert_eq!(point.field("value"), Some(&FieldValue::Float(12.5)));
        assert_eq!(point.field("flag"), Some(&FieldValue::Bool(true)));
        assert_eq!(
            point.field("label"),
            Some(&FieldValue::Text("plain".to_owned()))
        );
    }

    #[test]
    fn yaml_sequences_in_rows_are_rejected() {
        let body = "
data_descriptor:
  origin: test
data:
  - value:
      - 1
      - 2
";
        assert_eq!(
            parse_yaml_request(body).expect_err("sequence"),
            ServiceError::NestedValue
        );
    }

    #[test]
    fn yaml_options_carry_the_multiplier() {
        let body = "
data_descriptor:
  origin: test
options:
  drop_outliers_percent: 2.5
data: []
";
        let parsed = parse_yaml_request(body).expect("parse");
        assert_eq!(parsed.multiplier, Some(2.5));
    }
}
