#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use dp_types::FieldValue;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatasetError {
    #[error("column names must be non-empty")]
    EmptyColumnName,
}

/// One entry of a provenance tree: either a scalar leaf or a nested section.
/// Sequences are not representable, matching the wire contract for `_meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaNode {
    Section(MetaTree),
    Leaf(FieldValue),
}

impl MetaNode {
    #[must_use]
    pub fn as_leaf(&self) -> Option<&FieldValue> {
        match self {
            Self::Leaf(value) => Some(value),
            Self::Section(_) => None,
        }
    }

    #[must_use]
    pub fn as_section(&self) -> Option<&MetaTree> {
        match self {
            Self::Section(tree) => Some(tree),
            Self::Leaf(_) => None,
        }
    }

    fn is_empty_section(&self) -> bool {
        matches!(self, Self::Section(tree) if tree.is_empty())
    }
}

/// Recursive key → node mapping attached to a data point under `_meta`.
/// Empty sections are dropped on serialization so they round-trip as absent
/// keys.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct MetaTree {
    entries: BTreeMap<String, MetaNode>,
}

impl MetaTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &BTreeMap<String, MetaNode> {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetaNode> {
        self.entries.get(key)
    }

    /// Walks a `.`-free path of keys, returning the node at the end.
    #[must_use]
    pub fn get_path(&self, path: &[&str]) -> Option<&MetaNode> {
        let (first, rest) = path.split_first()?;
        let node = self.entries.get(*first)?;
        if rest.is_empty() {
            return Some(node);
        }
        node.as_section()?.get_path(rest)
    }

    pub fn set_leaf(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.entries
            .insert(key.into(), MetaNode::Leaf(value.into()));
    }

    /// Returns the nested section under `key`, creating it if absent. A leaf
    /// already stored under `key` is replaced by a section.
    pub fn ensure_section(&mut self, key: impl Into<String>) -> &mut MetaTree {
        let node = self
            .entries
            .entry(key.into())
            .or_insert_with(|| MetaNode::Section(MetaTree::new()));
        if !matches!(node, MetaNode::Section(_)) {
            *node = MetaNode::Section(MetaTree::new());
        }
        match node {
            MetaNode::Section(tree) => tree,
            MetaNode::Leaf(_) => unreachable!("section enforced above"),
        }
    }
}

impl Serialize for MetaTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (key, node) in &self.entries {
            if node.is_empty_section() {
                continue;
            }
            map.serialize_entry(key, node)?;
        }
        map.end()
    }
}

/// One logical row: a column → value mapping plus its provenance tree.
/// A field that is absent is equivalent to one holding null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    #[serde(rename = "values")]
    fields: BTreeMap<String, FieldValue>,
    #[serde(
        rename = "_meta",
        default,
        skip_serializing_if = "MetaTree::is_empty"
    )]
    meta: MetaTree,
}

impl DataPoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_fields(fields: BTreeMap<String, FieldValue>) -> Self {
        Self {
            fields,
            meta: MetaTree::new(),
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// True when the column is absent from the row or holds null.
    #[must_use]
    pub fn is_missing(&self, name: &str) -> bool {
        self.fields.get(name).map_or(true, FieldValue::is_null)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    #[must_use]
    pub fn meta(&self) -> &MetaTree {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaTree {
        &mut self.meta
    }
}

/// Ordered rows plus the ordered, duplicate-free column-name list. The row's
/// position in the sequence is its identity; provenance and outlier masks
/// refer to rows by index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    #[serde(rename = "rows")]
    points: Vec<DataPoint>,
}

impl Dataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            columns,
            points: Vec::new(),
        }
    }

    /// Registers a column name unless already present; first appearance wins
    /// the ordering.
    pub fn ensure_column(&mut self, name: &str) -> Result<(), DatasetError> {
        if name.is_empty() {
            return Err(DatasetError::EmptyColumnName);
        }
        if !self.columns.iter().any(|column| column == name) {
            self.columns.push(name.to_owned());
        }
        Ok(())
    }

    pub fn push(&mut self, point: DataPoint) {
        self.points.push(point);
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn points_mut(&mut self) -> &mut Vec<DataPoint> {
        &mut self.points
    }

    #[must_use]
    pub fn point(&self, index: usize) -> Option<&DataPoint> {
        self.points.get(index)
    }
}

#[cfg(test)]
mod tests {
    use dp_types::FieldValue;

    use super::{DataPoint, Dataset, DatasetError, MetaNode, MetaTree};

    #[test]
    fn column_registration_deduplicates_and_keeps_order() {
        let mut dataset = Dataset::new();
        dataset.ensure_column("b").expect("b");
        dataset.ensure_column("a").expect("a");
        dataset.ensure_column("b").expect("b again");
        assert_eq!(dataset.columns(), &["b".to_owned(), "a".to_owned()]);
        assert_eq!(dataset.column_index("a"), Some(1));
    }

    #[test]
    fn empty_column_names_are_rejected() {
        let mut dataset = Dataset::new();
        let err = dataset.ensure_column("").expect_err("must fail");
        assert_eq!(err, DatasetError::EmptyColumnName);
    }

    #[test]
    fn missing_field_is_equivalent_to_null() {
        let mut point = DataPoint::new();
        point.set_field("present", FieldValue::Null);
        assert!(point.is_missing("present"));
        assert!(point.is_missing("absent"));

        point.set_field("present", 1.0);
        assert!(!point.is_missing("present"));
    }

    #[test]
    fn meta_tree_nests_sections_and_leaves() {
        let mut meta = MetaTree::new();
        let status = meta.ensure_section("status");
        status.set_leaf("outlier", true);
        status.set_leaf("reason", "iqr_detection");

        let outlier = meta.get_path(&["status", "outlier"]).expect("node");
        assert_eq!(outlier.as_leaf(), Some(&FieldValue::Bool(true)));
        assert!(meta.get_path(&["status", "missing"]).is_none());
    }

    #[test]
    fn meta_round_trips_through_json_and_yaml() {
        let mut meta = MetaTree::new();
        meta.set_leaf("note", "raw");
        let imputation = meta
            .ensure_section("columns")
            .ensure_section("value")
            .ensure_section("imputation");
        imputation.set_leaf("imputed", true);
        imputation.set_leaf("value", 11.0);

        let json = serde_json::to_string(&meta).expect("json encode");
        let from_json: MetaTree = serde_json::from_str(&json).expect("json decode");
        assert_eq!(from_json, meta);

        let yaml = serde_yaml::to_string(&meta).expect("yaml encode");
        let from_yaml: MetaTree = serde_yaml::from_str(&yaml).expect("yaml decode");
        assert_eq!(from_yaml, meta);
    }

    #[test]
    fn empty_sections_serialize_as_absent_keys() {
        let mut meta = MetaTree::new();
        meta.ensure_section("empty");
        meta.set_leaf("kept", 1.0);

        let json = serde_json::to_string(&meta).expect("encode");
        assert_eq!(json, r#"{"kept":1.0}"#);
    }

    #[test]
    fn sequences_inside_meta_are_rejected() {
        let err = serde_json::from_str::<MetaTree>(r#"{"bad":[1,2]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn dataset_round_trips_with_rows_and_meta() {
        let mut dataset = Dataset::new();
        dataset.ensure_column("value").expect("column");
        let mut point = DataPoint::new();
        point.set_field("value", 10.0);
        point
            .meta_mut()
            .ensure_section("status")
            .set_leaf("outlier", false);
        dataset.push(point);

        let json = serde_json::to_string(&dataset).expect("encode");
        let decoded: Dataset = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, dataset);
    }

    #[test]
    fn points_without_meta_omit_the_meta_key() {
        let mut point = DataPoint::new();
        point.set_field("a", 1.0);
        let json = serde_json::to_string(&point).expect("encode");
        assert_eq!(json, r#"{"values":{"a":1.0}}"#);
    }

    #[test]
    fn ensure_section_replaces_a_leaf_in_place() {
        let mut meta = MetaTree::new();
        meta.set_leaf("status", "plain");
        meta.ensure_section("status").set_leaf("outlier", true);
        assert!(matches!(
            meta.get("status"),
            Some(MetaNode::Section(section)) if !section.is_empty()
        ));
    }
}
