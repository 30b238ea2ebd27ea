//! Result row representation with collated column-name lookup.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::Value;

/// Column metadata shared by all rows of one result window.
///
/// Name lookup is case-insensitive: the sorted index orders names by their
/// ASCII-case-folded form with a case-sensitive tie-break, and a lookup
/// returns the lowest column ordinal among the case-insensitive matches. So
/// for columns `ID, id, Id` in declaration order, `index_of("id")` is 0.
#[derive(Debug)]
pub struct RowMetadata {
    /// Column names in declaration order
    names: Vec<String>,
    /// (position in `names`) sorted by collated name
    sorted: Vec<usize>,
}

fn collate(a: &str, b: &str) -> Ordering {
    let folded = a
        .as_bytes()
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.as_bytes().iter().map(|c| c.to_ascii_lowercase()));
    folded.then_with(|| a.cmp(b))
}

impl RowMetadata {
    pub fn new(names: Vec<String>) -> Self {
        let mut sorted: Vec<usize> = (0..names.len()).collect();
        sorted.sort_by(|&a, &b| collate(&names[a], &names[b]));
        Self { names, sorted }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Find a column by name, ignoring ASCII case.
    ///
    /// Among several case-insensitive matches, the lowest column ordinal
    /// wins.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        let probe = self
            .sorted
            .binary_search_by(|&i| {
                self.names[i]
                    .as_bytes()
                    .iter()
                    .map(|c| c.to_ascii_lowercase())
                    .cmp(name.as_bytes().iter().map(|c| c.to_ascii_lowercase()))
            })
            .ok()?;

        // Expand to the whole run of case-insensitive matches.
        let eq_ci = |i: usize| self.names[i].eq_ignore_ascii_case(name);
        let mut lo = probe;
        while lo > 0 && eq_ci(self.sorted[lo - 1]) {
            lo -= 1;
        }
        let mut hi = probe;
        while hi + 1 < self.sorted.len() && eq_ci(self.sorted[hi + 1]) {
            hi += 1;
        }

        self.sorted[lo..=hi].iter().copied().min()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }
}

/// A single decoded row.
///
/// Metadata is shared via `Arc` across all rows of a result window.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    metadata: Arc<RowMetadata>,
}

impl Row {
    pub fn new(metadata: Arc<RowMetadata>, values: Vec<Value>) -> Self {
        Self { values, metadata }
    }

    pub fn metadata(&self) -> &Arc<RowMetadata> {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value by column ordinal.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value by column name (case-insensitive, lowest ordinal wins).
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.metadata.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Typed value by column ordinal.
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get(index).ok_or_else(|| {
            Error::Misuse(format!(
                "column index {} out of bounds (row has {} columns)",
                index,
                self.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Typed value by column name.
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .get_by_name(name)
            .ok_or_else(|| Error::Misuse(format!("column '{}' not found", name)))?;
        T::from_value(value)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.metadata
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Conversion from a decoded `Value` into a concrete Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

fn type_mismatch(expected: &str, value: &Value) -> Error {
    Error::Decode(format!("expected {}, found {}", expected, value.type_name()))
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| type_mismatch("bool", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let v = value.as_i64().ok_or_else(|| type_mismatch("i32", value))?;
        i32::try_from(v).map_err(|_| Error::Decode(format!("value {} out of range for i32", v)))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| type_mismatch("i64", value))
    }
}

impl FromValue for u64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_u64().ok_or_else(|| type_mismatch("u64", value))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| type_mismatch("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_mismatch("String", value))
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| type_mismatch("Vec<u8>", value))
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(names: &[&str]) -> Arc<RowMetadata> {
        Arc::new(RowMetadata::new(
            names.iter().map(|s| s.to_string()).collect(),
        ))
    }

    #[test]
    fn lookup_basic() {
        let m = meta(&["id", "name", "age"]);
        assert_eq!(m.index_of("id"), Some(0));
        assert_eq!(m.index_of("NAME"), Some(1));
        assert_eq!(m.index_of("Age"), Some(2));
        assert_eq!(m.index_of("missing"), None);
    }

    #[test]
    fn lookup_case_collision_prefers_lowest_ordinal() {
        // Three distinct spellings of the same case-folded name.
        let m = meta(&["ID", "id", "Id"]);
        assert_eq!(m.index_of("id"), Some(0));
        assert_eq!(m.index_of("ID"), Some(0));
        assert_eq!(m.index_of("iD"), Some(0));
    }

    #[test]
    fn lookup_collision_among_other_columns() {
        let m = meta(&["a", "Total", "total", "b"]);
        assert_eq!(m.index_of("TOTAL"), Some(1));
        assert_eq!(m.index_of("a"), Some(0));
        assert_eq!(m.index_of("b"), Some(3));
    }

    #[test]
    fn row_access() {
        let m = meta(&["id", "label"]);
        let row = Row::new(m, vec![Value::Int(7), Value::Text("x".into())]);

        assert_eq!(row.get(0), Some(&Value::Int(7)));
        assert_eq!(row.get_by_name("LABEL"), Some(&Value::Text("x".into())));
        assert_eq!(row.get_as::<i64>(0).unwrap(), 7);
        assert_eq!(row.get_named::<String>("label").unwrap(), "x");
        assert!(row.get_named::<i64>("label").is_err());
        assert!(row.get_as::<i64>(5).is_err());
    }

    #[test]
    fn row_null_handling() {
        let m = meta(&["v"]);
        let row = Row::new(m, vec![Value::Null]);
        assert_eq!(row.get_named::<Option<i64>>("v").unwrap(), None);
        assert!(row.get_named::<i64>("v").is_err());
    }

    #[test]
    fn row_iterators() {
        let m = meta(&["a", "b"]);
        let row = Row::new(m, vec![Value::Int(1), Value::Int(2)]);
        let pairs: Vec<_> = row.iter().collect();
        assert_eq!(pairs, vec![("a", &Value::Int(1)), ("b", &Value::Int(2))]);
    }
}
