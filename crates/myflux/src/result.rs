//! Result windows.
//!
//! Every statement produces one window per result: row-bearing windows
//! carry column metadata and decoded rows, update windows carry the OK
//! counters. Multi-statement batches produce one window per statement.

use std::sync::Arc;

use myflux_core::{Row, RowMetadata};

use crate::message::OkMessage;
use crate::types::ColumnDefinition;

/// One result window of an exchange.
#[derive(Debug)]
pub struct ResultSet {
    pub(crate) columns: Arc<[ColumnDefinition]>,
    pub(crate) metadata: Option<Arc<RowMetadata>>,
    pub(crate) rows: Vec<Row>,
    pub(crate) ok: Option<OkMessage>,
}

impl Default for ResultSet {
    fn default() -> Self {
        Self {
            columns: Arc::from(Vec::new()),
            metadata: None,
            rows: Vec::new(),
            ok: None,
        }
    }
}

impl ResultSet {
    /// Rows changed by an INSERT/UPDATE/DELETE; `None` for row-bearing
    /// results.
    pub fn rows_updated(&self) -> Option<u64> {
        match &self.ok {
            Some(ok) if self.metadata.is_none() => Some(ok.affected_rows),
            _ => None,
        }
    }

    /// Last generated auto-increment key.
    pub fn generated_keys(&self) -> Option<u64> {
        self.ok.as_ref().map(|ok| ok.last_insert_id)
    }

    pub fn warnings(&self) -> u16 {
        self.ok.as_ref().map_or(0, |ok| ok.warnings)
    }

    /// Column definitions of a row-bearing result.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myflux_core::Value;

    #[test]
    fn update_window_counters() {
        let result = ResultSet {
            ok: Some(OkMessage {
                affected_rows: 3,
                last_insert_id: 17,
                ..OkMessage::default()
            }),
            ..ResultSet::default()
        };
        assert_eq!(result.rows_updated(), Some(3));
        assert_eq!(result.generated_keys(), Some(17));
        assert!(result.rows().is_empty());
    }

    #[test]
    fn row_window_has_no_update_count() {
        let metadata = Arc::new(RowMetadata::new(vec!["a".into()]));
        let result = ResultSet {
            metadata: Some(Arc::clone(&metadata)),
            rows: vec![Row::new(metadata, vec![Value::Int(1)])],
            ok: Some(OkMessage::default()),
            ..ResultSet::default()
        };
        assert_eq!(result.rows_updated(), None);
        assert_eq!(result.len(), 1);
    }
}
