//! Placeholder scanning and parameter binding.
//!
//! The scanner finds `?` markers and `:name` markers outside string,
//! identifier and comment spans. Named markers are rewritten to positional
//! `?` for the server; one name may map onto several positions.

use std::collections::HashMap;

use myflux_core::{Error, Result, Value};

/// A SQL statement with its placeholders located.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    sql: String,
    placeholder_count: usize,
    names: HashMap<String, Vec<usize>>,
}

impl ParsedQuery {
    /// Scan `sql` for placeholders.
    ///
    /// `ansi_quotes` decides whether double-quoted spans are identifiers
    /// (no backslash escapes) or strings; `no_backslash_escapes` disables
    /// backslash escaping inside strings. Delimiter doubling always
    /// escapes.
    pub fn parse(sql: &str, ansi_quotes: bool, no_backslash_escapes: bool) -> Self {
        let bytes = sql.as_bytes();
        let mut normalized = String::with_capacity(sql.len());
        let mut names: HashMap<String, Vec<usize>> = HashMap::new();
        let mut placeholder_count = 0;

        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            match c {
                b'\'' | b'"' | b'`' => {
                    let is_identifier = c == b'`' || (c == b'"' && ansi_quotes);
                    let backslash_escapes = !is_identifier && !no_backslash_escapes;
                    let end = scan_quoted(bytes, i, c, backslash_escapes);
                    normalized.push_str(&sql[i..end]);
                    i = end;
                }
                b'#' => {
                    let end = scan_line_comment(bytes, i);
                    normalized.push_str(&sql[i..end]);
                    i = end;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    let end = scan_line_comment(bytes, i);
                    normalized.push_str(&sql[i..end]);
                    i = end;
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    let end = scan_block_comment(bytes, i);
                    normalized.push_str(&sql[i..end]);
                    i = end;
                }
                b'?' => {
                    placeholder_count += 1;
                    normalized.push('?');
                    i += 1;
                }
                b':' if bytes
                    .get(i + 1)
                    .is_some_and(|&b| b.is_ascii_alphanumeric() || b == b'_') =>
                {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len()
                        && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                    {
                        end += 1;
                    }
                    names
                        .entry(sql[start..end].to_string())
                        .or_default()
                        .push(placeholder_count);
                    placeholder_count += 1;
                    normalized.push('?');
                    i = end;
                }
                _ => {
                    // Copy whole UTF-8 sequences so multibyte text survives.
                    let char_len = utf8_len(c);
                    normalized.push_str(&sql[i..i + char_len]);
                    i += char_len;
                }
            }
        }

        Self {
            sql: normalized,
            placeholder_count,
            names,
        }
    }

    /// The SQL with named markers rewritten to `?`.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholder_count
    }

    /// Positional indices a named marker maps to.
    pub fn indexes_of(&self, name: &str) -> Option<&[usize]> {
        self.names.get(name).map(Vec::as_slice)
    }
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

fn scan_quoted(bytes: &[u8], start: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        let c = bytes[i];
        if backslash_escapes && c == b'\\' {
            i += 2;
            continue;
        }
        if c == quote {
            // Doubled delimiter stays inside the span.
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn scan_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn scan_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// One parameter slot: unset until bound, then a concrete value (`Null`
/// included).
#[derive(Debug, Clone, Default, PartialEq)]
enum ParamSlot {
    #[default]
    Unset,
    Bound(Value),
}

/// An ordered parameter vector for one execution of a prepared statement.
#[derive(Debug, Clone)]
pub struct Bindings {
    slots: Vec<ParamSlot>,
}

impl Bindings {
    pub fn new(placeholders: usize) -> Self {
        Self {
            slots: vec![ParamSlot::Unset; placeholders],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bind a positional parameter.
    pub fn bind(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let len = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            Error::Misuse(format!(
                "parameter index {} out of range (statement has {} placeholders)",
                index, len
            ))
        })?;
        *slot = ParamSlot::Bound(value.into());
        Ok(())
    }

    /// Bind every position a named marker maps to.
    pub fn bind_named(
        &mut self,
        query: &ParsedQuery,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let indices = query
            .indexes_of(name)
            .ok_or_else(|| Error::Misuse(format!("unknown named parameter ':{}'", name)))?
            .to_vec();
        let value = value.into();
        for index in indices {
            self.bind(index, value.clone())?;
        }
        Ok(())
    }

    /// A batch entry is complete when no slot is unset.
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| *s != ParamSlot::Unset)
    }

    /// Consume into the value vector for COM_STMT_EXECUTE.
    pub fn into_values(self) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.into_iter().enumerate() {
            match slot {
                ParamSlot::Bound(value) => values.push(value),
                ParamSlot::Unset => {
                    return Err(Error::Misuse(format!("parameter {} is not bound", i)));
                }
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &str) -> ParsedQuery {
        ParsedQuery::parse(sql, false, false)
    }

    #[test]
    fn positional_markers() {
        let q = parse("INSERT INTO t(a,b) VALUES(?,?)");
        assert_eq!(q.placeholder_count(), 2);
        assert_eq!(q.sql(), "INSERT INTO t(a,b) VALUES(?,?)");
    }

    #[test]
    fn named_markers_rewrite_to_positional() {
        let q = parse("SELECT * FROM t WHERE a = :id AND b = :name OR c = :id");
        assert_eq!(q.placeholder_count(), 3);
        assert_eq!(q.sql(), "SELECT * FROM t WHERE a = ? AND b = ? OR c = ?");
        assert_eq!(q.indexes_of("id"), Some(&[0usize, 2][..]));
        assert_eq!(q.indexes_of("name"), Some(&[1usize][..]));
        assert_eq!(q.indexes_of("missing"), None);
    }

    #[test]
    fn markers_inside_strings_are_ignored() {
        let q = parse("SELECT '?', \"?\", `a?b`, ? FROM t");
        assert_eq!(q.placeholder_count(), 1);
    }

    #[test]
    fn markers_inside_comments_are_ignored() {
        let q = parse("SELECT ? -- what about :this?\n, ? # and :that?\n, /* :x ? */ ?");
        assert_eq!(q.placeholder_count(), 3);
        assert!(q.indexes_of("this").is_none());
    }

    #[test]
    fn doubled_quotes_stay_in_span() {
        let q = parse("SELECT 'it''s ?', ?");
        assert_eq!(q.placeholder_count(), 1);
    }

    #[test]
    fn backslash_escape_rules() {
        // With backslash escapes, \' does not close the span: it ends at
        // the next quote and the marker after it is live.
        let q = ParsedQuery::parse(r"SELECT '\''?'", false, false);
        assert_eq!(q.placeholder_count(), 1);

        // With NO_BACKSLASH_ESCAPES the '' pair is a doubled delimiter and
        // the marker stays inside the span.
        let q = ParsedQuery::parse(r"SELECT '\''?'", false, true);
        assert_eq!(q.placeholder_count(), 0);
    }

    #[test]
    fn ansi_quotes_double_quoted_identifier() {
        // With ANSI_QUOTES a double-quoted span is an identifier; backslash
        // does not escape inside it.
        let q = ParsedQuery::parse(r#"SELECT "a\", ?"#, true, false);
        assert_eq!(q.placeholder_count(), 1);
    }

    #[test]
    fn colon_without_name_is_literal() {
        let q = parse("SELECT a::b FROM t WHERE x = ?");
        // "::b" is scanned as one named marker ":b" after a literal ':'?
        // No: ':' followed by ':' is literal, then ':b' is a marker.
        assert_eq!(q.placeholder_count(), 2);

        let q = parse("SELECT ': ' , ?");
        assert_eq!(q.placeholder_count(), 1);
    }

    #[test]
    fn bindings_lifecycle() {
        let q = parse("INSERT INTO t VALUES(:a, :b, :a)");
        let mut bindings = Bindings::new(q.placeholder_count());
        assert!(!bindings.is_complete());

        bindings.bind_named(&q, "a", 7i32).unwrap();
        assert!(!bindings.is_complete());
        bindings.bind_named(&q, "b", "x").unwrap();
        assert!(bindings.is_complete());

        let values = bindings.into_values().unwrap();
        assert_eq!(
            values,
            vec![Value::Int(7), Value::Text("x".into()), Value::Int(7)]
        );
    }

    #[test]
    fn binding_errors() {
        let q = parse("SELECT ?");
        let mut bindings = Bindings::new(q.placeholder_count());

        assert!(matches!(
            bindings.bind(3, 1i32).unwrap_err(),
            Error::Misuse(_)
        ));
        assert!(matches!(
            bindings.bind_named(&q, "nope", 1i32).unwrap_err(),
            Error::Misuse(_)
        ));
        assert!(matches!(
            bindings.clone().into_values().unwrap_err(),
            Error::Misuse(_)
        ));

        bindings.bind(0, Value::Null).unwrap();
        assert!(bindings.is_complete());
        assert_eq!(bindings.into_values().unwrap(), vec![Value::Null]);
    }
}
