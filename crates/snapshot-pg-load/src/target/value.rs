//! Row values and their COPY text encoding.

use chrono::NaiveDate;

/// A single extracted cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Text(String),
    Date(NaiveDate),
}

/// One row in the column order of its target table.
pub type Row = Vec<SqlValue>;

impl SqlValue {
    pub fn text(value: Option<&str>) -> Self {
        match value {
            Some(s) => SqlValue::Text(s.to_string()),
            None => SqlValue::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Plain text rendering, used for parameters, keys and manifests.
    /// NULL has no text form.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(if *b { "t" } else { "f" }.to_string()),
            SqlValue::I32(n) => Some(n.to_string()),
            SqlValue::I64(n) => Some(n.to_string()),
            SqlValue::F64(n) => Some(n.to_string()),
            SqlValue::Text(s) => Some(s.clone()),
            SqlValue::Date(d) => Some(d.to_string()),
        }
    }

    /// Append this value in COPY text format.
    pub fn write_copy_text(&self, buf: &mut String) {
        match self {
            SqlValue::Null => buf.push_str("\\N"),
            SqlValue::Text(s) => escape_copy_text(s, buf),
            other => {
                if let Some(text) = other.to_text() {
                    buf.push_str(&text);
                }
            }
        }
    }
}

/// Encode a row as one COPY text line, including the trailing newline.
pub fn encode_copy_row(row: &[SqlValue], buf: &mut String) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.push('\t');
        }
        value.write_copy_text(buf);
    }
    buf.push('\n');
}

/// Escape special characters for COPY text format.
fn escape_copy_text(s: &str, buf: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => buf.push_str("\\\\"),
            '\t' => buf.push_str("\\t"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            _ => buf.push(c),
        }
    }
}
