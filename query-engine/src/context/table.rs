use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default column delimiter for rendered context tables.
pub const DEFAULT_COLUMN_DELIMITER: char = '|';

/// A rendered context section as a small table: a header row plus string
/// records. These back both the prompt text and the `context_data` views on
/// verbose results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Per-section tables keyed by the lowercase section name.
pub type ContextSections = BTreeMap<String, ContextTable>;

impl ContextTable {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Renders the table as delimited text, one trailing newline per line.
    pub fn to_delimited(&self, delimiter: char) -> String {
        let mut out = String::new();
        out.push_str(&join_fields(&self.columns, delimiter));
        out.push('\n');
        for row in &self.rows {
            out.push_str(&join_fields(row, delimiter));
            out.push('\n');
        }
        out
    }
}

/// `-----{name}-----` banner, newline-terminated, placed above each table.
pub fn section_banner(name: &str) -> String {
    format!("-----{name}-----\n")
}

fn join_fields(fields: &[String], delimiter: char) -> String {
    fields
        .iter()
        .map(|field| escape_field(field, delimiter))
        .collect::<Vec<_>>()
        .join(&delimiter.to_string())
}

fn escape_field(field: &str, delimiter: char) -> String {
    if field.contains(delimiter) || field.contains('"') || field.contains('\n') || field.contains('\r')
    {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_delimited_renders_header_and_rows() {
        let mut table = ContextTable::new(&["id", "title"]);
        table.push_row(vec!["1".to_string(), "Alpha".to_string()]);
        assert_eq!(table.to_delimited('|'), "id|title\n1|Alpha\n");
    }

    #[test]
    fn test_fields_with_delimiter_are_quoted() {
        let mut table = ContextTable::new(&["text"]);
        table.push_row(vec!["a|b \"c\"".to_string()]);
        assert_eq!(table.to_delimited('|'), "text\n\"a|b \"\"c\"\"\"\n");
    }

    #[test]
    fn test_banner() {
        assert_eq!(section_banner("Reports"), "-----Reports-----\n");
    }
}
