//! Render-ready table model and text/JSON renderers.

use serde::Serialize;

use crate::normalize::{Cell, ResultSet};

/// How nested values are turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellStyle {
    /// Indented JSON, for panels that wrap.
    #[default]
    Pretty,
    /// Single-line JSON, for terminal tables.
    Compact,
}

/// Text for one cell. Nested values are shown as JSON text and nothing else.
pub fn format_cell(cell: &Cell, style: CellStyle) -> String {
    match cell {
        Cell::Null => "null".to_string(),
        Cell::Bool(b) => b.to_string(),
        Cell::Number(n) => n.to_string(),
        Cell::Text(s) => s.clone(),
        Cell::Nested(value) => match style {
            CellStyle::Pretty => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
            CellStyle::Compact => value.to_string(),
        },
    }
}

/// Columns plus already-formatted cells. Missing cells are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableModel {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableModel {
    pub fn from_result_set(set: &ResultSet, style: CellStyle) -> Self {
        let rows = set
            .rows
            .iter()
            .map(|row| {
                set.columns
                    .iter()
                    .map(|c| row.get(c).map(|cell| format_cell(cell, style)).unwrap_or_default())
                    .collect()
            })
            .collect();

        Self {
            columns: set.columns.clone(),
            rows,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Display width of each column: the widest of header and cells.
    pub fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                let len = cell.chars().count();
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(len);
                }
            }
        }
        widths
    }

    pub fn header_line(&self, widths: &[usize]) -> String {
        let header: Vec<String> = self
            .columns
            .iter()
            .zip(widths)
            .map(|(c, w)| format!("{:width$}", c, width = w))
            .collect();
        header.join(" │ ")
    }

    pub fn separator_line(&self, widths: &[usize]) -> String {
        let sep: Vec<String> = widths.iter().map(|w| "─".repeat(*w)).collect();
        sep.join("─┼─")
    }

    pub fn row_lines<'a>(&'a self, widths: &'a [usize]) -> impl Iterator<Item = String> + 'a {
        self.rows.iter().map(move |row| {
            let cells: Vec<String> = row
                .iter()
                .zip(widths)
                .map(|(val, w)| format!("{:width$}", val, width = w))
                .collect();
            cells.join(" │ ")
        })
    }

    /// Plain-text table with a row count footer.
    pub fn render_text(&self) -> String {
        if self.is_empty() {
            return "(no results)\n".to_string();
        }

        let widths = self.widths();
        let mut out = String::new();
        out.push_str(self.header_line(&widths).trim_end());
        out.push('\n');
        out.push_str(&self.separator_line(&widths));
        out.push('\n');
        for line in self.row_lines(&widths) {
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&format!("{} row(s) returned\n", self.rows.len()));
        out
    }
}

/// Pretty JSON array of row objects.
pub fn render_json(set: &ResultSet) -> String {
    serde_json::to_string_pretty(&set.rows).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_format_cell() {
        assert_eq!(format_cell(&Cell::Null, CellStyle::Pretty), "null");
        assert_eq!(format_cell(&Cell::Text("Ada".into()), CellStyle::Pretty), "Ada");
        assert_eq!(format_cell(&Cell::Bool(true), CellStyle::Compact), "true");

        let nested = Cell::Nested(json!({ "a": 1 }));
        assert_eq!(format_cell(&nested, CellStyle::Compact), r#"{"a":1}"#);
        assert_eq!(format_cell(&nested, CellStyle::Pretty), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_missing_cells_are_empty() {
        let set = normalize(&json!([{ "id": 1, "name": "Ada" }, { "id": 2 }]));
        let table = TableModel::from_result_set(&set, CellStyle::Compact);
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.rows[1], vec!["2".to_string(), String::new()]);
    }

    #[test]
    fn test_render_text() {
        let set = normalize(&json!([
            { "id": 1, "name": "Ada" },
            { "id": 22, "name": "Bo" }
        ]));
        let text = TableModel::from_result_set(&set, CellStyle::Compact).render_text();
        let expected = "\
id │ name
───┼─────
1  │ Ada
22 │ Bo

2 row(s) returned
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_render_empty() {
        let table = TableModel::from_result_set(&normalize(&json!(null)), CellStyle::Compact);
        assert_eq!(table.render_text(), "(no results)\n");
    }

    #[test]
    fn test_render_json() {
        let set = normalize(&json!({ "id": 1 }));
        assert_eq!(render_json(&set), "[\n  {\n    \"id\": 1\n  }\n]");
    }
}
