use comfy_table::{presets, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::app::GlobalOptions;

/// Write `data` as pretty JSON with `--json`, otherwise hand it to `text`.
pub fn print_output<T: Serialize>(
    data: &T,
    opts: &GlobalOptions,
    text: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if !opts.json {
        text(data);
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

#[derive(Clone, Copy)]
pub enum Align {
    Left,
    Right,
}

impl From<Align> for CellAlignment {
    fn from(align: Align) -> Self {
        match align {
            Align::Left => CellAlignment::Left,
            Align::Right => CellAlignment::Right,
        }
    }
}

/// Borderless table: a header line and whitespace-aligned columns two spaces apart.
pub struct TabWriter {
    table: Table,
    indent: String,
}

impl TabWriter {
    pub fn new(columns: Vec<(&str, Align)>) -> Self {
        let mut table = Table::new();
        table
            .load_preset(presets::NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(columns.iter().map(|(header, _)| *header));

        let count = columns.len();
        for (index, (_, align)) in columns.into_iter().enumerate() {
            let Some(column) = table.column_mut(index) else {
                continue;
            };
            let left = u16::from(index > 0);
            let right = u16::from(index + 1 < count);
            column.set_cell_alignment(align.into());
            column.set_padding((left, right));
        }

        Self {
            table,
            indent: String::new(),
        }
    }

    /// Prefix every printed line with `prefix`.
    pub fn indent(mut self, prefix: &str) -> Self {
        prefix.clone_into(&mut self.indent);
        self
    }

    pub fn row(&mut self, values: Vec<String>) {
        self.table.add_row(values);
    }

    fn render(&self) -> String {
        self.table
            .lines()
            .map(|line| format!("{}{}", self.indent, line.trim_end()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn print(&self) {
        println!("{}", self.render());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_are_aligned_and_indented() {
        let mut tw = TabWriter::new(vec![("Name", Align::Left), ("RVA", Align::Right)]).indent("  ");
        tw.row(vec![".text".to_string(), "0x1000".to_string()]);
        tw.row(vec![".reloc".to_string(), "0x12000".to_string()]);

        let rendered = tw.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|line| line.starts_with("  ")));
        assert!(lines[1].ends_with(" 0x1000"));
        assert_eq!(lines[1].len(), lines[2].len());
    }
}
