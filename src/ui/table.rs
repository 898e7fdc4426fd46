use crate::importer::ImportSummary;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Kind")]
    pub kind: String,
    #[tabled(rename = "Count")]
    pub count: String,
}

#[derive(Default)]
pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            kind: label.to_string(),
            count: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &[(String, usize)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, &value.to_string());
    }
    builder.build()
}

/// Per-kind feature counts followed by the run totals
pub fn summary_table(summary: &ImportSummary) -> String {
    let mut builder = TableBuilder::new();
    for (kind, count) in &summary.features {
        builder.add_row(&kind.to_string(), &count.to_string());
    }
    builder.add_row("Geometry objects", &summary.total_geometries().to_string());
    builder.add_row("XLinks resolved", &summary.xlinks_resolved.to_string());
    if summary.validation_errors > 0 {
        builder.add_row("Validation errors", &summary.validation_errors.to_string());
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeatureKind;

    #[test]
    fn test_summary_table_lists_kinds() {
        let mut summary = ImportSummary::default();
        summary.features.insert(FeatureKind::Building, 3);
        summary.xlinks_resolved = 7;

        let table = summary_table(&summary);
        assert!(table.contains(&FeatureKind::Building.to_string()));
        assert!(table.contains("XLinks resolved"));
        assert!(!table.contains("Validation errors"));
    }

    #[test]
    fn test_empty_builder() {
        assert!(TableBuilder::new().build().is_empty());
    }
}
