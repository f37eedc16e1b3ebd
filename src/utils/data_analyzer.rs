use serde::{Deserialize, Serialize};

use crate::models::table::{ColumnType, ResultTable};

/// Integer columns with fewer distinct values than this read as categories.
const LOW_CARDINALITY_LIMIT: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Temporal,
    Numerical,
    Categorical,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Temporal => "temporal",
            ColumnKind::Numerical => "numerical",
            ColumnKind::Categorical => "categorical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub name: String,
    pub kind: ColumnKind,
}

/// Structural summary of a result table, shown to the visualization LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub row_count: usize,
    pub columns: Vec<ColumnSummary>,
}

impl TableMetadata {
    pub fn render(&self) -> String {
        let mut text = format!(
            "The data has {} rows and {} columns.",
            self.row_count,
            self.columns.len()
        );
        for column in &self.columns {
            text.push_str(&format!("\n- {} ({})", column.name, column.kind.as_str()));
        }
        text
    }
}

pub fn summarize_table(table: &ResultTable) -> TableMetadata {
    let columns = table
        .columns
        .iter()
        .map(|column| {
            let kind = match column.dtype {
                ColumnType::Temporal => ColumnKind::Temporal,
                ColumnType::Float => ColumnKind::Numerical,
                ColumnType::Integer => {
                    if table.distinct_count(&column.name) < LOW_CARDINALITY_LIMIT {
                        ColumnKind::Categorical
                    } else {
                        ColumnKind::Numerical
                    }
                }
                ColumnType::Boolean | ColumnType::Text => ColumnKind::Categorical,
            };
            ColumnSummary {
                name: column.name.clone(),
                kind,
            }
        })
        .collect();

    TableMetadata {
        row_count: table.row_count(),
        columns,
    }
}
