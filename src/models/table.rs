use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage type of a result column as reported by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Temporal,
    Boolean,
    Text,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Float)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub dtype: ColumnType,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// Fully materialised query result. Temporal values are ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultTable {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultTable {
    pub fn new(columns: Vec<TableColumn>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).unwrap_or(&Value::Null))
                .collect(),
        )
    }

    /// Number of distinct non-null values in a column.
    pub fn distinct_count(&self, name: &str) -> usize {
        let Some(values) = self.column_values(name) else {
            return 0;
        };
        let mut seen: Vec<&Value> = Vec::new();
        for value in values.into_iter().filter(|v| !v.is_null()) {
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        seen.len()
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let record = self
                    .columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect::<serde_json::Map<_, _>>();
                Value::Object(record)
            })
            .collect()
    }
}
