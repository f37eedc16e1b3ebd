//! Inline value hints for schema DDL.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::utils::database::{DistinctValues, SampledValues};

/// Values shown before a long list is truncated.
const TRUNCATED_PREVIEW: usize = 8;

pub const TOO_MANY_VALUES: &str = "Too many distinct values";
pub const VALUES_UNAVAILABLE: &str = "Values unavailable (sampling failed)";

const CONSTRAINT_KEYWORDS: [&str; 6] = ["PRIMARY", "FOREIGN", "UNIQUE", "CHECK", "CONSTRAINT", "KEY"];

/// Double-quoted, backticked, bracketed or bare identifier; four groups.
const IDENTIFIER: &str = r#"(?:"([^"]+)"|`([^`]+)`|\[([^\]]+)\]|(\w+))"#;

fn table_regex() -> &'static Regex {
    static TABLE: OnceLock<Regex> = OnceLock::new();
    TABLE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:{IDENTIFIER}\.)?{IDENTIFIER}"
        ))
        .expect("table regex")
    })
}

fn column_regex() -> &'static Regex {
    static COLUMN: OnceLock<Regex> = OnceLock::new();
    COLUMN.get_or_init(|| {
        Regex::new(&format!(r"(?i)^\s+{IDENTIFIER}\s+[A-Z][\w()]*")).expect("column regex")
    })
}

fn identifier(captures: &regex::Captures<'_>, groups: std::ops::Range<usize>) -> Option<String> {
    groups
        .filter_map(|i| captures.get(i))
        .map(|m| m.as_str().to_string())
        .next()
}

fn is_constraint_line(line: &str) -> bool {
    let first = line
        .trim_start()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("")
        .to_uppercase();
    CONSTRAINT_KEYWORDS.contains(&first.as_str())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(text) => format!("'{}'", text),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

fn describe(values: &SampledValues, max_values: usize) -> String {
    match values {
        SampledValues::Values(values) if values.is_empty() => "No values".to_string(),
        SampledValues::Values(values) if values.len() <= max_values => format!(
            "Possible values: {}",
            values.iter().map(format_value).collect::<Vec<_>>().join(", ")
        ),
        SampledValues::Values(values) => {
            let shown = TRUNCATED_PREVIEW.min(max_values).min(values.len());
            format!(
                "Possible values: {} ... (+{} more)",
                values[..shown].iter().map(format_value).collect::<Vec<_>>().join(", "),
                values.len() - shown
            )
        }
        SampledValues::TooMany => TOO_MANY_VALUES.to_string(),
        SampledValues::Error => VALUES_UNAVAILABLE.to_string(),
    }
}

/// Walks `raw_schema` line by line and appends a `-- ...` comment to every
/// column definition that has an entry in `fetched`.
pub fn synthesize_augmented_schema(raw_schema: &str, fetched: &DistinctValues, max_values: usize) -> String {
    let mut current_table: Option<String> = None;
    let mut lines = Vec::new();

    for line in raw_schema.trim().lines() {
        if let Some(captures) = table_regex().captures(line) {
            current_table = identifier(&captures, 5..9);
            debug!("Entered table context: {:?}", current_table);
            lines.push(line.to_string());
            continue;
        }

        let annotated = current_table
            .as_deref()
            .filter(|_| !is_constraint_line(line))
            .and_then(|table| {
                let captures = column_regex().captures(line)?;
                let column = identifier(&captures, 1..5)?;
                let values = fetched.get(&format!("{}.{}", table, column))?;
                Some(format!("{} -- {}", line.trim_end(), describe(values, max_values)))
            });

        lines.push(annotated.unwrap_or_else(|| line.to_string()));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCHEMA: &str = "CREATE TABLE users (\n\tid INTEGER NOT NULL,\n\tstatus VARCHAR,\n\tcountry VARCHAR,\n\tPRIMARY KEY (id)\n)\n\nCREATE TABLE IF NOT EXISTS \"sales\".[orders] (\n  `order state` TEXT,\n  key_code INTEGER,\n  UNIQUE (key_code)\n)";

    fn values(items: &[&str]) -> SampledValues {
        SampledValues::Values(items.iter().map(|v| json!(v)).collect())
    }

    #[test]
    fn test_annotates_only_sampled_columns() {
        let mut fetched = DistinctValues::new();
        fetched.insert("users.status".to_string(), values(&["active", "inactive"]));
        fetched.insert("orders.order state".to_string(), SampledValues::TooMany);
        fetched.insert("orders.key_code".to_string(), SampledValues::Values(vec![json!(1), json!(2)]));

        let augmented = synthesize_augmented_schema(SCHEMA, &fetched, 15);
        let lines: Vec<&str> = augmented.lines().collect();

        assert_eq!(lines[2], "\tstatus VARCHAR, -- Possible values: 'active', 'inactive'");
        assert_eq!(lines[3], "\tcountry VARCHAR,");
        assert_eq!(lines[4], "\tPRIMARY KEY (id)");
        assert_eq!(lines[8], "  `order state` TEXT, -- Too many distinct values");
        assert_eq!(lines[9], "  key_code INTEGER, -- Possible values: 1, 2");
        assert_eq!(lines[10], "  UNIQUE (key_code)");
    }

    #[test]
    fn test_constraint_lines_never_annotated() {
        let schema = "CREATE TABLE t (\n  id INTEGER,\n  CONSTRAINT pk PRIMARY KEY (id),\n  KEY idx (id)\n)";
        let mut fetched = DistinctValues::new();
        fetched.insert("t.CONSTRAINT".to_string(), values(&["x"]));
        fetched.insert("t.KEY".to_string(), values(&["x"]));
        fetched.insert("t.pk".to_string(), values(&["x"]));

        let augmented = synthesize_augmented_schema(schema, &fetched, 15);
        assert_eq!(augmented, schema);
    }

    #[test]
    fn test_too_many_never_lists_values() {
        let mut fetched = DistinctValues::new();
        fetched.insert("users.country".to_string(), SampledValues::TooMany);
        let augmented = synthesize_augmented_schema(SCHEMA, &fetched, 15);
        assert!(augmented.contains(TOO_MANY_VALUES));
        assert!(!augmented.contains("Possible values"));
    }

    #[test]
    fn test_long_lists_are_truncated() {
        let many: Vec<String> = (0..20).map(|i| format!("c{}", i)).collect();
        let refs: Vec<&str> = many.iter().map(String::as_str).collect();
        let mut fetched = DistinctValues::new();
        fetched.insert("users.country".to_string(), values(&refs));
        fetched.insert("users.status".to_string(), SampledValues::Error);

        let augmented = synthesize_augmented_schema(SCHEMA, &fetched, 15);
        assert!(augmented.contains("'c7' ... (+12 more)"));
        assert!(!augmented.contains("'c8'"));
        assert!(augmented.contains(&format!("status VARCHAR, -- {}", VALUES_UNAVAILABLE)));
    }

    #[test]
    fn test_columns_outside_tables_are_ignored() {
        let mut fetched = DistinctValues::new();
        fetched.insert("users.status".to_string(), values(&["a"]));
        let schema = "status VARCHAR,\nid INTEGER";
        assert_eq!(synthesize_augmented_schema(schema, &fetched, 15), schema);
    }
}
