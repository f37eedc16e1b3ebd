use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::Dialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::agent_io::ColumnRef;
use crate::models::table::ResultTable;

/// Distinct values sampled for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampledValues {
    Values(Vec<Value>),
    /// The column has more distinct values than the sampling limit.
    TooMany,
    /// The values could not be fetched.
    Error,
}

/// Sampled values keyed by `table.column`.
pub type DistinctValues = BTreeMap<String, SampledValues>;

#[async_trait]
pub trait DatabaseGateway: Send + Sync {
    /// SQL dialect name shown to the LLM.
    fn dialect(&self) -> &str;

    /// Schema DDL and a stable SHA-256 of it.
    async fn schema_ddl_and_key(&self) -> Result<(String, String)>;

    /// Fetches up to `limit + 1` distinct values per column. A column with
    /// more than `limit` values is [`SampledValues::TooMany`]; a failing
    /// column is [`SampledValues::Error`] and does not stop the batch.
    async fn sample_distinct_values(&self, columns: &[ColumnRef], limit: usize) -> Result<DistinctValues>;

    /// Dry-runs a single SELECT statement without materialising rows.
    async fn validate(&self, sql: &str) -> Result<()>;

    /// Runs a query and materialises every row.
    async fn execute(&self, sql: &str) -> Result<ResultTable>;
}

/// Rejects anything but exactly one read-only query statement.
///
/// SQL the parser cannot read falls back to a lexical check: one statement
/// starting with SELECT or WITH and no data-modifying keyword outside
/// quotes. What passes is left to the database to judge.
pub fn ensure_single_select(sql: &str, dialect: &dyn Dialect) -> Result<()> {
    let trimmed = strip_trailing_semicolons(sql);
    if trimmed.is_empty() {
        return Err(Error::Validation("The SQL query is empty.".to_string()));
    }

    match Parser::parse_sql(dialect, trimmed) {
        Ok(statements) => match statements.as_slice() {
            [Statement::Query(query)] => match writing_statement(query) {
                None => Ok(()),
                Some(kind) => Err(Error::Validation(format!(
                    "Only SELECT statements are allowed. Found: {}",
                    kind
                ))),
            },
            [] => Err(Error::Validation("The SQL query is empty.".to_string())),
            [other] => Err(Error::Validation(format!(
                "Only SELECT statements are allowed. Found: {}",
                statement_kind(other)
            ))),
            many => Err(Error::Validation(format!(
                "Only a single statement is allowed, found {}.",
                many.len()
            ))),
        },
        Err(e) => {
            debug!("sqlparser could not read query ({}), using lexical check", e);
            let upper = trimmed.trim_start().to_uppercase();
            if trimmed.contains(';') {
                return Err(Error::Validation(
                    "Only a single statement is allowed.".to_string(),
                ));
            }
            if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
                return Err(Error::Validation(format!("Only SELECT statements are allowed: {}", e)));
            }
            match modifying_keyword(trimmed) {
                None => Ok(()),
                Some(keyword) => Err(Error::Validation(format!(
                    "Only SELECT statements are allowed. Found: {}",
                    keyword
                ))),
            }
        }
    }
}

const MODIFYING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "DROP", "CREATE", "ALTER", "TRUNCATE", "COPY",
    "ATTACH", "DETACH", "GRANT", "REVOKE",
];

/// Kind of the first statement inside `query` that writes, CTEs included.
fn writing_statement(query: &Query) -> Option<String> {
    let in_ctes = query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .find_map(|cte| writing_statement(&cte.query));
    in_ctes.or_else(|| writing_body(&query.body))
}

fn writing_body(body: &SetExpr) -> Option<String> {
    match body {
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => None,
        SetExpr::Query(query) => writing_statement(query),
        SetExpr::SetOperation { left, right, .. } => writing_body(left).or_else(|| writing_body(right)),
        SetExpr::Insert(statement) | SetExpr::Update(statement) => Some(statement_kind(statement)),
    }
}

/// First data-modifying keyword outside string literals and quoted identifiers.
fn modifying_keyword(sql: &str) -> Option<&'static str> {
    let mut unquoted = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(open) if c == open => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' || c == '`' => {
                quote = Some(c);
                unquoted.push(' ');
            }
            None => unquoted.push(c),
        }
    }

    unquoted
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .find_map(|word| {
            let upper = word.to_ascii_uppercase();
            MODIFYING_KEYWORDS.iter().copied().find(|keyword| *keyword == upper)
        })
}

pub(crate) fn strip_trailing_semicolons(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

fn statement_kind(statement: &Statement) -> String {
    let rendered = statement.to_string();
    rendered
        .split_whitespace()
        .next()
        .unwrap_or("UNKNOWN")
        .to_uppercase()
}

#[cfg(feature = "duckdb")]
pub use duck::DuckDbGateway;

#[cfg(feature = "duckdb")]
mod duck {
    use super::*;
    use crate::models::table::{ColumnType, TableColumn};
    use crate::utils::cache::sha256_hex;
    use chrono::{DateTime, NaiveDate};
    use duckdb::Connection;
    use duckdb::types::{TimeUnit, ValueRef};
    use sqlparser::dialect::DuckDbDialect;
    use std::path::Path;
    use std::sync::Mutex;
    use tracing::{info, warn};

    /// DuckDB backend. Each operation runs on its own cloned connection.
    pub struct DuckDbGateway {
        root: Mutex<Connection>,
    }

    impl DuckDbGateway {
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let conn = Connection::open(path.as_ref())
                .map_err(|e| Error::Connection(format!("{}: {}", path.as_ref().display(), e)))?;
            Ok(Self {
                root: Mutex::new(conn),
            })
        }

        pub fn open_in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory().map_err(|e| Error::Connection(e.to_string()))?;
            Ok(Self {
                root: Mutex::new(conn),
            })
        }

        fn connect(&self) -> Result<Connection> {
            let root = self
                .root
                .lock()
                .map_err(|_| Error::Connection("connection lock poisoned".to_string()))?;
            root.try_clone().map_err(|e| Error::Connection(e.to_string()))
        }

        /// Runs setup statements such as `CREATE TABLE ... AS SELECT * FROM read_csv_auto(...)`.
        pub fn execute_batch(&self, sql: &str) -> Result<()> {
            let conn = self.connect()?;
            conn.execute_batch(sql)?;
            Ok(())
        }

        fn render_ddl(conn: &Connection) -> Result<String> {
            let mut stmt = conn.prepare(
                "SELECT table_name, column_name, data_type, is_nullable
                 FROM information_schema.columns
                 WHERE table_schema = 'main'
                 ORDER BY table_name, ordinal_position",
            )?;
            let columns = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<duckdb::Result<Vec<_>>>()?;

            let mut tables: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (table, column, data_type, nullable) in columns {
                let mut line = format!("\t{} {}", render_identifier(&column), data_type);
                if nullable == "NO" {
                    line.push_str(" NOT NULL");
                }
                tables.entry(table).or_default().push(line);
            }

            let ddl = tables
                .iter()
                .map(|(table, lines)| {
                    format!(
                        "CREATE TABLE {} (\n{}\n)",
                        render_identifier(table),
                        lines.join(",\n")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            Ok(ddl)
        }
    }

    #[async_trait]
    impl DatabaseGateway for DuckDbGateway {
        fn dialect(&self) -> &str {
            "duckdb"
        }

        async fn schema_ddl_and_key(&self) -> Result<(String, String)> {
            let conn = self.connect()?;
            let ddl = Self::render_ddl(&conn)?;
            let key = sha256_hex(&ddl);
            info!("Read schema with key {}", &key[..12]);
            Ok((ddl, key))
        }

        async fn sample_distinct_values(
            &self,
            columns: &[ColumnRef],
            limit: usize,
        ) -> Result<DistinctValues> {
            let conn = self.connect()?;
            let fetch_limit = limit + 1;
            let mut sampled = DistinctValues::new();

            for column in columns {
                let query = format!(
                    "SELECT DISTINCT {col} FROM {table} WHERE {col} IS NOT NULL ORDER BY 1 LIMIT {limit}",
                    col = quote_identifier(&column.column),
                    table = quote_identifier(&column.table),
                    limit = fetch_limit,
                );
                let fetched = conn.prepare(&query).and_then(|mut stmt| {
                    let mut rows = stmt.query([])?;
                    let mut values = Vec::new();
                    while let Some(row) = rows.next()? {
                        values.push(convert_value(row.get_ref(0)?).0);
                    }
                    Ok(values)
                });

                let entry = match fetched {
                    Ok(values) if values.len() >= fetch_limit => SampledValues::TooMany,
                    Ok(values) => SampledValues::Values(values),
                    Err(e) => {
                        warn!("Could not fetch distinct values for {}: {}", column.key(), e);
                        SampledValues::Error
                    }
                };
                sampled.insert(column.key(), entry);
            }
            Ok(sampled)
        }

        async fn validate(&self, sql: &str) -> Result<()> {
            ensure_single_select(sql, &DuckDbDialect {})?;
            let conn = self.connect()?;
            let explain = format!("EXPLAIN {}", strip_trailing_semicolons(sql));
            conn.prepare(&explain)
                .and_then(|mut stmt| stmt.query([]).map(|_| ()))
                .map_err(|e| Error::Validation(format!("SQL Validation Error: {}", e)))
        }

        async fn execute(&self, sql: &str) -> Result<ResultTable> {
            ensure_single_select(sql, &DuckDbDialect {})
                .map_err(|e| Error::Execution(e.to_string()))?;
            let conn = self.connect()?;
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([])?;
            let names: Vec<String> = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();

            let mut dtypes: Vec<Option<ColumnType>> = vec![None; names.len()];
            let mut data = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(names.len());
                for (i, dtype) in dtypes.iter_mut().enumerate() {
                    let (value, kind) = convert_value(row.get_ref(i)?);
                    if dtype.is_none() {
                        *dtype = kind;
                    }
                    values.push(value);
                }
                data.push(values);
            }

            let columns = names
                .into_iter()
                .zip(dtypes)
                .map(|(name, dtype)| TableColumn::new(name, dtype.unwrap_or(ColumnType::Text)))
                .collect();
            Ok(ResultTable::new(columns, data))
        }
    }

    fn render_identifier(name: &str) -> String {
        let bare = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if bare {
            name.to_string()
        } else {
            quote_identifier(name)
        }
    }

    fn quote_identifier(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn convert_value(value: ValueRef<'_>) -> (Value, Option<ColumnType>) {
        match value {
            ValueRef::Null => (Value::Null, None),
            ValueRef::Boolean(b) => (Value::Bool(b), Some(ColumnType::Boolean)),
            ValueRef::TinyInt(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::SmallInt(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::Int(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::BigInt(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::UTinyInt(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::USmallInt(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::UInt(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::UBigInt(i) => (Value::from(i), Some(ColumnType::Integer)),
            ValueRef::HugeInt(i) => (
                i64::try_from(i)
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::String(i.to_string())),
                Some(ColumnType::Integer),
            ),
            ValueRef::Float(f) => (Value::from(f as f64), Some(ColumnType::Float)),
            ValueRef::Double(d) => (Value::from(d), Some(ColumnType::Float)),
            ValueRef::Decimal(d) => (
                d.to_string()
                    .parse::<f64>()
                    .map(Value::from)
                    .unwrap_or_else(|_| Value::String(d.to_string())),
                Some(ColumnType::Float),
            ),
            ValueRef::Text(bytes) => (
                Value::String(String::from_utf8_lossy(bytes).to_string()),
                Some(ColumnType::Text),
            ),
            ValueRef::Blob(_) => (Value::String("[BLOB]".to_string()), Some(ColumnType::Text)),
            ValueRef::Date32(d) => {
                let date = NaiveDate::from_num_days_from_ce_opt(d + 719163)
                    .map(|date| date.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| d.to_string());
                (Value::String(date), Some(ColumnType::Temporal))
            }
            ValueRef::Timestamp(unit, v) => {
                let micros = match unit {
                    TimeUnit::Second => v.saturating_mul(1_000_000),
                    TimeUnit::Millisecond => v.saturating_mul(1_000),
                    TimeUnit::Microsecond => v,
                    TimeUnit::Nanosecond => v / 1_000,
                };
                let rendered = DateTime::from_timestamp_micros(micros)
                    .map(|ts| ts.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string())
                    .unwrap_or_else(|| v.to_string());
                (Value::String(rendered), Some(ColumnType::Temporal))
            }
            other => (Value::String(format!("{:?}", other)), Some(ColumnType::Text)),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::{DuckDbDialect, GenericDialect};

    #[test]
    fn test_single_select_accepted() {
        ensure_single_select("SELECT 1;", &GenericDialect {}).unwrap();
        ensure_single_select(
            "WITH t AS (SELECT 1 AS x) SELECT x FROM t",
            &GenericDialect {},
        )
        .unwrap();
        ensure_single_select("SELECT 1 UNION ALL SELECT 2", &GenericDialect {}).unwrap();
    }

    #[test]
    fn test_non_select_and_multi_statement_rejected() {
        assert!(ensure_single_select("DROP TABLE users", &GenericDialect {}).is_err());
        assert!(ensure_single_select("SELECT 1; SELECT 2", &GenericDialect {}).is_err());
        assert!(ensure_single_select("   ;  ", &GenericDialect {}).is_err());

        let cte_insert = "WITH t AS (SELECT 1 AS id) INSERT INTO users SELECT * FROM t";
        let err = ensure_single_select(cte_insert, &GenericDialect {}).unwrap_err();
        assert!(err.to_string().contains("Only SELECT"));
        assert!(ensure_single_select(cte_insert, &DuckDbDialect {}).is_err());

        let cte_delete = "WITH t AS (SELECT 1) DELETE FROM users";
        assert!(ensure_single_select(cte_delete, &GenericDialect {}).is_err());
        assert!(ensure_single_select(cte_delete, &DuckDbDialect {}).is_err());
    }

    #[test]
    fn test_lexical_check_ignores_quoted_keywords() {
        assert_eq!(modifying_keyword("SELECT 'delete me' AS note, \"update\" FROM t"), None);
        assert_eq!(modifying_keyword("WITH x AS (SELECT 1) delete FROM users"), Some("DELETE"));
        assert_eq!(modifying_keyword("SELECT deleted_at FROM users"), None);
    }
}
