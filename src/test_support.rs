//! Scripted collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use crate::error::{Error, Result};
use crate::models::agent_io::ColumnRef;
use crate::models::public::EnrichedDatabaseContext;
use crate::models::table::{ColumnType, ResultTable, TableColumn};
use crate::utils::cache::sha256_hex;
use crate::utils::database::{DatabaseGateway, DistinctValues, SampledValues};
use crate::utils::llm_wrapper::{LLMOptions, LLMResponse, LLMWrapper};

/// Phrases that identify each shipped system prompt.
pub(crate) mod routes {
    pub const SCHEMA_ANALYZER: &str = "database analyst";
    pub const SQL_GENERATION: &str = "SQL writer";
    pub const SQL_REFLECTION: &str = "SQL reviewer";
    pub const VISUALIZATION: &str = "visualization specialist";
    pub const BI: &str = "business intelligence analyst";

    pub const ALL: [&str; 5] = [SCHEMA_ANALYZER, SQL_GENERATION, SQL_REFLECTION, VISUALIZATION, BI];
}

enum Reply {
    Content(String),
    Failure(String),
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub route: Option<&'static str>,
    pub system: String,
    pub user: String,
}

/// LLM that answers from per-prompt queues. An empty queue is a transport
/// failure.
#[derive(Default)]
pub(crate) struct ScriptedLlm {
    replies: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, route: &'static str, content: &str) {
        self.enqueue(route, Reply::Content(content.to_string()));
    }

    pub fn push_failure(&self, route: &'static str, message: &str) {
        self.enqueue(route, Reply::Failure(message.to_string()));
    }

    fn enqueue(&self, route: &'static str, reply: Reply) {
        self.replies.lock().unwrap().entry(route).or_default().push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, route: &'static str) -> usize {
        self.calls().iter().filter(|c| c.route == Some(route)).count()
    }

    pub fn systems_for(&self, route: &'static str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.route == Some(route))
            .map(|c| c.system)
            .collect()
    }
}

#[async_trait]
impl LLMWrapper for ScriptedLlm {
    async fn generate_with_options(
        &self,
        system_prompt: &str,
        user_input: &str,
        _options: LLMOptions,
    ) -> anyhow::Result<LLMResponse> {
        let route = routes::ALL.iter().copied().find(|needle| system_prompt.contains(needle));
        self.calls.lock().unwrap().push(RecordedCall {
            route,
            system: system_prompt.to_string(),
            user: user_input.to_string(),
        });

        let reply = route.and_then(|route| {
            self.replies
                .lock()
                .unwrap()
                .get_mut(route)
                .and_then(VecDeque::pop_front)
        });
        match reply {
            Some(Reply::Content(content)) => Ok(LLMResponse { content, usage: None }),
            Some(Reply::Failure(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted reply for {:?}", route)),
        }
    }
}

pub(crate) const USERS_DDL: &str =
    "CREATE TABLE users (\n\tid INTEGER NOT NULL,\n\temail VARCHAR,\n\tstatus VARCHAR\n)";

/// In-memory gateway that records every call.
pub(crate) struct FakeGateway {
    ddl: String,
    samples: Mutex<HashMap<String, SampledValues>>,
    outcomes: Mutex<VecDeque<std::result::Result<ResultTable, String>>>,
    validation_error: Mutex<Option<String>>,
    schema_error: Mutex<Option<String>>,
    executed: Mutex<Vec<String>>,
    validated: Mutex<Vec<String>>,
    sampled: Mutex<Vec<Vec<ColumnRef>>>,
}

impl FakeGateway {
    pub fn new(ddl: &str) -> Self {
        Self {
            ddl: ddl.to_string(),
            samples: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::new()),
            validation_error: Mutex::new(None),
            schema_error: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            validated: Mutex::new(Vec::new()),
            sampled: Mutex::new(Vec::new()),
        }
    }

    pub fn users() -> Self {
        let gateway = Self::new(USERS_DDL);
        gateway.set_sample(
            "users.status",
            SampledValues::Values(vec![json!("active"), json!("inactive")]),
        );
        gateway
    }

    pub fn set_sample(&self, key: &str, values: SampledValues) {
        self.samples.lock().unwrap().insert(key.to_string(), values);
    }

    pub fn push_table(&self, table: ResultTable) {
        self.outcomes.lock().unwrap().push_back(Ok(table));
    }

    pub fn fail_next_execute(&self, message: &str) {
        self.outcomes.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn fail_validation(&self, message: &str) {
        *self.validation_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn fail_schema(&self, message: &str) {
        *self.schema_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn validated(&self) -> Vec<String> {
        self.validated.lock().unwrap().clone()
    }

    pub fn sample_calls(&self) -> usize {
        self.sampled.lock().unwrap().len()
    }

    pub fn sampled_columns(&self) -> Vec<Vec<ColumnRef>> {
        self.sampled.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseGateway for FakeGateway {
    fn dialect(&self) -> &str {
        "fake"
    }

    async fn schema_ddl_and_key(&self) -> Result<(String, String)> {
        if let Some(message) = self.schema_error.lock().unwrap().clone() {
            return Err(Error::Connection(message));
        }
        Ok((self.ddl.clone(), sha256_hex(&self.ddl)))
    }

    async fn sample_distinct_values(&self, columns: &[ColumnRef], _limit: usize) -> Result<DistinctValues> {
        self.sampled.lock().unwrap().push(columns.to_vec());
        let samples = self.samples.lock().unwrap();
        Ok(columns
            .iter()
            .map(|c| {
                let values = samples.get(&c.key()).cloned().unwrap_or(SampledValues::Error);
                (c.key(), values)
            })
            .collect())
    }

    async fn validate(&self, sql: &str) -> Result<()> {
        self.validated.lock().unwrap().push(sql.to_string());
        match self.validation_error.lock().unwrap().clone() {
            Some(message) => Err(Error::Validation(message)),
            None => Ok(()),
        }
    }

    async fn execute(&self, sql: &str) -> Result<ResultTable> {
        self.executed.lock().unwrap().push(sql.to_string());
        match self.outcomes.lock().unwrap().pop_front() {
            Some(Ok(table)) => Ok(table),
            Some(Err(message)) => Err(Error::Execution(message)),
            None => Ok(count_table(0)),
        }
    }
}

pub(crate) fn sample_context() -> EnrichedDatabaseContext {
    EnrichedDatabaseContext {
        raw_schema: USERS_DDL.to_string(),
        augmented_schema: USERS_DDL.replace(
            "status VARCHAR",
            "status VARCHAR -- Possible values: 'active', 'inactive'",
        ),
        schema_key: sha256_hex(USERS_DDL),
        business_context: None,
    }
}

/// `SELECT COUNT(*)` style result: one row, one integer column.
pub(crate) fn count_table(n: i64) -> ResultTable {
    ResultTable::new(
        vec![TableColumn::new("count_star()", ColumnType::Integer)],
        vec![vec![json!(n)]],
    )
}

/// Twelve months of revenue: one temporal and one numeric column.
pub(crate) fn monthly_revenue() -> ResultTable {
    ResultTable::new(
        vec![
            TableColumn::new("month", ColumnType::Temporal),
            TableColumn::new("revenue", ColumnType::Float),
        ],
        (1..=12)
            .map(|m| vec![json!(format!("2024-{:02}-01", m)), json!(1250.0 * m as f64)])
            .collect(),
    )
}
