//! Text-to-SQL with bounded retries on execution failure and an optional
//! reviewer pass before each execution.

mod nodes;

use std::sync::Arc;

use tracing::info;

pub use nodes::SqlFlowState;
use nodes::{ExecuteSqlNode, GenerateSqlNode, ReflectNode};

use crate::build_flow;
use crate::config::{SqlSettings, SqlWorkflowKind};
use crate::context::Context;
use crate::error::Result;
use crate::flow::Flow;
use crate::models::agent_io::{GenerationStatus, LlmSqlResponse};
use crate::models::public::{EnrichedDatabaseContext, ResultStatus, SqlAgentOutput, SqlPlan, SqlResult};
use crate::models::table::ResultTable;
use crate::utils::database::DatabaseGateway;
use crate::utils::llm_wrapper::LLMWrapper;

pub(crate) mod keys {
    pub const QUESTION: &str = "question";
    pub const DB_CONTEXT: &str = "db_context";
    pub const CHAT_HISTORY: &str = "chat_history";
    pub const HISTORY: &str = "history";
    pub const REVIEW: &str = "review";
    pub const ATTEMPT: &str = "current_attempt";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const REFLECTION_ATTEMPT: &str = "current_reflection_attempt";
    pub const GENERATION: &str = "generation_result";
    pub const RESULT_TABLE: &str = "result_table";
    pub const GENERATED_SQL: &str = "generated_sql";
    pub const ERROR: &str = "error";
}

pub struct SqlAgent {
    gateway: Arc<dyn DatabaseGateway>,
    settings: SqlSettings,
    execute_flow: Flow<SqlFlowState>,
    plan_flow: Flow<SqlFlowState>,
}

impl SqlAgent {
    pub fn new(llm: Arc<dyn LLMWrapper>, gateway: Arc<dyn DatabaseGateway>, settings: SqlSettings) -> Self {
        let dialect = gateway.dialect().to_string();
        let reflect = settings.workflow == SqlWorkflowKind::Reflection;

        let mut execute_flow = build_flow!(
            start: ("generate_sql", GenerateSqlNode::new(llm.clone(), dialect.as_str(), reflect)),
            nodes: [("execute_sql", ExecuteSqlNode::new(gateway.clone()))],
            edges: [
                ("generate_sql", "execute_sql", SqlFlowState::Execute),
                ("execute_sql", "generate_sql", SqlFlowState::Retry),
            ]
        );
        if reflect {
            execute_flow.add_node(
                "reflect",
                ReflectNode::new(llm.clone(), dialect.as_str(), settings.max_reflection_attempts),
            );
            execute_flow.add_transition("generate_sql", SqlFlowState::Reflect, "reflect");
            execute_flow.add_transition("reflect", SqlFlowState::Regenerate, "generate_sql");
            execute_flow.add_transition("reflect", SqlFlowState::Execute, "execute_sql");
        }
        // Each attempt is generate, reflect, execute; every revision adds a
        // generate and a reflect on top.
        let step_cap = 3 * settings.max_attempts + 2 * settings.max_reflection_attempts + 1;
        let execute_flow = execute_flow.with_max_steps(step_cap);

        let plan_flow = Flow::new("generate_sql", GenerateSqlNode::new(llm, dialect.as_str(), false))
            .with_max_steps(1);

        Self {
            gateway,
            settings,
            execute_flow,
            plan_flow,
        }
    }

    pub fn settings(&self) -> &SqlSettings {
        &self.settings
    }

    /// Plan-only when `auto_execute` is false: the SQL is validated, never run.
    pub async fn run(
        &self,
        question: &str,
        context: &EnrichedDatabaseContext,
        history: &[(String, String)],
        auto_execute: bool,
    ) -> Result<SqlAgentOutput> {
        if auto_execute {
            Ok(SqlAgentOutput::Result(self.execute(question, context, history).await?))
        } else {
            Ok(SqlAgentOutput::Plan(self.plan(question, context, history).await?))
        }
    }

    fn initial_context(
        &self,
        question: &str,
        context: &EnrichedDatabaseContext,
        history: &[(String, String)],
        max_attempts: usize,
    ) -> Result<Context> {
        let mut state = Context::new();
        state.set_as(keys::QUESTION, &question)?;
        state.set_as(keys::DB_CONTEXT, context)?;
        state.set_as(keys::CHAT_HISTORY, &history)?;
        state.set_as(keys::MAX_ATTEMPTS, &max_attempts)?;
        Ok(state)
    }

    pub async fn execute(
        &self,
        question: &str,
        context: &EnrichedDatabaseContext,
        history: &[(String, String)],
    ) -> Result<SqlResult> {
        let state = self.initial_context(question, context, history, self.settings.max_attempts)?;
        let state = self.execute_flow.run(state).await?;

        let generation: LlmSqlResponse = state.require(keys::GENERATION)?;
        let attempts = state.get_usize(keys::ATTEMPT);

        if generation.status == GenerationStatus::Clarification {
            info!("SQL agent needs clarification");
            return Ok(SqlResult::clarification(Some(clarification_question(generation)), attempts));
        }

        if let Some(db_error) = state.get_as::<String>(keys::ERROR)? {
            return Ok(SqlResult::error(
                format!("SQL execution failed after {} attempts: {}", attempts, db_error),
                generation.sql().map(str::to_string),
                attempts,
            ));
        }

        if generation.status == GenerationStatus::Error {
            return Ok(SqlResult::error(
                generation
                    .reason
                    .unwrap_or_else(|| "The SQL agent could not generate a query.".to_string()),
                generation.query,
                attempts,
            ));
        }

        match (
            state.get_as::<ResultTable>(keys::RESULT_TABLE)?,
            state.get_as::<String>(keys::GENERATED_SQL)?,
        ) {
            (Some(table), Some(sql)) => Ok(SqlResult::success(table, sql, generation.reason, attempts)),
            _ => Ok(SqlResult::error(
                "The SQL agent stopped before the query was executed.".to_string(),
                generation.sql().map(str::to_string),
                attempts,
            )),
        }
    }

    pub async fn plan(
        &self,
        question: &str,
        context: &EnrichedDatabaseContext,
        history: &[(String, String)],
    ) -> Result<SqlPlan> {
        let state = self.initial_context(question, context, history, 1)?;
        let state = self.plan_flow.run(state).await?;
        let generation: LlmSqlResponse = state.require(keys::GENERATION)?;

        match generation.status {
            GenerationStatus::Clarification => Ok(SqlPlan::clarification(Some(clarification_question(generation)))),
            GenerationStatus::Error => Ok(SqlPlan::error(
                generation
                    .reason
                    .clone()
                    .unwrap_or_else(|| "The SQL agent could not generate a query.".to_string()),
                None,
                generation.reason,
            )),
            GenerationStatus::Success => {
                let sql = generation.sql().unwrap_or_default().to_string();
                match self.gateway.validate(&sql).await {
                    Ok(()) => Ok(SqlPlan {
                        status: ResultStatus::Success,
                        sql_query: Some(sql),
                        reasoning: generation.reason,
                        is_validated: true,
                        clarification_question: None,
                        error_message: None,
                    }),
                    Err(e) => Ok(SqlPlan::error(
                        e.to_string(),
                        Some(sql),
                        Some("The generated SQL was syntactically invalid.".to_string()),
                    )),
                }
            }
        }
    }
}

const DEFAULT_CLARIFICATION: &str = "Could you clarify your question?";

/// The model's question, else its reason, else a generic prompt.
fn clarification_question(generation: LlmSqlResponse) -> String {
    [generation.clarification_question, generation.reason]
        .into_iter()
        .flatten()
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
        .unwrap_or_else(|| DEFAULT_CLARIFICATION.to_string())
}
