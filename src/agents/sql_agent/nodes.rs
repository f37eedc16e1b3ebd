use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::keys;
use crate::context::Context;
use crate::error::Error;
use crate::models::agent_io::{GenerationStatus, LlmSqlResponse, ReflectionReview, format_chat_history};
use crate::models::public::EnrichedDatabaseContext;
use crate::node::{Node, ProcessResult, ProcessState};
use crate::prompts::{SQL_GENERATION, SQL_REFLECTION};
use crate::utils::database::DatabaseGateway;
use crate::utils::llm_wrapper::LLMWrapper;
use crate::utils::prompt::{PromptVariables, generate_structured};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SqlFlowState {
    Reflect,
    Execute,
    Regenerate,
    Retry,
    End,
    #[default]
    Default,
}

impl ProcessState for SqlFlowState {
    fn is_default(&self) -> bool {
        matches!(self, SqlFlowState::Default)
    }

    fn to_condition(&self) -> String {
        match self {
            SqlFlowState::Reflect => "reflect".to_string(),
            SqlFlowState::Execute => "execute".to_string(),
            SqlFlowState::Regenerate => "regenerate".to_string(),
            SqlFlowState::Retry => "retry".to_string(),
            SqlFlowState::End => "end".to_string(),
            SqlFlowState::Default => "default".to_string(),
        }
    }
}

fn history_entry(attempt: usize, response: &LlmSqlResponse) -> String {
    let mut entry = format!("ATTEMPT {} - Status: {}", attempt, response.status.as_str());
    if let Some(query) = response.query.as_deref().filter(|q| !q.trim().is_empty()) {
        entry.push_str(&format!("\nSQL:\n{}", query));
    }
    if let Some(reason) = response.reason.as_deref().filter(|r| !r.trim().is_empty()) {
        entry.push_str(&format!("\nReason:\n{}", reason));
    }
    entry
}

/// Asks the LLM for one SQL attempt.
pub struct GenerateSqlNode {
    llm: Arc<dyn LLMWrapper>,
    dialect: String,
    reflect: bool,
}

impl GenerateSqlNode {
    pub fn new(llm: Arc<dyn LLMWrapper>, dialect: impl Into<String>, reflect: bool) -> Self {
        Self {
            llm,
            dialect: dialect.into(),
            reflect,
        }
    }
}

#[async_trait]
impl Node for GenerateSqlNode {
    type State = SqlFlowState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let attempt = context.get_usize(keys::ATTEMPT) + 1;
        let max_attempts = context.get_usize(keys::MAX_ATTEMPTS);
        info!("--- Attempt {}/{}: Generating SQL ---", attempt, max_attempts);

        let question: String = context.require(keys::QUESTION)?;
        let db_context: EnrichedDatabaseContext = context.require(keys::DB_CONTEXT)?;
        let chat_history: Vec<(String, String)> = context.get_as(keys::CHAT_HISTORY)?.unwrap_or_default();
        let mut history: Vec<String> = context.get_as(keys::HISTORY)?.unwrap_or_default();
        if let Some(review) = context.get_as::<String>(keys::REVIEW)? {
            history.push(format!("REVIEWER SUGGESTIONS:\n{}", review));
        }
        let history = if history.is_empty() {
            "No previous attempts.".to_string()
        } else {
            history.join("\n")
        };

        let variables = PromptVariables::new()
            .with("database_dialect", self.dialect.as_str())
            .with("schema_definition", db_context.augmented_schema.as_str())
            .with("business_context", db_context.business_context_or_default())
            .with("user_question", question.as_str())
            .with("history", history)
            .with("chat_history", format_chat_history(&chat_history));

        let response: LlmSqlResponse =
            generate_structured(self.llm.as_ref(), &SQL_GENERATION, &question, &variables).await?;
        Ok(serde_json::to_value(response)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<SqlFlowState>> {
        let attempt = context.get_usize(keys::ATTEMPT) + 1;
        let response = match result {
            Ok(value) => serde_json::from_value::<LlmSqlResponse>(value.clone())
                .unwrap_or_else(|e| LlmSqlResponse::error(format!("SQL generation failed: {}", e))),
            Err(e) => {
                error!("SQL generation failed: {}", e);
                LlmSqlResponse::error(format!("SQL generation failed: {}", e))
            }
        }
        .normalized();
        info!("Generation status: {}", response.status.as_str());

        let mut history: Vec<String> = context.get_as(keys::HISTORY)?.unwrap_or_default();
        history.push(history_entry(attempt, &response));
        context.set_as(keys::HISTORY, &history)?;
        context.set(keys::ATTEMPT, json!(attempt));
        context.set(keys::REVIEW, Value::Null);

        let next = if self.reflect && response.status == GenerationStatus::Success {
            SqlFlowState::Reflect
        } else {
            SqlFlowState::Execute
        };
        context.set_as(keys::GENERATION, &response)?;
        Ok(ProcessResult::from_state(next))
    }
}

/// Second LLM pass that reviews a successful generation before it runs.
pub struct ReflectNode {
    llm: Arc<dyn LLMWrapper>,
    dialect: String,
    max_reflections: usize,
}

impl ReflectNode {
    pub fn new(llm: Arc<dyn LLMWrapper>, dialect: impl Into<String>, max_reflections: usize) -> Self {
        Self {
            llm,
            dialect: dialect.into(),
            max_reflections,
        }
    }
}

#[async_trait]
impl Node for ReflectNode {
    type State = SqlFlowState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        info!("--- Reviewing generated SQL ---");
        let generation: LlmSqlResponse = context.require(keys::GENERATION)?;
        let db_context: EnrichedDatabaseContext = context.require(keys::DB_CONTEXT)?;
        let question: String = context.require(keys::QUESTION)?;

        let variables = PromptVariables::new()
            .with("database_dialect", self.dialect.as_str())
            .with("user_question", question)
            .with("schema_definition", db_context.augmented_schema.as_str())
            .with("sql_query", generation.sql().unwrap_or_default());

        let review: ReflectionReview = generate_structured(
            self.llm.as_ref(),
            &SQL_REFLECTION,
            "Please review the provided SQL query.",
            &variables,
        )
        .await?;
        Ok(serde_json::to_value(review)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<SqlFlowState>> {
        let rounds = context.get_usize(keys::REFLECTION_ATTEMPT) + 1;
        context.set(keys::REFLECTION_ATTEMPT, json!(rounds));

        let review = match result {
            Ok(value) => match serde_json::from_value::<ReflectionReview>(value.clone()) {
                Ok(review) => {
                    info!("--- Reviewer decision: {:?} ---", review.decision);
                    review.revision().map(str::to_string)
                }
                Err(e) => {
                    warn!("Unreadable review, proceeding: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Review failed, proceeding with the generated SQL: {}", e);
                None
            }
        };

        let Some(review) = review else {
            info!("--- Reviewer approved. Proceeding to execution ---");
            return Ok(ProcessResult::from_state(SqlFlowState::Execute));
        };

        info!("--- Reviewer suggestions: {} ---", review);
        context.set_as(keys::REVIEW, &review)?;
        if rounds >= self.max_reflections {
            warn!("--- Max reflection attempts reached. Executing the last query ---");
            return Ok(ProcessResult::from_state(SqlFlowState::Execute));
        }
        Ok(ProcessResult::from_state(SqlFlowState::Regenerate))
    }
}

/// Runs a successful generation and decides whether to retry.
pub struct ExecuteSqlNode {
    gateway: Arc<dyn DatabaseGateway>,
}

impl ExecuteSqlNode {
    pub fn new(gateway: Arc<dyn DatabaseGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Node for ExecuteSqlNode {
    type State = SqlFlowState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let generation: LlmSqlResponse = context.require(keys::GENERATION)?;
        let Some(sql) = generation.sql().filter(|_| generation.status == GenerationStatus::Success) else {
            warn!(
                "Skipping SQL execution. Generation status: '{}'",
                generation.status.as_str()
            );
            return Ok(Value::Null);
        };

        info!("--- Executing SQL: {} ---", sql);
        let table = self.gateway.execute(sql).await?;
        info!("Successfully executed SQL ({} rows)", table.row_count());
        Ok(json!({ "sql": sql, "table": table }))
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<SqlFlowState>> {
        let value = match result {
            Ok(Value::Null) => return Ok(ProcessResult::from_state(SqlFlowState::End)),
            Ok(value) => value,
            Err(e) => {
                let reason = match e.downcast_ref::<Error>() {
                    Some(Error::Execution(message)) => message.clone(),
                    _ => e.to_string(),
                };
                let message = format!("Error executing SQL: {}", reason);
                error!("Execution failed: {}", message);

                let mut history: Vec<String> = context.get_as(keys::HISTORY)?.unwrap_or_default();
                history.push(format!("EXECUTION FAILED: {}", message));
                context.set_as(keys::HISTORY, &history)?;
                context.set(keys::ERROR, json!(message));
                context.set(keys::RESULT_TABLE, Value::Null);

                let attempt = context.get_usize(keys::ATTEMPT);
                let max_attempts = context.get_usize(keys::MAX_ATTEMPTS);
                if attempt >= max_attempts {
                    warn!("--- Max attempts reached, ending workflow ---");
                    return Ok(ProcessResult::from_state(SqlFlowState::End));
                }
                info!("--- Database error detected, retrying generation ---");
                return Ok(ProcessResult::from_state(SqlFlowState::Retry));
            }
        };

        context.set(keys::RESULT_TABLE, value["table"].clone());
        context.set(keys::GENERATED_SQL, value["sql"].clone());
        context.set(keys::ERROR, Value::Null);
        info!("--- Workflow successful ---");
        Ok(ProcessResult::from_state(SqlFlowState::End))
    }
}
