use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::keys;
use crate::agents::sql_agent::SqlAgent;
use crate::agents::vis_agent::VisualizationAgent;
use crate::context::Context;
use crate::error::Error;
use crate::models::agent_io::{BiAction, BiDecision, format_chat_history};
use crate::models::public::{EnrichedDatabaseContext, ResultStatus, SqlResult, VisualizationResult, VisualizationStatus};
use crate::node::{Node, ProcessResult, ProcessState};
use crate::prompts::BI_REACT;
use crate::utils::llm_wrapper::LLMWrapper;
use crate::utils::prompt::{PromptVariables, generate_structured};

pub const NO_SQL_RESULT: &str = "Cannot run visualization agent without a successful SQL result.";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum BiFlowState {
    Act,
    Think,
    #[default]
    Default,
}

impl ProcessState for BiFlowState {
    fn is_default(&self) -> bool {
        matches!(self, BiFlowState::Default)
    }

    fn to_condition(&self) -> String {
        match self {
            BiFlowState::Act => "act".to_string(),
            BiFlowState::Think => "think".to_string(),
            BiFlowState::Default => "default".to_string(),
        }
    }
}

/// One (reasoning, action, observation) triple of the router's scratchpad.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiStep {
    pub reasoning: String,
    pub action: Option<BiAction>,
    pub observation: String,
}

pub fn format_scratchpad(steps: &[BiStep]) -> String {
    if steps.is_empty() {
        return "No steps taken yet.".to_string();
    }
    steps
        .iter()
        .map(|step| {
            let (name, args) = match &step.action {
                Some(action) => {
                    let args = serde_json::to_value(action)
                        .ok()
                        .and_then(|v| v.get("args").cloned())
                        .unwrap_or(Value::Null);
                    (action.name(), args.to_string())
                }
                None => ("none", "null".to_string()),
            };
            format!(
                "Reasoning: {}\nAction: {}\nArgs: {}\nObservation: {}",
                step.reasoning, name, args, step.observation
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn continue_or_stop(context: &mut Context, step: usize, max_steps: usize) -> Result<ProcessResult<BiFlowState>> {
    if step >= max_steps {
        warn!("--- Max steps reached, ending workflow ---");
        let produced = context
            .get_as::<SqlResult>(keys::SQL_RESULT)?
            .is_some_and(|result| result.status != ResultStatus::Error);
        if !produced && context.get_as::<String>(keys::ERROR)?.is_none() {
            context.set(
                keys::ERROR,
                json!(format!("Stopped after {} steps without a final answer.", step)),
            );
        }
        return Ok(ProcessResult::from_state(BiFlowState::Default));
    }
    Ok(ProcessResult::from_state(BiFlowState::Think))
}

/// Asks the LLM for the next action.
pub struct ThinkNode {
    llm: Arc<dyn LLMWrapper>,
    max_steps: usize,
}

impl ThinkNode {
    pub fn new(llm: Arc<dyn LLMWrapper>, max_steps: usize) -> Self {
        Self { llm, max_steps }
    }
}

#[async_trait]
impl Node for ThinkNode {
    type State = BiFlowState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        info!("--- Step {}: Thinking ---", context.get_usize(keys::STEP) + 1);

        let question: String = context.require(keys::QUESTION)?;
        let chat_history: Vec<(String, String)> = context.get_as(keys::CHAT_HISTORY)?.unwrap_or_default();
        let steps: Vec<BiStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();
        let variables = PromptVariables::new()
            .with("user_question", question.as_str())
            .with("chat_history", format_chat_history(&chat_history))
            .with("agent_scratchpad", format_scratchpad(&steps));

        let decision: BiDecision = generate_structured(self.llm.as_ref(), &BI_REACT, &question, &variables).await?;
        info!("\t|>Reasoning: {}", decision.reasoning);
        info!("\t|>Action: {}", decision.action.name());
        Ok(serde_json::to_value(decision)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<BiFlowState>> {
        let step = context.get_usize(keys::STEP) + 1;
        context.set(keys::STEP, json!(step));
        let mut steps: Vec<BiStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();

        let failure = match result {
            Ok(value) => match serde_json::from_value::<BiDecision>(value.clone()) {
                Ok(decision) => {
                    steps.push(BiStep {
                        reasoning: decision.reasoning,
                        action: Some(decision.action),
                        observation: String::new(),
                    });
                    context.set_as(keys::SCRATCHPAD, &steps)?;
                    return Ok(ProcessResult::from_state(BiFlowState::Act));
                }
                Err(e) => Error::MalformedOutput(e.to_string()),
            },
            Err(e) => match e.downcast_ref::<Error>() {
                Some(Error::MalformedOutput(message)) => Error::MalformedOutput(message.clone()),
                _ => {
                    let message = format!("The BI agent could not decide on an action: {}", e);
                    error!("{}", message);
                    context.set(keys::ERROR, json!(message));
                    return Ok(ProcessResult::from_state(BiFlowState::Default));
                }
            },
        };

        let observation = format!("Could not read the chosen action: {}", failure);
        warn!("{}", observation);
        steps.push(BiStep {
            observation,
            ..BiStep::default()
        });
        context.set_as(keys::SCRATCHPAD, &steps)?;
        continue_or_stop(context, step, self.max_steps)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ActOutcome {
    Sql { result: SqlResult },
    Visualization { result: VisualizationResult },
    FinalAnswer { answer: String },
}

/// Runs the action chosen by the last think step.
pub struct ActNode {
    sql_agent: Arc<SqlAgent>,
    vis_agent: Arc<VisualizationAgent>,
    max_steps: usize,
}

impl ActNode {
    pub fn new(sql_agent: Arc<SqlAgent>, vis_agent: Arc<VisualizationAgent>, max_steps: usize) -> Self {
        Self {
            sql_agent,
            vis_agent,
            max_steps,
        }
    }
}

#[async_trait]
impl Node for ActNode {
    type State = BiFlowState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let steps: Vec<BiStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();
        let action = steps
            .last()
            .and_then(|step| step.action.clone())
            .ok_or_else(|| anyhow!("No action to execute."))?;
        info!("--- Executing Tool: {} ---", action.name());

        let outcome = match action {
            BiAction::SqlAgent { question } => {
                if question.trim().is_empty() {
                    return Err(anyhow!("Missing 'question' argument for sql_agent."));
                }
                let db_context: EnrichedDatabaseContext = context.require(keys::DB_CONTEXT)?;
                // Restated by the router, so the sub-run gets no history.
                let result = self.sql_agent.execute(&question, &db_context, &[]).await?;
                ActOutcome::Sql { result }
            }
            BiAction::VisualizationAgent { instruction } => {
                let sql_result = context
                    .get_as::<SqlResult>(keys::SQL_RESULT)?
                    .filter(SqlResult::is_success)
                    .ok_or_else(|| anyhow!(NO_SQL_RESULT))?;
                let question = match instruction.filter(|i| !i.trim().is_empty()) {
                    Some(instruction) => instruction,
                    None => context.require(keys::QUESTION)?,
                };
                let result = self.vis_agent.run(&question, &sql_result).await?;
                ActOutcome::Visualization { result }
            }
            BiAction::FinalAnswer { answer } => {
                if answer.trim().is_empty() {
                    return Err(anyhow!("Missing 'answer' argument for FinalAnswer."));
                }
                ActOutcome::FinalAnswer { answer }
            }
        };
        Ok(serde_json::to_value(outcome)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<BiFlowState>> {
        let step = context.get_usize(keys::STEP);
        let mut steps: Vec<BiStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();

        let outcome = result
            .as_ref()
            .map_err(|e| e.to_string())
            .and_then(|value| serde_json::from_value::<ActOutcome>(value.clone()).map_err(|e| e.to_string()));

        let mut finished = false;
        let observation = match outcome {
            Ok(ActOutcome::Sql { result }) => {
                let observation = match result.status {
                    ResultStatus::Success => {
                        let (rows, columns) = result
                            .result_table
                            .as_ref()
                            .map(|t| (t.row_count(), t.column_count()))
                            .unwrap_or_default();
                        format!(
                            "Successfully executed SQL query: {}.\nResult has {} rows and {} columns.",
                            result.sql_query.as_deref().unwrap_or_default(),
                            rows,
                            columns
                        )
                    }
                    ResultStatus::ClarificationNeeded => format!(
                        "The SQL agent requires clarification: {}",
                        result.clarification_question.as_deref().unwrap_or_default()
                    ),
                    ResultStatus::Error => format!(
                        "SQL agent returned an error: {}",
                        result.error_message.as_deref().unwrap_or_default()
                    ),
                };
                context.set_as(keys::SQL_RESULT, &result)?;
                observation
            }
            Ok(ActOutcome::Visualization { result }) => {
                let observation = match result.status {
                    VisualizationStatus::Success => "Successfully generated visualization.".to_string(),
                    VisualizationStatus::Error => format!(
                        "Visualization agent returned an error: {}",
                        result.error_message.as_deref().unwrap_or_default()
                    ),
                };
                context.set_as(keys::VIS_RESULT, &result)?;
                observation
            }
            Ok(ActOutcome::FinalAnswer { answer }) => {
                context.set_as(keys::FINAL_ANSWER, &answer)?;
                finished = true;
                "Final answer provided.".to_string()
            }
            Err(e) => {
                error!("Error executing tool: {}", e);
                format!("Error: {}", e)
            }
        };

        if let Some(last) = steps.last_mut() {
            last.observation = observation;
        }
        context.set_as(keys::SCRATCHPAD, &steps)?;

        if finished {
            info!("--- FinalAnswer received, ending workflow ---");
            return Ok(ProcessResult::from_state(BiFlowState::Default));
        }
        continue_or_stop(context, step, self.max_steps)
    }
}
