use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};

use super::keys;
use crate::context::Context;
use crate::models::agent_io::VisualizationToolset;
use crate::models::table::ResultTable;
use crate::node::{Node, ProcessResult, ProcessState};
use crate::prompts::VISUALIZATION_REACT;
use crate::utils::chart::{Chart, ChartRequest, ChartType, VisualizationProvider};
use crate::utils::llm_wrapper::LLMWrapper;
use crate::utils::prompt::{PromptVariables, generate_structured};

pub const GENERIC_FAILURE: &str = "Failed to generate a visualization after multiple attempts.";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum VisFlowState {
    Act,
    Think,
    #[default]
    Default,
}

impl ProcessState for VisFlowState {
    fn is_default(&self) -> bool {
        matches!(self, VisFlowState::Default)
    }

    fn to_condition(&self) -> String {
        match self {
            VisFlowState::Act => "act".to_string(),
            VisFlowState::Think => "think".to_string(),
            VisFlowState::Default => "default".to_string(),
        }
    }
}

/// One think/act round of the loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisStep {
    pub reasoning: String,
    pub toolset: Map<String, Value>,
    pub observation: String,
}

pub fn format_scratchpad(steps: &[VisStep]) -> String {
    if steps.is_empty() {
        return "No previous attempts.".to_string();
    }
    steps
        .iter()
        .map(|step| {
            format!(
                "Reasoning: {}\nVisualization Toolset: {}\nObservation: {}",
                step.reasoning,
                Value::Object(step.toolset.clone()),
                step.observation
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ends the loop at the step cap, keeping the last failure as the error.
fn continue_or_stop(context: &mut Context, step: usize, max_steps: usize) -> Result<ProcessResult<VisFlowState>> {
    if step >= max_steps {
        warn!("--- Max steps reached, ending workflow ---");
        if context.get_as::<String>(keys::ERROR)?.is_none() {
            context.set(keys::ERROR, json!(GENERIC_FAILURE));
        }
        return Ok(ProcessResult::from_state(VisFlowState::Default));
    }
    info!("--- Retrying visualization generation ---");
    Ok(ProcessResult::from_state(VisFlowState::Think))
}

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
    type State = VisFlowState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let step = context.get_usize(keys::STEP) + 1;
        info!("--- Step {}: Thinking about visualization ---", step);

        let question: String = context.require(keys::QUESTION)?;
        let steps: Vec<VisStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();
        let variables = PromptVariables::new()
            .with("user_question", question.as_str())
            .with("sql_query", context.get_as::<String>(keys::SQL_QUERY)?.unwrap_or_default())
            .with("metadata", context.require::<String>(keys::METADATA)?)
            .with("chart_catalogue", ChartType::catalogue())
            .with("agent_scratchpad", format_scratchpad(&steps));

        let response: VisualizationToolset =
            generate_structured(self.llm.as_ref(), &VISUALIZATION_REACT, &question, &variables).await?;
        info!("\t|>Reasoning: {}", response.reasoning);
        Ok(serde_json::to_value(response)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<VisFlowState>> {
        let step = context.get_usize(keys::STEP) + 1;
        context.set(keys::STEP, json!(step));
        let mut steps: Vec<VisStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();

        let parsed = result
            .as_ref()
            .map_err(|e| e.to_string())
            .and_then(|value| {
                serde_json::from_value::<VisualizationToolset>(value.clone()).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(response) => {
                steps.push(VisStep {
                    reasoning: response.reasoning,
                    toolset: response.visualization_toolset,
                    observation: String::new(),
                });
                context.set_as(keys::SCRATCHPAD, &steps)?;
                Ok(ProcessResult::from_state(VisFlowState::Act))
            }
            Err(e) => {
                let message = format!("Could not read the chart choice: {}", e);
                error!("{}", message);
                steps.push(VisStep {
                    observation: message.clone(),
                    ..VisStep::default()
                });
                context.set_as(keys::SCRATCHPAD, &steps)?;
                context.set(keys::ERROR, json!(message));
                continue_or_stop(context, step, self.max_steps)
            }
        }
    }
}

pub struct RenderChartNode {
    provider: Arc<dyn VisualizationProvider>,
    max_steps: usize,
}

impl RenderChartNode {
    pub fn new(provider: Arc<dyn VisualizationProvider>, max_steps: usize) -> Self {
        Self { provider, max_steps }
    }
}

#[async_trait]
impl Node for RenderChartNode {
    type State = VisFlowState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let steps: Vec<VisStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();
        let toolset = steps.last().map(|step| step.toolset.clone()).unwrap_or_default();
        let table: ResultTable = context.require(keys::TABLE)?;

        let request = ChartRequest::from_toolset(&toolset)?;
        info!("--- Executing visualization tool: {} ---", request.chart_type);
        let chart = self.provider.create_chart(&request, &table)?;
        Ok(json!({ "chart": chart, "params": request }))
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<VisFlowState>> {
        let step = context.get_usize(keys::STEP);
        let mut steps: Vec<VisStep> = context.get_as(keys::SCRATCHPAD)?.unwrap_or_default();
        let tool = steps
            .last()
            .and_then(|s| s.toolset.keys().next().cloned())
            .unwrap_or_else(|| "visualization".to_string());

        let rendered = result.as_ref().map_err(|e| e.to_string()).and_then(|value| {
            let chart = serde_json::from_value::<Chart>(value["chart"].clone()).map_err(|e| e.to_string())?;
            let params = serde_json::from_value::<ChartRequest>(value["params"].clone()).map_err(|e| e.to_string())?;
            Ok((chart, params))
        });

        let (observation, rendered) = match rendered {
            Ok((chart, params)) => {
                let observation = format!("Successfully generated '{}'.", tool);
                info!("--- {} ---", observation);
                context.set_as(keys::CHART, &chart)?;
                context.set_as(keys::VIS_PARAMS, &params)?;
                context.set(keys::ERROR, Value::Null);
                (observation, true)
            }
            Err(e) => {
                let message = format!("Error executing {}: {}", tool, e);
                error!("--- {} ---", message);
                context.set(keys::ERROR, json!(message));
                (message, false)
            }
        };

        if let Some(last) = steps.last_mut() {
            last.observation = observation;
        }
        context.set_as(keys::SCRATCHPAD, &steps)?;

        if rendered {
            info!("--- Visualization generated, ending workflow ---");
            return Ok(ProcessResult::from_state(VisFlowState::Default));
        }
        continue_or_stop(context, step, self.max_steps)
    }
}
