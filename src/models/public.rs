//! Result objects handed to callers of the agents.

use serde::{Deserialize, Serialize};

use crate::models::table::ResultTable;
use crate::utils::chart::{Chart, ChartRequest};

/// Schema DDL plus sampled categorical values, built once per
/// (schema, business context) pair and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedDatabaseContext {
    pub raw_schema: String,
    pub augmented_schema: String,
    pub schema_key: String,
    pub business_context: Option<String>,
}

impl EnrichedDatabaseContext {
    /// Context without sampled values, used when no LLM is available.
    pub fn unenriched(raw_schema: String, schema_key: String, business_context: Option<String>) -> Self {
        Self {
            augmented_schema: raw_schema.clone(),
            raw_schema,
            schema_key,
            business_context,
        }
    }

    pub fn business_context_or_default(&self) -> &str {
        self.business_context
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or("No additional context provided.")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    ClarificationNeeded,
    Error,
}

/// Outcome of plan-only SQL generation: nothing is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlPlan {
    pub status: ResultStatus,
    pub sql_query: Option<String>,
    pub reasoning: Option<String>,
    pub is_validated: bool,
    pub clarification_question: Option<String>,
    pub error_message: Option<String>,
}

impl SqlPlan {
    pub fn clarification(question: Option<String>) -> Self {
        Self {
            status: ResultStatus::ClarificationNeeded,
            sql_query: None,
            reasoning: None,
            is_validated: false,
            clarification_question: question,
            error_message: None,
        }
    }

    pub fn error(message: String, sql_query: Option<String>, reasoning: Option<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            sql_query,
            reasoning,
            is_validated: false,
            clarification_question: None,
            error_message: Some(message),
        }
    }
}

/// Outcome of SQL generation followed by execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlResult {
    pub status: ResultStatus,
    pub result_table: Option<ResultTable>,
    pub sql_query: Option<String>,
    pub reasoning: Option<String>,
    pub clarification_question: Option<String>,
    pub error_message: Option<String>,
    /// Generation attempts consumed by the run.
    pub attempts: usize,
}

impl SqlResult {
    pub fn success(table: ResultTable, sql_query: String, reasoning: Option<String>, attempts: usize) -> Self {
        Self {
            status: ResultStatus::Success,
            result_table: Some(table),
            sql_query: Some(sql_query),
            reasoning,
            clarification_question: None,
            error_message: None,
            attempts,
        }
    }

    pub fn clarification(question: Option<String>, attempts: usize) -> Self {
        Self {
            status: ResultStatus::ClarificationNeeded,
            result_table: None,
            sql_query: None,
            reasoning: None,
            clarification_question: question,
            error_message: None,
            attempts,
        }
    }

    pub fn error(message: String, sql_query: Option<String>, attempts: usize) -> Self {
        Self {
            status: ResultStatus::Error,
            result_table: None,
            sql_query,
            reasoning: None,
            clarification_question: None,
            error_message: Some(message),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Either result of [`crate::agents::SqlAgent::run`], depending on `auto_execute`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlAgentOutput {
    Plan(SqlPlan),
    Result(SqlResult),
}

impl SqlAgentOutput {
    pub fn status(&self) -> ResultStatus {
        match self {
            SqlAgentOutput::Plan(plan) => plan.status,
            SqlAgentOutput::Result(result) => result.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualizationStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationResult {
    pub status: VisualizationStatus,
    pub chart: Option<Chart>,
    /// Chart type and arguments actually used; enough to redraw the chart
    /// from a fresh table without the LLM.
    pub vis_params: Option<ChartRequest>,
    pub error_message: Option<String>,
}

impl VisualizationResult {
    pub fn success(chart: Chart, vis_params: ChartRequest) -> Self {
        Self {
            status: VisualizationStatus::Success,
            chart: Some(chart),
            vis_params: Some(vis_params),
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: VisualizationStatus::Error,
            chart: None,
            vis_params: None,
            error_message: Some(message.into()),
        }
    }
}

/// Answer to one user turn. A success with neither table nor chart is a
/// plain-text answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiResult {
    pub status: ResultStatus,
    pub final_answer: String,
    pub result_table: Option<ResultTable>,
    pub chart: Option<Chart>,
    pub sql_query: Option<String>,
    pub reasoning: Option<String>,
    pub vis_params: Option<ChartRequest>,
    pub error_message: Option<String>,
}

impl BiResult {
    pub(crate) fn base(status: ResultStatus, final_answer: String, reasoning: Option<String>) -> Self {
        Self {
            status,
            final_answer,
            result_table: None,
            chart: None,
            sql_query: None,
            reasoning,
            vis_params: None,
            error_message: None,
        }
    }
}
