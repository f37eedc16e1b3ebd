//! Shapes the LLM is asked to answer with.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::prompt::StructuredOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Success,
    #[serde(alias = "needs_clarification", alias = "clarification_needed")]
    Clarification,
    Error,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Success => "success",
            GenerationStatus::Clarification => "clarification",
            GenerationStatus::Error => "error",
        }
    }
}

/// One SQL generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSqlResponse {
    pub status: GenerationStatus,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub clarification_question: Option<String>,
}

impl LlmSqlResponse {
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: GenerationStatus::Error,
            query: None,
            reason: Some(reason.into()),
            clarification_question: None,
        }
    }

    /// The SQL text when the attempt succeeded with a non-blank query.
    pub fn sql(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }

    /// A success without SQL is not a success.
    pub fn normalized(self) -> Self {
        if self.status == GenerationStatus::Success && self.sql().is_none() {
            return Self::error("The model reported success but returned no SQL query.");
        }
        self
    }
}

impl StructuredOutput for LlmSqlResponse {
    fn shape() -> &'static str {
        r#"{
  "status": "success" | "clarification" | "error",
  "query": "<complete SQL query when status is success, otherwise null>",
  "reason": "<short explanation of the query, or why it could not be written>",
  "clarification_question": "<question for the user when status is clarification, otherwise null>"
}"#
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Proceed,
    Revise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionReview {
    pub decision: ReviewDecision,
    #[serde(default, alias = "suggestion")]
    pub suggestions: Option<String>,
}

impl ReflectionReview {
    /// Suggestion text to carry into the next generation, if the reviewer
    /// asked for a revision and said what to change.
    pub fn revision(&self) -> Option<&str> {
        match self.decision {
            ReviewDecision::Revise => self
                .suggestions
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            ReviewDecision::Proceed => None,
        }
    }
}

impl StructuredOutput for ReflectionReview {
    fn shape() -> &'static str {
        r#"{
  "decision": "proceed" | "revise",
  "suggestions": "<concrete changes to make when decision is revise, otherwise null>"
}"#
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// `table.column`, the key used for sampled values.
    pub fn key(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionPlan {
    #[serde(default)]
    pub columns_to_inspect: Vec<ColumnRef>,
}

impl StructuredOutput for InspectionPlan {
    fn shape() -> &'static str {
        r#"{
  "columns_to_inspect": [{"table": "<table name>", "column": "<column name>"}]
}"#
    }
}

/// Think step of the visualization loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationToolset {
    pub reasoning: String,
    pub visualization_toolset: Map<String, Value>,
}

impl StructuredOutput for VisualizationToolset {
    fn shape() -> &'static str {
        r#"{
  "reasoning": "<why this chart answers the question>",
  "visualization_toolset": {"<chart type>": {"<argument>": "<value>"}}
}"#
    }
}

/// Tool chosen by the BI router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "args")]
pub enum BiAction {
    #[serde(rename = "sql_agent")]
    SqlAgent { question: String },
    #[serde(rename = "visualization_agent")]
    VisualizationAgent {
        #[serde(default)]
        instruction: Option<String>,
    },
    #[serde(rename = "FinalAnswer")]
    FinalAnswer { answer: String },
}

impl BiAction {
    pub fn name(&self) -> &'static str {
        match self {
            BiAction::SqlAgent { .. } => "sql_agent",
            BiAction::VisualizationAgent { .. } => "visualization_agent",
            BiAction::FinalAnswer { .. } => "FinalAnswer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiDecision {
    pub reasoning: String,
    pub action: BiAction,
}

impl StructuredOutput for BiDecision {
    fn shape() -> &'static str {
        r#"{
  "reasoning": "<what you know so far and why you pick this action>",
  "action": one of
    {"action": "sql_agent", "args": {"question": "<self-contained data question>"}}
    {"action": "visualization_agent", "args": {"instruction": "<what to chart, optional>"}}
    {"action": "FinalAnswer", "args": {"answer": "<answer for the user>"}}
}"#
    }
}

/// Renders conversation history for prompts.
pub fn format_chat_history(history: &[(String, String)]) -> String {
    let rendered = history
        .iter()
        .map(|(question, answer)| format!("Human: {}\nAI: {}", question, answer))
        .collect::<Vec<_>>()
        .join("\n");
    if rendered.trim().is_empty() {
        "No previous conversation history.".to_string()
    } else {
        rendered
    }
}
