//! Top-level ReAct router: decides per step whether to query data, chart it
//! or answer, then formats the turn's outcome.

mod nodes;

use std::sync::Arc;

use tracing::info;

pub use nodes::{BiFlowState, BiStep, NO_SQL_RESULT, format_scratchpad};
use nodes::{ActNode, ThinkNode};

use crate::agents::sql_agent::SqlAgent;
use crate::agents::vis_agent::VisualizationAgent;
use crate::build_flow;
use crate::config::BiSettings;
use crate::context::Context;
use crate::error::Result;
use crate::flow::Flow;
use crate::models::public::{BiResult, EnrichedDatabaseContext, ResultStatus, SqlResult, VisualizationResult};
use crate::utils::llm_wrapper::LLMWrapper;

pub(crate) mod keys {
    pub const QUESTION: &str = "natural_language_question";
    pub const CHAT_HISTORY: &str = "chat_history";
    pub const DB_CONTEXT: &str = "db_context";
    pub const SCRATCHPAD: &str = "intermediate_steps";
    pub const STEP: &str = "current_step";
    pub const SQL_RESULT: &str = "sql_result";
    pub const VIS_RESULT: &str = "visualization_result";
    pub const FINAL_ANSWER: &str = "final_answer";
    pub const ERROR: &str = "error";
}

pub struct BiOrchestrator {
    settings: BiSettings,
    flow: Flow<BiFlowState>,
}

impl BiOrchestrator {
    pub fn new(
        llm: Arc<dyn LLMWrapper>,
        sql_agent: Arc<SqlAgent>,
        vis_agent: Arc<VisualizationAgent>,
        settings: BiSettings,
    ) -> Self {
        let max_steps = settings.max_steps.max(1);
        let flow = build_flow!(
            start: ("think", ThinkNode::new(llm, max_steps)),
            nodes: [("execute_tool", ActNode::new(sql_agent, vis_agent, max_steps))],
            edges: [
                ("think", "execute_tool", BiFlowState::Act),
                ("think", "think", BiFlowState::Think),
                ("execute_tool", "think", BiFlowState::Think),
            ]
        )
        .with_max_steps(2 * max_steps + 2);
        Self { settings, flow }
    }

    pub async fn run(
        &self,
        question: &str,
        context: &EnrichedDatabaseContext,
        history: &[(String, String)],
    ) -> Result<BiResult> {
        let mut state = Context::new();
        state.set_as(keys::QUESTION, &question)?;
        state.set_as(keys::CHAT_HISTORY, &history)?;
        state.set_as(keys::DB_CONTEXT, context)?;
        let state = self.flow.run(state).await?;
        self.format_output(&state)
    }

    fn format_output(&self, state: &Context) -> Result<BiResult> {
        let final_answer = state.get_as::<String>(keys::FINAL_ANSWER)?.unwrap_or_default();
        let sql_result = state.get_as::<SqlResult>(keys::SQL_RESULT)?;
        let vis_result = state.get_as::<VisualizationResult>(keys::VIS_RESULT)?;
        let error = state.get_as::<String>(keys::ERROR)?;

        let steps: Vec<BiStep> = state.get_as(keys::SCRATCHPAD)?.unwrap_or_default();
        let reasoning = steps
            .iter()
            .map(|step| step.reasoning.as_str())
            .filter(|r| !r.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let reasoning = Some(reasoning).filter(|r| !r.is_empty());

        if let Some(sql) = sql_result.as_ref().filter(|r| r.status == ResultStatus::ClarificationNeeded) {
            info!("Turn ends with a clarification request from the SQL agent");
            let question = sql.clarification_question.clone().unwrap_or(final_answer);
            return Ok(BiResult::base(ResultStatus::ClarificationNeeded, question, reasoning));
        }

        if self.looks_like_question(&final_answer) {
            return Ok(BiResult::base(ResultStatus::ClarificationNeeded, final_answer, reasoning));
        }

        if let Some(error) = error {
            let answer = if final_answer.is_empty() {
                "An error occurred.".to_string()
            } else {
                final_answer
            };
            let mut result = BiResult::base(ResultStatus::Error, answer, reasoning);
            result.sql_query = sql_result.and_then(|r| r.sql_query);
            result.error_message = Some(error);
            return Ok(result);
        }

        if let Some(sql) = sql_result.as_ref().filter(|r| r.status == ResultStatus::Error) {
            let answer = if final_answer.is_empty() {
                "An error occurred during SQL generation or execution.".to_string()
            } else {
                final_answer
            };
            let mut result = BiResult::base(ResultStatus::Error, answer, reasoning);
            result.sql_query = sql.sql_query.clone();
            result.error_message = sql.error_message.clone();
            return Ok(result);
        }

        let answer = if final_answer.is_empty() {
            "Request processed successfully.".to_string()
        } else {
            final_answer
        };
        let mut result = BiResult::base(ResultStatus::Success, answer, reasoning);
        if let Some(sql) = sql_result {
            result.result_table = sql.result_table;
            result.sql_query = sql.sql_query;
        }
        if let Some(vis) = vis_result {
            result.chart = vis.chart;
            result.vis_params = vis.vis_params;
        }
        Ok(result)
    }

    /// Best-effort: a short answer ending in a question mark is taken as a
    /// question back to the user.
    fn looks_like_question(&self, answer: &str) -> bool {
        let answer = answer.trim();
        answer.ends_with('?') && answer.chars().count() < self.settings.clarification_max_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SqlSettings, SqlWorkflowKind, VisualizationSettings};
    use crate::test_support::{FakeGateway, ScriptedLlm, count_table, monthly_revenue, routes, sample_context};
    use crate::utils::chart::{ChartType, VegaLiteProvider};

    const COUNT_USERS: &str =
        r#"{"status": "success", "query": "SELECT COUNT(*) FROM users", "reason": "Count all rows."}"#;

    fn bi_step(action: &str, args: &str) -> String {
        format!(
            r#"{{"reasoning": "step {action}", "action": {{"action": "{action}", "args": {args}}}}}"#
        )
    }

    fn orchestrator(llm: &Arc<ScriptedLlm>, gateway: &Arc<FakeGateway>, max_steps: usize) -> BiOrchestrator {
        let sql_settings = SqlSettings {
            workflow: SqlWorkflowKind::Simple,
            ..SqlSettings::default()
        };
        let sql_agent = Arc::new(SqlAgent::new(llm.clone(), gateway.clone(), sql_settings));
        let vis_agent = Arc::new(VisualizationAgent::new(
            llm.clone(),
            Arc::new(VegaLiteProvider::default()),
            VisualizationSettings::default(),
        ));
        BiOrchestrator::new(
            llm.clone(),
            sql_agent,
            vis_agent,
            BiSettings {
                max_steps,
                ..BiSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_counts_users_end_to_end() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        gateway.push_table(count_table(42));
        llm.push(routes::BI, &bi_step("sql_agent", r#"{"question": "How many users are there?"}"#));
        llm.push(routes::SQL_GENERATION, COUNT_USERS);
        llm.push(routes::BI, &bi_step("FinalAnswer", r#"{"answer": "There are 42 users."}"#));

        let result = orchestrator(&llm, &gateway, 12)
            .run("How many users are there?", &sample_context(), &[])
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.final_answer, "There are 42 users.");
        assert_eq!(result.sql_query.as_deref(), Some("SELECT COUNT(*) FROM users"));
        let table = result.result_table.unwrap();
        assert_eq!((table.row_count(), table.column_count()), (1, 1));
        assert_eq!(result.reasoning.as_deref(), Some("step sql_agent\nstep FinalAnswer"));
        assert_eq!(gateway.executed(), vec!["SELECT COUNT(*) FROM users".to_string()]);

        let second = &llm.systems_for(routes::BI)[1];
        assert!(second.contains(
            "Observation: Successfully executed SQL query: SELECT COUNT(*) FROM users.\nResult has 1 rows and 1 columns."
        ));
    }

    #[tokio::test]
    async fn test_chart_is_bundled_with_answer() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        gateway.push_table(monthly_revenue());
        llm.push(routes::BI, &bi_step("sql_agent", r#"{"question": "Revenue per month"}"#));
        llm.push(
            routes::SQL_GENERATION,
            r#"{"status": "success", "query": "SELECT month, SUM(amount) AS revenue FROM orders GROUP BY 1"}"#,
        );
        llm.push(routes::BI, &bi_step("visualization_agent", "{}"));
        llm.push(
            routes::VISUALIZATION,
            r#"{"reasoning": "trend", "visualization_toolset": {"line_chart": {"x": "month", "y": "revenue"}}}"#,
        );
        llm.push(routes::BI, &bi_step("FinalAnswer", r#"{"answer": "Revenue grew every month."}"#));

        let result = orchestrator(&llm, &gateway, 12)
            .run("Show me revenue per month", &sample_context(), &[])
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert!(result.chart.is_some());
        assert_eq!(result.vis_params.unwrap().chart_type, ChartType::LineChart);
        assert_eq!(result.result_table.unwrap().row_count(), 12);
        assert!(llm.systems_for(routes::BI)[2].contains("Observation: Successfully generated visualization."));
    }

    #[tokio::test]
    async fn test_stops_at_step_cap_without_final_answer() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        for _ in 0..10 {
            llm.push(routes::BI, &bi_step("visualization_agent", "{}"));
        }

        let result = orchestrator(&llm, &gateway, 3)
            .run("Plot something", &sample_context(), &[])
            .await
            .unwrap();

        assert_eq!(llm.calls_for(routes::BI), 3);
        assert_eq!(llm.calls_for(routes::VISUALIZATION), 0);
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Stopped after 3 steps without a final answer.")
        );
        assert!(llm.systems_for(routes::BI)[1].contains(NO_SQL_RESULT));
    }

    #[tokio::test]
    async fn test_sql_clarification_becomes_turn_status() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        llm.push(routes::BI, &bi_step("sql_agent", r#"{"question": "Show me the trend"}"#));
        llm.push(
            routes::SQL_GENERATION,
            r#"{"status": "clarification", "clarification_question": "Which metric should the trend cover?"}"#,
        );
        llm.push(
            routes::BI,
            &bi_step("FinalAnswer", r#"{"answer": "Which metric should the trend cover?"}"#),
        );

        let result = orchestrator(&llm, &gateway, 12)
            .run("Show me the trend", &sample_context(), &[])
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::ClarificationNeeded);
        assert_eq!(result.final_answer, "Which metric should the trend cover?");
        assert!(gateway.executed().is_empty());
        assert!(gateway.validated().is_empty());
    }

    #[tokio::test]
    async fn test_short_question_answer_is_clarification() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        llm.push(
            routes::BI,
            &bi_step("FinalAnswer", r#"{"answer": "Do you mean active or all users?"}"#),
        );

        let result = orchestrator(&llm, &gateway, 12)
            .run("How many?", &sample_context(), &[])
            .await
            .unwrap();
        assert_eq!(result.status, ResultStatus::ClarificationNeeded);
        assert!(result.result_table.is_none());
    }

    #[tokio::test]
    async fn test_sql_error_is_surfaced_with_query() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        for _ in 0..3 {
            gateway.fail_next_execute("Binder Error: column \"nme\" not found");
            llm.push(
                routes::SQL_GENERATION,
                r#"{"status": "success", "query": "SELECT nme FROM users"}"#,
            );
        }
        llm.push(routes::BI, &bi_step("sql_agent", r#"{"question": "List user names"}"#));
        llm.push(
            routes::BI,
            &bi_step("FinalAnswer", r#"{"answer": "I could not retrieve the user names."}"#),
        );

        let result = orchestrator(&llm, &gateway, 12)
            .run("List user names", &sample_context(), &[])
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.final_answer, "I could not retrieve the user names.");
        assert_eq!(result.sql_query.as_deref(), Some("SELECT nme FROM users"));
        assert!(result.error_message.unwrap().starts_with("SQL execution failed after 3 attempts"));
    }

    #[tokio::test]
    async fn test_unreadable_router_output_is_retried() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        llm.push(routes::BI, "I think we should query the database.");
        llm.push(routes::BI, &bi_step("FinalAnswer", r#"{"answer": "Hello there."}"#));

        let result = orchestrator(&llm, &gateway, 12)
            .run("Say hello", &sample_context(), &[])
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.final_answer, "Hello there.");
        assert!(llm.systems_for(routes::BI)[1].contains("Could not read the chosen action"));
    }

    #[tokio::test]
    async fn test_llm_outage_ends_turn_with_error() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        llm.push_failure(routes::BI, "connection reset by peer");

        let result = orchestrator(&llm, &gateway, 12)
            .run("How many users are there?", &sample_context(), &[])
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(llm.calls_for(routes::BI), 1);
        assert!(result.error_message.unwrap().contains("connection reset by peer"));
    }

    #[tokio::test]
    async fn test_history_reaches_router_but_not_sql_agent() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        llm.push(routes::BI, &bi_step("sql_agent", r#"{"question": "How many inactive users are there?"}"#));
        llm.push(routes::SQL_GENERATION, COUNT_USERS);
        llm.push(routes::BI, &bi_step("FinalAnswer", r#"{"answer": "There are 0 inactive users."}"#));
        let history = vec![("How many users?".to_string(), "SELECT COUNT(*) FROM users".to_string())];

        orchestrator(&llm, &gateway, 12)
            .run("And the inactive ones?", &sample_context(), &history)
            .await
            .unwrap();

        assert!(llm.systems_for(routes::BI)[0].contains("Human: How many users?"));
        let sql_prompt = &llm.systems_for(routes::SQL_GENERATION)[0];
        assert!(sql_prompt.contains("No previous conversation history."));
        let sql_call = llm
            .calls()
            .into_iter()
            .find(|c| c.route == Some(routes::SQL_GENERATION))
            .unwrap();
        assert_eq!(sql_call.user, "How many inactive users are there?");
    }

    #[test]
    fn test_scratchpad_lists_action_args() {
        let steps = vec![BiStep {
            reasoning: "need data".to_string(),
            action: Some(crate::models::agent_io::BiAction::SqlAgent {
                question: "How many users?".to_string(),
            }),
            observation: "The SQL agent requires clarification: Which users?".to_string(),
        }];
        assert_eq!(
            format_scratchpad(&steps),
            "Reasoning: need data\nAction: sql_agent\nArgs: {\"question\":\"How many users?\"}\nObservation: The SQL agent requires clarification: Which users?"
        );
        assert_eq!(format_scratchpad(&[]), "No steps taken yet.");
    }
}
