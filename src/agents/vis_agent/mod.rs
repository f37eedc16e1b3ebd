//! ReAct loop that picks a chart for a query result and retries with the
//! rendering error as feedback.

mod nodes;

use std::sync::Arc;

use tracing::warn;

pub use nodes::{GENERIC_FAILURE, VisFlowState, VisStep, format_scratchpad};
use nodes::{RenderChartNode, ThinkNode};

use crate::build_flow;
use crate::config::VisualizationSettings;
use crate::context::Context;
use crate::error::Result;
use crate::flow::Flow;
use crate::models::public::{SqlResult, VisualizationResult};
use crate::utils::chart::{Chart, ChartRequest, VisualizationProvider};
use crate::utils::data_analyzer::summarize_table;
use crate::utils::llm_wrapper::LLMWrapper;

pub const EMPTY_TABLE: &str = "Cannot generate visualization from an empty or missing table.";

pub(crate) mod keys {
    pub const QUESTION: &str = "user_question";
    pub const SQL_QUERY: &str = "sql_query";
    pub const TABLE: &str = "table";
    pub const METADATA: &str = "metadata";
    pub const SCRATCHPAD: &str = "agent_scratchpad";
    pub const STEP: &str = "current_step";
    pub const CHART: &str = "final_visualization";
    pub const VIS_PARAMS: &str = "vis_params";
    pub const ERROR: &str = "error";
}

pub struct VisualizationAgent {
    flow: Flow<VisFlowState>,
}

impl VisualizationAgent {
    pub fn new(
        llm: Arc<dyn LLMWrapper>,
        provider: Arc<dyn VisualizationProvider>,
        settings: VisualizationSettings,
    ) -> Self {
        let max_steps = settings.max_steps.max(1);
        let flow = build_flow!(
            start: ("think", ThinkNode::new(llm, max_steps)),
            nodes: [("render_chart", RenderChartNode::new(provider, max_steps))],
            edges: [
                ("think", "render_chart", VisFlowState::Act),
                ("think", "think", VisFlowState::Think),
                ("render_chart", "think", VisFlowState::Think),
            ]
        )
        .with_max_steps(2 * max_steps + 1);
        Self { flow }
    }

    pub async fn run(&self, question: &str, sql_result: &SqlResult) -> Result<VisualizationResult> {
        let Some(table) = sql_result.result_table.as_ref().filter(|t| !t.is_empty()) else {
            warn!("{}", EMPTY_TABLE);
            return Ok(VisualizationResult::error(EMPTY_TABLE));
        };

        let mut state = Context::new();
        state.set_as(keys::QUESTION, &question)?;
        state.set_as(keys::SQL_QUERY, &sql_result.sql_query)?;
        state.set_as(keys::TABLE, table)?;
        state.set_as(keys::METADATA, &summarize_table(table).render())?;
        let state = self.flow.run(state).await?;

        match (
            state.get_as::<Chart>(keys::CHART)?,
            state.get_as::<ChartRequest>(keys::VIS_PARAMS)?,
        ) {
            (Some(chart), Some(params)) => Ok(VisualizationResult::success(chart, params)),
            _ => {
                let message = state
                    .get_as::<String>(keys::ERROR)?
                    .unwrap_or_else(|| GENERIC_FAILURE.to_string());
                Ok(VisualizationResult::error(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::public::VisualizationStatus;
    use crate::models::table::ResultTable;
    use crate::test_support::{ScriptedLlm, monthly_revenue, routes};
    use crate::utils::chart::{ChartType, VegaLiteProvider, regenerate_chart};

    const LINE: &str = r#"{"reasoning": "Revenue over time", "visualization_toolset": {"line_chart": {"x": "month", "y": "revenue"}}}"#;

    fn agent(llm: &Arc<ScriptedLlm>) -> VisualizationAgent {
        VisualizationAgent::new(
            llm.clone(),
            Arc::new(VegaLiteProvider::default()),
            VisualizationSettings::default(),
        )
    }

    fn revenue_result() -> SqlResult {
        SqlResult::success(
            monthly_revenue(),
            "SELECT month, SUM(amount) AS revenue FROM orders GROUP BY 1".to_string(),
            None,
            1,
        )
    }

    #[tokio::test]
    async fn test_empty_table_is_refused_without_llm() {
        let llm = Arc::new(ScriptedLlm::new());
        let empty = SqlResult::success(ResultTable::default(), "SELECT 1 WHERE false".to_string(), None, 1);

        let result = agent(&llm).run("plot it", &empty).await.unwrap();
        assert_eq!(result.status, VisualizationStatus::Error);
        assert_eq!(result.error_message.as_deref(), Some(EMPTY_TABLE));

        let missing = SqlResult::error("boom".to_string(), None, 1);
        let result = agent(&llm).run("plot it", &missing).await.unwrap();
        assert_eq!(result.status, VisualizationStatus::Error);
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_time_series_becomes_line_chart_and_regenerates() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(routes::VISUALIZATION, LINE);

        let result = agent(&llm).run("Show revenue by month", &revenue_result()).await.unwrap();
        assert_eq!(result.status, VisualizationStatus::Success);
        let params = result.vis_params.clone().unwrap();
        assert_eq!(params.chart_type, ChartType::LineChart);

        let prompt = &llm.systems_for(routes::VISUALIZATION)[0];
        assert!(prompt.contains("- month (temporal)"));
        assert!(prompt.contains("- revenue (numerical)"));
        assert!(prompt.contains("No previous attempts."));

        let calls_before = llm.calls().len();
        let redrawn = regenerate_chart(&VegaLiteProvider::default(), &params, &monthly_revenue()).unwrap();
        assert_eq!(Some(redrawn), result.chart);
        assert_eq!(llm.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_failed_render_is_fed_back() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(
            routes::VISUALIZATION,
            r#"{"reasoning": "Waterfall", "visualization_toolset": {"waterfall_chart": {"x": "month"}}}"#,
        );
        llm.push(routes::VISUALIZATION, LINE);

        let result = agent(&llm).run("Show revenue by month", &revenue_result()).await.unwrap();
        assert_eq!(result.status, VisualizationStatus::Success);

        let second = &llm.systems_for(routes::VISUALIZATION)[1];
        assert!(second.contains("Observation: Error executing waterfall_chart: Unsupported chart type: waterfall_chart"));
    }

    #[tokio::test]
    async fn test_gives_up_after_step_cap() {
        let llm = Arc::new(ScriptedLlm::new());
        for _ in 0..5 {
            llm.push(
                routes::VISUALIZATION,
                r#"{"reasoning": "Bars", "visualization_toolset": {"bar_chart": {"x": "country", "y": "revenue"}}}"#,
            );
        }

        let result = agent(&llm).run("Compare revenue", &revenue_result()).await.unwrap();
        assert_eq!(result.status, VisualizationStatus::Error);
        assert_eq!(llm.calls_for(routes::VISUALIZATION), 3);
        assert!(result.error_message.unwrap().contains("Column 'country' not found"));
        assert!(result.chart.is_none());
    }

    #[tokio::test]
    async fn test_unusable_llm_output_counts_as_a_step() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push(routes::VISUALIZATION, "A line chart would be nice.");
        llm.push(routes::VISUALIZATION, LINE);

        let result = agent(&llm).run("Show revenue by month", &revenue_result()).await.unwrap();
        assert_eq!(result.status, VisualizationStatus::Success);
        assert_eq!(llm.calls_for(routes::VISUALIZATION), 2);
    }

    #[test]
    fn test_scratchpad_format() {
        let steps = vec![VisStep {
            reasoning: "Trend".to_string(),
            toolset: serde_json::from_str(r#"{"line_chart": {"x": "month"}}"#).unwrap(),
            observation: "Successfully generated 'line_chart'.".to_string(),
        }];
        assert_eq!(
            format_scratchpad(&steps),
            "Reasoning: Trend\nVisualization Toolset: {\"line_chart\":{\"x\":\"month\"}}\nObservation: Successfully generated 'line_chart'."
        );
    }
}
