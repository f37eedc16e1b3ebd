//! Builds the enriched database context: schema DDL plus inline hints with
//! the values of low-cardinality columns, cached per schema and business
//! context.

mod augment;
mod nodes;

use std::sync::Arc;

use tracing::{info, warn};

pub use augment::{TOO_MANY_VALUES, VALUES_UNAVAILABLE, synthesize_augmented_schema};
pub use nodes::ContextState;
use nodes::{PlanInspectionNode, SampleValuesNode, SchemaRetrievalNode, SynthesizeSchemaNode};

use crate::build_flow;
use crate::config::ContextSettings;
use crate::context::Context;
use crate::error::Result;
use crate::flow::Flow;
use crate::models::public::EnrichedDatabaseContext;
use crate::utils::cache::CacheProvider;
use crate::utils::database::DatabaseGateway;
use crate::utils::llm_wrapper::LLMWrapper;

pub(crate) mod keys {
    pub const BUSINESS_CONTEXT: &str = "business_context";
    pub const RAW_SCHEMA: &str = "raw_schema";
    pub const SCHEMA_KEY: &str = "schema_key";
    pub const CACHE_KEY: &str = "cache_key";
    pub const COLUMNS_TO_INSPECT: &str = "columns_to_inspect";
    pub const FETCHED_VALUES: &str = "fetched_values";
    pub const ENRICHED_CONTEXT: &str = "enriched_context";
}

pub struct ContextBuilder {
    gateway: Arc<dyn DatabaseGateway>,
    flow: Option<Flow<ContextState>>,
}

impl ContextBuilder {
    /// Without an LLM the builder returns the raw schema unenriched.
    pub fn new(
        llm: Option<Arc<dyn LLMWrapper>>,
        gateway: Arc<dyn DatabaseGateway>,
        cache: Arc<dyn CacheProvider>,
        settings: ContextSettings,
    ) -> Self {
        let flow = llm.map(|llm| {
            build_flow!(
                start: ("retrieve_schema", SchemaRetrievalNode::new(gateway.clone(), cache.clone())),
                nodes: [
                    ("plan_inspection", PlanInspectionNode::new(llm, settings.max_inspected_columns)),
                    ("sample_values", SampleValuesNode::new(gateway.clone(), settings.cardinality_limit)),
                    ("synthesize", SynthesizeSchemaNode::new(cache, settings.max_values)),
                ],
                edges: [
                    ("retrieve_schema", "plan_inspection", ContextState::CacheMiss),
                    ("plan_inspection", "sample_values", ContextState::Planned),
                    ("sample_values", "synthesize", ContextState::Sampled),
                ]
            )
        });
        Self { gateway, flow }
    }

    pub async fn build(&self, business_context: Option<&str>) -> Result<EnrichedDatabaseContext> {
        let business_context = business_context
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);

        let Some(flow) = &self.flow else {
            warn!("No LLM configured; using the raw schema without value hints");
            let (raw_schema, schema_key) = self.gateway.schema_ddl_and_key().await?;
            return Ok(EnrichedDatabaseContext::unenriched(
                raw_schema,
                schema_key,
                business_context,
            ));
        };

        let mut context = Context::new();
        context.set_as(keys::BUSINESS_CONTEXT, &business_context)?;
        let context = flow.run(context).await?;

        let enriched: EnrichedDatabaseContext = context.require(keys::ENRICHED_CONTEXT)?;
        info!(
            "Context ready for schema {}",
            enriched.schema_key.get(..12).unwrap_or(&enriched.schema_key)
        );
        Ok(enriched)
    }
}
