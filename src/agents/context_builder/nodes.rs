use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::augment::synthesize_augmented_schema;
use super::keys;
use crate::context::Context;
use crate::error::rethrow;
use crate::models::agent_io::{ColumnRef, InspectionPlan};
use crate::models::public::EnrichedDatabaseContext;
use crate::node::{Node, ProcessResult, ProcessState};
use crate::prompts::SCHEMA_ANALYZER;
use crate::utils::cache::{CacheProvider, sha256_hex};
use crate::utils::database::{DatabaseGateway, DistinctValues};
use crate::utils::llm_wrapper::LLMWrapper;
use crate::utils::prompt::{PromptVariables, generate_structured};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ContextState {
    CacheHit,
    CacheMiss,
    Planned,
    Sampled,
    #[default]
    Default,
}

impl ProcessState for ContextState {
    fn is_default(&self) -> bool {
        matches!(self, ContextState::Default)
    }

    fn to_condition(&self) -> String {
        match self {
            ContextState::CacheHit => "cache_hit".to_string(),
            ContextState::CacheMiss => "cache_miss".to_string(),
            ContextState::Planned => "planned".to_string(),
            ContextState::Sampled => "sampled".to_string(),
            ContextState::Default => "default".to_string(),
        }
    }
}

pub(crate) fn composite_key(schema_key: &str, business_context: Option<&str>) -> String {
    format!("{}-{}", schema_key, sha256_hex(business_context.unwrap_or("")))
}

/// Reads the DDL and looks the composite key up in the cache.
pub struct SchemaRetrievalNode {
    gateway: Arc<dyn DatabaseGateway>,
    cache: Arc<dyn CacheProvider>,
}

impl SchemaRetrievalNode {
    pub fn new(gateway: Arc<dyn DatabaseGateway>, cache: Arc<dyn CacheProvider>) -> Self {
        Self { gateway, cache }
    }
}

#[async_trait]
impl Node for SchemaRetrievalNode {
    type State = ContextState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let business_context: Option<String> = context.get_as(keys::BUSINESS_CONTEXT)?;
        let (raw_schema, schema_key) = self.gateway.schema_ddl_and_key().await?;
        let cache_key = composite_key(&schema_key, business_context.as_deref());
        let cached = self.cache.get(&cache_key);
        Ok(json!({
            "raw_schema": raw_schema,
            "schema_key": schema_key,
            "cache_key": cache_key,
            "cached": cached,
        }))
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<ContextState>> {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                error!("Schema retrieval failed: {}", e);
                return Err(rethrow(e));
            }
        };

        let cache_key = value["cache_key"].as_str().unwrap_or_default();
        context.set(keys::RAW_SCHEMA, value["raw_schema"].clone());
        context.set(keys::SCHEMA_KEY, value["schema_key"].clone());
        context.set(keys::CACHE_KEY, value["cache_key"].clone());

        if let Some(cached) = value["cached"].as_str() {
            match serde_json::from_str::<EnrichedDatabaseContext>(cached) {
                Ok(enriched) => {
                    info!("CACHE HIT for context key {}...", preview_key(cache_key));
                    context.set_as(keys::ENRICHED_CONTEXT, &enriched)?;
                    return Ok(ProcessResult::from_state(ContextState::CacheHit));
                }
                Err(e) => warn!("Ignoring unreadable cached context: {}", e),
            }
        }

        info!("CACHE MISS for context key {}... Building new context", preview_key(cache_key));
        Ok(ProcessResult::from_state(ContextState::CacheMiss))
    }
}

fn preview_key(key: &str) -> &str {
    key.get(..10).unwrap_or(key)
}

/// Asks the LLM which columns are worth sampling. Failure degrades to an
/// empty plan.
pub struct PlanInspectionNode {
    llm: Arc<dyn LLMWrapper>,
    max_columns: usize,
}

impl PlanInspectionNode {
    pub fn new(llm: Arc<dyn LLMWrapper>, max_columns: usize) -> Self {
        Self { llm, max_columns }
    }
}

#[async_trait]
impl Node for PlanInspectionNode {
    type State = ContextState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let raw_schema: String = context.require(keys::RAW_SCHEMA)?;
        let variables = PromptVariables::new()
            .with("schema_ddl", raw_schema.as_str())
            .with("max_columns", self.max_columns.to_string());
        let plan: InspectionPlan = generate_structured(
            self.llm.as_ref(),
            &SCHEMA_ANALYZER,
            &format!("Analyze this schema: {}", raw_schema),
            &variables,
        )
        .await?;
        Ok(serde_json::to_value(plan)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<ContextState>> {
        let proposed = match result {
            Ok(value) => serde_json::from_value::<InspectionPlan>(value.clone())
                .map(|plan| plan.columns_to_inspect)
                .unwrap_or_default(),
            Err(e) => {
                error!("Failed to generate a valid inspection plan: {}", e);
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        let columns: Vec<ColumnRef> = proposed
            .into_iter()
            .filter(|c| !c.table.trim().is_empty() && !c.column.trim().is_empty())
            .filter(|c| seen.insert(c.key()))
            .take(self.max_columns)
            .collect();
        info!("Inspection plan covers {} columns", columns.len());

        context.set_as(keys::COLUMNS_TO_INSPECT, &columns)?;
        Ok(ProcessResult::from_state(ContextState::Planned))
    }
}

pub struct SampleValuesNode {
    gateway: Arc<dyn DatabaseGateway>,
    cardinality_limit: usize,
}

impl SampleValuesNode {
    pub fn new(gateway: Arc<dyn DatabaseGateway>, cardinality_limit: usize) -> Self {
        Self {
            gateway,
            cardinality_limit,
        }
    }
}

#[async_trait]
impl Node for SampleValuesNode {
    type State = ContextState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let columns: Vec<ColumnRef> = context.get_as(keys::COLUMNS_TO_INSPECT)?.unwrap_or_default();
        if columns.is_empty() {
            return Ok(serde_json::to_value(DistinctValues::new())?);
        }
        let fetched = self
            .gateway
            .sample_distinct_values(&columns, self.cardinality_limit)
            .await?;
        Ok(serde_json::to_value(fetched)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<ContextState>> {
        match result {
            Ok(value) => {
                context.set(keys::FETCHED_VALUES, value.clone());
                Ok(ProcessResult::from_state(ContextState::Sampled))
            }
            Err(e) => {
                error!("Distinct value sampling failed: {}", e);
                Err(rethrow(e))
            }
        }
    }
}

/// Writes the augmented schema and stores the finished context in the cache.
pub struct SynthesizeSchemaNode {
    cache: Arc<dyn CacheProvider>,
    max_values: usize,
}

impl SynthesizeSchemaNode {
    pub fn new(cache: Arc<dyn CacheProvider>, max_values: usize) -> Self {
        Self { cache, max_values }
    }
}

#[async_trait]
impl Node for SynthesizeSchemaNode {
    type State = ContextState;

    async fn execute(&self, context: &Context) -> Result<Value> {
        let raw_schema: String = context.require(keys::RAW_SCHEMA)?;
        let fetched: DistinctValues = context.get_as(keys::FETCHED_VALUES)?.unwrap_or_default();
        let augmented_schema = synthesize_augmented_schema(&raw_schema, &fetched, self.max_values);

        let enriched = EnrichedDatabaseContext {
            raw_schema,
            augmented_schema,
            schema_key: context.require(keys::SCHEMA_KEY)?,
            business_context: context.get_as(keys::BUSINESS_CONTEXT)?,
        };
        Ok(serde_json::to_value(enriched)?)
    }

    async fn post_process(
        &self,
        context: &mut Context,
        result: &Result<Value>,
    ) -> Result<ProcessResult<ContextState>> {
        let value = result.as_ref().map_err(rethrow)?;
        let cache_key: String = context.require(keys::CACHE_KEY)?;
        self.cache.set(&cache_key, &value.to_string());
        info!("Saved new context to cache for key {}...", preview_key(&cache_key));

        context.set(keys::ENRICHED_CONTEXT, value.clone());
        Ok(ProcessResult::default())
    }
}
