//! Single entry point that wires the gateway, the LLM providers and the
//! agents together.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::agents::{BiOrchestrator, ContextBuilder, SqlAgent, VisualizationAgent};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::models::public::{BiResult, EnrichedDatabaseContext};
use crate::utils::cache::{CacheProvider, FileSystemCacheProvider};
use crate::utils::chart::{VegaLiteProvider, VisualizationProvider};
use crate::utils::database::DatabaseGateway;
use crate::utils::llm_wrapper::LLMWrapper;

struct ProviderAgents {
    sql_agent: Arc<SqlAgent>,
    orchestrator: BiOrchestrator,
}

pub struct IntelliQuery {
    context_builder: ContextBuilder,
    providers: BTreeMap<String, ProviderAgents>,
    default_llm: String,
    context: Mutex<Option<EnrichedDatabaseContext>>,
}

impl IntelliQuery {
    pub fn builder(gateway: Arc<dyn DatabaseGateway>) -> IntelliQueryBuilder {
        IntelliQueryBuilder::new(gateway)
    }

    pub fn default_llm(&self) -> &str {
        &self.default_llm
    }

    pub fn llm_keys(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Answers one conversational turn. `llm_key` picks a registered
    /// provider, `None` uses the default one.
    pub async fn ask(
        &self,
        question: &str,
        history: &[(String, String)],
        business_context: Option<&str>,
        llm_key: Option<&str>,
    ) -> Result<BiResult> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::InvalidInput("question cannot be empty".to_string()));
        }
        let agents = self.agents(llm_key)?;
        let context = self.context(business_context).await?;
        agents.orchestrator.run(question, &context, history).await
    }

    /// Enriched context for `business_context`, rebuilt only when the
    /// business context changes.
    pub async fn context(&self, business_context: Option<&str>) -> Result<EnrichedDatabaseContext> {
        let business_context = business_context.map(str::trim).filter(|text| !text.is_empty());
        let mut current = self.context.lock().await;
        if let Some(context) = current.as_ref() {
            if context.business_context.as_deref() == business_context {
                return Ok(context.clone());
            }
            info!("Business context changed; rebuilding the database context");
        }
        let context = self.context_builder.build(business_context).await?;
        *current = Some(context.clone());
        Ok(context)
    }

    /// SQL agent of a provider, for plan-only or standalone use.
    pub fn sql_agent(&self, llm_key: Option<&str>) -> Result<Arc<SqlAgent>> {
        Ok(self.agents(llm_key)?.sql_agent.clone())
    }

    fn agents(&self, llm_key: Option<&str>) -> Result<&ProviderAgents> {
        let key = llm_key.unwrap_or(&self.default_llm);
        self.providers
            .get(key)
            .ok_or_else(|| Error::Config(format!("unknown LLM provider '{}'", key)))
    }
}

pub struct IntelliQueryBuilder {
    gateway: Arc<dyn DatabaseGateway>,
    settings: Settings,
    llms: BTreeMap<String, Arc<dyn LLMWrapper>>,
    registration_order: Vec<String>,
    cache: Option<Arc<dyn CacheProvider>>,
    visualization: Option<Arc<dyn VisualizationProvider>>,
}

impl IntelliQueryBuilder {
    pub fn new(gateway: Arc<dyn DatabaseGateway>) -> Self {
        Self {
            gateway,
            settings: Settings::default(),
            llms: BTreeMap::new(),
            registration_order: Vec::new(),
            cache: None,
            visualization: None,
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Registers a provider. Without a configured default, the first
    /// registered provider is the default one.
    pub fn llm(mut self, key: impl Into<String>, llm: Arc<dyn LLMWrapper>) -> Self {
        self.register(key.into(), llm);
        self
    }

    fn register(&mut self, key: String, llm: Arc<dyn LLMWrapper>) {
        if self.llms.insert(key.clone(), llm).is_none() {
            self.registration_order.push(key);
        }
    }

    /// Registers an OpenAI-compatible client for every provider in the
    /// settings, in key order.
    #[cfg(feature = "openai")]
    pub fn openai_providers(mut self) -> Result<Self> {
        use crate::utils::llm_wrapper::OpenAIClient;

        let providers = self.settings.llm_providers.clone();
        for (key, provider) in providers {
            let client = OpenAIClient::new(provider.api_key()?, provider.model.clone(), provider.endpoint.clone());
            self.register(key, Arc::new(client));
        }
        Ok(self)
    }

    pub fn cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn visualization_provider(mut self, provider: Arc<dyn VisualizationProvider>) -> Self {
        self.visualization = Some(provider);
        self
    }

    pub fn build(self) -> Result<IntelliQuery> {
        let default_llm = match &self.settings.default_provider {
            Some(key) => key.clone(),
            None => self
                .registration_order
                .first()
                .cloned()
                .ok_or_else(|| Error::Config("at least one LLM provider is required".to_string()))?,
        };
        if !self.llms.contains_key(&default_llm) {
            return Err(Error::Config(format!("default LLM provider '{}' is not registered", default_llm)));
        }
        let context_llm = self.settings.context_provider.as_deref().unwrap_or(&default_llm);
        let context_llm = self
            .llms
            .get(context_llm)
            .cloned()
            .ok_or_else(|| Error::Config(format!("context LLM provider '{}' is not registered", context_llm)))?;

        let cache: Arc<dyn CacheProvider> = match self.cache {
            Some(cache) => cache,
            None => Arc::new(FileSystemCacheProvider::new(self.settings.cache_dir.clone())?),
        };
        let visualization: Arc<dyn VisualizationProvider> = match self.visualization {
            Some(provider) => provider,
            None => Arc::new(VegaLiteProvider::new(self.settings.visualization.style.clone())),
        };

        let context_builder = ContextBuilder::new(
            Some(context_llm),
            self.gateway.clone(),
            cache,
            self.settings.context.clone(),
        );

        let providers = self
            .llms
            .into_iter()
            .map(|(key, llm)| {
                let sql_agent = Arc::new(SqlAgent::new(llm.clone(), self.gateway.clone(), self.settings.sql.clone()));
                let vis_agent = Arc::new(VisualizationAgent::new(
                    llm.clone(),
                    visualization.clone(),
                    self.settings.visualization.clone(),
                ));
                let orchestrator = BiOrchestrator::new(llm, sql_agent.clone(), vis_agent, self.settings.bi.clone());
                (key, ProviderAgents { sql_agent, orchestrator })
            })
            .collect::<BTreeMap<_, _>>();
        info!("Agents ready for {} LLM provider(s), default '{}'", providers.len(), default_llm);

        Ok(IntelliQuery {
            context_builder,
            providers,
            default_llm,
            context: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SqlWorkflowKind;
    use crate::models::public::ResultStatus;
    use crate::test_support::{FakeGateway, ScriptedLlm, count_table, routes};
    use crate::utils::cache::InMemoryCacheProvider;

    const PLAN: &str = r#"{"columns_to_inspect": [{"table": "users", "column": "status"}]}"#;
    const ANSWER: &str = r#"{"reasoning": "greeting", "action": {"action": "FinalAnswer", "args": {"answer": "Hello."}}}"#;

    fn facade(llm: &Arc<ScriptedLlm>, gateway: &Arc<FakeGateway>) -> IntelliQuery {
        let mut settings = Settings::default();
        settings.sql.workflow = SqlWorkflowKind::Simple;
        IntelliQuery::builder(gateway.clone())
            .settings(settings)
            .llm("main", llm.clone())
            .cache(Arc::new(InMemoryCacheProvider::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        let err = facade(&llm, &gateway).ask("   ", &[], None, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(llm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        let query = facade(&llm, &gateway);
        assert!(query.ask("Hi", &[], None, Some("other")).await.is_err());
        assert!(query.sql_agent(Some("other")).is_err());
        assert_eq!(query.llm_keys().collect::<Vec<_>>(), vec!["main"]);
    }

    #[tokio::test]
    async fn test_context_is_reused_until_business_context_changes() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        llm.push(routes::SCHEMA_ANALYZER, PLAN);
        llm.push(routes::SCHEMA_ANALYZER, PLAN);
        for _ in 0..3 {
            llm.push(routes::BI, ANSWER);
        }
        let query = facade(&llm, &gateway);

        query.ask("Hi", &[], None, None).await.unwrap();
        query.ask("Hi again", &[], Some("  "), None).await.unwrap();
        assert_eq!(llm.calls_for(routes::SCHEMA_ANALYZER), 1);

        let result = query
            .ask("Hi once more", &[], Some("Inactive users churned."), None)
            .await
            .unwrap();
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(llm.calls_for(routes::SCHEMA_ANALYZER), 2);
        let context = query.context(Some("Inactive users churned.")).await.unwrap();
        assert_eq!(context.business_context.as_deref(), Some("Inactive users churned."));
        assert!(context.augmented_schema.contains("'active', 'inactive'"));
    }

    #[tokio::test]
    async fn test_sql_agent_plans_without_executing() {
        let llm = Arc::new(ScriptedLlm::new());
        let gateway = Arc::new(FakeGateway::users());
        gateway.push_table(count_table(3));
        llm.push(routes::SCHEMA_ANALYZER, PLAN);
        llm.push(
            routes::SQL_GENERATION,
            r#"{"status": "success", "query": "SELECT COUNT(*) FROM users"}"#,
        );
        let query = facade(&llm, &gateway);

        let context = query.context(None).await.unwrap();
        let plan = query
            .sql_agent(None)
            .unwrap()
            .plan("How many users?", &context, &[])
            .await
            .unwrap();
        assert!(plan.is_validated);
        assert!(gateway.executed().is_empty());
        assert_eq!(gateway.validated(), vec!["SELECT COUNT(*) FROM users".to_string()]);
    }

    #[test]
    fn test_first_registered_provider_is_default() {
        let gateway = Arc::new(FakeGateway::users());
        let query = IntelliQuery::builder(gateway)
            .llm("zeta", Arc::new(ScriptedLlm::new()))
            .llm("alpha", Arc::new(ScriptedLlm::new()))
            .llm("zeta", Arc::new(ScriptedLlm::new()))
            .cache(Arc::new(InMemoryCacheProvider::new()))
            .build()
            .unwrap();
        assert_eq!(query.default_llm(), "zeta");
        assert_eq!(query.llm_keys().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_builder_requires_a_provider() {
        let gateway = Arc::new(FakeGateway::users());
        let err = IntelliQuery::builder(gateway)
            .cache(Arc::new(InMemoryCacheProvider::new()))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("at least one LLM provider"));
    }
}
