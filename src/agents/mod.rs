pub mod bi_agent;
pub mod context_builder;
pub mod sql_agent;
pub mod vis_agent;

pub use bi_agent::BiOrchestrator;
pub use context_builder::ContextBuilder;
pub use sql_agent::SqlAgent;
pub use vis_agent::VisualizationAgent;
