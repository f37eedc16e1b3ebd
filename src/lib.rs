pub mod agents;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod flow;
pub mod models;
pub mod node;
pub mod prompts;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use agents::{BiOrchestrator, ContextBuilder, SqlAgent, VisualizationAgent};
pub use config::Settings;
pub use context::Context;
pub use error::{Error, Result};
pub use facade::{IntelliQuery, IntelliQueryBuilder};
pub use flow::*;
pub use models::*;
pub use node::*;
