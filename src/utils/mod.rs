pub mod cache;
pub mod chart;
pub mod data_analyzer;
pub mod database;
pub mod llm_wrapper;
pub mod prompt;
