//! System prompts shipped with the crate.

use crate::utils::prompt::PromptTemplate;

pub const SCHEMA_ANALYZER: PromptTemplate =
    PromptTemplate::new("schema_analyzer", include_str!("schema_analyzer.prompt"));

pub const SQL_GENERATION: PromptTemplate =
    PromptTemplate::new("sql_generation", include_str!("sql_generation.prompt"));

pub const SQL_REFLECTION: PromptTemplate =
    PromptTemplate::new("sql_reflection", include_str!("sql_reflection.prompt"));

pub const VISUALIZATION_REACT: PromptTemplate =
    PromptTemplate::new("vis_react", include_str!("vis_react.prompt"));

pub const BI_REACT: PromptTemplate = PromptTemplate::new("bi_react", include_str!("bi_react.prompt"));
