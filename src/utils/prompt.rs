//! Prompt templates and typed (JSON) LLM calls.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::utils::llm_wrapper::{LLMOptions, LLMWrapper};

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("placeholder regex"))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptVariables(BTreeMap<String, String>);

impl PromptVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// A system prompt with `{variable}` placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    name: &'static str,
    template: &'static str,
}

impl PromptTemplate {
    pub const fn new(name: &'static str, template: &'static str) -> Self {
        Self { name, template }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Substitutes every placeholder in a single pass. Placeholders without
    /// a binding are an error; values are never re-scanned.
    pub fn render(&self, variables: &PromptVariables) -> Result<String> {
        let mut missing = Vec::new();
        let rendered = placeholder_regex().replace_all(self.template, |caps: &regex::Captures| {
            let key = &caps[1];
            match variables.get(key) {
                Some(value) => value.to_string(),
                None => {
                    missing.push(key.to_string());
                    String::new()
                }
            }
        });
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "prompt '{}' is missing variables: {}",
                self.name,
                missing.join(", ")
            )));
        }
        Ok(rendered.into_owned())
    }
}

/// A type the LLM is asked to produce as JSON.
pub trait StructuredOutput: DeserializeOwned {
    /// Human-readable JSON shape appended to the system prompt.
    fn shape() -> &'static str;
}

/// Renders `system_prompt`, asks the LLM for a `T`-shaped JSON object and
/// parses the answer.
///
/// Transport failures map to [`Error::Llm`]; unparseable answers map to
/// [`Error::MalformedOutput`].
pub async fn generate_structured<T: StructuredOutput>(
    llm: &dyn LLMWrapper,
    system_prompt: &PromptTemplate,
    user_input: &str,
    variables: &PromptVariables,
) -> Result<T> {
    let mut system = system_prompt.render(variables)?;
    system.push_str(
        "\n\nRespond with a single JSON object and nothing else. The object must have this shape:\n",
    );
    system.push_str(T::shape());

    debug!("Structured call with prompt '{}'", system_prompt.name());
    let response = llm
        .generate_with_options(&system, user_input, LLMOptions::structured())
        .await
        .map_err(|e| Error::Llm(e.to_string()))?;

    parse_structured(&response.content).inspect_err(|e| {
        warn!("Prompt '{}' produced unusable output: {}", system_prompt.name(), e);
    })
}

pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let json = extract_json_object(raw).ok_or_else(|| {
        Error::MalformedOutput(format!("no JSON object in response: {}", preview(raw)))
    })?;
    serde_json::from_str(json)
        .map_err(|e| Error::MalformedOutput(format!("{} in {}", e, preview(json))))
}

/// Returns the outermost `{...}` span of an answer, ignoring Markdown fences
/// and surrounding prose.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 200;
    match text.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
