use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub usage: Option<LLMUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

#[async_trait]
pub trait LLMWrapper: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<LLMResponse> {
        self.generate_with_options("", prompt, LLMOptions::default()).await
    }

    /// Sends a system prompt (may be empty) and a user message.
    async fn generate_with_options(
        &self,
        system_prompt: &str,
        user_input: &str,
        options: LLMOptions,
    ) -> anyhow::Result<LLMResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct LLMOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Option<Vec<String>>,
    pub logit_bias: Option<HashMap<String, String>>,
}

impl LLMOptions {
    /// Low-temperature settings used for JSON-shaped answers.
    pub fn structured() -> Self {
        Self {
            temperature: Some(0.1),
            max_tokens: Some(2048),
            ..Self::default()
        }
    }
}

#[cfg(feature = "openai")]
pub use openai::OpenAIClient;

#[cfg(feature = "openai")]
mod openai {
    use super::*;
    use anyhow::anyhow;
    use openai_api_rust::chat::*;
    use openai_api_rust::*;
    use tracing::{debug, info};

    /// Client for any OpenAI-compatible chat completion endpoint.
    #[allow(dead_code)]
    pub struct OpenAIClient {
        api_key: String,
        model: String,
        endpoint: String,
        client: OpenAI,
    }

    impl OpenAIClient {
        pub fn new(api_key: String, model: String, endpoint: String) -> Self {
            let auth = Auth::new(&api_key);
            let client = OpenAI::new(auth, &endpoint);
            Self {
                api_key,
                model,
                endpoint,
                client,
            }
        }
    }

    #[async_trait]
    impl LLMWrapper for OpenAIClient {
        async fn generate_with_options(
            &self,
            system_prompt: &str,
            user_input: &str,
            options: LLMOptions,
        ) -> anyhow::Result<LLMResponse> {
            let mut messages = Vec::with_capacity(2);
            if !system_prompt.is_empty() {
                messages.push(Message {
                    role: Role::System,
                    content: system_prompt.to_string(),
                });
            }
            messages.push(Message {
                role: Role::User,
                content: user_input.to_string(),
            });

            let chat = ChatBody {
                model: self.model.clone(),
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                presence_penalty: options.presence_penalty,
                frequency_penalty: options.frequency_penalty,
                logit_bias: options.logit_bias,
                top_p: options.top_p,
                stream: Some(false),
                stop: options.stop,
                user: None,
                n: Some(1),
                messages,
            };

            info!("Sending request to OpenAI API (model {})", self.model);
            let response = self
                .client
                .chat_completion_create(&chat)
                .map_err(|e| anyhow!("OpenAI request failed: {:?}", e))?;
            let content = response
                .choices
                .first()
                .and_then(|choice| choice.message.as_ref())
                .map(|message| message.content.clone())
                .ok_or_else(|| anyhow!("OpenAI response contained no message"))?;
            debug!("OpenAI response: {}", content);

            let u = response.usage;
            let usage = LLMUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            };

            Ok(LLMResponse {
                content,
                usage: Some(usage),
            })
        }
    }
}
