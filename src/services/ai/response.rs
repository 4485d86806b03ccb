use std::sync::Arc;

use async_trait::async_trait;

use crate::models::ResponseContext;
use crate::services::ai::retry::RetryPolicy;
use crate::services::ai::{ChatOptions, LlmProvider, Message};

/// Spoken when the synthesizer cannot produce anything better.
pub const FALLBACK_REPLY: &str = "I encountered an error. Could you please repeat that?";

const OPTIONS: ChatOptions = ChatOptions {
    temperature: 0.7,
    max_tokens: 200,
};

const SYSTEM_PROMPT: &str = "You are a professional clinic scheduling assistant helping a receptionist.
Write natural, concise, professional replies. Be helpful and clear.
Write dates like \"November 1\", never \"2025-11-01\".
Write times like \"2:00 PM\", never \"14:00\".
When alternative slots are listed, offer them. When information is missing, ask only for what is missing.";

#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub text: String,
    /// Set when `text` is the fallback because the model call failed.
    pub error: Option<String>,
}

impl Synthesis {
    pub fn fallback(error: impl Into<String>) -> Self {
        Self {
            text: FALLBACK_REPLY.to_string(),
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait ResponseSynthesizer: Send + Sync {
    async fn synthesize(&self, context: &ResponseContext) -> Synthesis;
}

pub struct LlmResponseSynthesizer {
    llm: Arc<dyn LlmProvider>,
    retry: RetryPolicy,
}

impl LlmResponseSynthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>, retry: RetryPolicy) -> Self {
        Self { llm, retry }
    }
}

#[async_trait]
impl ResponseSynthesizer for LlmResponseSynthesizer {
    async fn synthesize(&self, context: &ResponseContext) -> Synthesis {
        let messages = [Message::user(format!(
            "Context: {}\nGenerate appropriate response:",
            context.to_json()
        ))];

        let result = self
            .retry
            .run("response synthesis", || {
                self.llm.chat(SYSTEM_PROMPT, &messages, OPTIONS)
            })
            .await;

        match result {
            Ok(text) if !text.trim().is_empty() => Synthesis {
                text: text.trim().to_string(),
                error: None,
            },
            Ok(_) => {
                tracing::warn!("synthesizer returned an empty reply");
                Synthesis::fallback("empty reply from language model")
            }
            Err(e) => {
                tracing::error!(error = %e, "response synthesis failed");
                Synthesis::fallback(e.to_string())
            }
        }
    }
}
