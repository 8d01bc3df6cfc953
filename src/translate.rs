use anyhow::{Context, Result};
use llm::{
    builder::{LLMBackend, LLMBuilder},
    chat::ChatMessage,
    LLMProvider,
};
use tokio::runtime::Handle;
use tracing::debug;

use crate::config::LlmProvider;
use crate::error::{DubError, DubResult};

/// Maps text between languages. Shared by every worker, so it must be `Sync`.
pub trait Translator: Send + Sync {
    fn translate(&self, text: &str, source: &str, target: &str) -> DubResult<String>;
}

/// Convert our LlmProvider enum to llm crate's LLMBackend
fn to_llm_backend(provider: LlmProvider) -> LLMBackend {
    match provider {
        LlmProvider::Openai => LLMBackend::OpenAI,
        LlmProvider::Anthropic => LLMBackend::Anthropic,
        LlmProvider::Google => LLMBackend::Google,
        LlmProvider::Ollama => LLMBackend::Ollama,
        LlmProvider::Deepseek => LLMBackend::DeepSeek,
    }
}

const SYSTEM_PROMPT: &str = "You translate lines of a video transcript for dubbing.\n\
     Rules:\n\
     - Keep the translation about as long as the original so it can be spoken in the same time\n\
     - Maintain the original meaning and tone\n\
     - Do not add explanations, quotes or notes\n\
     - Return only the translated text";

fn user_prompt(text: &str, source: &str, target: &str) -> String {
    format!(
        "Translate from language code `{}` to language code `{}`:\n{}",
        source, target, text
    )
}

/// Strip the wrapping some models add despite the prompt.
fn clean_response(response: &str) -> String {
    response
        .trim()
        .trim_matches(|c| c == '"' || c == '“' || c == '”')
        .trim()
        .to_string()
}

/// Translator backed by a chat LLM. The client is built once and reused for every request.
pub struct LlmTranslator {
    llm: Box<dyn LLMProvider>,
    runtime: Handle,
}

impl LlmTranslator {
    pub fn new(
        provider: LlmProvider,
        api_key: &str,
        model: &str,
        base_url: Option<&str>,
        runtime: Handle,
    ) -> Result<Self> {
        let mut builder = LLMBuilder::new()
            .backend(to_llm_backend(provider))
            .api_key(api_key)
            .model(model)
            .system(SYSTEM_PROMPT);

        // Set custom base URL if provided (for Azure OpenAI, etc.)
        if let Some(url) = base_url {
            builder = builder.base_url(url);
        }

        let llm = builder.build().context("Failed to build LLM client")?;
        Ok(Self { llm, runtime })
    }

    async fn translate_async(&self, text: &str, source: &str, target: &str) -> Result<String> {
        let messages = vec![ChatMessage::user()
            .content(user_prompt(text, source, target))
            .build()];

        let response = self
            .llm
            .chat(&messages)
            .await
            .context("Failed to call translation API")?;

        let translated = response
            .text()
            .context("Empty response from translation API")?;
        Ok(clean_response(&translated))
    }
}

impl Translator for LlmTranslator {
    /// Blocks the calling worker thread; must not be called from an async task.
    fn translate(&self, text: &str, source: &str, target: &str) -> DubResult<String> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        debug!("Translating {} chars {} -> {}", text.len(), source, target);
        self.runtime
            .block_on(self.translate_async(text, source, target))
            .map_err(|e| DubError::Translation(format!("{:#}", e)))
    }
}
