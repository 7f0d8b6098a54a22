//! Chat-completion extensions.
//!
//! [`ChatModel`] is the narrow seam to the language model: role-tagged
//! messages in, one completion out. [`OpenAiChat`] speaks the OpenAI chat
//! completions format over the shared [`Fetcher`]. [`ChatExtension`] is a
//! form-based chat page with a bounded history.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use html_escape::encode_text;
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::pages::{page, select};
use super::{Extension, ExtensionServices, RewriteContext};
use crate::config::{ChatConfig, LlmConfig};
use crate::content::GatewayResponse;
use crate::error::{GatewayError, Result};
use crate::http_client::{Fetcher, UpstreamRequest};

/// Messages kept per conversation.
pub const CHAT_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A conversational language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Complete `messages`. `model` overrides the configured default.
    async fn complete(&self, model: Option<&str>, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiChat {
    fetcher: Arc<dyn Fetcher>,
    config: LlmConfig,
}

impl OpenAiChat {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: LlmConfig) -> Self {
        Self { fetcher, config }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[async_trait]
impl ChatModel for OpenAiChat {
    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    async fn complete(&self, model: Option<&str>, messages: &[ChatMessage]) -> Result<String> {
        let api_key = self
            .config
            .api_key()
            .ok_or_else(|| GatewayError::Llm(format!("{} is not set", self.config.api_key_env)))?;
        let model = model.unwrap_or(&self.config.model);
        let body = serde_json::json!({ "model": model, "messages": messages });

        let request = UpstreamRequest::post_json(&self.config.endpoint, &body)
            .header("authorization", &format!("Bearer {api_key}"));
        let response = self.fetcher.fetch(request).await?;
        if !response.status.is_success() {
            return Err(GatewayError::Llm(format!(
                "{} returned {}: {}",
                self.config.endpoint,
                response.status,
                response.text()
            )));
        }
        let parsed: CompletionResponse =
            serde_json::from_slice(&response.body).map_err(|e| GatewayError::Llm(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GatewayError::Llm("empty completion".to_string()))
    }
}

/// Instructions that keep replies renderable by a vintage browser.
const CHAT_SYSTEM_PROMPTS: &[&str] = &[
    "Please provide your response in plain text using only ASCII characters. \
     Never use any special or esoteric characters that might not be supported by older systems.",
    "Your responses will be presented to the user within the body of an html document. \
     Any html tags you respond with will be rendered as html, so when discussing an html tag, \
     wrap its name in <b> tags instead of angle brackets, for example \"the <b>a</b> tag\". \
     You do not need to provide a <body> tag. Format lists with <ol> or <ul> and <li> items. \
     Use the <a> tag for links.",
    "When responding with code or other formatted text, use <pre></pre> tags with <code></code> \
     tags nested inside. Never use markdown code fences. Keep lines under 60 characters.",
    "Never use markdown emphasis. Use <b> or <i> tags instead.",
];

#[derive(Default)]
struct Conversation {
    model: Option<String>,
    messages: VecDeque<ChatMessage>,
}

impl Conversation {
    fn push(&mut self, message: ChatMessage) {
        self.messages.push_back(message);
        while self.messages.len() > CHAT_HISTORY {
            self.messages.pop_front();
        }
    }
}

/// Chat page for the configured domains.
pub struct ChatExtension {
    model: Arc<dyn ChatModel>,
    domains: Vec<String>,
    title: String,
    models: Vec<(String, String)>,
    conversation: Mutex<Conversation>,
}

impl ChatExtension {
    pub fn new(model: Arc<dyn ChatModel>, config: &ChatConfig) -> Self {
        Self {
            model,
            domains: config.domains.clone(),
            title: config.title.clone(),
            models: config.models.iter().map(|m| (m.id.clone(), m.label.clone())).collect(),
            conversation: Mutex::new(Conversation::default()),
        }
    }

    fn default_model(&self) -> String {
        self.models.first().map(|(id, _)| id.clone()).unwrap_or_default()
    }

    async fn converse(&self, command: String, selected: String) -> Result<()> {
        let mut conversation = self.conversation.lock().await;
        if conversation.model.as_deref() != Some(selected.as_str()) {
            if conversation.model.is_some() {
                debug!(model = %selected, "Model changed, history reset");
            }
            conversation.messages.clear();
            conversation.model = Some(selected.clone());
        }
        conversation.push(ChatMessage::user(command));

        let mut messages: Vec<ChatMessage> = CHAT_SYSTEM_PROMPTS.iter().map(|p| ChatMessage::system(*p)).collect();
        messages.extend(conversation.messages.iter().cloned());
        let reply = self.model.complete(Some(&selected), &messages).await?;
        conversation.push(ChatMessage::assistant(reply));
        Ok(())
    }

    async fn render(&self) -> GatewayResponse {
        let conversation = self.conversation.lock().await;
        let selected = conversation.model.clone().unwrap_or_else(|| self.default_model());

        let mut transcript = String::new();
        for message in conversation.messages.iter().rev() {
            match message.role {
                Role::User => {
                    transcript.push_str(&format!("<b>User:</b> {}<br>", encode_text(&message.content)));
                }
                // Replies are markup by instruction.
                Role::Assistant => {
                    transcript.push_str(&format!("<b>{}:</b> {}<br>", encode_text(&self.title), message.content));
                }
                Role::System => {}
            }
        }

        let body = format!(
            "<form method=\"post\" action=\"/\">\n{}\n<input type=\"text\" size=\"63\" name=\"command\" required autocomplete=\"off\">\n<input type=\"submit\" value=\"Submit\">\n</form>\n<div id=\"chat\">\n<p>{transcript}</p>\n</div>",
            select("model", &self.models, &selected),
        );
        GatewayResponse::html(StatusCode::OK, page(&self.title, &body))
    }
}

#[async_trait]
impl Extension for ChatExtension {
    fn name(&self) -> &str {
        "chat"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn handle(&self, ctx: &RewriteContext, _services: &ExtensionServices) -> Result<GatewayResponse> {
        match ctx.method {
            Method::GET => {}
            Method::POST => {
                let command = ctx
                    .form_value("command")
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| GatewayError::BadRequest("missing command".to_string()))?;
                let selected = ctx.form_value("model").unwrap_or_else(|| self.default_model());
                self.converse(command, selected).await?;
            }
            _ => return Err(GatewayError::MethodNotAllowed(ctx.method.clone())),
        }
        Ok(self.render().await)
    }
}
