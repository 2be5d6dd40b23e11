//! Provider-backed runtime: a minimal client for the Anthropic-compatible
//! messages API with in-memory per-session history.
//!
//! This is the default runtime behind `valet gateway` and `valet agent` when
//! no richer runtime is injected. It performs no tool execution — one
//! request is one model turn.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{AgentRequest, AgentResponse, AgentRuntime};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug)]
pub struct ProviderRuntime {
    client: Client,
    messages_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    system_prompt: String,
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ImageSource {
    Base64 { media_type: String, data: String },
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl ProviderRuntime {
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<&str>,
        model: impl Into<String>,
        max_tokens: u32,
        system_prompt: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            bail!("provider API key not set; run `valet onboard` or set VALET_API_KEY / ANTHROPIC_API_KEY");
        }
        let base = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/');
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            messages_url: format!("{base}/v1/messages"),
            api_key,
            model: model.into(),
            max_tokens,
            system_prompt: system_prompt.into(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn user_message(request: &AgentRequest) -> anyhow::Result<ChatMessage> {
        let mut content = Vec::new();
        for attachment in &request.attachments {
            let bytes = std::fs::read(&attachment.path)
                .with_context(|| format!("read attachment {}", attachment.path.display()))?;
            content.push(ContentBlock::Image {
                source: ImageSource::Base64 {
                    media_type: attachment.mime_type.clone(),
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                },
            });
        }
        if !request.prompt.is_empty() || content.is_empty() {
            content.push(ContentBlock::Text {
                text: request.prompt.clone(),
            });
        }
        Ok(ChatMessage {
            role: "user",
            content,
        })
    }
}

#[async_trait::async_trait]
impl AgentRuntime for ProviderRuntime {
    async fn run(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
        let user = Self::user_message(&request)?;

        // Snapshot history + new message without holding the lock across the
        // network call; concurrent turns on the same session are resolved
        // last-writer-wins, which matches the per-chat serial inbound flow.
        let history = {
            let sessions = self.sessions.lock().await;
            let mut msgs = sessions.get(&request.session_id).cloned().unwrap_or_default();
            msgs.push(user.clone());
            msgs
        };

        let body = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &self.system_prompt,
            messages: &history,
        };

        let response = self
            .client
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("messages request failed")?;

        let status = response.status();
        let raw = response.text().await.context("messages response read failed")?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorEnvelope>(&raw)
                .map(|e| e.error.message)
                .unwrap_or(raw);
            bail!("provider error ({status}): {message}");
        }

        let parsed: ChatResponse =
            serde_json::from_str(&raw).context("messages response parse failed")?;
        let output: String = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        debug!(session = %request.session_id, chars = output.len(), "provider turn complete");

        {
            let mut sessions = self.sessions.lock().await;
            let msgs = sessions.entry(request.session_id.clone()).or_default();
            msgs.push(user);
            msgs.push(ChatMessage {
                role: "assistant",
                content: vec![ContentBlock::Text {
                    text: output.clone(),
                }],
            });
        }

        Ok(AgentResponse::from_output(output))
    }

    async fn clear_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }

    async fn close(&self) {
        self.sessions.lock().await.clear();
    }
}
