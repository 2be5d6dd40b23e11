//! valet-agent: the narrow contract the gateway consumes the agent runtime
//! through, plus a thin provider-backed implementation.
//!
//! The gateway never looks inside the runtime — it runs requests, clears
//! sessions, and closes. Anything richer (tool execution, long-term memory,
//! subagents) is the runtime's business and surfaces only through the
//! response structure and hook events below.

pub mod provider;

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use valet_types::Attachment;

// ──────────────────── Requests & responses ────────────────────

/// A mid-request notification from the runtime.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// Tool progress. Forwarded to the chat only when tool logging is on.
    ProgressUpdate { tool: String, params: String },
    /// The session is approaching the model's context window. Always
    /// forwarded.
    ContextWindowWarn { message: String },
}

/// One agent invocation.
pub struct AgentRequest {
    pub prompt: String,
    pub session_id: String,
    pub attachments: Vec<Attachment>,
    /// Per-request realtime event sink. The runtime drops the sender when
    /// the request finishes; `None` disables realtime events entirely.
    pub events: Option<mpsc::Sender<RealtimeEvent>>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: session_id.into(),
            attachments: Vec::new(),
            events: None,
        }
    }
}

/// A hook event reported by the runtime after a request.
#[derive(Debug, Clone)]
pub enum HookEvent {
    /// A tool finished executing.
    PostToolUse {
        name: String,
        output: String,
        params: HashMap<String, Value>,
        error: Option<String>,
    },
    /// A tool produced a file meant for the user.
    FileAttachment { tool: String, path: std::path::PathBuf },
}

/// The runtime's answer to one request.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    /// Main agent output.
    pub output: String,
    /// Outputs of slash-command executions inside the runtime (e.g. /help).
    pub command_results: Vec<String>,
    /// Outputs of skill invocations.
    pub skill_results: Vec<String>,
    /// Output of a delegated subagent run, if any.
    pub subagent_output: Option<String>,
    pub hook_events: Vec<HookEvent>,
}

impl AgentResponse {
    pub fn from_output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }
}

// ──────────────────── Runtime contract ────────────────────

/// The agent runtime as the gateway sees it.
#[async_trait::async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Run one request to completion. May block for minutes; the caller is
    /// responsible for cancellation.
    async fn run(&self, request: AgentRequest) -> anyhow::Result<AgentResponse>;

    /// Forget the conversational history of one session.
    async fn clear_session(&self, session_id: &str) -> anyhow::Result<()>;

    /// Release resources. Called once at shutdown.
    async fn close(&self);
}
