use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ──────────────────── Ack handle ────────────────────

/// Close-once token that stops a chat's liveness ("typing") indicator.
///
/// The channel adapter that created the typing refresher hands the handle to
/// the gateway inside the `InboundMessage`; whoever consumes the message owns
/// the close. `close` takes `self`, so a second close is unrepresentable, and
/// `Drop` cancels the token as well so the refresher cannot outlive an agent
/// task that panicked or errored out.
#[derive(Debug)]
pub struct AckHandle {
    token: CancellationToken,
}

impl AckHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stop the typing refresher. Consumes the handle.
    pub fn close(self) {
        self.token.cancel();
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ──────────────────── Messages ────────────────────

/// One user utterance received from a channel.
///
/// Created by a channel adapter and consumed exactly once by the gateway —
/// intentionally not `Clone`, because the ack handle inside must have a
/// single owner.
#[derive(Debug)]
pub struct InboundMessage {
    /// Channel identifier (e.g. "telegram").
    pub channel: String,
    /// Opaque sender identifier on the external platform.
    pub sender_id: String,
    /// Opaque chat identifier on the external platform.
    pub chat_id: String,
    /// Message text. May be empty for media-only messages.
    pub content: String,
    /// Local file paths of downloaded media, in message order.
    pub media: Vec<PathBuf>,
    pub timestamp: DateTime<Utc>,
    /// Platform-specific extras (username, message id, …).
    pub metadata: HashMap<String, serde_json::Value>,
    /// Typing-indicator token; closed exactly once by the consumer.
    pub ack: Option<AckHandle>,
}

impl InboundMessage {
    /// The agent runtime's unit of conversational memory.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// Message from the gateway to a channel adapter.
///
/// Consumed by whichever subscriber is registered on `channel`; dropped with
/// a log line if nobody is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    /// Response text. May be empty for media-only sends.
    #[serde(default)]
    pub content: String,
    /// Local file paths to deliver alongside (or instead of) the text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<PathBuf>,
}

impl OutboundMessage {
    pub fn text(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
        }
    }
}

// ──────────────────── Channel adapter ────────────────────

/// Status of a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Adapter constructed but not started, or stopped again.
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

/// Summary information about a registered channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    pub status: ChannelStatus,
}

/// Trait for channel adapters bridging an external chat platform to the bus.
///
/// Adapters receive the bus at construction time and push `InboundMessage`s
/// onto it from their own polling loop. Use `&self` for all methods —
/// implementations keep mutable state behind a `Mutex`.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel identifier, used as the bus subscription key (e.g. "telegram").
    fn name(&self) -> &str;

    /// Connect to the external platform and spawn the listener. The listener
    /// must exit when `cancel` fires.
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Disconnect from the external platform. Idempotent; a no-op before
    /// `start`.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Deliver a message to the external platform.
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()>;

    fn status(&self) -> ChannelStatus;
}

// ──────────────────── Attachments ────────────────────

/// A media file handed to the agent runtime alongside a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub path: PathBuf,
    pub mime_type: String,
}

impl Attachment {
    /// Build an attachment, detecting the MIME type from the file extension.
    pub fn from_path(path: PathBuf) -> Self {
        let mime_type = mime_from_extension(&path).to_string();
        Self { path, mime_type }
    }
}

/// Map a file extension to an image MIME type. Unknown extensions fall back
/// to JPEG, matching what the channels actually deliver.
pub fn mime_from_extension(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/jpeg",
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Stopped => write!(f, "stopped"),
            ChannelStatus::Starting => write!(f, "starting"),
            ChannelStatus::Running => write!(f, "running"),
            ChannelStatus::Stopping => write!(f, "stopping"),
            ChannelStatus::Error(e) => write!(f, "error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(channel: &str, chat_id: &str) -> InboundMessage {
        InboundMessage {
            channel: channel.into(),
            sender_id: "u1".into(),
            chat_id: chat_id.into(),
            content: "hello".into(),
            media: vec![],
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            ack: None,
        }
    }

    #[test]
    fn test_session_key() {
        let msg = inbound("telegram", "42");
        assert_eq!(msg.session_key(), "telegram:42");
    }

    #[test]
    fn test_ack_handle_close_cancels_token() {
        let token = CancellationToken::new();
        let handle = AckHandle::new(token.clone());
        assert!(!token.is_cancelled());
        handle.close();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_ack_handle_drop_cancels_token() {
        let token = CancellationToken::new();
        {
            let _handle = AckHandle::new(token.clone());
        }
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_outbound_message_serde() {
        let msg = OutboundMessage::text("telegram", "7", "ping");
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: OutboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.channel, "telegram");
        assert_eq!(parsed.chat_id, "7");
        assert_eq!(parsed.content, "ping");
        assert!(parsed.media.is_empty());
    }

    #[test]
    fn test_outbound_message_media_compat() {
        // No "media" field defaults to an empty vec.
        let json = r#"{"channel":"telegram","chat_id":"1","content":"x"}"#;
        let parsed: OutboundMessage = serde_json::from_str(json).unwrap();
        assert!(parsed.media.is_empty());
    }

    #[test]
    fn test_mime_from_extension() {
        use std::path::Path;
        assert_eq!(mime_from_extension(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_from_extension(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_from_extension(Path::new("a.webp")), "image/webp");
        assert_eq!(mime_from_extension(Path::new("a.bin")), "image/jpeg");
        assert_eq!(mime_from_extension(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn test_channel_status_serde() {
        let status = ChannelStatus::Running;
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"running\"");

        let err = ChannelStatus::Error("connection lost".into());
        let json = serde_json::to_string(&err).unwrap();
        let parsed: ChannelStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ChannelStatus::Error("connection lost".into()));
    }
}
