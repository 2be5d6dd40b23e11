//! Telegram channel adapter for the valet gateway.
//!
//! Long-polls the Bot API (no webhook required), enforces the sender
//! allowlist, downloads media to a scoped temp directory, keeps the typing
//! indicator alive per inbound message, and delivers outbound text as
//! entity-formatted messages split to Telegram's size limit.

pub mod api;
pub mod format;
pub mod polling;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use valet_bus::{BaseChannel, MessageBus};
use valet_types::{ChannelAdapter, ChannelStatus, OutboundMessage};

use api::TelegramApi;
use format::{render_markdown, split_rich, RichText};

pub const CHANNEL_NAME: &str = "telegram";

/// Maximum UTF-16 code units per message. The API limit is 4096; keep a
/// margin like the other channels do.
const MAX_MESSAGE_UNITS: usize = 4000;

pub struct TelegramChannel {
    base: Arc<BaseChannel>,
    api: Arc<TelegramApi>,
    media_dir: PathBuf,
    state: Mutex<TelegramState>,
}

struct TelegramState {
    status: ChannelStatus,
    cancel: Option<CancellationToken>,
    poll_handle: Option<JoinHandle<()>>,
}

impl TelegramChannel {
    pub fn new(token: &str, allow_from: &[String], bus: Arc<MessageBus>) -> anyhow::Result<Self> {
        if token.is_empty() {
            bail!("telegram token is required");
        }
        Ok(Self {
            base: Arc::new(BaseChannel::new(CHANNEL_NAME, bus, allow_from)),
            api: Arc::new(TelegramApi::new(token)),
            media_dir: std::env::temp_dir().join("valet-telegram-media"),
            state: Mutex::new(TelegramState {
                status: ChannelStatus::Stopped,
                cancel: None,
                poll_handle: None,
            }),
        })
    }

    async fn send_text(&self, chat_id: i64, content: &str) -> anyhow::Result<()> {
        let rich = render_markdown(content);
        for chunk in split_rich(&rich, MAX_MESSAGE_UNITS) {
            self.send_chunk(chat_id, &chunk).await?;
        }
        Ok(())
    }

    /// Entity-formatted send with a single plain-text fallback.
    async fn send_chunk(&self, chat_id: i64, chunk: &RichText) -> anyhow::Result<()> {
        let entities = (!chunk.entities.is_empty()).then(|| chunk.entities.clone());
        match self.api.send_message(chat_id, &chunk.text, entities).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("entity send failed, falling back to plain text: {e:#}");
                self.api
                    .send_message(chat_id, &chunk.text, None)
                    .await
                    .map(|_| ())
            }
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramChannel {
    fn name(&self) -> &str {
        self.base.name()
    }

    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.status == ChannelStatus::Running {
            bail!("telegram channel is already running");
        }
        state.status = ChannelStatus::Starting;

        match self.api.get_me().await {
            Ok(bot) => {
                info!(
                    bot = bot.username.as_deref().unwrap_or("unknown"),
                    "telegram bot authenticated"
                );
            }
            Err(e) => {
                state.status = ChannelStatus::Error(format!("auth failed: {e:#}"));
                return Err(e).context("telegram authentication failed");
            }
        }

        let local = cancel.child_token();
        let handle = tokio::spawn(polling::run_polling_loop(
            self.api.clone(),
            self.base.clone(),
            self.media_dir.clone(),
            local.clone(),
        ));

        state.cancel = Some(local);
        state.poll_handle = Some(handle);
        state.status = ChannelStatus::Running;
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.cancel.is_none() && state.poll_handle.is_none() {
            // Never started, or stopped already.
            state.status = ChannelStatus::Stopped;
            return Ok(());
        }
        state.status = ChannelStatus::Stopping;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = state.poll_handle.take() {
            let _ = handle.await;
        }
        state.status = ChannelStatus::Stopped;
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        let chat_id: i64 = message
            .chat_id
            .parse()
            .with_context(|| format!("invalid chat id {:?}", message.chat_id))?;

        // Attached media first.
        for path in &message.media {
            if is_image(path) {
                self.api.send_photo(chat_id, path).await?;
            } else {
                self.api.send_document(chat_id, path).await?;
            }
        }

        let mut content = message.content;

        // Screenshot paths embedded in the text become a photo send.
        if let Some(image_path) = extract_screenshot_path(&content) {
            if let Err(e) = self.api.send_photo(chat_id, Path::new(&image_path)).await {
                warn!("failed to send screenshot, keeping text only: {e:#}");
            }
            content = content.replace(&image_path, "");
        }

        if !content.trim().is_empty() {
            self.send_text(chat_id, &content).await?;
        }
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        match self.state.try_lock() {
            Ok(state) => state.status.clone(),
            Err(_) => ChannelStatus::Starting,
        }
    }
}

fn is_image(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("jpg") | Some("jpeg") | Some("png") | Some("gif") | Some("webp")
    )
}

/// Extract a screenshot file path (e.g. `/tmp/screenshot-1712.png`) from
/// message content.
fn extract_screenshot_path(content: &str) -> Option<String> {
    // Compiled per call; sends are rare enough that caching isn't worth it.
    let re = Regex::new(r"(/\S+/screenshot-[0-9]+\.png)").expect("valid pattern");
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> Arc<MessageBus> {
        Arc::new(MessageBus::new(4))
    }

    #[test]
    fn test_new_requires_token() {
        assert!(TelegramChannel::new("", &[], bus()).is_err());
        assert!(TelegramChannel::new("123:ABC", &[], bus()).is_ok());
    }

    #[test]
    fn test_name() {
        let ch = TelegramChannel::new("123:ABC", &[], bus()).unwrap();
        assert_eq!(ch.name(), "telegram");
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let ch = TelegramChannel::new("123:ABC", &[], bus()).unwrap();
        ch.stop().await.unwrap();
        ch.stop().await.unwrap();
        assert_eq!(ch.status(), ChannelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_send_rejects_bad_chat_id() {
        let ch = TelegramChannel::new("123:ABC", &[], bus()).unwrap();
        let err = ch
            .send(OutboundMessage::text("telegram", "not-a-number", "hi"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid chat id"));
    }

    #[test]
    fn test_extract_screenshot_path() {
        let content = "Here you go: /tmp/screenshot-1712345678.png done";
        assert_eq!(
            extract_screenshot_path(content).as_deref(),
            Some("/tmp/screenshot-1712345678.png")
        );
        assert!(extract_screenshot_path("no path here").is_none());
        assert!(extract_screenshot_path("/tmp/other-123.png").is_none());
    }

    #[test]
    fn test_is_image() {
        assert!(is_image(Path::new("/a/b.PNG")));
        assert!(is_image(Path::new("x.jpeg")));
        assert!(!is_image(Path::new("x.pdf")));
        assert!(!is_image(Path::new("noext")));
    }
}
