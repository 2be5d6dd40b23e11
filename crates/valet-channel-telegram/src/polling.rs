//! Telegram long-polling loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use valet_bus::BaseChannel;
use valet_types::{AckHandle, InboundMessage};

use crate::api::TelegramApi;
use crate::types::{GetUpdatesParams, SendChatActionParams, TgMessage};

/// Seconds between typing-indicator refreshes. Telegram expires the
/// indicator after ~5 s.
const TYPING_REFRESH_SECS: u64 = 4;

/// Run the long-polling loop, converting Telegram updates into bus messages.
///
/// Exits when `cancel` fires or the bus inbound queue closes.
pub async fn run_polling_loop(
    api: Arc<TelegramApi>,
    base: Arc<BaseChannel>,
    media_dir: std::path::PathBuf,
    cancel: CancellationToken,
) {
    let mut offset: Option<i64> = None;
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(30);

    info!("telegram polling loop started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let params = GetUpdatesParams {
            offset,
            timeout: Some(30),
            allowed_updates: Some(vec!["message".into()]),
        };

        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            result = api.get_updates(&params) => result,
        };

        match updates {
            Ok(updates) => {
                backoff = Duration::from_secs(1);
                for update in updates {
                    offset = Some(update.update_id + 1);
                    let Some(msg) = update.message else { continue };
                    if handle_message(&api, &base, &media_dir, msg).await.is_err() {
                        info!("inbound queue closed, stopping polling");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(backoff_secs = backoff.as_secs(), "getUpdates error: {e:#}");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }

    info!("telegram polling loop stopped");
}

/// Convert one Telegram message into an `InboundMessage` and publish it.
/// Returns an error only when the bus inbound queue has closed.
async fn handle_message(
    api: &Arc<TelegramApi>,
    base: &Arc<BaseChannel>,
    media_dir: &std::path::Path,
    msg: TgMessage,
) -> anyhow::Result<()> {
    let sender_id = msg
        .from
        .as_ref()
        .map(|u| u.id.to_string())
        .unwrap_or_else(|| msg.chat.id.to_string());

    if !base.is_allowed(&sender_id) {
        warn!(sender = %sender_id, "rejected message from sender not on allowlist");
        return Ok(());
    }

    let mut content = msg
        .text
        .clone()
        .or_else(|| msg.caption.clone())
        .unwrap_or_default();

    // Download the largest photo size, if any.
    let mut media = Vec::new();
    if let Some(photos) = &msg.photo {
        if let Some(photo) = photos.last() {
            match api.download_file(&photo.file_id, media_dir, "photo").await {
                Ok(path) => {
                    debug!(path = %path.display(), "downloaded photo");
                    media.push(path);
                }
                Err(e) => warn!("failed to download photo: {e:#}"),
            }
        }
        if content.is_empty() {
            content = "Please analyse this image.".to_string();
        }
    }

    if content.is_empty() && media.is_empty() {
        return Ok(());
    }

    let chat_id = msg.chat.id;

    // Refresh the typing indicator until the ack handle is closed.
    let typing = CancellationToken::new();
    let refresher_token = typing.clone();
    let refresher_api = api.clone();
    tokio::spawn(async move {
        loop {
            let _ = refresher_api
                .send_chat_action(&SendChatActionParams {
                    chat_id,
                    action: "typing".into(),
                })
                .await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(TYPING_REFRESH_SECS)) => {}
                _ = refresher_token.cancelled() => break,
            }
        }
    });

    let mut metadata = HashMap::new();
    metadata.insert("message_id".into(), serde_json::Value::from(msg.message_id));
    if let Some(from) = &msg.from {
        if let Some(username) = &from.username {
            metadata.insert("username".into(), serde_json::Value::from(username.clone()));
        }
        if let Some(first_name) = &from.first_name {
            metadata.insert("first_name".into(), serde_json::Value::from(first_name.clone()));
        }
    }

    let inbound = InboundMessage {
        channel: base.name().to_string(),
        sender_id,
        chat_id: chat_id.to_string(),
        content,
        media,
        timestamp: Utc.timestamp_opt(msg.date, 0).single().unwrap_or_else(Utc::now),
        metadata,
        ack: Some(AckHandle::new(typing)),
    };

    // A failed publish drops the message, and with it the ack handle —
    // its Drop stops the refresher.
    base.publish_inbound(inbound).await
}
