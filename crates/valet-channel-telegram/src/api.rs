//! Telegram Bot API HTTP client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use reqwest::multipart::{Form, Part};
use reqwest::Client;

use crate::types::{
    ApiResponse, BotInfo, GetUpdatesParams, MessageEntity, SendChatActionParams,
    SendMessageParams, TgFile, TgMessage, Update,
};

pub struct TelegramApi {
    client: Client,
    base_url: String,
    file_base_url: String,
}

impl TelegramApi {
    /// Create a new API client with the given bot token.
    pub fn new(bot_token: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            file_base_url: format!("https://api.telegram.org/file/bot{bot_token}"),
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &impl serde::Serialize,
    ) -> anyhow::Result<T> {
        let resp: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(params)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("{method} response parse failed"))?;

        if !resp.ok {
            bail!(
                "{method} failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        resp.result
            .with_context(|| format!("{method} returned no result"))
    }

    /// Verify the bot token by calling `getMe`.
    pub async fn get_me(&self) -> anyhow::Result<BotInfo> {
        let resp: ApiResponse<BotInfo> = self
            .client
            .get(format!("{}/getMe", self.base_url))
            .send()
            .await
            .context("getMe request failed")?
            .json()
            .await
            .context("getMe response parse failed")?;

        if !resp.ok {
            bail!(
                "getMe failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        resp.result.context("getMe returned no result")
    }

    /// Long-poll for updates.
    pub async fn get_updates(&self, params: &GetUpdatesParams) -> anyhow::Result<Vec<Update>> {
        let resp: ApiResponse<Vec<Update>> = self
            .client
            .post(format!("{}/getUpdates", self.base_url))
            .json(params)
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates response parse failed")?;

        if !resp.ok {
            bail!(
                "getUpdates failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(resp.result.unwrap_or_default())
    }

    /// Send a chat action (e.g. "typing"). Telegram expires it after ~5 s.
    pub async fn send_chat_action(&self, params: &SendChatActionParams) -> anyhow::Result<()> {
        let _: bool = self.call("sendChatAction", params).await?;
        Ok(())
    }

    /// Send a text message, optionally with formatting entities.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        entities: Option<Vec<MessageEntity>>,
    ) -> anyhow::Result<TgMessage> {
        self.call(
            "sendMessage",
            &SendMessageParams {
                chat_id,
                text: text.to_string(),
                entities,
            },
        )
        .await
    }

    /// Upload and send a local file as a photo.
    pub async fn send_photo(&self, chat_id: i64, path: &Path) -> anyhow::Result<()> {
        self.send_file(chat_id, path, "sendPhoto", "photo").await
    }

    /// Upload and send a local file as a document.
    pub async fn send_document(&self, chat_id: i64, path: &Path) -> anyhow::Result<()> {
        self.send_file(chat_id, path, "sendDocument", "document").await
    }

    async fn send_file(
        &self,
        chat_id: i64,
        path: &Path,
        method: &str,
        field: &str,
    ) -> anyhow::Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read file {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field.to_string(), Part::bytes(bytes).file_name(file_name));

        let resp: ApiResponse<TgMessage> = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("{method} request failed"))?
            .json()
            .await
            .with_context(|| format!("{method} response parse failed"))?;

        if !resp.ok {
            bail!(
                "{method} failed: {}",
                resp.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(())
    }

    /// Download a remote file into `dest_dir`, returning the local path.
    pub async fn download_file(
        &self,
        file_id: &str,
        dest_dir: &Path,
        prefix: &str,
    ) -> anyhow::Result<PathBuf> {
        let file: TgFile = self
            .call("getFile", &serde_json::json!({ "file_id": file_id }))
            .await?;
        let remote_path = file.file_path.context("getFile returned no file_path")?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .context("create media temp dir")?;

        let base_name = remote_path.rsplit('/').next().unwrap_or("file");
        let local_path = dest_dir.join(format!(
            "{prefix}-{}-{base_name}",
            chrono::Utc::now().timestamp()
        ));

        let bytes = self
            .client
            .get(format!("{}/{remote_path}", self.file_base_url))
            .send()
            .await
            .context("file download request failed")?
            .error_for_status()
            .context("file download failed")?
            .bytes()
            .await
            .context("file download read failed")?;

        tokio::fs::write(&local_path, &bytes)
            .await
            .with_context(|| format!("save file {}", local_path.display()))?;
        Ok(local_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_urls() {
        let api = TelegramApi::new("123:ABC");
        assert_eq!(api.base_url, "https://api.telegram.org/bot123:ABC");
        assert_eq!(api.file_base_url, "https://api.telegram.org/file/bot123:ABC");
    }
}
