//! Channel lifecycle management.
//!
//! The manager constructs an adapter per enabled channel, registers a bus
//! subscription on the adapter's name whose callback performs the send, and
//! owns concurrent startup / best-effort shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use valet_bus::{MessageBus, OutboundHandler};
use valet_channel_telegram::TelegramChannel;
use valet_config::Config;
use valet_types::{ChannelAdapter, ChannelInfo};

pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Build adapters for every enabled channel and register their bus
    /// subscriptions. A channel that fails to initialize is skipped with a
    /// log line; the others continue.
    pub async fn from_config(cfg: &Config, bus: &Arc<MessageBus>) -> anyhow::Result<Self> {
        let mgr = Self::new();
        if cfg.channels.telegram.enabled {
            match TelegramChannel::new(
                &cfg.channels.telegram.token,
                &cfg.channels.telegram.allow_from,
                bus.clone(),
            ) {
                Ok(adapter) => mgr.register(Arc::new(adapter), bus).await,
                Err(e) => error!("init telegram channel failed, skipping: {e:#}"),
            }
        }
        Ok(mgr)
    }

    /// Record an adapter and subscribe it to its channel's outbound stream.
    /// Send failures are logged; the bus does not retry.
    pub async fn register(&self, adapter: Arc<dyn ChannelAdapter>, bus: &Arc<MessageBus>) {
        let name = adapter.name().to_string();
        info!(channel = %name, "registering channel");

        let send_adapter = adapter.clone();
        let handler: OutboundHandler = Arc::new(move |msg| {
            let adapter = send_adapter.clone();
            Box::pin(async move {
                if let Err(e) = adapter.send(msg).await {
                    error!(channel = %adapter.name(), "send failed: {e:#}");
                }
            })
        });
        bus.subscribe_outbound(&name, handler).await;
        self.channels.write().await.insert(name, adapter);
    }

    /// Start every adapter concurrently; the first failure is returned.
    pub async fn start_all(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let channels = self.channels.read().await;
        let starts = channels.iter().map(|(name, adapter)| {
            let name = name.clone();
            let cancel = cancel.clone();
            async move {
                info!(channel = %name, "starting channel");
                adapter
                    .start(cancel)
                    .await
                    .with_context(|| format!("start channel {name}"))
            }
        });
        for result in futures::future::join_all(starts).await {
            result?;
        }
        Ok(())
    }

    /// Stop every adapter; failures are logged, never returned.
    pub async fn stop_all(&self) {
        let channels = self.channels.read().await;
        for (name, adapter) in channels.iter() {
            info!(channel = %name, "stopping channel");
            if let Err(e) = adapter.stop().await {
                error!(channel = %name, "error stopping channel: {e:#}");
            }
        }
    }

    pub async fn enabled_channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn infos(&self) -> Vec<ChannelInfo> {
        self.channels
            .read()
            .await
            .values()
            .map(|adapter| ChannelInfo {
                name: adapter.name().to_string(),
                status: adapter.status(),
            })
            .collect()
    }
}
