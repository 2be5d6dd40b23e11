//! valet-bus: in-memory fan-in / fan-out of gateway messages.
//!
//! Two bounded FIFO queues — Inbound and Outbound — plus a per-channel
//! outbound subscription table. Producers block when a queue is full
//! (backpressure); the outbound dispatcher is a single cooperative consumer
//! that invokes subscriber callbacks in registration order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use valet_types::{InboundMessage, OutboundMessage};

/// Default queue capacity when the configured buffer size is zero.
pub const DEFAULT_BUF_SIZE: usize = 100;

/// Subscriber callback for outbound messages on one channel.
///
/// Callbacks must not block indefinitely; a channel adapter taking low
/// seconds for a remote send is acceptable because dispatch is
/// single-threaded by design.
pub type OutboundHandler = Arc<dyn Fn(OutboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    subs: RwLock<HashMap<String, Vec<OutboundHandler>>>,
}

impl MessageBus {
    /// Create a bus with the given queue capacity (0 falls back to 100).
    pub fn new(buf_size: usize) -> Self {
        let buf_size = if buf_size == 0 { DEFAULT_BUF_SIZE } else { buf_size };
        let (inbound_tx, inbound_rx) = mpsc::channel(buf_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buf_size);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            subs: RwLock::new(HashMap::new()),
        }
    }

    /// Push an inbound message. Blocks while the queue is full.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("inbound queue closed"))
    }

    /// Push an outbound message. Blocks while the queue is full.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("outbound queue closed"))
    }

    /// Take the inbound receiver. The gateway's inbound loop is the single
    /// consumer; the second take returns `None`.
    pub async fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().await.take()
    }

    /// Register an outbound subscriber for `channel`.
    pub async fn subscribe_outbound(&self, channel: &str, handler: OutboundHandler) {
        let mut subs = self.subs.write().await;
        subs.entry(channel.to_string()).or_default().push(handler);
    }

    /// Run the outbound dispatch loop until `cancel` fires.
    ///
    /// Takes the next outbound message, looks up subscribers under the read
    /// lock, and awaits each callback in insertion order. Messages for
    /// channels without a subscriber are logged and dropped.
    pub async fn dispatch_outbound(&self, cancel: CancellationToken) {
        let mut rx = match self.outbound_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("outbound dispatcher already running");
                return;
            }
        };

        info!("outbound dispatcher started");
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let handlers: Vec<OutboundHandler> = {
                let subs = self.subs.read().await;
                subs.get(&msg.channel).cloned().unwrap_or_default()
            };

            if handlers.is_empty() {
                warn!(channel = %msg.channel, "no subscriber for channel, dropping message");
                continue;
            }
            for handler in handlers {
                handler(msg.clone()).await;
            }
        }
        info!("outbound dispatcher stopped");
    }
}

// ──────────────────── Base channel ────────────────────

/// State every channel adapter shares: its name, the bus it feeds, and the
/// sender allowlist.
pub struct BaseChannel {
    name: String,
    bus: Arc<MessageBus>,
    allow_from: HashSet<String>,
}

impl BaseChannel {
    pub fn new(name: impl Into<String>, bus: Arc<MessageBus>, allow_from: &[String]) -> Self {
        Self {
            name: name.into(),
            bus,
            allow_from: allow_from.iter().cloned().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// An empty allowlist accepts everyone.
    pub fn is_allowed(&self, sender_id: &str) -> bool {
        self.allow_from.is_empty() || self.allow_from.contains(sender_id)
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        self.bus.publish_inbound(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use chrono::Utc;

    fn outbound(channel: &str, content: &str) -> OutboundMessage {
        OutboundMessage::text(channel, "1", content)
    }

    fn inbound(channel: &str) -> InboundMessage {
        InboundMessage {
            channel: channel.into(),
            sender_id: "u1".into(),
            chat_id: "1".into(),
            content: "hi".into(),
            media: vec![],
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            ack: None,
        }
    }

    /// Collects dispatched messages for assertions.
    fn recording_handler() -> (OutboundHandler, Arc<StdMutex<Vec<String>>>) {
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: OutboundHandler = Arc::new(move |msg: OutboundMessage| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(msg.content);
            })
        });
        (handler, seen)
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_subscriber() {
        let bus = Arc::new(MessageBus::new(16));
        let (handler, seen) = recording_handler();
        bus.subscribe_outbound("telegram", handler).await;

        let cancel = CancellationToken::new();
        let dispatcher = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(cancel).await })
        };

        bus.publish_outbound(outbound("telegram", "a")).await.unwrap();
        bus.publish_outbound(outbound("telegram", "b")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        dispatcher.await.unwrap();

        // Per-channel delivery order matches enqueue order.
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_drops_unsubscribed_channel() {
        let bus = Arc::new(MessageBus::new(16));
        let (handler, seen) = recording_handler();
        bus.subscribe_outbound("telegram", handler).await;

        let cancel = CancellationToken::new();
        let dispatcher = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(cancel).await })
        };

        bus.publish_outbound(outbound("feishu", "dropped")).await.unwrap();
        bus.publish_outbound(outbound("telegram", "kept")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        dispatcher.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_exits_on_cancel() {
        let bus = Arc::new(MessageBus::new(16));
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            bus.dispatch_outbound(cancel),
        )
        .await
        .expect("dispatcher should exit promptly when cancelled");
    }

    #[tokio::test]
    async fn test_second_dispatcher_returns_immediately() {
        let bus = Arc::new(MessageBus::new(16));
        let cancel = CancellationToken::new();

        let first = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // The outbound receiver is already taken; the second call must not hang.
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            bus.dispatch_outbound(CancellationToken::new()),
        )
        .await
        .expect("second dispatcher should return immediately");

        cancel.cancel();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_roundtrip() {
        let bus = MessageBus::new(4);
        bus.publish_inbound(inbound("telegram")).await.unwrap();

        let mut rx = bus.take_inbound().await.expect("receiver available once");
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "telegram");
        assert!(bus.take_inbound().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_blocks_when_full() {
        let bus = Arc::new(MessageBus::new(1));
        bus.publish_outbound(outbound("telegram", "first")).await.unwrap();

        // Queue full: the next publish must not complete until a consumer runs.
        let blocked = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.publish_outbound(outbound("telegram", "second")).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "publish should block under backpressure");

        let (handler, _) = recording_handler();
        bus.subscribe_outbound("telegram", handler).await;
        let cancel = CancellationToken::new();
        let dispatcher = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(cancel).await })
        };

        blocked.await.unwrap().unwrap();
        cancel.cancel();
        dispatcher.await.unwrap();
    }

    #[test]
    fn test_base_channel_allowlist() {
        let bus = Arc::new(MessageBus::new(4));
        let open = BaseChannel::new("telegram", bus.clone(), &[]);
        assert!(open.is_allowed("anyone"));

        let restricted = BaseChannel::new("telegram", bus, &["42".to_string()]);
        assert!(restricted.is_allowed("42"));
        assert!(!restricted.is_allowed("7"));
        assert_eq!(restricted.name(), "telegram");
    }
}
