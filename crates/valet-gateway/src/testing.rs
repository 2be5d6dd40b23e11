//! Test doubles shared by the gateway test modules.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;

use tokio_util::sync::CancellationToken;

use valet_agent::{AgentRequest, AgentResponse, AgentRuntime};
use valet_types::{ChannelAdapter, ChannelStatus, OutboundMessage};

/// Scriptable runtime: pops queued responses, falls back to echoing "ok".
pub struct MockRuntime {
    responses: StdMutex<VecDeque<Result<AgentResponse, String>>>,
    pub calls: StdMutex<Vec<(String, String)>>,
    pub cleared: StdMutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            responses: StdMutex::new(VecDeque::new()),
            calls: StdMutex::new(Vec::new()),
            cleared: StdMutex::new(Vec::new()),
        }
    }

    pub fn returning(output: &str) -> Self {
        let rt = Self::new();
        rt.push_response(AgentResponse::from_output(output));
        rt
    }

    pub fn failing(message: &str) -> Self {
        let rt = Self::new();
        rt.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        rt
    }

    pub fn push_response(&self, response: AgentResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn run_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl AgentRuntime for MockRuntime {
    async fn run(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((request.prompt.clone(), request.session_id.clone()));
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow::anyhow!("{message}")),
            None => Ok(AgentResponse::from_output("ok")),
        }
    }

    async fn clear_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.cleared.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn close(&self) {}
}

/// Adapter that records sends; optionally fails start/stop.
pub struct MockChannel {
    name: String,
    fail: bool,
    state: AtomicU8, // 0=stopped, 2=running
    sent: tokio::sync::Mutex<Vec<OutboundMessage>>,
}

impl MockChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail: false,
            state: AtomicU8::new(0),
            sent: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("start refused");
        }
        self.state.store(2, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("stop refused");
        }
        self.state.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("send refused");
        }
        self.sent.lock().await.push(message);
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        match self.state.load(Ordering::SeqCst) {
            2 => ChannelStatus::Running,
            _ => ChannelStatus::Stopped,
        }
    }
}
