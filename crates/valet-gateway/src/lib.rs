//! valet-gateway: wires the bus, channels, scheduler, heartbeat, command
//! handling and the local RPC surface into one long-running daemon, and owns
//! the inbound → agent dispatch pipeline.

pub mod channel;
pub mod commands;
pub mod handlers;
pub mod heartbeat;
pub mod rpc;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use valet_agent::{AgentRequest, AgentResponse, AgentRuntime, HookEvent, RealtimeEvent};
use valet_bus::MessageBus;
use valet_config::Config;
use valet_cron::{CronJob, JobRunner, PayloadKind, Scheduler, SessionTarget};
use valet_types::{Attachment, ChannelAdapter, InboundMessage, OutboundMessage};

use channel::ChannelManager;
use commands::CommandHandler;
use heartbeat::{Heartbeat, HeartbeatNotifyFn, HeartbeatRunFn};
use rpc::RpcServer;

/// Builds the agent runtime from the loaded config and composed system
/// prompt. Injectable so tests can supply mocks.
pub type RuntimeFactory =
    Box<dyn FnOnce(&Config, &str) -> Result<Arc<dyn AgentRuntime>> + Send>;

pub struct Gateway {
    cfg: Arc<Config>,
    config_dir: PathBuf,
    bus: Arc<MessageBus>,
    runtime: Arc<dyn AgentRuntime>,
    scheduler: Arc<Scheduler>,
    heartbeat: Arc<Heartbeat>,
    commands: Arc<CommandHandler>,
    channels: ChannelManager,
    rpc: Arc<RpcServer>,
    /// Most recent inbound chat, written only by the inbound loop. Used as
    /// the heartbeat notification target.
    last_chat: Arc<StdMutex<Option<(String, String)>>>,
}

impl Gateway {
    pub async fn new(cfg: Config, config_dir: PathBuf, factory: RuntimeFactory) -> Result<Self> {
        let cfg = Arc::new(cfg);
        let workspace = cfg.workspace_dir();
        let bus = Arc::new(MessageBus::new(cfg.gateway.buf_size));

        let system_prompt = build_system_prompt(&workspace);
        let runtime = factory(&cfg, &system_prompt)?;

        // Scheduler runner: the gateway's job-execution policy.
        let runner: JobRunner = {
            let cfg = cfg.clone();
            let runtime = runtime.clone();
            let bus = bus.clone();
            Arc::new(move |job| {
                let cfg = cfg.clone();
                let runtime = runtime.clone();
                let bus = bus.clone();
                Box::pin(run_job(cfg, runtime, bus, job))
            })
        };
        let scheduler = Arc::new(Scheduler::new(
            config_dir.join("data").join("cron").join("jobs.json"),
            runner,
        ));

        let last_chat: Arc<StdMutex<Option<(String, String)>>> = Arc::new(StdMutex::new(None));

        // Heartbeat: run the workspace prompt under the system session,
        // notify the most recent chat (or the first Telegram allowlist
        // entry).
        let on_heartbeat: HeartbeatRunFn = {
            let runtime = runtime.clone();
            Arc::new(move |prompt| {
                let runtime = runtime.clone();
                Box::pin(async move {
                    let response = runtime.run(AgentRequest::new(prompt, "system")).await?;
                    Ok(response.output)
                })
            })
        };
        let notify: HeartbeatNotifyFn = {
            let cfg = cfg.clone();
            let bus = bus.clone();
            let last_chat = last_chat.clone();
            Arc::new(move |result| {
                let cfg = cfg.clone();
                let bus = bus.clone();
                let last_chat = last_chat.clone();
                Box::pin(async move {
                    let target = last_chat.lock().unwrap().clone().or_else(|| {
                        cfg.channels
                            .telegram
                            .allow_from
                            .first()
                            .map(|id| ("telegram".to_string(), id.clone()))
                    });
                    let Some((channel, chat_id)) = target else {
                        warn!("heartbeat: no active chat and no allowlist entry, dropping notification");
                        return;
                    };
                    info!(channel = %channel, chat = %chat_id, "heartbeat notifying user");
                    if let Err(e) = bus
                        .publish_outbound(OutboundMessage::text(channel, chat_id, result))
                        .await
                    {
                        warn!("heartbeat notify failed: {e:#}");
                    }
                })
            })
        };
        let heartbeat = Arc::new(Heartbeat::new(
            workspace.clone(),
            std::time::Duration::from_secs(cfg.heartbeat.interval_secs),
            on_heartbeat,
            notify,
        ));

        let commands = Arc::new(CommandHandler::new(
            runtime.clone(),
            workspace,
            config_dir.clone(),
            cfg.gateway.extended_commands,
        ));

        let channels = ChannelManager::from_config(&cfg, &bus).await?;

        let rpc = Arc::new(RpcServer::new());
        handlers::register_cron_handlers(&rpc, scheduler.clone()).await;
        handlers::register_notify_handlers(&rpc, bus.clone()).await;

        Ok(Self {
            cfg,
            config_dir,
            bus,
            runtime,
            scheduler,
            heartbeat,
            commands,
            channels,
            rpc,
            last_chat,
        })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Register an extra channel adapter (used by tests and embedders).
    pub async fn register_channel(&self, adapter: Arc<dyn ChannelAdapter>) {
        self.channels.register(adapter, &self.bus).await;
    }

    /// Launch every subsystem. Returns once the RPC listener is bound.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        {
            let bus = self.bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(cancel).await });
        }

        self.channels.start_all(&cancel).await.context("start channels")?;
        info!(channels = ?self.channels.enabled_channels().await, "channels started");

        self.scheduler.start(cancel.clone()).await.context("start scheduler")?;

        {
            let heartbeat = self.heartbeat.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { heartbeat.start(cancel).await });
        }

        {
            let gateway = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gateway.inbound_loop(cancel).await });
        }

        let addr = format!("{}:{}", self.cfg.gateway.host, self.cfg.gateway.port);
        self.rpc.clone().start(&addr, cancel).await.context("rpc server")?;

        self.send_restart_notice().await;
        Ok(())
    }

    /// Run until SIGINT/SIGTERM, then shut down in order.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let cancel = CancellationToken::new();
        self.start(cancel.clone()).await?;

        let pid_file = self.config_dir.join("valet.pid");
        if let Err(e) = std::fs::write(&pid_file, std::process::id().to_string()) {
            warn!("failed to write pid file: {e}");
        }

        wait_for_shutdown_signal().await;
        info!("shutdown signal received");

        cancel.cancel();
        self.scheduler.stop();
        self.channels.stop_all().await;
        self.runtime.close().await;
        let _ = std::fs::remove_file(&pid_file);
        info!("shutdown complete");
        Ok(())
    }

    async fn inbound_loop(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.bus.take_inbound().await else {
            warn!("inbound loop already running");
            return;
        };
        info!("inbound loop started");
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            self.handle_inbound(msg).await;
        }
        info!("inbound loop stopped");
    }

    /// Process one inbound message: command short-circuit or agent task.
    pub async fn handle_inbound(self: &Arc<Self>, mut msg: InboundMessage) {
        info!(
            channel = %msg.channel,
            sender = %msg.sender_id,
            content = %truncate(&msg.content, 80),
            "inbound message"
        );
        *self.last_chat.lock().unwrap() = Some((msg.channel.clone(), msg.chat_id.clone()));

        let result = self.commands.handle(&msg).await;
        if result.handled {
            debug!(content = %truncate(&msg.content, 40), "command handled");
            if let Some(ack) = msg.ack.take() {
                ack.close();
            }
            if !result.response.is_empty() || !result.files.is_empty() {
                let out = OutboundMessage {
                    channel: msg.channel.clone(),
                    chat_id: msg.chat_id.clone(),
                    content: result.response,
                    media: result.files,
                };
                if let Err(e) = self.bus.publish_outbound(out).await {
                    error!("failed to enqueue command response: {e:#}");
                }
            }
            return;
        }

        // Each agent call runs in its own task so a slow or panicking
        // request never stalls the loop; the ack handle travels with the
        // message and its Drop stops the typing indicator even on panic.
        let gateway = self.clone();
        tokio::spawn(async move { gateway.process_agent(msg).await });
    }

    async fn process_agent(self: Arc<Self>, mut msg: InboundMessage) {
        let ack = msg.ack.take();
        let outbounds = self.run_agent_for(msg).await;
        for out in outbounds {
            if let Err(e) = self.bus.publish_outbound(out).await {
                error!("failed to enqueue agent response: {e:#}");
            }
        }
        if let Some(ack) = ack {
            ack.close();
        }
    }

    /// Run the agent and compose the outbound messages for one inbound.
    async fn run_agent_for(&self, msg: InboundMessage) -> Vec<OutboundMessage> {
        let channel = msg.channel.clone();
        let chat_id = msg.chat_id.clone();
        let session_id = msg.session_key();

        let attachments: Vec<Attachment> = msg
            .media
            .iter()
            .cloned()
            .map(Attachment::from_path)
            .collect();
        if !attachments.is_empty() {
            info!(count = attachments.len(), "processing media attachments");
        }

        // Per-request realtime channel: the forwarder maps runtime events to
        // progress messages for this chat and dies with the request.
        let (events_tx, mut events_rx) = mpsc::channel::<RealtimeEvent>(16);
        let forwarder = {
            let bus = self.bus.clone();
            let channel = channel.clone();
            let chat_id = chat_id.clone();
            let progress_enabled = self.cfg.agent.tool_log.enabled;
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    let text = match event {
                        // The user must always learn about context pressure.
                        RealtimeEvent::ContextWindowWarn { message } => message,
                        RealtimeEvent::ProgressUpdate { tool, params } => {
                            if !progress_enabled {
                                continue;
                            }
                            if params.is_empty() || params == "{}" {
                                format!("⏳ {tool}")
                            } else {
                                format!("⏳ {tool}: {params}")
                            }
                        }
                    };
                    if text.is_empty() {
                        continue;
                    }
                    let _ = bus
                        .publish_outbound(OutboundMessage::text(
                            channel.clone(),
                            chat_id.clone(),
                            text,
                        ))
                        .await;
                }
            })
        };

        let request = AgentRequest {
            prompt: msg.content.clone(),
            session_id,
            attachments,
            events: Some(events_tx),
        };
        let result = self.runtime.run(request).await;
        let _ = forwarder.await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!("agent error: {e:#}");
                return vec![OutboundMessage::text(channel, chat_id, map_agent_error(&e))];
            }
        };

        compose_outbounds(&channel, &chat_id, &response)
    }

    /// If a restart trigger exists, tell the originating chat we are back.
    pub async fn send_restart_notice(&self) {
        let path = self.config_dir.join("restart_trigger.txt");
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(_) => {
                debug!("no restart trigger file, skipping startup notification");
                return;
            }
        };
        let trimmed = data.trim();
        let Some((channel, chat_id)) = trimmed.split_once(':') else {
            warn!(trigger = %trimmed, "invalid restart trigger format");
            let _ = std::fs::remove_file(&path);
            return;
        };

        let notice = format!(
            "✅ **Gateway Restarted Successfully**\n\nPID: {}\nTime: {}",
            std::process::id(),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
        info!(channel = %channel, chat = %chat_id, "sending restart notification");
        if let Err(e) = self
            .bus
            .publish_outbound(OutboundMessage::text(channel, chat_id, notice))
            .await
        {
            warn!("restart notification failed: {e:#}");
        }
        let _ = std::fs::remove_file(&path);
    }
}

// ──────────────────── Scheduler job policy ────────────────────

/// Execute one scheduled job: shell command, inert system event, or agent
/// turn; announce the result when the job asks for it.
async fn run_job(
    cfg: Arc<Config>,
    runtime: Arc<dyn AgentRuntime>,
    bus: Arc<MessageBus>,
    job: CronJob,
) -> Result<String> {
    let session_id = match job.session_target {
        SessionTarget::Main => "system".to_string(),
        SessionTarget::Isolated => format!("cron-isolated-{}", job.id),
    };

    let result = match job.payload.kind {
        PayloadKind::Command => {
            // Shell payloads are trusted local code. With the RPC surface
            // reachable from other hosts, anyone could schedule them.
            if !cfg.rpc_is_loopback() {
                bail!(
                    "shell command payloads are disabled while gateway.host is {}; bind to loopback to enable them",
                    cfg.gateway.host
                );
            }
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&job.payload.command)
                .output()
                .await;
            match output {
                Ok(out) => {
                    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
                    if out.status.success() {
                        stdout
                    } else {
                        let stderr = String::from_utf8_lossy(&out.stderr);
                        format!("command error: {}\n{stdout}{stderr}", out.status)
                    }
                }
                Err(e) => format!("command error: {e}"),
            }
        }
        PayloadKind::SystemEvent => job.payload.text.clone(),
        PayloadKind::AgentTurn => {
            let response = runtime
                .run(AgentRequest::new(job.payload.prompt(), session_id))
                .await?;
            response.output
        }
    };

    if let Some(delivery) = &job.delivery {
        if delivery.mode == valet_cron::DeliveryMode::Announce && !delivery.channel.is_empty() {
            bus.publish_outbound(OutboundMessage::text(
                delivery.channel.clone(),
                delivery.to.clone(),
                result.clone(),
            ))
            .await?;
        }
    }
    Ok(result)
}

// ──────────────────── Response composition ────────────────────

#[derive(Default)]
struct HookOutcome {
    send_files: Vec<PathBuf>,
    ask_question: String,
    memory_notice: String,
}

/// One pass over the hook events, extracting everything the composition
/// rules need.
fn process_hook_events(response: &AgentResponse) -> HookOutcome {
    let mut outcome = HookOutcome::default();
    let mut writes: Vec<(String, usize)> = Vec::new();

    for event in &response.hook_events {
        match event {
            HookEvent::PostToolUse {
                name,
                output,
                params,
                error,
            } => match name.as_str() {
                "AskUserQuestion" | "ask_user_question" => {
                    if !output.is_empty() {
                        outcome.ask_question = output.clone();
                    }
                }
                "memory_write" => {
                    if error.is_some() {
                        continue;
                    }
                    let path = params
                        .get("path")
                        .and_then(|v| v.as_str())
                        .unwrap_or("memory")
                        .to_string();
                    writes.push((path, parse_written_bytes(output)));
                }
                _ => {}
            },
            HookEvent::FileAttachment { tool, path } => {
                if tool == "SendFile" {
                    outcome.send_files.push(path.clone());
                }
            }
        }
    }

    if !writes.is_empty() {
        outcome.memory_notice = writes
            .iter()
            .map(|(path, bytes)| {
                if *bytes > 0 {
                    format!("📝 {path} (+{bytes} bytes)")
                } else {
                    format!("📝 {path}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
    }
    outcome
}

/// Parse "Appended N …" / "Written N …" tool outputs.
fn parse_written_bytes(output: &str) -> usize {
    let mut words = output.split_whitespace();
    match words.next() {
        Some("Appended") | Some("Written") => {
            words.next().and_then(|n| n.parse().ok()).unwrap_or(0)
        }
        _ => 0,
    }
}

/// Compose the outbound messages for a successful agent response: files
/// first, then either the ask-user short-circuit or the concatenated
/// outputs, then the memory notice.
fn compose_outbounds(
    channel: &str,
    chat_id: &str,
    response: &AgentResponse,
) -> Vec<OutboundMessage> {
    let hooks = process_hook_events(response);
    let mut out = Vec::new();

    for file in &hooks.send_files {
        info!(file = %file.display(), "sending file from hook event");
        out.push(OutboundMessage {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: String::new(),
            media: vec![file.clone()],
        });
    }

    if !hooks.ask_question.is_empty() {
        info!(question = %truncate(&hooks.ask_question, 60), "ask-user short-circuit");
        out.push(OutboundMessage::text(channel, chat_id, hooks.ask_question));
        return out;
    }

    let mut content = String::new();
    for piece in response
        .command_results
        .iter()
        .chain(response.skill_results.iter())
        .chain(response.subagent_output.iter())
    {
        if !piece.is_empty() {
            content.push_str(piece);
            content.push_str("\n\n");
        }
    }
    content.push_str(&response.output);
    let content = content.trim().to_string();

    if !content.is_empty() {
        out.push(OutboundMessage::text(channel, chat_id, content));
    } else if hooks.send_files.is_empty() {
        warn!(channel = %channel, chat = %chat_id, "no response generated");
    }

    if !hooks.memory_notice.is_empty() {
        out.push(OutboundMessage::text(channel, chat_id, hooks.memory_notice));
    }
    out
}

/// Translate runtime failures into user-visible messages.
fn map_agent_error(e: &anyhow::Error) -> String {
    let text = format!("{e:#}");
    if text.contains("max iterations reached") {
        "Sorry, that task needed too many tool calls. Please simplify the request or break it into steps.".to_string()
    } else if text.contains("context deadline exceeded") {
        "Sorry, processing timed out. Please try again or simplify the request.".to_string()
    } else {
        "Sorry, something went wrong while processing your message.".to_string()
    }
}

fn build_system_prompt(workspace: &Path) -> String {
    let mut prompt = String::new();
    for file in ["AGENTS.md", "SOUL.md"] {
        if let Ok(data) = std::fs::read_to_string(workspace.join(file)) {
            prompt.push_str(&data);
            prompt.push_str("\n\n");
        }
    }
    prompt
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        let cut: String = s.chars().take(n).collect();
        format!("{cut}...")
    }
}
