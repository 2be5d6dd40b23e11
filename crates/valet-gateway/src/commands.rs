//! Slash-command handling: short-circuits the agent path for `/`-prefixed
//! messages.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use valet_agent::AgentRuntime;
use valet_types::InboundMessage;

/// Outcome of command processing. When `handled` is true the orchestrator
/// bypasses the agent and emits `response` / `files` directly (nothing is
/// emitted when both are empty).
#[derive(Debug, Default)]
pub struct CommandResult {
    pub handled: bool,
    pub response: String,
    pub files: Vec<PathBuf>,
}

impl CommandResult {
    fn unhandled() -> Self {
        Self::default()
    }

    fn text(response: impl Into<String>) -> Self {
        Self {
            handled: true,
            response: response.into(),
            files: Vec::new(),
        }
    }
}

pub struct CommandHandler {
    runtime: Arc<dyn AgentRuntime>,
    workspace: PathBuf,
    config_dir: PathBuf,
    /// Enables the operational commands (/logs /status /chatid /cleanup
    /// /restart).
    extended: bool,
}

impl CommandHandler {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        workspace: PathBuf,
        config_dir: PathBuf,
        extended: bool,
    ) -> Self {
        Self {
            runtime,
            workspace,
            config_dir,
            extended,
        }
    }

    pub async fn handle(&self, msg: &InboundMessage) -> CommandResult {
        let content = msg.content.trim();
        if !content.starts_with('/') {
            return CommandResult::unhandled();
        }
        let parts: Vec<&str> = content.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return CommandResult::unhandled();
        };
        let command = command.to_lowercase();
        let arg = parts.get(1).map(|s| s.to_lowercase());

        match command.as_str() {
            "/start" => CommandResult::text(START_TEXT),
            "/help" => CommandResult::text(self.help_text()),
            "/reset" => self.handle_reset(&msg.session_key()).await,
            "/skill" => match arg.as_deref() {
                Some("list") => CommandResult::text(self.handle_skill_list()),
                _ => CommandResult::text("❓ Unknown command. Use `/skill list` to see available skills."),
            },
            "/restart" if self.extended => self.handle_restart(msg),
            "/logs" if self.extended => self.handle_logs(arg.as_deref().unwrap_or("100")),
            "/status" if self.extended => CommandResult::text(self.handle_status()),
            "/chatid" if self.extended => CommandResult::text(format!(
                "💬 **Your Chat Information**\n\nChannel: {}\nChat ID: `{}`\nSender ID: `{}`",
                msg.channel, msg.chat_id, msg.sender_id
            )),
            "/cleanup" if self.extended => match arg.as_deref() {
                Some("confirm") | Some("yes") => self.handle_cleanup_confirm(&msg.chat_id),
                _ => self.handle_cleanup_scan(&msg.chat_id),
            },
            _ => CommandResult::text(format!(
                "❓ Unknown command: {command}\n\nUse /help to see available commands."
            )),
        }
    }

    fn help_text(&self) -> String {
        let mut text = String::from(
            "📚 **Valet Capabilities**\n\n\
             **Commands:**\n\
             • /start - Welcome message\n\
             • /help - Show this help\n\
             • /skill list - List installed skills\n\
             • /reset - Clear conversation history\n",
        );
        if self.extended {
            text.push_str(
                "• /restart - Restart gateway (production only)\n\
                 • /logs [lines|all] - Show logs (default 100 lines, max 1000)\n\
                 • /status - Show gateway status\n\
                 • /chatid - Show your chat ID\n\
                 • /cleanup - Clean temporary screenshot files (requires confirmation)\n",
            );
        }
        text.push_str(
            "\n**Multimodal:**\nSend images with text - I can analyse photos, diagrams and screenshots.\n\
             \nJust send a message or image to get started!",
        );
        text
    }

    async fn handle_reset(&self, session_key: &str) -> CommandResult {
        match self.runtime.clear_session(session_key).await {
            Ok(()) => CommandResult::text("✅ **Session Reset**\n\nLet's start fresh!"),
            Err(e) => CommandResult::text(format!("❌ Failed to reset session: {e:#}")),
        }
    }

    fn handle_skill_list(&self) -> String {
        let skills_dir = self.workspace.join("skills");
        let mut skills: Vec<String> = match std::fs::read_dir(&skills_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().join("SKILL.md").exists())
                .filter_map(|e| e.file_name().into_string().ok())
                .collect(),
            Err(_) => Vec::new(),
        };
        skills.sort();

        if skills.is_empty() {
            return "📦 **Installed Skills**\n\nNo skills are currently installed.".to_string();
        }
        let mut out = String::from("📦 **Installed Skills**\n\n");
        for (i, skill) in skills.iter().enumerate() {
            out.push_str(&format!("{}. **{}**\n", i + 1, skill));
        }
        out
    }

    fn handle_restart(&self, msg: &InboundMessage) -> CommandResult {
        // Remember who asked, so the restarted gateway can report back.
        let trigger = self.config_dir.join("restart_trigger.txt");
        let _ = std::fs::create_dir_all(&self.config_dir);
        let _ = std::fs::write(&trigger, format!("{}:{}", msg.channel, msg.chat_id));

        let script = self.config_dir.join("restart.sh");
        if !script.exists() {
            return CommandResult::text(
                "⚠️ Restart script not found. This command only works in production mode.",
            );
        }
        match std::process::Command::new("/bin/sh").arg(&script).spawn() {
            Ok(_) => {
                info!("restart requested via chat command");
                CommandResult::text(
                    "🔄 **Restarting Gateway**\n\nThe gateway will restart in a few seconds. \
                     You'll receive a notification when it's back online.",
                )
            }
            Err(e) => CommandResult::text(format!("❌ Failed to restart: {e}")),
        }
    }

    fn handle_logs(&self, arg: &str) -> CommandResult {
        let Some(log_file) = current_log_file(&self.workspace.join("logs")) else {
            return CommandResult::text("⚠️ No log file found yet.");
        };

        if arg == "all" {
            return CommandResult {
                handled: true,
                response: "📄 **Gateway Logs (Full File)**\n\nSending complete log file...".into(),
                files: vec![log_file],
            };
        }

        let lines = arg.parse::<usize>().unwrap_or(100).clamp(1, 1000);
        match read_last_lines(&log_file, lines) {
            Ok(content) => CommandResult::text(format!(
                "📄 **Gateway Logs (Last {lines} lines)**\n\n```\n{content}\n```"
            )),
            Err(e) => CommandResult::text(format!("❌ Failed to read log file: {e}")),
        }
    }

    fn handle_status(&self) -> String {
        let pid_file = self.config_dir.join("valet.pid");
        let Ok(pid_raw) = std::fs::read_to_string(&pid_file) else {
            return format!(
                "🟡 **Gateway Status: Running (Foreground)**\n\nCurrent PID: {}\n\n\
                 No PID file found - gateway may be running in foreground mode.",
                std::process::id()
            );
        };
        let pid = pid_raw.trim();

        let alive = std::process::Command::new("ps")
            .args(["-p", pid])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false);
        if alive {
            format!("🟢 **Gateway Status: Running (Background)**\n\nPID: {pid}")
        } else {
            format!(
                "🔴 **Gateway Status: Not Running**\n\nStale PID file found (PID: {pid})\n\n\
                 Use /restart to start."
            )
        }
    }

    fn handle_cleanup_scan(&self, chat_id: &str) -> CommandResult {
        let mut temp_files: Vec<PathBuf> = Vec::new();
        let mut total_size: u64 = 0;

        let mut dirs = vec![std::env::temp_dir()];
        let tmp = PathBuf::from("/tmp");
        if tmp != dirs[0] && tmp.is_dir() {
            dirs.push(tmp);
        }

        for dir in dirs {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with("screenshot-") && name.ends_with(".png") {
                    if let Ok(meta) = entry.metadata() {
                        total_size += meta.len();
                    }
                    temp_files.push(entry.path());
                }
            }
        }

        if temp_files.is_empty() {
            return CommandResult::text("✨ **No Temporary Files Found**\n\nYour system is clean!");
        }

        let list = temp_files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let pending = pending_cleanup_file(chat_id);
        if let Err(e) = std::fs::write(&pending, list) {
            return CommandResult::text(format!("❌ Failed to save cleanup list: {e}"));
        }

        CommandResult::text(format!(
            "🗑️ **Temporary Files Found**\n\n\
             📊 Statistics:\n\
             • Files: {} screenshot(s)\n\
             • Total Size: {:.2} MB\n\n\
             ⚠️ **Warning**: This action cannot be undone!\n\n\
             Reply with `/cleanup confirm` or `/cleanup yes` to delete these files.",
            temp_files.len(),
            total_size as f64 / (1024.0 * 1024.0),
        ))
    }

    fn handle_cleanup_confirm(&self, chat_id: &str) -> CommandResult {
        let pending = pending_cleanup_file(chat_id);
        let Ok(data) = std::fs::read_to_string(&pending) else {
            return CommandResult::text(
                "⚠️ No pending cleanup request found or it has expired.\n\n\
                 Use `/cleanup` to scan for temporary files first.",
            );
        };

        let mut deleted = 0usize;
        let mut failed: Vec<String> = Vec::new();
        for line in data.lines().filter(|l| !l.is_empty()) {
            let path = Path::new(line);
            if std::fs::remove_file(path).is_ok() {
                deleted += 1;
            } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                failed.push(name.to_string());
            }
        }
        let _ = std::fs::remove_file(&pending);

        let mut response = format!("✅ **Cleanup Complete**\n\nDeleted {deleted} file(s)");
        if !failed.is_empty() {
            response.push_str(&format!(
                "\n\n⚠️ Failed to delete {} file(s):\n{}",
                failed.len(),
                failed.join(", ")
            ));
        }
        CommandResult::text(response)
    }
}

const START_TEXT: &str = "🚀 **Valet Activated**\n\nYour personal assistant gateway is online.\n\nType /help to see what I can do.";

fn pending_cleanup_file(chat_id: &str) -> PathBuf {
    // Chat ids are opaque; strip anything that would escape the temp dir.
    let safe: String = chat_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    std::env::temp_dir().join(format!("valet_cleanup_{safe}.txt"))
}

/// Newest file in the log directory (rolling logs carry a date suffix that
/// sorts lexicographically).
fn current_log_file(log_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(log_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.starts_with("valet.log"))
        })
        .max_by_key(|e| e.file_name())
        .map(|e| e.path())
}

/// Read the last `n` lines of a file, scanning at most the trailing 256 KiB.
fn read_last_lines(path: &Path, n: usize) -> std::io::Result<String> {
    const MAX_SCAN: u64 = 256 * 1024;

    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(MAX_SCAN);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    if start > 0 {
        // Drop the partial first line.
        if let Some(idx) = buf.find('\n') {
            buf.drain(..=idx);
        }
    }

    let lines: Vec<&str> = buf.lines().collect();
    let tail = if lines.len() > n { &lines[lines.len() - n..] } else { &lines[..] };
    Ok(tail.join("\n"))
}
