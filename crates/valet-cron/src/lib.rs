//! valet-cron: persistent job scheduling.
//!
//! Jobs live in a single JSON document on disk and come in three schedule
//! kinds: six-field cron expressions, fixed intervals, and one-shot
//! instants. Execution is handed to a runner injected at construction; the
//! scheduler only decides *when*.

pub mod scheduler;
pub mod store;

pub use scheduler::{JobRunner, Scheduler};
pub use store::CronStore;

use serde::{Deserialize, Serialize};

// ──────────────────── Schedule ────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Six-field cron expression (second minute hour day month weekday).
    Cron,
    /// Fixed interval in milliseconds.
    Every,
    /// One-shot unix-millisecond instant.
    At,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_ms: Option<i64>,
}

impl Schedule {
    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            expr: Some(expr.into()),
            every_ms: None,
            at_ms: None,
        }
    }

    pub fn every_ms(ms: i64) -> Self {
        Self {
            kind: ScheduleKind::Every,
            expr: None,
            every_ms: Some(ms),
            at_ms: None,
        }
    }

    pub fn at_ms(ms: i64) -> Self {
        Self {
            kind: ScheduleKind::At,
            expr: None,
            every_ms: None,
            at_ms: Some(ms),
        }
    }
}

// ──────────────────── Payload ────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PayloadKind {
    /// Run the agent with `message` (or `text`); the result can be delivered.
    #[default]
    AgentTurn,
    /// Execute `command` with a shell; stdout is the result.
    Command,
    /// Inert text: the result is `text` itself, no agent call.
    SystemEvent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default)]
    pub kind: PayloadKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
}

impl Payload {
    pub fn agent_turn(message: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::AgentTurn,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn command(command: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::Command,
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn system_event(text: impl Into<String>) -> Self {
        Self {
            kind: PayloadKind::SystemEvent,
            text: text.into(),
            ..Default::default()
        }
    }

    /// Prompt for agent-turn payloads; `message` with `text` as the legacy
    /// fallback field.
    pub fn prompt(&self) -> &str {
        if self.message.is_empty() {
            &self.text
        } else {
            &self.message
        }
    }
}

// ──────────────────── Session target & delivery ────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    /// Shared `system` session.
    #[default]
    Main,
    /// Per-job `cron-isolated-<id>` session.
    Isolated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Send the job result to `(channel, to)`.
    Announce,
    /// Discard the result.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub mode: DeliveryMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
}

// ──────────────────── Job ────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(default)]
    pub next_run_at_ms: i64,
    #[serde(default)]
    pub last_run_at_ms: i64,
    /// "ok" | "error" | "" (never ran).
    #[serde(default)]
    pub last_status: String,
    #[serde(default)]
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: Schedule,
    #[serde(default)]
    pub session_target: SessionTarget,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Delivery>,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub delete_after_run: bool,
}

impl CronJob {
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            schedule,
            session_target: SessionTarget::Main,
            payload,
            delivery: None,
            state: JobState::default(),
            delete_after_run: false,
        }
    }
}

/// Options accepted by `Scheduler::add` beyond the mandatory fields.
#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    pub session_target: SessionTarget,
    pub delivery: Option<Delivery>,
    pub delete_after_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_serde_camel_case() {
        let mut job = CronJob::new("nightly", Schedule::cron("0 0 3 * * *"), Payload::agent_turn("report"));
        job.delete_after_run = true;
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"deleteAfterRun\":true"));
        assert!(json.contains("\"sessionTarget\":\"main\""));
        assert!(json.contains("\"kind\":\"agentTurn\""));

        let parsed: CronJob = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "nightly");
        assert_eq!(parsed.schedule.kind, ScheduleKind::Cron);
    }

    #[test]
    fn test_payload_kind_defaults_to_agent_turn() {
        // Legacy jobs carried no payload kind at all.
        let parsed: Payload = serde_json::from_str(r#"{"message":"do it"}"#).unwrap();
        assert_eq!(parsed.kind, PayloadKind::AgentTurn);
        assert_eq!(parsed.prompt(), "do it");
    }

    #[test]
    fn test_payload_prompt_falls_back_to_text() {
        let payload = Payload {
            kind: PayloadKind::AgentTurn,
            text: "from text".into(),
            ..Default::default()
        };
        assert_eq!(payload.prompt(), "from text");
    }

    #[test]
    fn test_schedule_serde_shapes() {
        let every: Schedule = serde_json::from_str(r#"{"kind":"every","everyMs":5000}"#).unwrap();
        assert_eq!(every.kind, ScheduleKind::Every);
        assert_eq!(every.every_ms, Some(5000));

        let at: Schedule = serde_json::from_str(r#"{"kind":"at","atMs":1700000000000}"#).unwrap();
        assert_eq!(at.kind, ScheduleKind::At);

        let cron: Schedule = serde_json::from_str(r#"{"kind":"cron","expr":"0 */5 * * * *"}"#).unwrap();
        assert_eq!(cron.expr.as_deref(), Some("0 */5 * * * *"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = CronJob::new("a", Schedule::every_ms(1000), Payload::default());
        let b = CronJob::new("b", Schedule::every_ms(1000), Payload::default());
        assert_ne!(a.id, b.id);
    }
}
