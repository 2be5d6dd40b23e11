//! Scheduler: one tick loop, three schedule kinds, at-least-once execution
//! with post-run state writeback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use croner::Cron;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::CronStore;
use crate::{AddJobOptions, CronJob, Payload, Schedule, ScheduleKind};

/// Executes one job and returns its textual result.
///
/// Injected at construction; the scheduler releases its lock before calling
/// so the runner may call back into scheduler methods.
pub type JobRunner = Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<String>> + Send + Sync>;

struct CronEntry {
    cron: Cron,
    next_run: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    jobs: Vec<CronJob>,
    /// Parsed cron expressions keyed by job id. Jobs with invalid
    /// expressions stay in `jobs` but never get an entry here.
    entries: HashMap<String, CronEntry>,
}

pub struct Scheduler {
    store: CronStore,
    state: Mutex<State>,
    runner: JobRunner,
    cancel: std::sync::Mutex<Option<CancellationToken>>,
}

/// Parse a six-field cron expression (second minute hour day month weekday).
pub fn parse_expression(expr: &str) -> Result<Cron> {
    Cron::new(expr)
        .with_seconds_required()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid cron expression {expr:?}: {e}"))
}

fn next_occurrence(cron: &Cron) -> Result<DateTime<Utc>> {
    cron.find_next_occurrence(&Utc::now(), false)
        .map_err(|e| anyhow::anyhow!("no next occurrence: {e}"))
}

impl Scheduler {
    pub fn new(store_path: impl Into<PathBuf>, runner: JobRunner) -> Self {
        Self {
            store: CronStore::new(store_path),
            state: Mutex::new(State::default()),
            runner,
            cancel: std::sync::Mutex::new(None),
        }
    }

    /// Load the store, register cron expressions, and spawn the tick loop.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let jobs = match self.store.load() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("failed to load cron store: {e:#}");
                Vec::new()
            }
        };

        {
            let mut state = self.state.lock().await;
            state.jobs = jobs;
            let ids: Vec<String> = state
                .jobs
                .iter()
                .filter(|j| j.enabled && j.schedule.kind == ScheduleKind::Cron)
                .map(|j| j.id.clone())
                .collect();
            for id in ids {
                register_entry(&mut state, &id);
            }
            info!(jobs = state.jobs.len(), "scheduler started");
        }

        *self.cancel.lock().unwrap() = Some(cancel.clone());

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => scheduler.tick().await,
                }
            }
            info!("scheduler stopped");
        });

        Ok(())
    }

    /// Stop the tick loop. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    async fn tick(self: &Arc<Self>) {
        let now_ms = Utc::now().timestamp_millis();
        let now = Utc::now();
        let mut inline: Vec<CronJob> = Vec::new();
        let mut spawned: Vec<CronJob> = Vec::new();

        {
            let mut state = self.state.lock().await;
            for job in state.jobs.iter_mut() {
                if !job.enabled {
                    continue;
                }
                match job.schedule.kind {
                    ScheduleKind::Every => {
                        let every_ms = job.schedule.every_ms.unwrap_or(0);
                        if every_ms > 0 && now_ms >= job.state.last_run_at_ms + every_ms {
                            inline.push(job.clone());
                        }
                    }
                    ScheduleKind::At => {
                        let at_ms = job.schedule.at_ms.unwrap_or(0);
                        if at_ms > 0 && now_ms >= at_ms {
                            // Disabled before dispatch: an at-job fires at
                            // most once even though last-run writeback
                            // happens after execution.
                            job.enabled = false;
                            inline.push(job.clone());
                        }
                    }
                    ScheduleKind::Cron => {}
                }
            }

            let due_ids: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.next_run <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in due_ids {
                let advanced = match state.entries.get_mut(&id) {
                    Some(entry) => match next_occurrence(&entry.cron) {
                        Ok(next) => {
                            entry.next_run = next;
                            Some(next.timestamp_millis())
                        }
                        Err(e) => {
                            warn!(job = %id, "cron advance failed, unregistering: {e:#}");
                            None
                        }
                    },
                    None => None,
                };
                if advanced.is_none() {
                    state.entries.remove(&id);
                }
                if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id && j.enabled) {
                    job.state.next_run_at_ms = advanced.unwrap_or(0);
                    spawned.push(job.clone());
                }
            }
        }

        // Interval and one-shot jobs run serially on the tick loop; cron
        // jobs run concurrently, as the expression engine's own workers did.
        for job in inline {
            self.clone().execute_job(job).await;
        }
        for job in spawned {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.execute_job(job).await });
        }
    }

    async fn execute_job(self: Arc<Self>, job: CronJob) {
        info!(name = %job.name, id = %job.id, "executing job");
        let result = (self.runner)(job.clone()).await;

        let mut state = self.state.lock().await;
        if let Some(idx) = state.jobs.iter().position(|j| j.id == job.id) {
            let stored = &mut state.jobs[idx];
            stored.state.last_run_at_ms = Utc::now().timestamp_millis();
            match &result {
                Ok(output) => {
                    stored.state.last_status = "ok".into();
                    stored.state.last_error.clear();
                    info!(name = %job.name, result = %truncate(output, 100), "job ok");
                }
                Err(e) => {
                    stored.state.last_status = "error".into();
                    stored.state.last_error = format!("{e:#}");
                    warn!(name = %job.name, "job error: {e:#}");
                }
            }
            if stored.delete_after_run {
                state.jobs.remove(idx);
                state.entries.remove(&job.id);
            }
        }
        if let Err(e) = self.store.save(&state.jobs) {
            warn!("failed to persist cron store: {e:#}");
        }
    }

    // ──────────────────── Public operations ────────────────────

    pub async fn add(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        payload: Payload,
        opts: AddJobOptions,
    ) -> Result<CronJob> {
        match schedule.kind {
            ScheduleKind::Every => {
                if schedule.every_ms.unwrap_or(0) <= 0 {
                    bail!("every-schedule requires everyMs > 0");
                }
            }
            ScheduleKind::At => {
                if schedule.at_ms.unwrap_or(0) <= 0 {
                    bail!("at-schedule requires atMs > 0");
                }
            }
            ScheduleKind::Cron => {
                if schedule.expr.as_deref().unwrap_or("").is_empty() {
                    bail!("cron-schedule requires an expression");
                }
            }
        }

        let mut job = CronJob::new(name, schedule, payload);
        job.session_target = opts.session_target;
        job.delivery = opts.delivery;
        job.delete_after_run = opts.delete_after_run;

        let mut state = self.state.lock().await;
        state.jobs.push(job.clone());
        if job.schedule.kind == ScheduleKind::Cron {
            // Registration failure is logged, not returned: the job stays
            // stored and becomes live once its expression is fixed.
            register_entry(&mut state, &job.id);
        }
        self.store.save(&state.jobs)?;

        let stored = state.jobs.last().cloned().unwrap_or(job);
        Ok(stored)
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != id);
        if state.jobs.len() == before {
            return false;
        }
        state.entries.remove(id);
        if let Err(e) = self.store.save(&state.jobs) {
            warn!("failed to persist cron store: {e:#}");
        }
        true
    }

    pub async fn enable(&self, id: &str, enabled: bool) -> Result<CronJob> {
        let mut state = self.state.lock().await;
        let Some(idx) = state.jobs.iter().position(|j| j.id == id) else {
            bail!("job {id} not found");
        };
        state.jobs[idx].enabled = enabled;
        let is_cron = state.jobs[idx].schedule.kind == ScheduleKind::Cron;
        if is_cron {
            if enabled {
                register_entry(&mut state, id);
            } else {
                state.entries.remove(id);
            }
        }
        self.store.save(&state.jobs)?;
        Ok(state.jobs[idx].clone())
    }

    /// Snapshot of all jobs.
    pub async fn list(&self) -> Vec<CronJob> {
        self.state.lock().await.jobs.clone()
    }

    /// Run a job immediately, regardless of its schedule. The execution is
    /// asynchronous; state writeback follows the normal path.
    pub async fn run(self: &Arc<Self>, id: &str) -> Result<()> {
        let job = {
            let state = self.state.lock().await;
            state
                .jobs
                .iter()
                .find(|j| j.id == id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("job {id} not found"))?
        };
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.execute_job(job).await });
        Ok(())
    }
}

fn register_entry(state: &mut State, id: &str) {
    let Some(idx) = state.jobs.iter().position(|j| j.id == id) else {
        return;
    };
    let Some(expr) = state.jobs[idx].schedule.expr.clone() else {
        warn!(name = %state.jobs[idx].name, "cron job without expression, not registering");
        return;
    };
    match parse_expression(&expr).and_then(|cron| {
        let next = next_occurrence(&cron)?;
        Ok((cron, next))
    }) {
        Ok((cron, next)) => {
            state.jobs[idx].state.next_run_at_ms = next.timestamp_millis();
            state
                .entries
                .insert(id.to_string(), CronEntry { cron, next_run: next });
        }
        Err(e) => {
            warn!(name = %state.jobs[idx].name, expr = %expr, "failed to register cron job: {e:#}");
        }
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
