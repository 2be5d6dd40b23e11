//! RPC method registrations: `cron.*` on the scheduler, `notify.send` on
//! the bus.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use valet_bus::MessageBus;
use valet_cron::{AddJobOptions, Delivery, Payload, Schedule, Scheduler, SessionTarget};
use valet_types::OutboundMessage;

use crate::rpc::{RpcHandler, RpcServer};

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| format!("serialize failed: {e}"))
}

/// Params that identify a job by `id`, accepting the `jobId` alias.
#[derive(Debug, Default, Deserialize)]
struct IdParams {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "jobId")]
    job_id: String,
    #[serde(default)]
    enabled: bool,
}

impl IdParams {
    fn effective_id(&self) -> Result<&str, String> {
        let id = if self.id.is_empty() { &self.job_id } else { &self.id };
        if id.is_empty() {
            return Err("missing id".to_string());
        }
        Ok(id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddParams {
    #[serde(default)]
    name: String,
    schedule: Schedule,
    payload: Payload,
    #[serde(default)]
    session_target: SessionTarget,
    #[serde(default)]
    delivery: Option<Delivery>,
    #[serde(default)]
    delete_after_run: bool,
}

/// Register the `cron.*` method handlers.
pub async fn register_cron_handlers(server: &RpcServer, scheduler: Arc<Scheduler>) {
    // cron.list -> { jobs }
    {
        let scheduler = scheduler.clone();
        let handler: RpcHandler = Arc::new(move |_params| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                let jobs = scheduler.list().await;
                to_value(&json!({ "jobs": jobs }))
            })
        });
        server.register("cron.list", handler).await;
    }

    // cron.add -> the created job
    {
        let scheduler = scheduler.clone();
        let handler: RpcHandler = Arc::new(move |params| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                let p: AddParams =
                    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))?;
                if p.name.is_empty() {
                    return Err("missing name".to_string());
                }
                let job = scheduler
                    .add(
                        p.name,
                        p.schedule,
                        p.payload,
                        AddJobOptions {
                            session_target: p.session_target,
                            delivery: p.delivery,
                            delete_after_run: p.delete_after_run,
                        },
                    )
                    .await
                    .map_err(|e| format!("{e:#}"))?;
                to_value(&job)
            })
        });
        server.register("cron.add", handler).await;
    }

    // cron.remove -> { ok, id }
    {
        let scheduler = scheduler.clone();
        let handler: RpcHandler = Arc::new(move |params| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                let p: IdParams =
                    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))?;
                let id = p.effective_id()?.to_string();
                if !scheduler.remove(&id).await {
                    return Err(format!("job {id} not found"));
                }
                Ok(json!({ "ok": true, "id": id }))
            })
        });
        server.register("cron.remove", handler).await;
    }

    // cron.enable -> the updated job
    {
        let scheduler = scheduler.clone();
        let handler: RpcHandler = Arc::new(move |params| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                let p: IdParams =
                    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))?;
                let id = p.effective_id()?.to_string();
                let job = scheduler
                    .enable(&id, p.enabled)
                    .await
                    .map_err(|e| format!("{e:#}"))?;
                to_value(&job)
            })
        });
        server.register("cron.enable", handler).await;
    }

    // cron.run -> { ok, id }
    {
        let handler: RpcHandler = Arc::new(move |params| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                let p: IdParams =
                    serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))?;
                let id = p.effective_id()?.to_string();
                scheduler.run(&id).await.map_err(|e| format!("{e:#}"))?;
                Ok(json!({ "ok": true, "id": id }))
            })
        });
        server.register("cron.run", handler).await;
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotifyParams {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    message: String,
}

/// Register `notify.send`: push a message into a chat without touching the
/// agent. This is how skill scripts report progress mid-run.
pub async fn register_notify_handlers(server: &RpcServer, bus: Arc<MessageBus>) {
    let handler: RpcHandler = Arc::new(move |params| {
        let bus = bus.clone();
        Box::pin(async move {
            let mut p: NotifyParams =
                serde_json::from_value(params).map_err(|e| format!("invalid params: {e}"))?;
            if p.message.is_empty() {
                return Err("missing message".to_string());
            }
            if p.channel.is_empty() {
                p.channel = "telegram".to_string();
            }
            bus.publish_outbound(OutboundMessage::text(p.channel, p.chat_id, p.message))
                .await
                .map_err(|e| format!("{e:#}"))?;
            Ok(json!({ "ok": true }))
        })
    });
    server.register("notify.send", handler).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use tokio_util::sync::CancellationToken;
    use valet_bus::OutboundHandler;

    fn noop_runner() -> valet_cron::JobRunner {
        Arc::new(|_job| Box::pin(async { Ok("ran".to_string()) }))
    }

    async fn rpc_with_cron(dir: &tempfile::TempDir) -> (RpcServer, Arc<Scheduler>) {
        let scheduler = Arc::new(Scheduler::new(
            dir.path().join("jobs.json"),
            noop_runner(),
        ));
        let server = RpcServer::new();
        register_cron_handlers(&server, scheduler.clone()).await;
        (server, scheduler)
    }

    #[tokio::test]
    async fn test_cron_add_list_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = rpc_with_cron(&dir).await;

        let add = server
            .dispatch(
                r#"{"type":"req","id":"1","method":"cron.add","params":{
                    "name":"nightly",
                    "schedule":{"kind":"every","everyMs":60000},
                    "payload":{"kind":"command","command":"echo hi"}
                }}"#,
            )
            .await;
        assert!(add.ok, "{:?}", add.error);
        let job_id = add.payload.unwrap()["id"].as_str().unwrap().to_string();

        let list = server
            .dispatch(r#"{"type":"req","id":"2","method":"cron.list","params":{}}"#)
            .await;
        let jobs = list.payload.unwrap()["jobs"].as_array().unwrap().clone();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], job_id.as_str());

        let remove = server
            .dispatch(&format!(
                r#"{{"type":"req","id":"3","method":"cron.remove","params":{{"jobId":"{job_id}"}}}}"#
            ))
            .await;
        assert!(remove.ok);

        let list = server
            .dispatch(r#"{"type":"req","id":"4","method":"cron.list","params":{}}"#)
            .await;
        assert!(list.payload.unwrap()["jobs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cron_add_requires_name() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = rpc_with_cron(&dir).await;
        let resp = server
            .dispatch(
                r#"{"type":"req","id":"1","method":"cron.add","params":{
                    "schedule":{"kind":"every","everyMs":1000},
                    "payload":{}
                }}"#,
            )
            .await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().message.contains("missing name"));
    }

    #[tokio::test]
    async fn test_cron_enable_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let (server, scheduler) = rpc_with_cron(&dir).await;
        let job = scheduler
            .add("j", Schedule::every_ms(1000), Payload::default(), AddJobOptions::default())
            .await
            .unwrap();

        let resp = server
            .dispatch(&format!(
                r#"{{"type":"req","id":"1","method":"cron.enable","params":{{"id":"{}","enabled":false}}}}"#,
                job.id
            ))
            .await;
        assert!(resp.ok);
        assert_eq!(resp.payload.unwrap()["enabled"], false);
    }

    #[tokio::test]
    async fn test_cron_remove_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _) = rpc_with_cron(&dir).await;
        let resp = server
            .dispatch(r#"{"type":"req","id":"1","method":"cron.remove","params":{"id":"ghost"}}"#)
            .await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().message.contains("not found"));
    }

    #[tokio::test]
    async fn test_notify_send_enqueues_outbound() {
        // S5: notify.send produces ok:true and the outbound message appears.
        let bus = Arc::new(MessageBus::new(16));
        let server = RpcServer::new();
        register_notify_handlers(&server, bus.clone()).await;

        let seen: Arc<StdMutex<Vec<OutboundMessage>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler: OutboundHandler = Arc::new(move |msg| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(msg);
            })
        });
        bus.subscribe_outbound("telegram", handler).await;

        let cancel = CancellationToken::new();
        let dispatcher = {
            let bus = bus.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { bus.dispatch_outbound(cancel).await })
        };

        let resp = server
            .dispatch(
                r#"{"type":"req","id":"1","method":"notify.send","params":{"chatId":"7","message":"ping"}}"#,
            )
            .await;
        assert!(resp.ok);
        assert_eq!(resp.payload.unwrap()["ok"], true);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        dispatcher.await.unwrap();

        let sent = seen.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "telegram");
        assert_eq!(sent[0].chat_id, "7");
        assert_eq!(sent[0].content, "ping");
    }

    #[tokio::test]
    async fn test_notify_send_requires_message() {
        let bus = Arc::new(MessageBus::new(16));
        let server = RpcServer::new();
        register_notify_handlers(&server, bus).await;
        let resp = server
            .dispatch(r#"{"type":"req","id":"1","method":"notify.send","params":{"chatId":"7"}}"#)
            .await;
        assert!(!resp.ok);
        assert!(resp.error.unwrap().message.contains("missing message"));
    }
}
