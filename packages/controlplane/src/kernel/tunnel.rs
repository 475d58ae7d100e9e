//! The agent tunnel: one long-lived framed WebSocket session per agent.
//!
//! The first frame must be a `hello` matching the connect parameters; after
//! that the session is a send worker draining the agent's queue and a read
//! loop feeding task results into the store. Every teardown path (clean
//! close, cancellation, read error, write error) unregisters the agent.

use std::borrow::Cow;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::protocol::{HelloBody, WsMessage};
use super::Kernel;
use crate::common::error::StoreError;

/// Connect parameters carried in the upgrade request's query string.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelParams {
    pub agent_id: String,
    pub region: String,
}

/// Drive one agent session to completion.
pub async fn run_tunnel(kernel: Kernel, params: TunnelParams, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let hello = match read_hello(&mut stream, &params).await {
        Some(hello) => hello,
        None => {
            let close = Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: Cow::from("hello required"),
            }));
            let _ = sink.send(close).await;
            warn!(agent_id = %params.agent_id, "agent rejected: hello required");
            return;
        }
    };

    let agent = kernel.registry.register(hello);
    let cancel = agent.cancel_token();
    info!(agent_id = %agent.agent_id, region = %agent.region, "agent connected");
    kernel.broker.publish_job(
        "",
        "agent.connected",
        Some(json!({ "agentId": agent.agent_id, "region": agent.region })),
    );

    let send_worker = {
        let agent = agent.clone();
        tokio::spawn(async move {
            while let Some(msg) = agent.next_outbound().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(agent_id = %agent.agent_id, error = %err, "dropped unserializable frame");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    agent.cancel_token().cancel();
                    break;
                }
            }
            let _ = sink.close().await;
        })
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&kernel, &text).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pings are answered by the transport; anything else is noise.
                Some(Ok(_)) => {}
            },
        }
    }

    cancel.cancel();
    kernel.registry.unregister(&agent);
    let _ = send_worker.await;
    info!(agent_id = %agent.agent_id, region = %agent.region, "agent disconnected");
    kernel.broker.publish_job(
        "",
        "agent.disconnected",
        Some(json!({ "agentId": agent.agent_id, "region": agent.region })),
    );
}

/// Wait for the agent's first meaningful frame and validate it against the
/// connect parameters. Returns `None` on any violation.
async fn read_hello(
    stream: &mut SplitStream<WebSocket>,
    params: &TunnelParams,
) -> Option<HelloBody> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => {
                return match serde_json::from_str::<WsMessage>(&text) {
                    Ok(msg) => accept_hello(params, msg),
                    Err(_) => None,
                };
            }
            // Control frames may precede the hello.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            _ => return None,
        }
    }
}

fn accept_hello(params: &TunnelParams, msg: WsMessage) -> Option<HelloBody> {
    match msg {
        WsMessage::Hello { hello }
            if hello.agent_id == params.agent_id && hello.region == params.region =>
        {
            Some(hello)
        }
        _ => None,
    }
}

/// Process one inbound frame. Only `task_result` matters; everything else
/// that parses is tolerated and ignored.
pub(crate) async fn handle_frame(kernel: &Kernel, text: &str) {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(error = %err, "unparseable agent frame dropped");
            return;
        }
    };

    match msg {
        WsMessage::TaskResult { task_result } => {
            match kernel
                .store
                .set_task_result(&task_result.task_id, task_result.success)
                .await
            {
                Ok((task, job)) => {
                    kernel.broker.publish_job(
                        &task.job_id,
                        "task.finished",
                        Some(json!({
                            "taskId": task.id,
                            "success": task_result.success,
                            "job": job.status,
                        })),
                    );
                }
                // The job may have been purged since dispatch; drop silently.
                Err(StoreError::NotFound(_)) => {
                    debug!(task_id = %task_result.task_id, "result for unknown task dropped");
                }
                Err(err) => {
                    error!(task_id = %task_result.task_id, error = %err, "failed to record task result");
                }
            }
        }
        WsMessage::Hello { .. } | WsMessage::Task { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::{JobStatus, NewJob, TaskStatus};
    use crate::kernel::testing;

    fn params() -> TunnelParams {
        TunnelParams { agent_id: "a1".into(), region: "eu".into() }
    }

    fn hello_msg(agent_id: &str, region: &str) -> WsMessage {
        WsMessage::Hello {
            hello: HelloBody {
                agent_id: agent_id.into(),
                region: region.into(),
                capabilities: Default::default(),
                meta: Default::default(),
            },
        }
    }

    #[test]
    fn hello_must_match_connect_params() {
        assert!(accept_hello(&params(), hello_msg("a1", "eu")).is_some());
        assert!(accept_hello(&params(), hello_msg("a2", "eu")).is_none());
        assert!(accept_hello(&params(), hello_msg("a1", "us")).is_none());
    }

    #[test]
    fn non_hello_first_frame_is_rejected() {
        let msg: WsMessage = serde_json::from_str(
            r#"{"type":"task_result","taskResult":{"taskId":"t1","success":true}}"#,
        )
        .unwrap();
        assert!(accept_hello(&params(), msg).is_none());
    }

    #[tokio::test]
    async fn task_result_frame_finishes_task_and_publishes() {
        let kernel = testing::kernel().await;
        let created = kernel
            .store
            .create_job(NewJob {
                action: "ping".into(),
                targets: vec!["acct-1".into()],
                ..NewJob::default()
            })
            .await
            .unwrap();
        let claimed = kernel.store.claim_next_task("").await.unwrap().unwrap();
        let mut rx = kernel.broker.subscribe_job(&created.job.id);

        let frame = format!(
            r#"{{"type":"task_result","taskResult":{{"taskId":"{}","success":true}}}}"#,
            claimed.id
        );
        handle_frame(&kernel, &frame).await;

        let fetched = kernel.store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Finished);
        assert_eq!(fetched.job.status, JobStatus::Finished);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task.finished");
        let payload = event.payload.unwrap();
        assert_eq!(payload["success"], true);
        assert_eq!(payload["job"], "finished");
    }

    #[tokio::test]
    async fn result_for_unknown_task_is_dropped() {
        let kernel = testing::kernel().await;
        let frame = r#"{"type":"task_result","taskResult":{"taskId":"deadbeef","success":true}}"#;
        // Must not error or publish anything.
        handle_frame(&kernel, frame).await;
    }

    #[tokio::test]
    async fn irrelevant_and_malformed_frames_are_ignored() {
        let kernel = testing::kernel().await;
        handle_frame(&kernel, r#"{"type":"hello","hello":{"agentId":"a1","region":"eu"}}"#).await;
        handle_frame(&kernel, r#"{"type":"metrics","metrics":{}}"#).await;
        handle_frame(&kernel, "not json").await;
    }
}
