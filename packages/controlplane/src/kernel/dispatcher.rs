//! Background dispatch loop.
//!
//! Every tick: requeue tasks whose lease expired, then for each region with
//! a connected agent claim queued tasks and hand them to an agent's send
//! queue. Per-task failures are absorbed and published as events; the loop
//! only exits on shutdown.
//!
//! Delivery is at-least-once: a crash between claim and enqueue (or between
//! enqueue and transmission) leaves a `Running` task that the next lease
//! sweep reclaims. Agents must treat tasks idempotently by task id.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Kernel;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick: Duration,
    /// How long a claimed task may sit untouched before it is reclaimed.
    pub lease: Duration,
    /// Claim cap per region per tick, to bound tail latency from one busy
    /// region.
    pub per_region_batch: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(250),
            lease: Duration::from_secs(300),
            per_region_batch: 25,
        }
    }
}

pub struct Dispatcher {
    kernel: Kernel,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(kernel: Kernel, config: DispatcherConfig) -> Self {
        Self { kernel, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            lease_secs = self.config.lease.as_secs(),
            "dispatcher starting"
        );
        let mut interval = tokio::time::interval(self.config.tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        info!("dispatcher stopped");
    }

    pub(crate) async fn tick(&self) {
        match self.kernel.store.requeue_stale_tasks(self.config.lease).await {
            Ok(0) => {}
            Ok(count) => info!(count, "requeued stale running tasks"),
            Err(err) => error!(error = %err, "lease sweep failed"),
        }

        for region in self.kernel.registry.regions() {
            self.dispatch_region(&region).await;
        }
    }

    async fn dispatch_region(&self, region: &str) {
        for _ in 0..self.config.per_region_batch {
            let task = match self.kernel.store.claim_next_task(region).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(err) => {
                    error!(region, error = %err, "claim failed");
                    break;
                }
            };

            // The agent can disconnect between the region scan and this pick.
            let Some(agent) = self.kernel.registry.pick(region) else {
                self.requeue(&task.id).await;
                self.kernel.broker.publish_job(
                    &task.job_id,
                    "task.dispatch_failed",
                    Some(json!({ "taskId": task.id, "error": "no agent available" })),
                );
                break;
            };

            let task_id = task.id.clone();
            let job_id = task.job_id.clone();
            if !self.kernel.registry.enqueue_task(&agent, task) {
                self.requeue(&task_id).await;
                self.kernel.broker.publish_job(
                    &job_id,
                    "task.enqueue_failed",
                    Some(json!({ "taskId": task_id, "agentId": agent.agent_id })),
                );
                break;
            }

            debug!(task_id = %task_id, agent_id = %agent.agent_id, region, "task dispatched");
            self.kernel.broker.publish_job(
                &job_id,
                "task.dispatched",
                Some(json!({ "taskId": task_id, "agentId": agent.agent_id })),
            );
        }
    }

    async fn requeue(&self, task_id: &str) {
        if let Err(err) = self.kernel.store.requeue_task(task_id).await {
            error!(task_id, error = %err, "requeue failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::protocol::{HelloBody, WsMessage};
    use crate::kernel::store::{JobStatus, NewJob, TaskStatus};
    use crate::kernel::testing;

    fn hello(agent_id: &str, region: &str) -> HelloBody {
        HelloBody {
            agent_id: agent_id.to_string(),
            region: region.to_string(),
            capabilities: Default::default(),
            meta: Default::default(),
        }
    }

    fn new_job(region: &str, targets: &[&str]) -> NewJob {
        NewJob {
            action: "ping".into(),
            region: region.into(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..NewJob::default()
        }
    }

    fn dispatcher(kernel: Kernel) -> Dispatcher {
        Dispatcher::new(kernel, DispatcherConfig::default())
    }

    #[tokio::test]
    async fn tick_dispatches_to_region_agent() {
        let kernel = testing::kernel().await;
        let agent = kernel.registry.register(hello("a1", "local"));
        let created = kernel.store.create_job(new_job("local", &["acct-1"])).await.unwrap();
        let mut rx = kernel.broker.subscribe_job(&created.job.id);

        dispatcher(kernel.clone()).tick().await;

        // Task is running with attempt 1 and the frame is queued for a1.
        let fetched = kernel.store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Running);
        assert_eq!(fetched.tasks[0].attempt, 1);
        match agent.try_next_outbound().unwrap() {
            WsMessage::Task { task } => assert_eq!(task.id, fetched.tasks[0].id),
            other => panic!("unexpected frame: {other:?}"),
        }

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task.dispatched");
        assert_eq!(event.payload.unwrap()["agentId"], "a1");
    }

    #[tokio::test]
    async fn tick_without_region_agent_leaves_task_queued() {
        let kernel = testing::kernel().await;
        let created = kernel.store.create_job(new_job("eu", &["acct-1"])).await.unwrap();

        dispatcher(kernel.clone()).tick().await;

        let fetched = kernel.store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Queued);
        assert_eq!(fetched.job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn enqueue_failure_requeues_and_publishes() {
        let kernel = testing::kernel().await;
        let agent = kernel.registry.register(hello("a1", "local"));
        // Dead send worker: the entry is still registered but rejects frames.
        agent.cancel_token().cancel();

        let created = kernel.store.create_job(new_job("local", &["acct-1"])).await.unwrap();
        let mut rx = kernel.broker.subscribe_job(&created.job.id);

        dispatcher(kernel.clone()).tick().await;

        let fetched = kernel.store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Queued);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "task.enqueue_failed");
        assert_eq!(event.payload.unwrap()["agentId"], "a1");
    }

    #[tokio::test]
    async fn per_region_batch_caps_claims() {
        let kernel = testing::kernel().await;
        let agent = kernel.registry.register(hello("a1", "local"));

        let targets: Vec<String> = (0..30).map(|i| format!("acct-{i}")).collect();
        let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();
        let created = kernel.store.create_job(new_job("local", &target_refs)).await.unwrap();

        dispatcher(kernel.clone()).tick().await;

        let fetched = kernel.store.get_job(&created.job.id).await.unwrap();
        let running = fetched.tasks.iter().filter(|t| t.status == TaskStatus::Running).count();
        let queued = fetched.tasks.iter().filter(|t| t.status == TaskStatus::Queued).count();
        assert_eq!(running, 25);
        assert_eq!(queued, 5);

        let mut frames = 0;
        while agent.try_next_outbound().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 25);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_then_redispatched() {
        let kernel = testing::kernel().await;
        kernel.registry.register(hello("a1", "local"));
        let created = kernel.store.create_job(new_job("local", &["acct-1"])).await.unwrap();

        let dispatcher = Dispatcher::new(
            kernel.clone(),
            DispatcherConfig { lease: Duration::from_millis(0), ..DispatcherConfig::default() },
        );

        dispatcher.tick().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        // Agent never replied; the zero lease reclaims and redispatches.
        dispatcher.tick().await;

        let fetched = kernel.store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Running);
        assert_eq!(fetched.tasks[0].attempt, 2);
    }

    #[tokio::test]
    async fn empty_region_tasks_dispatch_to_any_agent() {
        let kernel = testing::kernel().await;
        kernel.registry.register(hello("a1", "eu"));
        let created = kernel.store.create_job(new_job("", &["acct-1"])).await.unwrap();

        dispatcher(kernel.clone()).tick().await;

        let fetched = kernel.store.get_job(&created.job.id).await.unwrap();
        assert_eq!(fetched.tasks[0].status, TaskStatus::Running);
    }
}
