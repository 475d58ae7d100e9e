//! Registry of connected agents.
//!
//! Each entry owns the agent's declared identity and a bounded outbound
//! queue drained in order by that agent's send worker. The queue drops the
//! oldest frame when full: the newest dispatch is the most relevant, and a
//! stalled transport must never block the dispatcher.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::time;
use crate::common::time::rfc3339_millis;
use crate::kernel::protocol::{HelloBody, WsMessage};
use crate::kernel::store::Task;

/// Outbound frames buffered per agent.
pub const SEND_QUEUE_CAPACITY: usize = 1024;

/// Bounded FIFO with drop-oldest eviction. `mpsc` cannot evict, so this is a
/// ring under a mutex with a `Notify` to wake the single consumer.
struct SendQueue {
    inner: Mutex<VecDeque<WsMessage>>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, msg: WsMessage) {
        {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() == self.capacity {
                queue.pop_front();
                debug!("send queue full, dropped oldest frame");
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<WsMessage> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    async fn pop(&self) -> WsMessage {
        loop {
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            self.notify.notified().await;
        }
    }
}

/// One connected agent.
pub struct ConnectedAgent {
    pub agent_id: String,
    pub region: String,
    pub capabilities: HashMap<String, bool>,
    pub meta: HashMap<String, String>,
    pub connected_at: DateTime<Utc>,
    queue: SendQueue,
    cancel: CancellationToken,
}

impl ConnectedAgent {
    /// Queue an outbound frame. Returns false once the agent's session is
    /// shutting down; otherwise the frame is accepted (evicting the oldest
    /// one when the buffer is full).
    pub fn enqueue(&self, msg: WsMessage) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.queue.push(msg);
        true
    }

    /// Next frame for the send worker, or `None` once the session is
    /// canceled.
    pub async fn next_outbound(&self) -> Option<WsMessage> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            msg = self.queue.pop() => Some(msg),
        }
    }

    /// Non-blocking variant of [`next_outbound`](Self::next_outbound).
    pub fn try_next_outbound(&self) -> Option<WsMessage> {
        self.queue.try_pop()
    }

    /// Cancellation signal shared by the tunnel's read loop and send worker.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: self.agent_id.clone(),
            region: self.region.clone(),
            capabilities: self.capabilities.clone(),
            meta: self.meta.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Wire-facing snapshot of a registry entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub region: String,
    pub capabilities: HashMap<String, bool>,
    pub meta: HashMap<String, String>,
    #[serde(with = "rfc3339_millis")]
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<String, Arc<ConnectedAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly-connected agent, replacing (and canceling) any prior
    /// entry under the same agent id.
    pub fn register(&self, hello: HelloBody) -> Arc<ConnectedAgent> {
        let entry = Arc::new(ConnectedAgent {
            agent_id: hello.agent_id,
            region: hello.region,
            capabilities: hello.capabilities,
            meta: hello.meta,
            connected_at: time::now(),
            queue: SendQueue::new(SEND_QUEUE_CAPACITY),
            cancel: CancellationToken::new(),
        });
        if let Some(previous) = self.agents.insert(entry.agent_id.clone(), entry.clone()) {
            previous.cancel.cancel();
        }
        entry
    }

    /// Remove an agent's entry. A stale unregister (the torn-down session of
    /// an agent that has already reconnected) leaves the new entry in place,
    /// so a double unregister is harmless.
    pub fn unregister(&self, entry: &Arc<ConnectedAgent>) {
        entry.cancel.cancel();
        self.agents
            .remove_if(&entry.agent_id, |_, current| Arc::ptr_eq(current, entry));
    }

    /// Current entries, sorted by region then agent id.
    pub fn list(&self) -> Vec<Arc<ConnectedAgent>> {
        let mut entries: Vec<_> = self.agents.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| {
            (a.region.as_str(), a.agent_id.as_str()).cmp(&(b.region.as_str(), b.agent_id.as_str()))
        });
        entries
    }

    /// Distinct regions with at least one connected agent, sorted.
    pub fn regions(&self) -> Vec<String> {
        let regions: BTreeSet<String> =
            self.agents.iter().map(|e| e.value().region.clone()).collect();
        regions.into_iter().collect()
    }

    /// Some currently-connected agent in `region`, or `None`. The choice is
    /// deterministic (smallest agent id) so tests and operators can predict
    /// placement; a smarter policy can replace this without changing the
    /// contract.
    pub fn pick(&self, region: &str) -> Option<Arc<ConnectedAgent>> {
        self.agents
            .iter()
            .filter(|e| e.value().region == region)
            .min_by(|a, b| a.value().agent_id.cmp(&b.value().agent_id))
            .map(|e| e.value().clone())
    }

    /// Queue a task-delivery frame for `agent`.
    pub fn enqueue_task(&self, agent: &ConnectedAgent, task: Task) -> bool {
        agent.enqueue(WsMessage::Task { task })
    }
}
