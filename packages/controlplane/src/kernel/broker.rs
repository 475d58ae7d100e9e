//! In-process event broker.
//!
//! Three independent topic spaces (job id, account name for sessions,
//! account name for auth challenges), each a map of topic key to a
//! broadcast channel.
//! Publishing never blocks and never fails: with no subscribers the event is
//! discarded, and a subscriber that falls more than the buffer capacity
//! behind loses the oldest events, not the newest.
//!
//! Events are ephemeral. Nothing is persisted or replayed; delivery is
//! at-most-once to whoever is subscribed at publish time.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::common::time::rfc3339_millis;
use crate::common::{id, time};

/// Per-subscriber buffer capacity.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Wildcard key for the session and auth-challenge topic spaces.
pub const ALL_ACCOUNTS: &str = "all";

/// Names the SSE event type for a broker event.
pub trait BrokerEvent {
    fn kind(&self) -> &str;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub id: String,
    pub job_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(with = "rfc3339_millis")]
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl JobEvent {
    pub fn new(job_id: &str, event_type: &str, payload: Option<serde_json::Value>) -> Self {
        Self {
            id: id::new_id(),
            job_id: job_id.to_string(),
            event_type: event_type.to_string(),
            ts: time::now(),
            payload,
        }
    }
}

impl BrokerEvent for JobEvent {
    fn kind(&self) -> &str {
        &self.event_type
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: String,
    pub account_name: String,
    pub event_type: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(with = "rfc3339_millis")]
    pub ts: DateTime<Utc>,
}

impl BrokerEvent for SessionEvent {
    fn kind(&self) -> &str {
        &self.event_type
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthChallengeEvent {
    pub id: String,
    pub account_name: String,
    pub challenge_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(with = "rfc3339_millis")]
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl BrokerEvent for AuthChallengeEvent {
    fn kind(&self) -> &str {
        &self.challenge_type
    }
}

#[derive(Default)]
pub struct EventBroker {
    jobs: DashMap<String, broadcast::Sender<JobEvent>>,
    sessions: DashMap<String, broadcast::Sender<SessionEvent>>,
    challenges: DashMap<String, broadcast::Sender<AuthChallengeEvent>>,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a job event. Events without a job id (connection lifecycle
    /// notices) and events for jobs nobody watches are discarded.
    pub fn publish_job(&self, job_id: &str, event_type: &str, payload: Option<serde_json::Value>) {
        if job_id.is_empty() {
            return;
        }
        fan_out(&self.jobs, job_id, JobEvent::new(job_id, event_type, payload));
    }

    /// Publish a session event to the account's subscribers and the wildcard
    /// subscribers.
    pub fn publish_session(
        &self,
        account_name: &str,
        event_type: &str,
        state: &str,
        message: Option<String>,
    ) {
        let event = SessionEvent {
            id: id::new_id(),
            account_name: account_name.to_string(),
            event_type: event_type.to_string(),
            state: state.to_string(),
            message,
            ts: time::now(),
        };
        fan_out(&self.sessions, account_name, event.clone());
        fan_out(&self.sessions, ALL_ACCOUNTS, event);
    }

    /// Publish an auth challenge to the account's subscribers and the
    /// wildcard subscribers.
    pub fn publish_challenge(
        &self,
        account_name: &str,
        challenge_type: &str,
        message: Option<String>,
        job_id: Option<String>,
    ) {
        let event = AuthChallengeEvent {
            id: id::new_id(),
            account_name: account_name.to_string(),
            challenge_type: challenge_type.to_string(),
            message,
            ts: time::now(),
            job_id,
        };
        fan_out(&self.challenges, account_name, event.clone());
        fan_out(&self.challenges, ALL_ACCOUNTS, event);
    }

    pub fn subscribe_job(&self, job_id: &str) -> broadcast::Receiver<JobEvent> {
        subscribe(&self.jobs, job_id)
    }

    /// Subscribe to one account's session events, or pass [`ALL_ACCOUNTS`]
    /// for everything.
    pub fn subscribe_sessions(&self, key: &str) -> broadcast::Receiver<SessionEvent> {
        subscribe(&self.sessions, key)
    }

    pub fn subscribe_challenges(&self, key: &str) -> broadcast::Receiver<AuthChallengeEvent> {
        subscribe(&self.challenges, key)
    }

    /// Drop topic keys whose last subscriber has gone away.
    pub fn cleanup(&self) {
        self.jobs.retain(|_, tx| tx.receiver_count() > 0);
        self.sessions.retain(|_, tx| tx.receiver_count() > 0);
        self.challenges.retain(|_, tx| tx.receiver_count() > 0);
    }
}

fn subscribe<T: Clone>(
    map: &DashMap<String, broadcast::Sender<T>>,
    key: &str,
) -> broadcast::Receiver<T> {
    map.entry(key.to_string())
        .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
        .subscribe()
}

fn fan_out<T: Clone>(map: &DashMap<String, broadcast::Sender<T>>, key: &str, event: T) {
    let dead = match map.get(key) {
        // Send only errors when every receiver is gone.
        Some(tx) => tx.send(event).is_err(),
        None => return,
    };
    if dead {
        map.remove_if(key, |_, tx| tx.receiver_count() == 0);
    }
}
