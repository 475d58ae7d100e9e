//! Framed messages exchanged over the agent tunnel.
//!
//! One JSON object per frame, tagged by `type`. Only `hello` is accepted as
//! an agent's first frame, only `task` is ever sent to an agent, and only
//! `task_result` is consumed from one. Unknown `type` strings fail to parse;
//! tolerance for known-but-irrelevant frames lives in the tunnel, not here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::time::rfc3339_millis_opt;
use crate::kernel::store::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Hello {
        hello: HelloBody,
    },
    Task {
        task: Task,
    },
    TaskResult {
        #[serde(rename = "taskResult")]
        task_result: TaskResultBody,
    },
}

/// An agent's self-declaration, required as the first frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloBody {
    pub agent_id: String,
    pub region: String,
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// An agent's report on one finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultBody {
    pub task_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, with = "rfc3339_millis_opt", skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
