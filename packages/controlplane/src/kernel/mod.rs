//! Domain subsystems: the job store, event broker, agent registry, agent
//! tunnel, dispatcher and the tunnel wire protocol.

pub mod broker;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod tunnel;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;

/// Shared handles to every subsystem. Cloning is cheap; all state lives
/// behind the `Arc`s.
#[derive(Clone)]
pub struct Kernel {
    pub store: Arc<store::JobStore>,
    pub broker: Arc<broker::EventBroker>,
    pub registry: Arc<registry::AgentRegistry>,
    pub config: Arc<Config>,
}

impl Kernel {
    pub async fn new(config: Config) -> Result<Self> {
        let store = store::JobStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open job store at {}", config.db_path))?;
        Ok(Self {
            store: Arc::new(store),
            broker: Arc::new(broker::EventBroker::new()),
            registry: Arc::new(registry::AgentRegistry::new()),
            config: Arc::new(config),
        })
    }
}
