//! Control plane for the Steam automation platform.
//!
//! Tenants submit jobs over HTTP; the control plane fans each job into
//! per-target tasks, leases them out to regional agents over long-lived
//! WebSocket tunnels, and streams progress back as server-sent events.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::Config;
