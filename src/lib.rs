//! Drover — fleet management and telemetry pipeline for reverse-proxy
//! hosts.
//!
//! Two processes share this crate:
//!
//! - `drover-agent` ([`agent`]): runs on every monitored host, scrapes
//!   the proxy status endpoint, tails its logs, samples the system, and
//!   streams everything through a durable WAL ([`wal`]) to the gateway.
//! - `drover-gateway` ([`gateway`]): terminates agent streams, maintains
//!   the fleet registry, routes commands, and batches telemetry into
//!   downstream sinks.
//!
//! The wire protocol lives in [`proto`]; both sides speak length-prefixed
//! JSON frames over TCP.

pub mod agent;
pub mod config;
pub mod gateway;
pub mod identity;
pub mod proto;
pub mod retry;
pub mod wal;

pub use config::{AgentConfig, GatewayConfig};
