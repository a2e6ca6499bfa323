//! Multi-host log query orchestration: per-host connection agents, query
//! fan-out with generation-based supersession, bounded-latency result
//! merging and fleet-state aggregation.

pub mod config;
pub mod engine;
pub mod file;
pub mod fleet_state;
mod host_agent;
pub mod merger;
pub mod registry;
pub mod scripted;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{FleetEngine, FleetHandle};
pub use merger::ResultMerger;
pub use registry::HostsFilter;
pub use transport::{HostTransport, QueryJob, QueryOutput, QueryStats, TransportFactory};
