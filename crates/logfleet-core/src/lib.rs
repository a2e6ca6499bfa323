pub mod error;
pub mod types;

pub use error::{EngineError, TransportError};
pub use types::{
    minute_key, FleetState, HostAgentState, HostId, HostSpec, LogMessage, MinuteKey, MinuteStat,
    QueryRequest, QueryResponse,
};
