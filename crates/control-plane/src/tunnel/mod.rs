pub mod registry;
pub mod service;

pub use registry::{
    AgentCommand, BinaryStream, StreamEvent, TunnelRegistry, TunnelRegistrySnapshot, TunnelStatus,
};
