//! Shared wire types used by the aero control plane and node agents.

pub mod wire;
