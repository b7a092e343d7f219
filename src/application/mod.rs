//! Application layer - Generic services that use ports.

pub mod delivery;
pub mod orchestrator;
