//! Ports - Trait definitions implemented by adapters.

pub mod encoder;
pub mod repository;
pub mod source;
