//! Rendition - Adaptive bitrate transcoding and delivery
//!
//! Hexagonal Architecture:
//! - domain/: Pure business logic (quality ladder, hls, jobs, layout)
//! - ports/: Trait definitions (encoder, repository, source)
//! - adapters/: Concrete implementations (ffmpeg, sqlite, fs, http)
//! - application/: Generic services (orchestrator, delivery)
//! - config: Environment configuration
//! - error: Error taxonomy

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;

// Re-exports for convenience
pub use config::Config;
pub use domain::{hls, quality};
pub use error::{Error, Result};
