//! Domain layer - Pure business logic.

// Output layout and manifest formats
pub mod hls;
pub mod layout;

// Job definitions and the quality ladder
pub mod jobs;
pub mod quality;
