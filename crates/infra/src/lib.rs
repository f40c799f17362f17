//! Infrastructure layer: the job execution engine, its stores and config.

pub mod config;
pub mod engine;
pub mod jobs;

pub use config::EngineConfig;
pub use engine::Engine;
