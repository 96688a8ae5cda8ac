// Core modules
pub mod config;
pub mod dispatch;
pub mod exchange;
pub mod execution;
pub mod models;
pub mod position;
pub mod signal;
pub mod strategy;

// Re-export commonly used types
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
