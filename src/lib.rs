// Core modules
pub mod config;
pub mod db;
pub mod dispatch;
pub mod exchange;
pub mod ingest;
pub mod models;
pub mod risk;
pub mod server;

// Re-export commonly used types
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
