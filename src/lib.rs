// src/lib.rs
pub mod config;
pub mod conn;
pub mod error;
pub mod files;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod syscalls;
pub mod table;

// Re-exports for users
pub use config::Config;
pub use error::{EmberError, EmberResult};
pub use server::{Server, ServerHandle};
