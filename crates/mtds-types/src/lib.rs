//! Core type definitions for MTDS
//!
//! This crate contains the fundamental keys, element types, configuration and
//! error definitions shared by the memory, storage and controller crates. It
//! is kept lightweight to avoid circular dependencies.

pub mod config;
pub mod devices;
pub mod errors;
pub mod ids;

// Re-export commonly used types
pub use config::*;
pub use devices::*;
pub use errors::*;
pub use ids::*;

/// Result type used throughout MTDS
pub type Result<T> = std::result::Result<T, MtdsError>;
