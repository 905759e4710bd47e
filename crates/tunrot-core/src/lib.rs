//! tunrot Core Library
//!
//! Shared functionality for the tunnel rotation daemon:
//! - Configuration resolution (defaults, TOML file, environment)
//! - Traffic classifier policy (protected vs rotated)
//! - Common error types
//! - Tracing initialisation

pub mod classifier;
pub mod config;
pub mod error;
pub mod tracing_init;

pub use classifier::{ClassifierError, Tag, TrafficClassifier};
pub use config::Config;
pub use error::{Error, Result};
