//! gpuadmit-core: Core types for GPU-aware task admission
//!
//! This crate provides the fundamental types used throughout gpuadmit:
//! - Resource quantities and request normalization
//! - Taints, tolerations and nodes
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod model;
pub mod resources;

pub use config::*;
pub use error::*;
pub use model::*;
pub use resources::*;
