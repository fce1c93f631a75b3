//! Core types and utilities for denoising pretraining and transfer learning.
//!
//! This crate provides the error type, configuration structures, backend
//! aliases and CLI helpers shared across the workspace.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;

pub use backend::*;
pub use cli::*;
pub use config::*;
pub use error::{Error, Result};

/// Re-export commonly used burn types
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use burn::prelude::*;
}
