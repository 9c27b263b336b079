//! Core types shared across all Strato provisioner crates
//!
//! This crate provides:
//! - The deferred-value substrate ([`Output`]) backing all cross-resource
//!   data flow
//! - The declaration facade over the orchestration engine SDK ([`Stack`])
//! - Configuration namespaces and the closed environment enum
//! - Common error types

pub mod error;
pub mod output;
pub mod settings;
pub mod stack;

// Re-export commonly used types
pub use error::{ProvisionError, ProvisionResult};
pub use output::{Output, OutputError, OutputResolver};
pub use settings::{Environment, LibrarySettings, ProviderSettings};
pub use stack::{Input, Inputs, ResourceDeclaration, ResourceHandle, Stack};

// Re-export external dependencies
pub use anyhow;
pub use futures;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;
