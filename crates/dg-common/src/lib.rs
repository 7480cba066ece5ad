//! devguard common types, identity model, and errors.
//!
//! This crate provides foundational types shared by the guardian core and
//! its host integrations:
//! - Identity field model (`TargetIdentity`, field name constants)
//! - Typed guardian configuration validated at deserialization time
//! - Process handle and execution mode types
//! - Common error types with stable codes
//! - Output format specifications

pub mod config;
pub mod error;
pub mod id;
pub mod identity;
pub mod output;

pub use config::{FeatureFlags, GuardianConfig, GuardianMode, IdeVariant, ProcessHandle};
pub use error::{Error, ErrorCategory, Result};
pub use id::{ProcessId, RunId};
pub use identity::{IdentityFields, TargetIdentity};
pub use output::OutputFormat;

/// Schema version for the guardian config file.
pub const CONFIG_SCHEMA_VERSION: &str = "1.0.0";
