//! # pc-core
//!
//! Core types, traits, and configuration for Paperclip RS.
//!
//! This crate provides the foundational building blocks used by the other crates:
//! - Validation error collection (`ValidationErrors`)
//! - The host record traits (`Identifiable`, `Attachable`)
//! - Persisted column types for attachment fields
//! - Process-wide attachment configuration

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{AttachmentSettings, ConfigError};
pub use error::*;
pub use traits::*;
pub use types::*;
