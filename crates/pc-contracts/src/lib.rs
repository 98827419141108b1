//! # pc-contracts
//!
//! Contract validation for Paperclip RS.
//!
//! Contracts validate an attachment's pending metadata before the owning
//! record is saved. Failures are collected as field messages and surfaced
//! through the host's regular validation reporting.

pub mod attachments;
pub mod base;

pub use attachments::{AttachmentContract, AttachmentData, SizeRange, Validator};
pub use base::*;
