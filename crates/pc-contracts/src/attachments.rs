//! Attachment validators
//!
//! Each validator is a pure function of the attachment's metadata returning
//! an optional error message. The contract runs all of them and keys the
//! messages by the attachment field name.

use std::ops::RangeInclusive;

use pc_core::error::ValidationErrors;
use serde::{Deserialize, Serialize};

use crate::base::{Contract, ValidationResult};

/// Metadata a validator can inspect
pub trait AttachmentData {
    /// Field name the messages are reported under
    fn field_name(&self) -> &str;
    fn file_name(&self) -> Option<&str>;
    fn content_type(&self) -> Option<&str>;
    fn file_size(&self) -> Option<u64>;

    fn has_file(&self) -> bool {
        self.file_name().is_some_and(|name| !name.is_empty())
    }
}

/// Inclusive byte size bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: u64,
    /// `None` means unbounded
    pub max: Option<u64>,
}

impl SizeRange {
    /// A range no size falls in
    pub const EMPTY: Self = Self { min: 1, max: Some(0) };

    pub fn contains(&self, size: u64) -> bool {
        size >= self.min && self.max.map_or(true, |max| size <= max)
    }
}

/// A declared attachment validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validator {
    Presence {
        message: Option<String>,
    },
    Size {
        range: SizeRange,
        message: Option<String>,
    },
    ContentType {
        /// Exact types, or `type/*` to accept a whole family
        allowed: Vec<String>,
        message: Option<String>,
    },
}

impl Validator {
    pub const PRESENCE_MESSAGE: &'static str = "must be set";
    pub const SIZE_MESSAGE: &'static str = "file size must be between :min and :max bytes";
    pub const CONTENT_TYPE_MESSAGE: &'static str = "is not one of the allowed file types";

    pub fn presence() -> Self {
        Self::Presence { message: None }
    }

    /// Size must fall inside `range` (inclusive)
    pub fn size_in(range: RangeInclusive<u64>) -> Self {
        Self::Size {
            range: SizeRange {
                min: *range.start(),
                max: Some(*range.end()),
            },
            message: None,
        }
    }

    /// Size must be strictly less than `bytes`
    pub fn size_less_than(bytes: u64) -> Self {
        let range = match bytes.checked_sub(1) {
            Some(max) => SizeRange { min: 0, max: Some(max) },
            None => SizeRange::EMPTY,
        };
        Self::Size { range, message: None }
    }

    /// Size must be strictly greater than `bytes`
    pub fn size_greater_than(bytes: u64) -> Self {
        let range = match bytes.checked_add(1) {
            Some(min) => SizeRange { min, max: None },
            None => SizeRange::EMPTY,
        };
        Self::Size { range, message: None }
    }

    pub fn content_type<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ContentType {
            allowed: allowed.into_iter().map(Into::into).collect(),
            message: None,
        }
    }

    /// Replace the default message
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        let text = Some(text.into());
        match &mut self {
            Self::Presence { message }
            | Self::Size { message, .. }
            | Self::ContentType { message, .. } => *message = text,
        }
        self
    }

    /// Evaluate against metadata. Size and content type only apply when a
    /// file is present; absence is the presence validator's concern.
    pub fn evaluate<T: AttachmentData + ?Sized>(&self, data: &T) -> Option<String> {
        match self {
            Self::Presence { message } => {
                if data.has_file() {
                    None
                } else {
                    Some(message.as_deref().unwrap_or(Self::PRESENCE_MESSAGE).to_string())
                }
            }
            Self::Size { range, message } => {
                if !data.has_file() {
                    return None;
                }
                let size = data.file_size().unwrap_or(0);
                if range.contains(size) {
                    return None;
                }
                let max = range
                    .max
                    .map_or_else(|| "unlimited".to_string(), |max| max.to_string());
                Some(
                    message
                        .as_deref()
                        .unwrap_or(Self::SIZE_MESSAGE)
                        .replace(":min", &range.min.to_string())
                        .replace(":max", &max),
                )
            }
            Self::ContentType { allowed, message } => {
                if !data.has_file() {
                    return None;
                }
                let content_type = data.content_type().unwrap_or_default();
                if allowed.iter().any(|a| content_type_matches(a, content_type)) {
                    None
                } else {
                    Some(
                        message
                            .as_deref()
                            .unwrap_or(Self::CONTENT_TYPE_MESSAGE)
                            .to_string(),
                    )
                }
            }
        }
    }
}

fn content_type_matches(allowed: &str, content_type: &str) -> bool {
    match allowed.strip_suffix("/*") {
        Some(family) => content_type
            .split_once('/')
            .is_some_and(|(top, _)| top.eq_ignore_ascii_case(family)),
        None => allowed.eq_ignore_ascii_case(content_type),
    }
}

/// Runs every declared validator of one attachment field
pub struct AttachmentContract<'a> {
    validators: &'a [Validator],
}

impl<'a> AttachmentContract<'a> {
    pub fn new(validators: &'a [Validator]) -> Self {
        Self { validators }
    }
}

impl<'a, T: AttachmentData + ?Sized> Contract<T> for AttachmentContract<'a> {
    fn validate(&self, entity: &T) -> ValidationResult {
        let mut errors = ValidationErrors::new();

        for validator in self.validators {
            if let Some(message) = validator.evaluate(entity) {
                errors.add(entity.field_name(), message);
            }
        }

        errors.into_result()
    }
}
