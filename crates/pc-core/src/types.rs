//! Common types shared across crates

use serde::{Deserialize, Serialize};

/// The three persisted columns backing an attachment field
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentColumns {
    /// `<name>_file_name`
    pub file_name: Option<String>,
    /// `<name>_content_type`
    pub content_type: Option<String>,
    /// `<name>_file_size`
    pub file_size: Option<i64>,
}

impl AttachmentColumns {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        file_size: i64,
    ) -> Self {
        Self {
            file_name: Some(file_name.into()),
            content_type: Some(content_type.into()),
            file_size: Some(file_size),
        }
    }

    /// Column names the record schema must provide for attachment `name`
    pub fn column_names(name: &str) -> [String; 3] {
        [
            format!("{}_file_name", name),
            format!("{}_content_type", name),
            format!("{}_file_size", name),
        ]
    }

    /// A file is present when a filename has been persisted
    pub fn is_present(&self) -> bool {
        self.file_name.as_deref().is_some_and(|name| !name.is_empty())
    }
}
