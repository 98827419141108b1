//! Uploaded files
//!
//! An [`Upload`] is what the host assigns; it is buffered into a
//! [`PendingFile`] that lives in a temp file until the record is saved. The
//! temp file is removed when the pending file is dropped, whatever the outcome.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use pc_core::AttachmentColumns;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Upload errors
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid file name: {0:?}")]
    InvalidFilename(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// What to do with unsafe characters in an uploaded filename.
///
/// Safe characters are ASCII alphanumerics, `.`, `-` and `_`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilenamePolicy {
    /// Keep the last path component and replace unsafe characters with `_`
    #[default]
    Replace,
    /// Refuse any name containing a separator or an unsafe character
    Reject,
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// Sanitize an uploaded filename according to `policy`
pub fn sanitize_filename(raw: &str, policy: FilenamePolicy) -> UploadResult<String> {
    let invalid = || UploadError::InvalidFilename(raw.to_string());

    let name = match policy {
        FilenamePolicy::Replace => {
            let last = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
            last.chars()
                .map(|c| if is_safe(c) { c } else { '_' })
                .collect::<String>()
        }
        FilenamePolicy::Reject => {
            if !raw.chars().all(is_safe) {
                return Err(invalid());
            }
            raw.to_string()
        }
    };

    if name.is_empty() || name == "." || name == ".." {
        return Err(invalid());
    }
    Ok(name)
}

#[derive(Debug, Clone)]
enum UploadSource {
    Bytes(Bytes),
    Path(PathBuf),
}

/// A file handed to an attachment
#[derive(Debug, Clone)]
pub struct Upload {
    file_name: String,
    content_type: Option<String>,
    source: UploadSource,
}

impl Upload {
    pub fn from_bytes(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            source: UploadSource::Bytes(data.into()),
        }
    }

    /// Upload of a local file; the name defaults to the file's own name
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        Self {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            content_type: None,
            source: UploadSource::Path(path.to_path_buf()),
        }
    }

    /// Declared content type; guessed from the filename when absent
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

/// An assigned file waiting for the record to be saved
#[derive(Debug)]
pub struct PendingFile {
    file: NamedTempFile,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
}

impl PendingFile {
    /// Copy the upload into a temp file and extract its metadata
    pub async fn buffer(upload: Upload, policy: FilenamePolicy) -> UploadResult<Self> {
        let file_name = sanitize_filename(&upload.file_name, policy)?;
        let content_type = match upload.content_type {
            Some(ct) if !ct.trim().is_empty() => ct.trim().to_string(),
            _ => mime_guess::from_path(&file_name)
                .first_or_octet_stream()
                .to_string(),
        };

        let data = match upload.source {
            UploadSource::Bytes(data) => data,
            UploadSource::Path(path) => Bytes::from(tokio::fs::read(&path).await?),
        };

        let file = tempfile::Builder::new().prefix("paperclip-upload-").tempfile()?;
        let mut writer = tokio::fs::File::from_std(file.reopen()?);
        writer.write_all(&data).await?;
        writer.flush().await?;

        debug!(file_name = %file_name, content_type = %content_type, size = data.len(), "Upload buffered");

        Ok(Self {
            file,
            file_name,
            content_type,
            size: data.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Extension of the sanitized name, without the dot
    pub fn extension(&self) -> &str {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
    }

    pub fn columns(&self) -> AttachmentColumns {
        AttachmentColumns::new(
            self.file_name.clone(),
            self.content_type.clone(),
            i64::try_from(self.size).unwrap_or(i64::MAX),
        )
    }
}
