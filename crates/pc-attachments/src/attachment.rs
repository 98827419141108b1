//! Attachment lifecycle
//!
//! One [`Attachment`] per attachment field per record instance. It moves
//! between three states:
//!
//! - `Empty`: no file
//! - `Assigned`: a file is buffered and waits for the record to be saved
//! - `Saved`: every style is in storage and the columns describe it
//!
//! Deletes are queued and only flushed after all writes of a save succeed.
//! Keys rewritten by the save are never deleted afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use pc_contracts::{AttachmentContract, AttachmentData, Contract, ValidationResult};
use pc_core::{Attachable, AttachmentColumns, Id, ValidationErrors};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::definition::{AttachmentBackend, AttachmentDefinition, ModelAttachments, ORIGINAL_STYLE};
use crate::interpolation::InterpolationContext;
use crate::storage::StorageError;
use crate::thumbnail::{ProcessingError, StyleOutput};
use crate::upload::{PendingFile, Upload, UploadError};

/// Attachment errors
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("Attachment {0:?} is not declared")]
    Undeclared(String),
    #[error("{0}")]
    Invalid(#[from] ValidationErrors),
    #[error("Style {style:?} could not be processed: {source}")]
    Processing {
        style: String,
        #[source]
        source: ProcessingError,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;

pub const INVALID_FILENAME_MESSAGE: &str = "has an invalid file name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Empty,
    Assigned,
    Saved,
}

/// A queued delete that did not succeed
#[derive(Debug)]
pub struct DeleteFailure {
    pub path: String,
    pub error: StorageError,
}

/// File of one style, ready to be stored
enum VariantFile {
    /// The original as it will be stored
    Source,
    Processed(StyleOutput),
}

struct Variant {
    style: String,
    key: String,
    file: VariantFile,
}

/// A single attachment field of a single record
#[derive(Debug)]
pub struct Attachment {
    definition: Arc<AttachmentDefinition>,
    backend: Arc<AttachmentBackend>,
    model_name: String,
    record_id: Option<Id>,
    /// Metadata as currently assigned
    columns: AttachmentColumns,
    /// Metadata of the files currently in storage
    saved: AttachmentColumns,
    pending: Option<PendingFile>,
    queued_for_delete: Vec<String>,
    /// Messages from assignment and processing failures
    errors: ValidationErrors,
    dirty: bool,
}

impl Attachment {
    pub fn new(
        model_name: impl Into<String>,
        definition: Arc<AttachmentDefinition>,
        backend: Arc<AttachmentBackend>,
        record_id: Option<Id>,
        columns: AttachmentColumns,
    ) -> Self {
        Self {
            definition,
            backend,
            model_name: model_name.into(),
            record_id,
            saved: columns.clone(),
            columns,
            pending: None,
            queued_for_delete: Vec::new(),
            errors: ValidationErrors::new(),
            dirty: false,
        }
    }

    /// Attachment `name` of `record`, initialized from its persisted columns
    pub fn load<R: Attachable + ?Sized>(
        model: &ModelAttachments,
        name: &str,
        record: &R,
    ) -> AttachmentResult<Self> {
        let definition = model
            .definition(name)
            .ok_or_else(|| AttachmentError::Undeclared(name.to_string()))?;

        Ok(Self::new(
            model.model_name(),
            Arc::clone(definition),
            Arc::clone(model.backend()),
            record.id(),
            record.attachment_columns(name),
        ))
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &AttachmentDefinition {
        &self.definition
    }

    pub fn columns(&self) -> &AttachmentColumns {
        &self.columns
    }

    pub fn state(&self) -> AttachmentState {
        if self.pending.is_some() {
            AttachmentState::Assigned
        } else if self.columns.is_present() {
            AttachmentState::Saved
        } else {
            AttachmentState::Empty
        }
    }

    pub fn is_present(&self) -> bool {
        self.columns.is_present()
    }

    pub fn queued_for_delete(&self) -> &[String] {
        &self.queued_for_delete
    }

    pub(crate) fn set_record_id(&mut self, id: Option<Id>) {
        self.record_id = id;
    }

    // ------------------------------------------------------------------
    // URLs and paths
    // ------------------------------------------------------------------

    /// URL of the default style
    pub fn url(&self) -> String {
        self.url_for(&self.definition.default_style)
    }

    /// URL of `style`, or the missing-file URL when nothing is assigned
    pub fn url_for(&self, style: &str) -> String {
        let pattern = if self.columns.is_present() {
            &self.definition.url
        } else {
            &self.definition.default_url
        };
        self.interpolate(pattern, style, &self.columns)
    }

    /// Storage key of the default style
    pub fn path(&self) -> Option<String> {
        self.path_for(&self.definition.default_style)
    }

    /// Storage key of `style`; `None` when nothing is assigned
    pub fn path_for(&self, style: &str) -> Option<String> {
        self.columns
            .is_present()
            .then(|| self.key(style, &self.columns))
    }

    fn interpolate(&self, pattern: &str, style: &str, columns: &AttachmentColumns) -> String {
        let ctx = InterpolationContext {
            model_name: &self.model_name,
            attachment_name: &self.definition.name,
            id: self.record_id,
            style,
            file_name: columns.file_name.as_deref(),
            format: self
                .definition
                .style(style)
                .and_then(|s| s.format.as_deref()),
        };
        self.backend.interpolator.interpolate(pattern, &ctx)
    }

    fn key(&self, style: &str, columns: &AttachmentColumns) -> String {
        self.interpolate(&self.definition.path, style, columns)
            .trim_start_matches('/')
            .to_string()
    }

    /// Keys of every style of the stored file
    fn saved_keys(&self) -> Vec<String> {
        if !self.saved.is_present() {
            return Vec::new();
        }
        let mut keys: Vec<String> = Vec::new();
        for style in self.definition.style_names() {
            let key = self.key(style, &self.saved);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    fn enqueue(&mut self, keys: Vec<String>) {
        for key in keys {
            if !self.queued_for_delete.contains(&key) {
                self.queued_for_delete.push(key);
            }
        }
    }

    // ------------------------------------------------------------------
    // Assignment and validation
    // ------------------------------------------------------------------

    /// Assign a new file, or `None` to remove the current one.
    ///
    /// Nothing reaches storage until [`Attachment::save`]. An unusable
    /// filename is reported through [`Attachment::validate`].
    #[instrument(skip(self, upload), fields(attachment = %self.definition.name))]
    pub async fn assign(&mut self, upload: Option<Upload>) -> AttachmentResult<()> {
        self.errors = ValidationErrors::new();

        let Some(upload) = upload else {
            debug!("Attachment cleared");
            self.queue_existing_for_delete();
            return Ok(());
        };

        let pending = match PendingFile::buffer(upload, self.definition.filename_policy).await {
            Ok(pending) => pending,
            Err(UploadError::InvalidFilename(raw)) => {
                debug!(file_name = %raw, "Upload rejected");
                self.errors.add(self.definition.name.clone(), INVALID_FILENAME_MESSAGE);
                self.dirty = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let previous = self.saved_keys();
        self.enqueue(previous);
        self.columns = pending.columns();
        self.pending = Some(pending);
        self.dirty = true;

        Ok(())
    }

    /// Declared validators plus any assignment or processing failure
    pub fn validate(&self) -> ValidationResult {
        let mut errors = self.errors.clone();
        if let Err(contract_errors) = AttachmentContract::new(&self.definition.validators).validate(self) {
            errors.merge(contract_errors);
        }
        errors.into_result()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Process and store a pending file, or commit a removal, then flush
    /// queued deletes and write the columns back to `record`.
    ///
    /// On failure no file is stored and the attachment returns to its last
    /// saved state.
    #[instrument(skip(self, record), fields(attachment = %self.definition.name))]
    pub async fn save<R: Attachable + ?Sized>(&mut self, record: &mut R) -> AttachmentResult<()> {
        self.record_id = record.id();

        if self.pending.is_none() && !self.dirty && self.queued_for_delete.is_empty() {
            return Ok(());
        }
        if self.pending.is_some() || self.dirty {
            self.validate()?;
        }

        if let Some(pending) = self.pending.take() {
            if let Err(e) = self.store(&pending).await {
                self.reset_to_saved();
                return Err(e);
            }
        }

        self.saved = self.columns.clone();
        self.dirty = false;
        record.write_attachment_columns(&self.definition.name, self.saved.clone());

        let failures = self.flush_deletes().await;
        info!(
            id = ?self.record_id,
            file_name = ?self.saved.file_name,
            delete_failures = failures.len(),
            "Attachment saved"
        );

        Ok(())
    }

    /// Produce every style, then write them all
    async fn store(&mut self, pending: &PendingFile) -> AttachmentResult<()> {
        let columns = self.columns.clone();
        let (variants, skipped) = self
            .process_styles(pending.path(), pending.extension(), &columns, true)
            .await?;

        let original_path = variants
            .iter()
            .find_map(|v| match &v.file {
                VariantFile::Processed(output) if v.style == ORIGINAL_STYLE => Some(output.path()),
                _ => None,
            })
            .unwrap_or_else(|| pending.path());
        let written = self.write_variants(&variants, original_path).await?;

        // a skipped style keeps whatever is already stored at its key
        self.queued_for_delete
            .retain(|k| !written.contains(k) && !skipped.contains(k));

        Ok(())
    }

    /// Run the styles over `source`. Derived styles are made from the
    /// processed original when there is one. Returns the produced variants
    /// and the keys of styles skipped in non-whiny mode.
    async fn process_styles(
        &mut self,
        source: &Path,
        extension: &str,
        columns: &AttachmentColumns,
        include_original: bool,
    ) -> AttachmentResult<(Vec<Variant>, Vec<String>)> {
        let definition = Arc::clone(&self.definition);
        let backend = Arc::clone(&self.backend);
        let whiny = definition.whiny(&backend.settings);

        let mut variants: Vec<Variant> = Vec::with_capacity(definition.styles.len());
        let mut skipped: Vec<String> = Vec::new();
        let mut processed_original: Option<PathBuf> = None;

        for style in &definition.styles {
            if style.is_original() && !include_original {
                continue;
            }
            let key = self.key(&style.name, columns);
            let thumbnail = style.thumbnail();

            if !thumbnail.needs_processing() {
                variants.push(Variant {
                    style: style.name.clone(),
                    key,
                    file: VariantFile::Source,
                });
                continue;
            }

            let input = match &processed_original {
                Some(path) if !style.is_original() => path.as_path(),
                _ => source,
            };
            let result = thumbnail
                .make(backend.transcoder.as_ref(), &style.name, input, extension)
                .await;

            match result {
                Ok(output) => {
                    if style.is_original() {
                        processed_original = Some(output.path().to_path_buf());
                    }
                    variants.push(Variant {
                        style: style.name.clone(),
                        key,
                        file: VariantFile::Processed(output),
                    });
                }
                Err(source) if whiny => {
                    warn!(style = %style.name, error = %source, "Style processing failed");
                    self.errors
                        .add(definition.name.clone(), source.to_string());
                    return Err(AttachmentError::Processing {
                        style: style.name.clone(),
                        source,
                    });
                }
                Err(error) => {
                    warn!(style = %style.name, error = %error, "Style skipped");
                    skipped.push(key);
                }
            }
        }

        Ok((variants, skipped))
    }

    /// Store every variant. Existing content at the target keys is read
    /// first; if any write fails, that content is put back and keys that did
    /// not exist are deleted, so storage is left as it was.
    async fn write_variants(
        &self,
        variants: &[Variant],
        original_path: &Path,
    ) -> AttachmentResult<Vec<String>> {
        let storage = &self.backend.storage;

        let mut overwritten: Vec<(String, Bytes)> = Vec::new();
        for variant in variants {
            if overwritten.iter().any(|(key, _)| *key == variant.key) {
                continue;
            }
            match storage.get(&variant.key).await {
                Ok(data) => overwritten.push((variant.key.clone(), data)),
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let mut written: Vec<String> = Vec::with_capacity(variants.len());
        for variant in variants {
            let source = match &variant.file {
                VariantFile::Source => original_path,
                VariantFile::Processed(output) => output.path(),
            };
            match storage.put_file(&variant.key, source).await {
                Ok(metadata) => {
                    debug!(
                        style = %variant.style,
                        key = %variant.key,
                        size = metadata.size,
                        digest = %metadata.digest,
                        "Style stored"
                    );
                    written.push(variant.key.clone());
                }
                Err(e) => {
                    warn!(style = %variant.style, key = %variant.key, error = %e, "Store failed");
                    written.push(variant.key.clone());
                    self.roll_back(&written, &overwritten).await;
                    return Err(e.into());
                }
            }
        }

        Ok(written)
    }

    async fn roll_back(&self, written: &[String], overwritten: &[(String, Bytes)]) {
        let storage = &self.backend.storage;

        for key in written {
            let restored = match overwritten.iter().find(|(k, _)| k == key) {
                Some((_, data)) => storage.put(key, data.clone()).await.map(|_| ()),
                None => storage.delete(key).await,
            };
            match restored {
                Ok(()) => debug!(key = %key, "Write rolled back"),
                Err(e) => warn!(key = %key, error = %e, "Rollback failed"),
            }
        }
    }

    fn reset_to_saved(&mut self) {
        self.columns = self.saved.clone();
        self.pending = None;
        self.queued_for_delete.clear();
        self.dirty = false;
    }

    /// Queue every stored style for deletion and clear the metadata
    pub fn queue_existing_for_delete(&mut self) {
        let keys = self.saved_keys();
        self.enqueue(keys);
        self.columns = AttachmentColumns::default();
        self.pending = None;
        self.dirty = true;
    }

    /// Delete every queued key. Failures are logged and returned; the queue
    /// is emptied either way.
    pub async fn flush_deletes(&mut self) -> Vec<DeleteFailure> {
        let queued = std::mem::take(&mut self.queued_for_delete);
        let mut failures = Vec::new();

        for path in queued {
            match self.backend.storage.delete(&path).await {
                Ok(()) => debug!(path = %path, "Queued file deleted"),
                Err(error) => {
                    warn!(path = %path, error = %error, "Queued delete failed");
                    failures.push(DeleteFailure { path, error });
                }
            }
        }

        failures
    }

    /// Remove every stored style. Safe to call repeatedly.
    #[instrument(skip(self), fields(attachment = %self.definition.name))]
    pub async fn destroy(&mut self) -> Vec<DeleteFailure> {
        self.queue_existing_for_delete();
        let failures = self.flush_deletes().await;
        self.saved = AttachmentColumns::default();
        self.dirty = false;
        failures
    }

    // ------------------------------------------------------------------
    // Stored files
    // ------------------------------------------------------------------

    pub async fn exists(&self, style: &str) -> AttachmentResult<bool> {
        match self.path_for(style) {
            Some(key) => Ok(self.backend.storage.exists(&key).await?),
            None => Ok(false),
        }
    }

    pub async fn read(&self, style: &str) -> AttachmentResult<Bytes> {
        let key = self
            .path_for(style)
            .ok_or_else(|| StorageError::NotFound(style.to_string()))?;
        Ok(self.backend.storage.get(&key).await?)
    }

    /// Regenerate every non-original style from the stored original and
    /// overwrite the stored variants. The original and the columns are left
    /// untouched.
    #[instrument(skip(self, record), fields(attachment = %self.definition.name))]
    pub async fn reprocess<R: Attachable + ?Sized>(&mut self, record: &R) -> AttachmentResult<()> {
        self.record_id = record.id();
        if !self.saved.is_present() {
            return Ok(());
        }

        let saved = self.saved.clone();
        let original_key = self.key(ORIGINAL_STYLE, &saved);
        let data = self.backend.storage.get(&original_key).await?;

        // the stored original may carry a converted format
        let suffix = Path::new(&original_key)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let source = tempfile::Builder::new()
            .prefix("paperclip-reprocess-")
            .suffix(&suffix)
            .tempfile()
            .map_err(StorageError::from)?;
        tokio::fs::write(source.path(), &data)
            .await
            .map_err(StorageError::from)?;

        let extension = saved
            .file_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (variants, _) = self
            .process_styles(source.path(), &extension, &saved, false)
            .await?;
        let written = self.write_variants(&variants, source.path()).await?;

        info!(id = ?self.record_id, styles = written.len(), "Attachment reprocessed");
        Ok(())
    }
}

impl AttachmentData for Attachment {
    fn field_name(&self) -> &str {
        &self.definition.name
    }

    fn file_name(&self) -> Option<&str> {
        self.columns.file_name.as_deref()
    }

    fn content_type(&self) -> Option<&str> {
        self.columns.content_type.as_deref()
    }

    fn file_size(&self) -> Option<u64> {
        self.columns.file_size.and_then(|size| u64::try_from(size).ok())
    }
}


#[cfg(test)]
mod tests {
    use pc_contracts::Validator;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::testing::{model, model_with_storage, png, TestRecord};
    use super::*;
    use crate::storage::{FileMetadata, LocalStorage, MemoryStorage, Storage, StorageResult};
    use crate::thumbnail::testing::{Call, MockTranscoder};
    use crate::upload::FilenamePolicy;

    fn avatar_with_thumb() -> AttachmentDefinition {
        AttachmentDefinition::builder("avatar")
            .style("thumb", "100x100#")
            .original()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_assign_and_save_round_trip() {
        let transcoder = Arc::new(MockTranscoder::new(400, 200));
        let (model, storage) = model(avatar_with_thumb(), transcoder.clone());
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();
        assert_eq!(avatar.state(), AttachmentState::Empty);

        avatar.assign(Some(png("me.png"))).await.unwrap();
        assert_eq!(avatar.state(), AttachmentState::Assigned);
        avatar.save(&mut record).await.unwrap();
        assert_eq!(avatar.state(), AttachmentState::Saved);

        let thumb = avatar.url_for("thumb");
        let original = avatar.url_for("original");
        assert_eq!(thumb, "users/avatars/1/thumb_me.png");
        assert_eq!(original, "users/avatars/1/original_me.png");
        assert!(avatar.exists("thumb").await.unwrap());
        assert!(avatar.exists("original").await.unwrap());
        assert_eq!(storage.keys().await, vec![original.clone(), thumb.clone()]);

        assert_eq!(
            record.attachment_columns("avatar"),
            AttachmentColumns::new("me.png", "image/png", 9)
        );
        assert_eq!(avatar.read("original").await.unwrap(), Bytes::from_static(b"\x89PNG-data"));

        let calls = transcoder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            Call::Convert(
                ["-resize", "200x100!", "-crop", "100x100+50+0", "+repage"]
                    .map(String::from)
                    .to_vec()
            )
        );
    }

    #[tokio::test]
    async fn test_destroy_removes_all_styles() {
        let (model, storage) = model(avatar_with_thumb(), Arc::new(MockTranscoder::new(50, 50)));
        let mut record = TestRecord::persisted(7);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();
        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        assert_eq!(storage.keys().await.len(), 2);

        let failures = avatar.destroy().await;
        assert!(failures.is_empty());
        assert!(storage.keys().await.is_empty());
        assert_eq!(avatar.state(), AttachmentState::Empty);
        assert_eq!(avatar.url_for("original"), "/users/avatars/missing_original.png");
        assert_eq!(avatar.path(), None);

        // second destroy has nothing to do
        assert!(avatar.destroy().await.is_empty());
        assert!(avatar.queued_for_delete().is_empty());
    }

    #[tokio::test]
    async fn test_assign_none_clears_on_save() {
        let (model, storage) = model(avatar_with_thumb(), Arc::new(MockTranscoder::new(50, 50)));
        let mut record = TestRecord::persisted(3);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();
        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();

        avatar.assign(None).await.unwrap();
        assert_eq!(avatar.queued_for_delete().len(), 2);
        // nothing is flushed before save
        assert_eq!(storage.keys().await.len(), 2);

        avatar.save(&mut record).await.unwrap();
        assert!(storage.keys().await.is_empty());
        assert_eq!(record.attachment_columns("avatar"), AttachmentColumns::default());
        assert_eq!(avatar.state(), AttachmentState::Empty);
    }

    #[tokio::test]
    async fn test_whiny_failure_commits_nothing() {
        let transcoder = Arc::new(MockTranscoder::failing());
        let (model, storage) = model(avatar_with_thumb(), transcoder);
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.assign(Some(png("me.png"))).await.unwrap();
        let err = avatar.save(&mut record).await.unwrap_err();

        assert!(matches!(
            err,
            AttachmentError::Processing { ref style, source: ProcessingError::NotIdentified { .. } }
                if style == "thumb"
        ));
        assert!(storage.keys().await.is_empty());
        assert!(record.columns.is_empty());
        assert_eq!(avatar.state(), AttachmentState::Empty);
        let errors = avatar.validate().unwrap_err();
        assert!(errors.has_error("avatar"));
    }

    #[tokio::test]
    async fn test_whiny_failure_keeps_previous_file() {
        let (model, storage) = model(avatar_with_thumb(), Arc::new(MockTranscoder::new(50, 50)));
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();
        avatar.assign(Some(png("old.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        let before = storage.keys().await;

        let mut avatar = Attachment::new(
            "User",
            Arc::new(avatar_with_thumb()),
            Arc::new(AttachmentBackend::new(
                storage.clone(),
                Arc::new(MockTranscoder::failing()),
                Default::default(),
            )),
            record.id,
            record.attachment_columns("avatar"),
        );
        avatar.assign(Some(png("new.png"))).await.unwrap();
        assert!(avatar.save(&mut record).await.is_err());

        assert_eq!(storage.keys().await, before);
        assert_eq!(record.attachment_columns("avatar").file_name.as_deref(), Some("old.png"));
        assert_eq!(avatar.url(), "users/avatars/1/original_old.png");
        assert!(avatar.queued_for_delete().is_empty());
    }

    #[tokio::test]
    async fn test_non_whiny_skips_failed_style() {
        let definition = AttachmentDefinition::builder("avatar")
            .style("thumb", "100x100#")
            .original()
            .whiny_thumbnails(false)
            .build()
            .unwrap();
        let (model, storage) = model(definition, Arc::new(MockTranscoder::failing()));
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();

        assert_eq!(storage.keys().await, vec!["users/avatars/1/original_me.png".to_string()]);
        assert!(!avatar.exists("thumb").await.unwrap());
        assert_eq!(record.attachment_columns("avatar").file_name.as_deref(), Some("me.png"));
    }

    #[tokio::test]
    async fn test_no_styles_never_calls_transcoder() {
        let transcoder = Arc::new(MockTranscoder::new(10, 10));
        let definition = AttachmentDefinition::builder("avatar").build().unwrap();
        let (model, storage) = model(definition, transcoder.clone());
        let mut record = TestRecord::persisted(5);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();

        assert_eq!(storage.keys().await, vec!["users/avatars/5/original_me.png".to_string()]);
        assert!(transcoder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_url_defaults_to_default_style() {
        let definition = AttachmentDefinition::builder("avatar")
            .style("thumb", "10x10")
            .default_style("thumb")
            .build()
            .unwrap();
        let (model, _) = model(definition, Arc::new(MockTranscoder::new(20, 20)));
        let mut record = TestRecord::persisted(2);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        assert_eq!(avatar.url(), avatar.url_for("thumb"));
        assert_eq!(avatar.url(), "/users/avatars/missing_thumb.png");

        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        assert_eq!(avatar.url(), avatar.url_for("thumb"));
        assert_eq!(avatar.url(), "users/avatars/2/thumb_me.png");
        assert_eq!(avatar.path(), avatar.path_for("thumb"));
    }

    #[tokio::test]
    async fn test_replacing_file_deletes_old_styles() {
        let (model, storage) = model(avatar_with_thumb(), Arc::new(MockTranscoder::new(50, 50)));
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.assign(Some(png("old.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        avatar.assign(Some(png("new.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();

        assert_eq!(
            storage.keys().await,
            vec![
                "users/avatars/1/original_new.png".to_string(),
                "users/avatars/1/thumb_new.png".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_name_reupload_keeps_files() {
        let (model, storage) = model(avatar_with_thumb(), Arc::new(MockTranscoder::new(50, 50)));
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        avatar
            .assign(Some(Upload::from_bytes("me.png", Bytes::from_static(b"v2"))))
            .await
            .unwrap();
        avatar.save(&mut record).await.unwrap();

        assert_eq!(storage.keys().await.len(), 2);
        assert_eq!(avatar.read("original").await.unwrap(), Bytes::from_static(b"v2"));
        assert!(avatar.queued_for_delete().is_empty());
    }

    #[tokio::test]
    async fn test_validation_blocks_save() {
        let definition = AttachmentDefinition::builder("avatar")
            .validates(Validator::presence())
            .validates(Validator::content_type(["image/*"]))
            .build()
            .unwrap();
        let (model, storage) = model(definition, Arc::new(MockTranscoder::new(1, 1)));
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        let errors = avatar.validate().unwrap_err();
        assert_eq!(errors.get("avatar"), Some(&vec!["must be set".to_string()]));

        avatar
            .assign(Some(Upload::from_bytes("notes.txt", Bytes::from_static(b"hi"))))
            .await
            .unwrap();
        let err = avatar.save(&mut record).await.unwrap_err();
        assert!(matches!(err, AttachmentError::Invalid(ref e) if e.has_error("avatar")));
        assert!(storage.keys().await.is_empty());
        assert!(record.columns.is_empty());

        avatar.assign(Some(png("ok.png"))).await.unwrap();
        assert!(avatar.validate().is_ok());
        avatar.save(&mut record).await.unwrap();
        assert_eq!(storage.keys().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_filename_is_a_validation_error() {
        let definition = AttachmentDefinition::builder("avatar")
            .filename_policy(FilenamePolicy::Reject)
            .build()
            .unwrap();
        let (model, storage) = model(definition, Arc::new(MockTranscoder::new(1, 1)));
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.assign(Some(png("../../evil.png"))).await.unwrap();
        let errors = avatar.validate().unwrap_err();
        assert_eq!(
            errors.get("avatar"),
            Some(&vec![INVALID_FILENAME_MESSAGE.to_string()])
        );
        assert!(avatar.save(&mut record).await.is_err());
        assert!(storage.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_without_changes_is_noop() {
        let transcoder = Arc::new(MockTranscoder::new(1, 1));
        let (model, storage) = model(avatar_with_thumb(), transcoder.clone());
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.save(&mut record).await.unwrap();
        assert!(record.columns.is_empty());
        assert!(storage.keys().await.is_empty());
        assert!(transcoder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_format_style_and_processed_original() {
        let transcoder = Arc::new(MockTranscoder::new(800, 600));
        let definition = AttachmentDefinition::builder("photo")
            .style_with_format("original", Some("1024x1024>"), "jpg")
            .style("small", "64x64")
            .build()
            .unwrap();
        let (model, storage) = model(definition, transcoder.clone());
        let mut record = TestRecord::persisted(9);
        let mut photo = Attachment::load(&model, "photo", &record).unwrap();

        photo.assign(Some(png("shot.png"))).await.unwrap();
        photo.save(&mut record).await.unwrap();

        assert_eq!(
            storage.keys().await,
            vec![
                "users/photos/9/original_shot.jpg".to_string(),
                "users/photos/9/small_shot.png".to_string(),
            ]
        );
        // the small style is made from the processed original
        let calls = transcoder.calls();
        assert_eq!(calls.len(), 4);
        match (&calls[0], &calls[2]) {
            (Call::Identify(first), Call::Identify(second)) => assert_ne!(first, second),
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reprocess_rebuilds_styles() {
        let transcoder = Arc::new(MockTranscoder::new(300, 300));
        let (model, storage) = model(avatar_with_thumb(), transcoder.clone());
        let mut record = TestRecord::persisted(4);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();
        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        let keys = storage.keys().await;

        storage.delete("users/avatars/4/thumb_me.png").await.unwrap();
        let mut reloaded = Attachment::load(&model, "avatar", &record).unwrap();
        reloaded.reprocess(&record).await.unwrap();

        assert_eq!(storage.keys().await, keys);
        assert_eq!(transcoder.calls().len(), 4);
        assert_eq!(record.attachment_columns("avatar").content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_reprocess_keeps_converted_original() {
        let transcoder = Arc::new(MockTranscoder::new(800, 600));
        let definition = AttachmentDefinition::builder("photo")
            .style_with_format("original", Some("1024x1024>"), "jpg")
            .style("small", "64x64")
            .build()
            .unwrap();
        let (model, storage) = model(definition, transcoder.clone());
        let mut record = TestRecord::persisted(9);
        let mut photo = Attachment::load(&model, "photo", &record).unwrap();
        photo.assign(Some(png("shot.png"))).await.unwrap();
        photo.save(&mut record).await.unwrap();
        storage
            .put("users/photos/9/original_shot.jpg", Bytes::from_static(b"jpeg-data"))
            .await
            .unwrap();

        let mut reloaded = Attachment::load(&model, "photo", &record).unwrap();
        reloaded.reprocess(&record).await.unwrap();

        assert_eq!(
            storage.keys().await,
            vec![
                "users/photos/9/original_shot.jpg".to_string(),
                "users/photos/9/small_shot.png".to_string(),
            ]
        );
        assert_eq!(reloaded.read("original").await.unwrap(), Bytes::from_static(b"jpeg-data"));
        assert_eq!(reloaded.read("small").await.unwrap(), Bytes::from_static(b"jpeg-data"));

        // only the small style ran, from a source named after the stored original
        let calls = transcoder.calls();
        assert_eq!(calls.len(), 6);
        match &calls[4] {
            Call::Identify(path) => {
                assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"))
            }
            other => panic!("unexpected call: {:?}", other),
        }
        assert_eq!(calls[5], Call::Convert(vec!["-resize".to_string(), "64x64".to_string()]));
    }

    /// Memory storage whose `nth` put (counting from 1) fails
    struct FailingPutStorage {
        inner: MemoryStorage,
        nth: usize,
        puts: AtomicUsize,
    }

    impl FailingPutStorage {
        fn new(nth: usize) -> Self {
            Self {
                inner: MemoryStorage::new(),
                nth,
                puts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Storage for FailingPutStorage {
        async fn put(&self, key: &str, data: Bytes) -> StorageResult<FileMetadata> {
            if self.puts.fetch_add(1, Ordering::SeqCst) + 1 == self.nth {
                return Err(StorageError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.put(key, data).await
        }

        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> StorageResult<bool> {
            self.inner.exists(key).await
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_store_failure_restores_overwritten_files() {
        let storage = Arc::new(FailingPutStorage::new(4));
        let model = model_with_storage(
            avatar_with_thumb(),
            storage.clone(),
            Arc::new(MockTranscoder::new(50, 50)),
        );
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();
        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();

        avatar
            .assign(Some(Upload::from_bytes("me.png", Bytes::from_static(b"v2"))))
            .await
            .unwrap();
        let err = avatar.save(&mut record).await.unwrap_err();

        assert!(matches!(err, AttachmentError::Storage(_)));
        assert_eq!(
            storage.inner.keys().await,
            vec![
                "users/avatars/1/original_me.png".to_string(),
                "users/avatars/1/thumb_me.png".to_string(),
            ]
        );
        assert_eq!(avatar.read("original").await.unwrap(), Bytes::from_static(b"\x89PNG-data"));
        assert_eq!(avatar.read("thumb").await.unwrap(), Bytes::from_static(b"\x89PNG-data"));
        assert_eq!(avatar.columns().file_size, Some(9));
        assert_eq!(record.attachment_columns("avatar").file_size, Some(9));
    }

    #[tokio::test]
    async fn test_store_failure_removes_new_files() {
        let storage = Arc::new(FailingPutStorage::new(4));
        let model = model_with_storage(
            avatar_with_thumb(),
            storage.clone(),
            Arc::new(MockTranscoder::new(50, 50)),
        );
        let mut record = TestRecord::persisted(1);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();
        avatar.assign(Some(png("old.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        let before = storage.inner.keys().await;

        avatar.assign(Some(png("new.png"))).await.unwrap();
        assert!(avatar.save(&mut record).await.is_err());

        assert_eq!(storage.inner.keys().await, before);
        assert_eq!(avatar.url(), "users/avatars/1/original_old.png");
        assert!(avatar.queued_for_delete().is_empty());
    }

    #[tokio::test]
    async fn test_local_storage_lifecycle_prunes_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let model = model_with_storage(
            avatar_with_thumb(),
            Arc::new(LocalStorage::new(tmp.path())),
            Arc::new(MockTranscoder::new(120, 80)),
        );
        let mut record = TestRecord::persisted(12);
        let mut avatar = Attachment::load(&model, "avatar", &record).unwrap();

        avatar.assign(Some(png("me.png"))).await.unwrap();
        avatar.save(&mut record).await.unwrap();
        assert!(tmp.path().join("users/avatars/12/thumb_me.png").is_file());
        assert!(tmp.path().join("users/avatars/12/original_me.png").is_file());

        assert!(avatar.destroy().await.is_empty());
        assert!(!tmp.path().join("users").exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_undeclared_attachment() {
        let (model, _) = model(avatar_with_thumb(), Arc::new(MockTranscoder::new(1, 1)));
        let record = TestRecord::persisted(1);
        assert!(matches!(
            Attachment::load(&model, "resume", &record),
            Err(AttachmentError::Undeclared(name)) if name == "resume"
        ));
    }
}
