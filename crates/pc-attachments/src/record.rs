//! Host integration
//!
//! [`Attachments`] holds the attachment instances of one record and exposes
//! the lifecycle hooks the host must call: `validate` with its own
//! validations, `on_after_save` once the record is saved and
//! `on_before_destroy` before it is destroyed.

use std::collections::BTreeMap;
use std::sync::Arc;

use pc_contracts::ValidationResult;
use pc_core::{Attachable, AttachmentColumns, ValidationErrors};
use tracing::{debug, warn};

use crate::attachment::{Attachment, AttachmentError, AttachmentResult, DeleteFailure};
use crate::definition::ModelAttachments;
use crate::upload::Upload;

/// Attachment instances of one record, created on first use
#[derive(Debug)]
pub struct Attachments {
    model: Arc<ModelAttachments>,
    instances: BTreeMap<String, Attachment>,
}

impl Attachments {
    pub fn new(model: Arc<ModelAttachments>) -> Self {
        Self {
            model,
            instances: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &ModelAttachments {
        &self.model
    }

    /// The attachment `name` of `record`
    pub fn get<R: Attachable + ?Sized>(
        &mut self,
        name: &str,
        record: &R,
    ) -> AttachmentResult<&mut Attachment> {
        if !self.instances.contains_key(name) {
            let attachment = Attachment::load(&self.model, name, record)?;
            self.instances.insert(name.to_string(), attachment);
        }

        let attachment = self
            .instances
            .get_mut(name)
            .ok_or_else(|| AttachmentError::Undeclared(name.to_string()))?;
        attachment.set_record_id(record.id());
        Ok(attachment)
    }

    /// Assign a file (or `None`) to the attachment `name`
    pub async fn set<R: Attachable + ?Sized>(
        &mut self,
        name: &str,
        record: &R,
        upload: Option<Upload>,
    ) -> AttachmentResult<()> {
        self.get(name, record)?.assign(upload).await
    }

    pub fn is_present<R: Attachable + ?Sized>(
        &mut self,
        name: &str,
        record: &R,
    ) -> AttachmentResult<bool> {
        Ok(self.get(name, record)?.is_present())
    }

    /// Validate every declared attachment of `record`
    pub fn validate<R: Attachable + ?Sized>(&mut self, record: &R) -> ValidationResult {
        let mut errors = ValidationErrors::new();
        let names: Vec<String> = self.model.names().map(str::to_string).collect();

        for name in names {
            match self.get(&name, record) {
                Ok(attachment) => {
                    if let Err(e) = attachment.validate() {
                        errors.merge(e);
                    }
                }
                Err(e) => errors.add_base(e.to_string()),
            }
        }

        errors.into_result()
    }

    /// Post-save hook. Every touched attachment is saved; the first error is
    /// returned after all of them were attempted.
    pub async fn on_after_save<R: Attachable + ?Sized>(&mut self, record: &mut R) -> AttachmentResult<()> {
        let mut first_error = None;

        for (name, attachment) in self.instances.iter_mut() {
            if let Err(e) = attachment.save(record).await {
                warn!(model = %self.model.model_name(), attachment = %name, error = %e, "Attachment save failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pre-destroy hook. Removes the files of every declared attachment and
    /// clears the columns on `record`. Never fails; delete failures are
    /// returned for reporting.
    pub async fn on_before_destroy<R: Attachable + ?Sized>(&mut self, record: &mut R) -> Vec<DeleteFailure> {
        let names: Vec<String> = self.model.names().map(str::to_string).collect();
        let mut failures = Vec::new();

        for name in names {
            let attachment = match self.get(&name, &*record) {
                Ok(attachment) => attachment,
                Err(e) => {
                    warn!(attachment = %name, error = %e, "Attachment unavailable on destroy");
                    continue;
                }
            };
            failures.extend(attachment.destroy().await);
            record.write_attachment_columns(&name, AttachmentColumns::default());
        }

        debug!(
            model = %self.model.model_name(),
            id = ?record.id(),
            failures = failures.len(),
            "Attachments destroyed"
        );
        failures
    }
}
