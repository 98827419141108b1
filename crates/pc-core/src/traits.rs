//! Host record traits
//!
//! The attachment subsystem never owns a record. The host hands its record to
//! the lifecycle hooks through these traits.

use crate::types::AttachmentColumns;

/// Primary key type
pub type Id = i64;

/// Trait for entities that have a primary key
pub trait Identifiable {
    fn id(&self) -> Option<Id>;
    fn is_persisted(&self) -> bool {
        self.id().is_some()
    }
    fn is_new_record(&self) -> bool {
        !self.is_persisted()
    }
}

/// A persisted record that carries one or more attachment fields.
///
/// For every declared attachment `name` the record persists three columns,
/// `<name>_file_name`, `<name>_content_type` and `<name>_file_size`, exposed
/// here as one [`AttachmentColumns`] value.
pub trait Attachable: Identifiable + Send + Sync {
    /// Read the persisted columns of the attachment `name`
    fn attachment_columns(&self, name: &str) -> AttachmentColumns;

    /// Overwrite the persisted columns of the attachment `name`
    fn write_attachment_columns(&mut self, name: &str, columns: AttachmentColumns);
}
