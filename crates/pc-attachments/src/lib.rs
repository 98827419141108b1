//! # pc-attachments
//!
//! File attachments for persisted records.
//!
//! ## Features
//!
//! - Declarative attachment fields with named styles (`thumb: "100x100#"`)
//! - Style generation through ImageMagick `identify` / `convert`
//! - Path and URL interpolation (`:class/:attachment/:id/:style_:filename`)
//! - Storage abstraction (local filesystem, in-memory)
//! - Deferred writes and deletes driven by the record's save/destroy hooks
//!
//! ## Example
//!
//! ```rust,ignore
//! use pc_attachments::{AttachmentBackend, AttachmentDefinition, Attachments, ModelAttachments, Upload};
//! use pc_core::AttachmentSettings;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(AttachmentBackend::from_settings(AttachmentSettings::from_env()?));
//! let mut model = ModelAttachments::new("User", backend);
//! model.has_attached_file(
//!     AttachmentDefinition::builder("avatar")
//!         .style("thumb", "100x100#")
//!         .build()?,
//! )?;
//!
//! let mut attachments = Attachments::new(Arc::new(model));
//! attachments.set("avatar", &user, Some(Upload::from_path("me.png"))).await?;
//! attachments.validate(&user)?;
//! // ... the host saves the user ...
//! attachments.on_after_save(&mut user).await?;
//! ```

pub mod attachment;
pub mod definition;
pub mod geometry;
pub mod interpolation;
pub mod record;
pub mod storage;
pub mod thumbnail;
pub mod upload;

pub use attachment::{
    Attachment, AttachmentError, AttachmentResult, AttachmentState, DeleteFailure,
};
pub use definition::{
    AttachmentBackend, AttachmentDefinition, AttachmentDefinitionBuilder, DefinitionError,
    ModelAttachments, Style, DEFAULT_MISSING_URL, DEFAULT_PATH, DEFAULT_URL, ORIGINAL_STYLE,
};
pub use geometry::{CropPlan, Dimensions, Geometry, GeometryError, Modifier};
pub use interpolation::{InterpolationContext, InterpolationFn, Interpolator};
pub use record::Attachments;
pub use storage::{FileMetadata, LocalStorage, MemoryStorage, Storage, StorageError, StorageResult};
pub use thumbnail::{ImageMagick, ProcessingError, ProcessingResult, StyleOutput, Thumbnail, Transcoder};
pub use upload::{sanitize_filename, FilenamePolicy, PendingFile, Upload, UploadError};
