//! Attachment declarations
//!
//! An [`AttachmentDefinition`] is built once per attachment field when the
//! model is registered. [`ModelAttachments`] groups the definitions of one
//! model with the backend they share and is passed by reference to every
//! attachment instance.

use std::collections::BTreeMap;
use std::sync::Arc;

use pc_contracts::Validator;
use pc_core::AttachmentSettings;
use thiserror::Error;
use tracing::debug;

use crate::geometry::{Geometry, GeometryError};
use crate::interpolation::Interpolator;
use crate::storage::{LocalStorage, Storage};
use crate::thumbnail::{ImageMagick, Thumbnail, Transcoder};
use crate::upload::FilenamePolicy;

pub const ORIGINAL_STYLE: &str = "original";
pub const DEFAULT_PATH: &str = ":class/:attachment/:id/:style_:filename";
pub const DEFAULT_URL: &str = ":class/:attachment/:id/:style_:filename";
pub const DEFAULT_MISSING_URL: &str = "/:class/:attachment/missing_:style.png";

/// Declaration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Attachment name must not be empty")]
    EmptyName,
    #[error("Style {style:?} has an invalid geometry: {source}")]
    InvalidGeometry {
        style: String,
        #[source]
        source: GeometryError,
    },
    #[error("Style {0:?} is declared twice")]
    DuplicateStyle(String),
    #[error("Default style {0:?} is not declared")]
    UnknownDefaultStyle(String),
    #[error("Attachment {0:?} is declared twice")]
    DuplicateAttachment(String),
}

/// A named variant of the attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Style {
    pub name: String,
    pub geometry: Option<Geometry>,
    /// Output format (file extension) of the variant
    pub format: Option<String>,
}

impl Style {
    pub fn thumbnail(&self) -> Thumbnail {
        Thumbnail::new(self.geometry, self.format.clone())
    }

    pub fn is_original(&self) -> bool {
        self.name == ORIGINAL_STYLE
    }
}

/// Declaration of one attachment field
#[derive(Debug, Clone)]
pub struct AttachmentDefinition {
    pub name: String,
    /// `original` always comes first
    pub styles: Vec<Style>,
    pub default_style: String,
    pub url: String,
    pub default_url: String,
    pub path: String,
    /// Overrides the process-wide setting when set
    pub whiny_thumbnails: Option<bool>,
    pub validators: Vec<Validator>,
    pub filename_policy: FilenamePolicy,
}

impl AttachmentDefinition {
    pub fn builder(name: impl Into<String>) -> AttachmentDefinitionBuilder {
        AttachmentDefinitionBuilder::new(name)
    }

    pub fn style(&self, name: &str) -> Option<&Style> {
        self.styles.iter().find(|s| s.name == name)
    }

    pub fn style_names(&self) -> impl Iterator<Item = &str> {
        self.styles.iter().map(|s| s.name.as_str())
    }

    /// Effective whiny flag for this field
    pub fn whiny(&self, settings: &AttachmentSettings) -> bool {
        self.whiny_thumbnails.unwrap_or(settings.whiny_thumbnails)
    }
}

/// Builder for [`AttachmentDefinition`]
#[derive(Debug, Clone)]
pub struct AttachmentDefinitionBuilder {
    name: String,
    styles: Vec<(String, Option<String>, Option<String>)>,
    default_style: Option<String>,
    url: Option<String>,
    default_url: Option<String>,
    path: Option<String>,
    whiny_thumbnails: Option<bool>,
    validators: Vec<Validator>,
    filename_policy: FilenamePolicy,
}

impl AttachmentDefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            styles: Vec::new(),
            default_style: None,
            url: None,
            default_url: None,
            path: None,
            whiny_thumbnails: None,
            validators: Vec::new(),
            filename_policy: FilenamePolicy::default(),
        }
    }

    /// Declare a style with a geometry such as `100x100#`
    pub fn style(mut self, name: impl Into<String>, geometry: impl Into<String>) -> Self {
        self.styles.push((name.into(), Some(geometry.into()), None));
        self
    }

    /// Declare a style with a geometry and an output format
    pub fn style_with_format(
        mut self,
        name: impl Into<String>,
        geometry: Option<&str>,
        format: impl Into<String>,
    ) -> Self {
        self.styles.push((
            name.into(),
            geometry.map(str::to_string),
            Some(format.into()),
        ));
        self
    }

    /// Declare the original style explicitly, stored unprocessed
    pub fn original(mut self) -> Self {
        self.styles.push((ORIGINAL_STYLE.to_string(), None, None));
        self
    }

    pub fn default_style(mut self, style: impl Into<String>) -> Self {
        self.default_style = Some(style.into());
        self
    }

    pub fn url(mut self, pattern: impl Into<String>) -> Self {
        self.url = Some(pattern.into());
        self
    }

    pub fn default_url(mut self, pattern: impl Into<String>) -> Self {
        self.default_url = Some(pattern.into());
        self
    }

    pub fn path(mut self, pattern: impl Into<String>) -> Self {
        self.path = Some(pattern.into());
        self
    }

    pub fn whiny_thumbnails(mut self, whiny: bool) -> Self {
        self.whiny_thumbnails = Some(whiny);
        self
    }

    pub fn validates(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn filename_policy(mut self, policy: FilenamePolicy) -> Self {
        self.filename_policy = policy;
        self
    }

    pub fn build(self) -> Result<AttachmentDefinition, DefinitionError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(DefinitionError::EmptyName);
        }

        let mut styles: Vec<Style> = Vec::with_capacity(self.styles.len() + 1);
        for (style_name, geometry, format) in self.styles {
            if styles.iter().any(|s| s.name == style_name) {
                return Err(DefinitionError::DuplicateStyle(style_name));
            }
            let geometry = match geometry.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(spec) => Some(Geometry::parse(spec).map_err(|source| {
                    DefinitionError::InvalidGeometry {
                        style: style_name.clone(),
                        source,
                    }
                })?),
            };
            let format = format
                .map(|f| f.trim().trim_start_matches('.').to_string())
                .filter(|f| !f.is_empty());
            styles.push(Style {
                name: style_name,
                geometry,
                format,
            });
        }

        match styles.iter().position(Style::is_original) {
            Some(0) => {}
            Some(index) => {
                let original = styles.remove(index);
                styles.insert(0, original);
            }
            None => styles.insert(
                0,
                Style {
                    name: ORIGINAL_STYLE.to_string(),
                    geometry: None,
                    format: None,
                },
            ),
        }

        let default_style = self
            .default_style
            .unwrap_or_else(|| ORIGINAL_STYLE.to_string());
        if !styles.iter().any(|s| s.name == default_style) {
            return Err(DefinitionError::UnknownDefaultStyle(default_style));
        }

        Ok(AttachmentDefinition {
            name,
            styles,
            default_style,
            url: self.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            default_url: self
                .default_url
                .unwrap_or_else(|| DEFAULT_MISSING_URL.to_string()),
            path: self.path.unwrap_or_else(|| DEFAULT_PATH.to_string()),
            whiny_thumbnails: self.whiny_thumbnails,
            validators: self.validators,
            filename_policy: self.filename_policy,
        })
    }
}

/// Collaborators shared by every attachment of a model
pub struct AttachmentBackend {
    pub storage: Arc<dyn Storage>,
    pub transcoder: Arc<dyn Transcoder>,
    pub settings: AttachmentSettings,
    pub interpolator: Interpolator,
}

impl AttachmentBackend {
    pub fn new(
        storage: Arc<dyn Storage>,
        transcoder: Arc<dyn Transcoder>,
        settings: AttachmentSettings,
    ) -> Self {
        Self {
            storage,
            transcoder,
            settings,
            interpolator: Interpolator::new(),
        }
    }

    /// Filesystem storage and ImageMagick, both configured from `settings`
    pub fn from_settings(settings: AttachmentSettings) -> Self {
        let storage = Arc::new(LocalStorage::new(&settings.storage_root));
        let transcoder = Arc::new(ImageMagick::from_settings(&settings));
        Self::new(storage, transcoder, settings)
    }

    pub fn with_interpolator(mut self, interpolator: Interpolator) -> Self {
        self.interpolator = interpolator;
        self
    }
}

impl std::fmt::Debug for AttachmentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentBackend")
            .field("storage", &self.storage.name())
            .field("transcoder", &self.transcoder.name())
            .field("settings", &self.settings)
            .field("interpolator", &self.interpolator)
            .finish()
    }
}

/// All attachment declarations of one model
#[derive(Debug, Clone)]
pub struct ModelAttachments {
    model_name: String,
    definitions: BTreeMap<String, Arc<AttachmentDefinition>>,
    backend: Arc<AttachmentBackend>,
}

impl ModelAttachments {
    pub fn new(model_name: impl Into<String>, backend: Arc<AttachmentBackend>) -> Self {
        Self {
            model_name: model_name.into(),
            definitions: BTreeMap::new(),
            backend,
        }
    }

    /// Declare an attachment field
    pub fn has_attached_file(
        &mut self,
        definition: AttachmentDefinition,
    ) -> Result<&mut Self, DefinitionError> {
        if self.definitions.contains_key(&definition.name) {
            return Err(DefinitionError::DuplicateAttachment(definition.name));
        }
        debug!(
            model = %self.model_name,
            attachment = %definition.name,
            styles = ?definition.style_names().collect::<Vec<_>>(),
            "Attachment declared"
        );
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(self)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn definition(&self, name: &str) -> Option<&Arc<AttachmentDefinition>> {
        self.definitions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }

    pub fn backend(&self) -> &Arc<AttachmentBackend> {
        &self.backend
    }
}
