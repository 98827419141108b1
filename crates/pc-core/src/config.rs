//! Configuration types and loading
//!
//! Process-wide attachment options. Each attachment declaration may override
//! `whiny_thumbnails`; everything else applies to every model.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Process-wide attachment configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AttachmentSettings {
    /// Abort the save when a style fails to process
    pub whiny_thumbnails: bool,
    /// Directory holding the `identify`/`convert` executables (None = search PATH)
    pub transcoder_path: Option<String>,
    /// Upper bound for a single transcoder invocation
    pub transcoder_timeout_seconds: u64,
    /// Root directory for the filesystem storage backend
    pub storage_root: String,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            whiny_thumbnails: true,
            transcoder_path: None,
            transcoder_timeout_seconds: 60,
            storage_root: "public/system".to_string(),
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl AttachmentSettings {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, starting from defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("PAPERCLIP_WHINY_THUMBNAILS") {
            config.whiny_thumbnails = parse_bool("PAPERCLIP_WHINY_THUMBNAILS", &value)?;
        }
        if let Some(path) = lookup("PAPERCLIP_TRANSCODER_PATH") {
            let path = path.trim();
            config.transcoder_path = (!path.is_empty()).then(|| path.to_string());
        }
        if let Some(value) = lookup("PAPERCLIP_TRANSCODER_TIMEOUT_SECONDS") {
            config.transcoder_timeout_seconds =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "PAPERCLIP_TRANSCODER_TIMEOUT_SECONDS".to_string(),
                        message: format!("expected a number of seconds, got {:?}", value),
                    })?;
        }
        if let Some(root) = lookup("PAPERCLIP_STORAGE_ROOT") {
            config.storage_root = root;
        }

        debug!(
            whiny_thumbnails = config.whiny_thumbnails,
            transcoder_path = ?config.transcoder_path,
            storage_root = %config.storage_root,
            "Attachment settings loaded"
        );

        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {:?}", other),
        }),
    }
}
