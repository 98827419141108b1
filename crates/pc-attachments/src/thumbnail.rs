//! Style processing
//!
//! A [`Thumbnail`] turns one source image into one style variant by calling an
//! external [`Transcoder`]. The source is identified first; the geometry is
//! then resolved against its real dimensions into `convert` arguments.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use pc_core::AttachmentSettings;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::geometry::{Dimensions, Geometry};

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("{} is not recognized by the identify command: {message}", path.display())]
    NotIdentified { path: PathBuf, message: String },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("{command} did not finish within {seconds}s")]
    TimedOut { command: String, seconds: u64 },

    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;

/// External image processing capability
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Dimensions of the first frame of `path`, failing for non-images
    async fn identify(&self, path: &Path) -> ProcessingResult<Dimensions>;

    /// Write `source` transformed by `args` to `destination`
    async fn convert(
        &self,
        source: &Path,
        args: &[String],
        destination: &Path,
    ) -> ProcessingResult<()>;

    /// Transcoder name for logging
    fn name(&self) -> &str;
}

/// ImageMagick `identify` / `convert`
#[derive(Debug, Clone)]
pub struct ImageMagick {
    /// Directory holding the executables; `None` searches `PATH`
    search_path: Option<PathBuf>,
    timeout: Duration,
}

impl Default for ImageMagick {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(60))
    }
}

impl ImageMagick {
    pub fn new(search_path: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            search_path,
            timeout,
        }
    }

    pub fn from_settings(settings: &AttachmentSettings) -> Self {
        Self::new(
            settings.transcoder_path.as_ref().map(PathBuf::from),
            Duration::from_secs(settings.transcoder_timeout_seconds),
        )
    }

    fn program(&self, command: &str) -> PathBuf {
        match &self.search_path {
            Some(dir) => dir.join(command),
            None => PathBuf::from(command),
        }
    }

    /// Run `command` and return its stdout; non-zero exits carry stderr
    async fn run(&self, command: &str, args: &[String]) -> ProcessingResult<String> {
        let program = self.program(command);
        debug!(command = %program.display(), ?args, "Running transcoder");

        let child = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessingError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(command, seconds = self.timeout.as_secs(), "Transcoder timed out");
                return Err(ProcessingError::TimedOut {
                    command: command.to_string(),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            return Err(ProcessingError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// First frame only, so animated sources produce a single image
fn first_frame(path: &Path) -> String {
    format!("{}[0]", path.display())
}

#[async_trait]
impl Transcoder for ImageMagick {
    async fn identify(&self, path: &Path) -> ProcessingResult<Dimensions> {
        let args = vec![
            "-format".to_string(),
            "%wx%h".to_string(),
            first_frame(path),
        ];

        let stdout = match self.run("identify", &args).await {
            Ok(stdout) => stdout,
            Err(ProcessingError::CommandFailed { stderr, .. }) => {
                return Err(ProcessingError::NotIdentified {
                    path: path.to_path_buf(),
                    message: stderr,
                })
            }
            Err(e) => return Err(e),
        };

        stdout
            .parse::<Dimensions>()
            .map_err(|e| ProcessingError::NotIdentified {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    async fn convert(
        &self,
        source: &Path,
        args: &[String],
        destination: &Path,
    ) -> ProcessingResult<()> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push(first_frame(source));
        full.extend(args.iter().cloned());
        full.push(destination.display().to_string());

        self.run("convert", &full).await.map(|_| ())
    }

    fn name(&self) -> &str {
        "imagemagick"
    }
}

/// One processed style, held in a temp file until it is stored
#[derive(Debug)]
pub struct StyleOutput {
    pub style: String,
    pub file: NamedTempFile,
    pub dimensions: Dimensions,
}

impl StyleOutput {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Geometry and output format of one style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub geometry: Option<Geometry>,
    pub format: Option<String>,
}

impl Thumbnail {
    pub fn new(geometry: Option<Geometry>, format: Option<String>) -> Self {
        Self { geometry, format }
    }

    /// Whether producing this style needs the transcoder at all
    pub fn needs_processing(&self) -> bool {
        self.geometry.is_some() || self.format.is_some()
    }

    /// `convert` arguments and resulting dimensions for a source
    pub fn transformation(&self, source: Dimensions) -> (Vec<String>, Dimensions) {
        let Some(geometry) = self.geometry else {
            return (Vec::new(), source);
        };

        match geometry.crop_plan(source) {
            Some(plan) => (
                vec![
                    "-resize".to_string(),
                    format!("{}!", plan.resize),
                    "-crop".to_string(),
                    format!("{}+{}+{}", plan.crop, plan.offset_x, plan.offset_y),
                    "+repage".to_string(),
                ],
                plan.crop,
            ),
            None => (
                vec!["-resize".to_string(), geometry.to_string()],
                geometry.transform(source),
            ),
        }
    }

    /// Produce the variant of `source`. `source_extension` is kept when the
    /// style declares no format.
    #[instrument(skip(self, transcoder, source), fields(backend = transcoder.name()))]
    pub async fn make(
        &self,
        transcoder: &dyn Transcoder,
        style: &str,
        source: &Path,
        source_extension: &str,
    ) -> ProcessingResult<StyleOutput> {
        let dimensions = transcoder.identify(source).await?;
        let (args, target) = self.transformation(dimensions);

        let extension = self.format.as_deref().unwrap_or(source_extension);
        let suffix = if extension.is_empty() {
            String::new()
        } else {
            format!(".{}", extension)
        };
        let file = tempfile::Builder::new()
            .prefix("paperclip-")
            .suffix(&suffix)
            .tempfile()?;

        transcoder.convert(source, &args, file.path()).await?;

        debug!(style, from = %dimensions, to = %target, "Style processed");

        Ok(StyleOutput {
            style: style.to_string(),
            file,
            dimensions: target,
        })
    }
}
