//! Geometry
//!
//! Parses resize specifications such as `100x100`, `100x100#`, `200x`, `x50>`
//! and computes the dimensions a source image ends up with.
//!
//! Rounding policy: every scaled dimension is rounded half up and never drops
//! below one pixel. Crop offsets are truncated toward zero.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static GEOMETRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d*)(?:x(\d*))?([#!<>])?$").expect("geometry pattern is valid"));

/// Geometry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("Geometry is empty")]
    Empty,
    #[error("Invalid geometry: {0:?}")]
    Invalid(String),
    #[error("Geometry {0:?} has neither width nor height")]
    MissingDimensions(String),
    #[error("Geometry {0:?} has a zero dimension")]
    ZeroDimension(String),
    #[error("Invalid dimensions: {0:?}")]
    InvalidDimensions(String),
}

/// Trailing geometry modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    /// `#` scale to cover the target, then crop the center
    Crop,
    /// `!` stretch to exactly the target, ignoring aspect ratio
    Force,
    /// `<` resize only when it would enlarge the image
    GrowOnly,
    /// `>` resize only when it would shrink the image
    ShrinkOnly,
}

impl Modifier {
    pub fn as_char(&self) -> char {
        match self {
            Self::Crop => '#',
            Self::Force => '!',
            Self::GrowOnly => '<',
            Self::ShrinkOnly => '>',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '#' => Some(Self::Crop),
            '!' => Some(Self::Force),
            '<' => Some(Self::GrowOnly),
            '>' => Some(Self::ShrinkOnly),
            _ => None,
        }
    }
}

/// Pixel dimensions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parses `WxH` as printed by `identify -format %wx%h`
impl FromStr for Dimensions {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (w, h) = trimmed
            .split_once('x')
            .ok_or_else(|| GeometryError::InvalidDimensions(trimmed.to_string()))?;
        let parse = |v: &str| {
            v.parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| GeometryError::InvalidDimensions(trimmed.to_string()))
        };
        Ok(Self::new(parse(w)?, parse(h)?))
    }
}

/// How a crop geometry is carried out: resize to cover, then cut the center
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlan {
    pub resize: Dimensions,
    pub crop: Dimensions,
    pub offset_x: u32,
    pub offset_y: u32,
}

/// Parsed resize specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub modifier: Option<Modifier>,
}

impl Geometry {
    pub fn parse(spec: &str) -> Result<Self, GeometryError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(GeometryError::Empty);
        }

        let caps = GEOMETRY_RE
            .captures(spec)
            .ok_or_else(|| GeometryError::Invalid(spec.to_string()))?;

        let dimension = |idx: usize| -> Result<Option<u32>, GeometryError> {
            match caps.get(idx).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
                None => Ok(None),
                Some(digits) => {
                    let value: u32 = digits
                        .parse()
                        .map_err(|_| GeometryError::Invalid(spec.to_string()))?;
                    if value == 0 {
                        return Err(GeometryError::ZeroDimension(spec.to_string()));
                    }
                    Ok(Some(value))
                }
            }
        };

        let width = dimension(1)?;
        let height = dimension(2)?;
        if width.is_none() && height.is_none() {
            return Err(GeometryError::MissingDimensions(spec.to_string()));
        }

        let modifier = caps
            .get(3)
            .and_then(|m| m.as_str().chars().next())
            .and_then(Modifier::from_char);

        Ok(Self {
            width,
            height,
            modifier,
        })
    }

    pub fn is_crop(&self) -> bool {
        self.modifier == Some(Modifier::Crop)
    }

    /// Dimensions of `source` after applying this geometry
    pub fn transform(&self, source: Dimensions) -> Dimensions {
        let source = Dimensions::new(source.width.max(1), source.height.max(1));
        let fit = self.fit_scale(source);

        match self.modifier {
            None => scale(source, fit),
            Some(Modifier::Force) => Dimensions::new(
                self.width.unwrap_or(source.width),
                self.height.unwrap_or(source.height),
            ),
            Some(Modifier::ShrinkOnly) if fit < 1.0 => scale(source, fit),
            Some(Modifier::GrowOnly) if fit > 1.0 => scale(source, fit),
            Some(Modifier::ShrinkOnly) | Some(Modifier::GrowOnly) => source,
            Some(Modifier::Crop) => self.cover_and_crop(source).crop,
        }
    }

    /// Crop plan for `#` geometries, `None` for every other modifier
    pub fn crop_plan(&self, source: Dimensions) -> Option<CropPlan> {
        if !self.is_crop() {
            return None;
        }
        let source = Dimensions::new(source.width.max(1), source.height.max(1));
        Some(self.cover_and_crop(source))
    }

    fn cover_and_crop(&self, source: Dimensions) -> CropPlan {
        let (sw, sh) = (source.width as f64, source.height as f64);
        let target = match (self.width, self.height) {
            (Some(w), Some(h)) => Dimensions::new(w, h),
            (Some(w), None) => Dimensions::new(w, round_half_up(sh * w as f64 / sw)),
            (None, Some(h)) => Dimensions::new(round_half_up(sw * h as f64 / sh), h),
            (None, None) => source,
        };

        let cover = (target.width as f64 / sw).max(target.height as f64 / sh);
        let scaled = scale(source, cover);
        let resize = Dimensions::new(
            scaled.width.max(target.width),
            scaled.height.max(target.height),
        );

        CropPlan {
            resize,
            crop: target,
            offset_x: (resize.width - target.width) / 2,
            offset_y: (resize.height - target.height) / 2,
        }
    }

    fn fit_scale(&self, source: Dimensions) -> f64 {
        let (sw, sh) = (source.width as f64, source.height as f64);
        match (self.width, self.height) {
            (Some(w), Some(h)) => (w as f64 / sw).min(h as f64 / sh),
            (Some(w), None) => w as f64 / sw,
            (None, Some(h)) => h as f64 / sh,
            (None, None) => 1.0,
        }
    }
}

impl FromStr for Geometry {
    type Err = GeometryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(w) = self.width {
            write!(f, "{}", w)?;
        }
        if let Some(h) = self.height {
            write!(f, "x{}", h)?;
        }
        if let Some(m) = self.modifier {
            write!(f, "{}", m.as_char())?;
        }
        Ok(())
    }
}

fn round_half_up(value: f64) -> u32 {
    ((value + 0.5).floor() as u32).max(1)
}

fn scale(source: Dimensions, factor: f64) -> Dimensions {
    Dimensions::new(
        round_half_up(source.width as f64 * factor),
        round_half_up(source.height as f64 * factor),
    )
}
