//! Output formats and the renderer parameters that produce them.

use std::fmt;

/// Internal rendering resolution handed to the renderer.
pub const RENDER_DPI: u32 = 300;
/// 300 / 3 = 100 DPI delivered images.
pub const DOWNSCALE_FACTOR: u32 = 3;
pub const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable parameter set for one supported output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    pub format: OutputFormat,
    /// Ghostscript output device.
    pub device: &'static str,
    pub resolution_dpi: u32,
    pub downscale_factor: u32,
    /// Ignored by non-JPEG devices.
    pub jpeg_quality: u8,
    pub content_type: &'static str,
}

pub static PNG: FormatSpec = FormatSpec {
    format: OutputFormat::Png,
    device: "png16m",
    resolution_dpi: RENDER_DPI,
    downscale_factor: DOWNSCALE_FACTOR,
    jpeg_quality: JPEG_QUALITY,
    content_type: "image/png",
};

pub static JPEG: FormatSpec = FormatSpec {
    format: OutputFormat::Jpeg,
    device: "jpeg",
    resolution_dpi: RENDER_DPI,
    downscale_factor: DOWNSCALE_FACTOR,
    jpeg_quality: JPEG_QUALITY,
    content_type: "image/jpeg",
};

pub fn default_spec() -> &'static FormatSpec {
    &PNG
}

/// Pick the output format from an `Accept` header value.
///
/// Only an exact `image/jpeg` selects JPEG. Everything else, including a missing
/// header, wildcards, quality lists and garbage, falls back to PNG.
pub fn negotiate(accept: Option<&str>) -> &'static FormatSpec {
    match accept {
        Some(value) if value == JPEG.content_type => &JPEG,
        _ => default_spec(),
    }
}
