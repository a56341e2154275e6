use std::path::Path;

use anyhow::Context;
use peweld::PeImage;

/// Load and parse a PE image.
pub fn load_image(path: &Path) -> anyhow::Result<PeImage> {
    PeImage::from_file(path).with_context(|| format!("failed to load image: {}", path.display()))
}

/// Extract a display-friendly filename from a path.
pub fn file_display_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    )
}

/// Format an RVA or address as `0x...`.
pub fn hex(value: impl Into<u64>) -> String {
    format!("{:#x}", value.into())
}
