//! Run artifacts on disk
//!
//! Layout under the artifacts root:
//!
//! ```text
//! runs/<run_id>/step-<order>-<step_id>.png
//! runs/<run_id>/step-<order>-<step_id>-thumb.png
//! downloads/<file>
//! ```

use std::path::{Component, Path, PathBuf};

use image::ImageFormat;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};

pub const THUMBNAIL_MAX_WIDTH: u32 = 320;
pub const THUMBNAIL_MAX_HEIGHT: u32 = 200;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> EngineResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    /// Write a step screenshot and its thumbnail, returning the screenshot path.
    /// A thumbnail that cannot be produced is logged and skipped.
    pub fn save_screenshot(&self, run_id: &str, step_order: u32, step_id: &str, png: &[u8]) -> EngineResult<PathBuf> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("step-{}-{}.png", step_order, step_id));
        std::fs::write(&path, png)?;
        debug!(path = %path.display(), bytes = png.len(), "saved screenshot");

        if let Err(e) = write_thumbnail(png, &thumbnail_path(&path)) {
            warn!(path = %path.display(), error = %e, "failed to write thumbnail");
        }

        Ok(path)
    }

    /// Canonicalize a caller-supplied screenshot path and make sure it lives
    /// strictly inside the artifacts root. Relative paths are taken relative
    /// to the root.
    pub fn resolve_screenshot(&self, path: &Path) -> EngineResult<PathBuf> {
        let root = self.root.canonicalize()?;
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };

        match candidate.canonicalize() {
            Ok(resolved) => {
                if resolved.starts_with(&root) && resolved != root {
                    Ok(resolved)
                } else {
                    Err(EngineError::PathOutsideArtifacts(path.to_path_buf()))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let lexical = normalize(&candidate);
                if lexical.starts_with(&root) && lexical != root {
                    Err(EngineError::ArtifactNotFound(path.to_path_buf()))
                } else {
                    Err(EngineError::PathOutsideArtifacts(path.to_path_buf()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_screenshot(&self, path: &Path) -> EngineResult<Vec<u8>> {
        let resolved = self.resolve_screenshot(path)?;
        Ok(std::fs::read(resolved)?)
    }

    /// The thumbnail for a screenshot, or the screenshot itself when no
    /// thumbnail was written
    pub fn read_thumbnail(&self, path: &Path) -> EngineResult<Vec<u8>> {
        let resolved = self.resolve_screenshot(path)?;
        let thumb = thumbnail_path(&resolved);
        if thumb.is_file() {
            Ok(std::fs::read(thumb)?)
        } else {
            Ok(std::fs::read(resolved)?)
        }
    }
}

/// `step-1-x.png` becomes `step-1-x-thumb.png`
pub fn thumbnail_path(screenshot: &Path) -> PathBuf {
    let stem = screenshot
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    screenshot.with_file_name(format!("{}-thumb.png", stem))
}

fn write_thumbnail(png: &[u8], path: &Path) -> EngineResult<()> {
    let image = image::load_from_memory(png)?;
    let thumb = image.thumbnail(THUMBNAIL_MAX_WIDTH, THUMBNAIL_MAX_HEIGHT);
    thumb.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

/// Resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
