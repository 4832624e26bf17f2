//! # Template Tree Passes
//!
//! Walks the defaults and custom roots and mirrors them into the export
//! root: directories are created, plain files copied, and `*.tmpl` files
//! evaluated with the `.tmpl` suffix stripped from the output name.
//!
//! Everything here is synchronous and must run on a blocking thread,
//! because template evaluation calls back into the engine's resolvers.

use crate::error::{ConfigError, ControllerError};
use crate::secret::GENERATED_SECRET_FILE;
use kubetemplate::{RenderMode, TemplateRenderer};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Written to the export root once a cycle has fully rendered
pub const COMPLETION_MARKER: &str = ".asterisk-config";

/// Top-level names in the export root owned by the sidecar
pub const RESERVED_NAMES: [&str; 2] = [GENERATED_SECRET_FILE, COMPLETION_MARKER];

/// One root mirrored into the export root in a given mode.
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget<'a> {
    /// Tree being read
    pub source_root: &'a Path,
    /// Tree being written
    pub export_root: &'a Path,
    /// Learn or render
    pub mode: RenderMode,
}

impl RenderTarget<'_> {
    /// Export path for a file under the source root.
    fn output_path(&self, relative: &Path, is_template: bool) -> PathBuf {
        let out = self.export_root.join(relative);
        if is_template { out.with_extension("") } else { out }
    }

    /// Walks the source root, returning the number of files processed.
    ///
    /// # Errors
    /// [`ConfigError::MissingRoot`], [`ConfigError::ReservedName`], template
    /// errors and filesystem errors.
    pub fn render(&self, renderer: &TemplateRenderer) -> Result<usize, ControllerError> {
        if !self.source_root.is_dir() {
            return Err(ConfigError::MissingRoot(self.source_root.to_path_buf()).into());
        }

        let mut files = 0;
        for entry in WalkDir::new(self.source_root).sort_by_file_name() {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(self.source_root)
                .unwrap_or(entry.path());

            if entry.file_type().is_dir() {
                let out = self.export_root.join(relative);
                std::fs::create_dir_all(&out).map_err(ControllerError::file("Failed to create", &out))?;
                continue;
            }

            let is_template = entry.path().extension() == Some(OsStr::new("tmpl"));
            let out = self.output_path(relative, is_template);
            check_reserved(self.export_root, &out)?;
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent).map_err(ControllerError::file("Failed to create", parent))?;
            }

            if is_template {
                self.render_template(renderer, entry.path(), &out)?;
            } else {
                std::fs::copy(entry.path(), &out).map_err(ControllerError::file("Failed to copy", entry.path()))?;
                debug!("Copied {}", out.display());
            }
            files += 1;
        }

        Ok(files)
    }

    fn render_template(&self, renderer: &TemplateRenderer, template: &Path, out: &Path) -> Result<(), ControllerError> {
        let source = std::fs::read_to_string(template).map_err(ControllerError::file("Failed to read", template))?;
        let name = template.display().to_string();

        match self.mode {
            RenderMode::Learn => {
                renderer.render(&name, &source, &mut std::io::sink(), RenderMode::Learn)?;
                debug!("Learned {}", name);
            }
            RenderMode::Render => {
                let mut rendered = Vec::with_capacity(source.len());
                renderer.render(&name, &source, &mut rendered, RenderMode::Render)?;
                std::fs::write(out, rendered).map_err(ControllerError::file("Failed to write", out))?;
                debug!("Rendered {} to {}", name, out.display());
            }
        }
        Ok(())
    }
}

fn check_reserved(export_root: &Path, out: &Path) -> Result<(), ControllerError> {
    let Ok(relative) = out.strip_prefix(export_root) else {
        return Ok(());
    };
    let mut components = relative.components();
    if let (Some(first), None) = (components.next(), components.next()) {
        let name = first.as_os_str().to_string_lossy();
        if RESERVED_NAMES.contains(&name.as_ref()) {
            return Err(ConfigError::ReservedName(name.into_owned()).into());
        }
    }
    Ok(())
}

/// Runs one pass over every root in order.
///
/// # Errors
/// Any error from [`RenderTarget::render`], or [`ConfigError::NoFilesProcessed`]
/// if the roots held no files at all.
pub fn run_pass(
    renderer: &TemplateRenderer,
    roots: &[&Path],
    export_root: &Path,
    mode: RenderMode,
) -> Result<usize, ControllerError> {
    let mut total = 0;
    for root in roots {
        let target = RenderTarget {
            source_root: root,
            export_root,
            mode,
        };
        let files = target.render(renderer)?;
        info!("{:?} pass processed {} files from {}", mode, files, root.display());
        total += files;
    }

    if total == 0 {
        return Err(ConfigError::NoFilesProcessed.into());
    }
    Ok(total)
}

/// Removes every top-level entry of the export root except the generated secret.
///
/// # Errors
/// Filesystem errors.
pub async fn clear_export_dir(export_root: &Path) -> Result<(), ControllerError> {
    clear_dir(export_root, &[GENERATED_SECRET_FILE]).await
}

/// Removes every top-level entry of the custom root, so nothing from a
/// previous archive survives the next extraction.
///
/// # Errors
/// Filesystem errors.
pub async fn clear_custom_dir(custom_root: &Path) -> Result<(), ControllerError> {
    clear_dir(custom_root, &[]).await
}

async fn clear_dir(root: &Path, keep: &[&str]) -> Result<(), ControllerError> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(ControllerError::file("Failed to read", root))?;

    while let Some(entry) = entries.next_entry().await? {
        if keep.iter().any(|name| entry.file_name() == **name) {
            continue;
        }
        let path = entry.path();
        let removed = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(ControllerError::file("Failed to remove", &path))?;
    }
    debug!("Cleared {}", root.display());
    Ok(())
}

/// Writes the completion marker.
///
/// # Errors
/// Filesystem errors.
pub async fn write_completion_marker(export_root: &Path) -> Result<(), ControllerError> {
    let path = export_root.join(COMPLETION_MARKER);
    tokio::fs::write(&path, b"complete")
        .await
        .map_err(ControllerError::file("Failed to write", &path))
}
