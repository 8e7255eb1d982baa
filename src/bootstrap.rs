//! First-run working-area setup
//!
//! Copies a directory template (folder skeleton, starter configuration,
//! empty database) into the base directory. Existing files are never
//! overwritten, so re-running is safe and user edits survive.

use crate::error::Result;
use std::fs;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Seed `base_dir` from `template_dir`. Missing directories are created,
/// missing files copied; anything already present is left alone.
pub fn seed(template_dir: &Path, base_dir: &Path) -> Result<()> {
    if !template_dir.exists() {
        warn!(dir = %template_dir.display(), "template directory missing; skipping setup");
        return Ok(());
    }

    for entry in WalkDir::new(template_dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(template_dir) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let dest = base_dir.join(relative);
        if entry.file_type().is_dir() {
            if !dest.exists() {
                fs::create_dir_all(&dest)?;
                info!(dir = %dest.display(), "created");
            }
        } else if !dest.exists() {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &dest)?;
            info!(file = %dest.display(), "seeded");
        }
    }

    Ok(())
}
