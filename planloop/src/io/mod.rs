//! Collaborator contracts and side-effecting helpers.
//!
//! Everything that talks to something outside the process lives here: tools,
//! model functions and their backends, configuration and session files.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod backend;
pub mod config;
pub mod function;
pub mod model;
pub mod prompt;
pub mod registry;
pub mod resilient;
pub mod session;
pub mod tool;

/// Write `contents` next to `path`, then rename over it.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
