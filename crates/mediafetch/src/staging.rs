//! Staging layout on disk.
//!
//! ```text
//! <staging_dir>/<media_id>/g<group>/<stream_id>.<container>.part
//! <staging_dir>/<media_id>/g<group>/<stream_id>.<container>.part.state
//! <output_dir>/<media_id>.<container>
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::StagingConfig;
use crate::descriptor::StreamDescriptor;
use crate::error::EngineError;

const PART_SUFFIX: &str = "part";
const SIDECAR_SUFFIX: &str = "state";

/// Replace everything outside `[A-Za-z0-9._-]` so ids are safe as path components.
pub fn sanitize_component(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // "." and ".." would escape the directory.
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{cleaned}")
    } else {
        cleaned
    }
}

/// `<staging>.state`
pub fn sidecar_path_for(staging_path: &Path) -> PathBuf {
    let mut name = OsString::from(staging_path.as_os_str());
    name.push(".");
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct StagingLayout {
    staging_root: PathBuf,
    output_dir: PathBuf,
}

impl StagingLayout {
    pub fn new(config: &StagingConfig) -> Self {
        Self {
            staging_root: config.staging_dir.clone(),
            output_dir: config.output_dir.clone(),
        }
    }

    pub fn media_dir(&self, media_id: &str) -> PathBuf {
        self.staging_root.join(sanitize_component(media_id))
    }

    pub fn group_dir(&self, media_id: &str, group_index: usize) -> PathBuf {
        self.media_dir(media_id).join(format!("g{group_index}"))
    }

    pub fn staging_path(
        &self,
        media_id: &str,
        group_index: usize,
        descriptor: &StreamDescriptor,
    ) -> PathBuf {
        self.group_dir(media_id, group_index).join(format!(
            "{}.{}.{}",
            sanitize_component(&descriptor.id),
            sanitize_component(&descriptor.container),
            PART_SUFFIX
        ))
    }

    pub fn output_path(&self, media_id: &str, container: &str) -> PathBuf {
        self.output_dir.join(format!(
            "{}.{}",
            sanitize_component(media_id),
            sanitize_component(container)
        ))
    }
}

pub async fn ensure_parent(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Move a finished staging file to its final location.
///
/// Falls back to copy + remove when a rename is impossible (different filesystems).
pub async fn promote(staging: &Path, output: &Path) -> Result<(), EngineError> {
    ensure_parent(output).await?;
    if let Err(e) = tokio::fs::rename(staging, output).await {
        debug!(error = %e, "Rename failed, copying staging file instead");
        tokio::fs::copy(staging, output).await?;
        tokio::fs::remove_file(staging).await?;
    }
    Ok(())
}

pub async fn remove_if_exists(path: &Path) -> Result<(), EngineError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Current length of a file, `None` when it does not exist.
pub async fn file_len(path: &Path) -> Result<Option<u64>, EngineError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
