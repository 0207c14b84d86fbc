//! Resume sidecar persisted next to each staging file.
//!
//! The file is JSON, versioned, and replaced atomically (write to a temporary
//! file, then rename). A sidecar that cannot be read, has another version, or
//! was written for different remote content is ignored and the job restarts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::descriptor::{StreamDescriptor, StreamSource};
use crate::error::EngineError;
use crate::job::FragmentState;

pub const SIDECAR_VERSION: u32 = 1;

/// Kind-specific resume data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeData {
    Progressive {
        /// Remote size reported by the server.
        total_bytes: Option<u64>,
        /// `Some(false)` once the server was seen ignoring byte ranges.
        accepts_ranges: Option<bool>,
    },
    Fragmented {
        fragments: Vec<FragmentState>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub version: u32,
    pub descriptor_id: String,
    /// Digest of the parts of the descriptor that determine staging content.
    pub fingerprint: String,
    pub updated_at: DateTime<Utc>,
    pub data: ResumeData,
}

impl ResumeState {
    pub fn new(descriptor: &StreamDescriptor, data: ResumeData) -> Self {
        Self {
            version: SIDECAR_VERSION,
            descriptor_id: descriptor.id.clone(),
            fingerprint: fingerprint(descriptor),
            updated_at: Utc::now(),
            data,
        }
    }

    /// Load the sidecar at `path` if it belongs to `descriptor`.
    pub async fn load(path: &Path, descriptor: &StreamDescriptor) -> Option<Self> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read resume state, starting over");
                return None;
            }
        };
        let state: Self = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt resume state, starting over");
                return None;
            }
        };
        if state.version != SIDECAR_VERSION {
            warn!(
                path = %path.display(),
                version = state.version,
                "Unsupported resume state version, starting over"
            );
            return None;
        }
        if state.descriptor_id != descriptor.id || state.fingerprint != fingerprint(descriptor) {
            warn!(path = %path.display(), "Resume state belongs to different content, starting over");
            return None;
        }
        debug!(path = %path.display(), updated_at = %state.updated_at, "Loaded resume state");
        Some(state)
    }

    pub async fn save(&mut self, path: &Path) -> Result<(), EngineError> {
        self.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::Io { source: std::io::Error::other(e) })?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn fragments(&self) -> Option<&[FragmentState]> {
        match &self.data {
            ResumeData::Fragmented { fragments } => Some(fragments),
            ResumeData::Progressive { .. } => None,
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Hash of the descriptor fields that decide which bytes end up in staging.
///
/// Query strings are left out: signed URLs rotate between extractions while
/// still naming the same content.
pub fn fingerprint(descriptor: &StreamDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.id.as_bytes());
    hasher.update([0]);
    hasher.update(descriptor.container.as_bytes());
    if let StreamSource::Fragmented { fragments, .. } = &descriptor.source {
        hasher.update((fragments.len() as u64).to_le_bytes());
        for fragment in fragments.iter() {
            let path = fragment.url.split('?').next().unwrap_or_default();
            hasher.update([0]);
            hasher.update(path.as_bytes());
            if let Some(range) = fragment.byte_range {
                hasher.update(range.start.to_le_bytes());
                hasher.update(range.length.unwrap_or(u64::MAX).to_le_bytes());
            }
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FragmentRef, Protocol, TrackType};
    use crate::job::FragmentStatus;

    fn fragmented(urls: &[&str]) -> StreamDescriptor {
        StreamDescriptor::fragmented(
            "hls-720",
            urls.iter().map(|u| FragmentRef::new(*u)).collect(),
            Protocol::SegmentedHttp,
            TrackType::Combined,
        )
    }

    #[test]
    fn fingerprint_ignores_query_strings() {
        let a = fragmented(&["http://h/0.ts?sig=a", "http://h/1.ts?sig=a"]);
        let b = fragmented(&["http://h/0.ts?sig=b", "http://h/1.ts?sig=b"]);
        let c = fragmented(&["http://h/0.ts", "http://h/2.ts"]);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.part.state");
        let descriptor = fragmented(&["http://h/0.ts", "http://h/1.ts"]);

        let mut fragments = vec![FragmentState::pending(0), FragmentState::pending(1)];
        fragments[0].status = FragmentStatus::Done;
        fragments[0].byte_count = Some(10);
        let mut state = ResumeState::new(&descriptor, ResumeData::Fragmented { fragments });
        state.save(&path).await.unwrap();

        let loaded = ResumeState::load(&path, &descriptor).await.unwrap();
        assert_eq!(loaded.fragments().unwrap()[0].byte_count, Some(10));
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn mismatched_or_corrupt_state_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.part.state");
        let descriptor = fragmented(&["http://h/0.ts"]);
        let mut state = ResumeState::new(
            &descriptor,
            ResumeData::Fragmented {
                fragments: vec![FragmentState::pending(0)],
            },
        );
        state.save(&path).await.unwrap();

        let other = fragmented(&["http://h/other.ts"]);
        assert!(ResumeState::load(&path, &other).await.is_none());

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(ResumeState::load(&path, &descriptor).await.is_none());

        assert!(ResumeState::load(&dir.path().join("missing"), &descriptor).await.is_none());
    }
}
