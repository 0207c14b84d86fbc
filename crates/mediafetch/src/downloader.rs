use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::fetcher::ChunkedFetcher;
use crate::job::{DownloadJob, JobState};
use crate::progress::SharedProgressListener;

/// Drives one [`DownloadJob`] to a terminal or paused state.
///
/// Errors never escape: they land in `job.last_error` and the returned state
/// is `Failed`. Cancellation yields `Paused` with resumable staging state.
#[async_trait]
pub trait StreamDownloader: Send + Sync {
    async fn download(&self, job: &mut DownloadJob, token: &CancellationToken) -> JobState;
}

/// Collaborators shared by every downloader of one engine.
#[derive(Clone)]
pub struct DownloadContext {
    pub fetcher: ChunkedFetcher,
    pub config: Arc<EngineConfig>,
    pub listener: Option<SharedProgressListener>,
}

impl DownloadContext {
    pub fn new(
        fetcher: ChunkedFetcher,
        config: Arc<EngineConfig>,
        listener: Option<SharedProgressListener>,
    ) -> Self {
        Self {
            fetcher,
            config,
            listener,
        }
    }
}

impl std::fmt::Debug for DownloadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadContext")
            .field("fetcher", &self.fetcher)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
