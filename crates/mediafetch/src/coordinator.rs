// Download Coordinator: runs format groups in fallback order.
//
// Members of a group download concurrently. A group whose members all
// complete is finalized (single member promoted, several handed to the
// postprocessor for merging). A failed group leaves its staging files in
// place and the next candidate group is tried.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use humansize::{BINARY, format_size};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::create_client;
use crate::config::EngineConfig;
use crate::descriptor::{StreamDescriptor, StreamKind, TrackType};
use crate::downloader::{DownloadContext, StreamDownloader};
use crate::error::{EngineError, ErrorKind, FailedMember};
use crate::fetcher::ChunkedFetcher;
use crate::fragment::FragmentDownloader;
use crate::job::{DownloadJob, JobState};
use crate::progress::SharedProgressListener;
use crate::progressive::ProgressiveDownloader;
use crate::selector::FormatGroup;
use crate::staging::{
    StagingLayout, ensure_parent, promote, remove_if_exists, sidecar_path_for,
};
use crate::throttle::Throttle;

/// Codec and container metadata of one constituent stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub track: TrackType,
    pub container: String,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub tbr: Option<f64>,
    pub language: Option<String>,
}

impl From<&StreamDescriptor> for StreamInfo {
    fn from(descriptor: &StreamDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            track: descriptor.track,
            container: descriptor.container.clone(),
            vcodec: descriptor.vcodec.clone(),
            acodec: descriptor.acodec.clone(),
            width: descriptor.width,
            height: descriptor.height,
            fps: descriptor.fps,
            tbr: descriptor.bitrate(),
            language: descriptor.language.clone(),
        }
    }
}

/// One finished staging file handed to the postprocessor.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeInput {
    pub path: PathBuf,
    pub stream: StreamInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub media_id: String,
    pub inputs: Vec<MergeInput>,
    pub output_path: PathBuf,
    pub container: String,
}

/// External muxing stage. Receives finished staging files and writes
/// `output_path`; the inputs are removed by the coordinator afterwards.
#[async_trait]
pub trait Postprocessor: Send + Sync {
    async fn merge(&self, request: &MergeRequest) -> Result<(), EngineError>;
}

/// Postprocessor used when none is configured: every merge fails, so
/// groups needing one fall back to the next candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMerge;

#[async_trait]
impl Postprocessor for NoMerge {
    async fn merge(&self, request: &MergeRequest) -> Result<(), EngineError> {
        Err(EngineError::postprocess(format!(
            "no postprocessor configured to merge {} streams",
            request.inputs.len()
        )))
    }
}

/// Result handed to the caller on success.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalArtifact {
    pub path: PathBuf,
    pub container: String,
    pub size: u64,
    pub streams: Vec<StreamInfo>,
}

enum GroupFailure {
    Cancelled,
    Failed(Vec<FailedMember>),
}

pub struct DownloadCoordinator {
    ctx: DownloadContext,
    layout: StagingLayout,
    throttle: Throttle,
    progressive: ProgressiveDownloader,
    fragmented: FragmentDownloader,
    postprocessor: Arc<dyn Postprocessor>,
    token: CancellationToken,
}

impl DownloadCoordinator {
    pub fn new(config: Arc<EngineConfig>, client: Client, throttle: Throttle) -> Self {
        let fetcher = ChunkedFetcher::new(
            client,
            throttle.clone(),
            config.retry.clone(),
            config.http.read_timeout(),
        );
        let ctx = DownloadContext::new(fetcher, Arc::clone(&config), None);
        Self {
            layout: StagingLayout::new(&config.staging),
            throttle,
            progressive: ProgressiveDownloader::new(ctx.clone()),
            fragmented: FragmentDownloader::new(ctx.clone()),
            ctx,
            postprocessor: Arc::new(NoMerge),
            token: CancellationToken::new(),
        }
    }

    /// Validate `config` and build the HTTP client and throttle from it.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let client = create_client(&config.http)?;
        let throttle = Throttle::new(config.throttle.clone());
        Ok(Self::new(Arc::new(config), client, throttle))
    }

    pub fn with_postprocessor(mut self, postprocessor: Arc<dyn Postprocessor>) -> Self {
        self.postprocessor = postprocessor;
        self
    }

    pub fn with_progress_listener(mut self, listener: SharedProgressListener) -> Self {
        self.ctx.listener = Some(listener);
        self.progressive = ProgressiveDownloader::new(self.ctx.clone());
        self.fragmented = FragmentDownloader::new(self.ctx.clone());
        self
    }

    /// Use `token` as the parent of every job token. Cancelling it pauses
    /// all running jobs.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }

    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Download the first group that succeeds, trying `groups` in order.
    #[instrument(skip(self, groups), fields(groups = groups.len()))]
    pub async fn run(
        &self,
        media_id: &str,
        groups: &[FormatGroup],
    ) -> Result<FinalArtifact, EngineError> {
        if groups.is_empty() {
            return Err(EngineError::configuration("no format groups to download"));
        }

        let mut failed_members = Vec::new();
        for (group_index, group) in groups.iter().enumerate() {
            if self.token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self.attempt_group(media_id, group_index, group).await {
                Ok(artifact) => return Ok(artifact),
                Err(GroupFailure::Cancelled) => return Err(EngineError::Cancelled),
                Err(GroupFailure::Failed(members)) => {
                    if group_index + 1 < groups.len() {
                        warn!(
                            media_id,
                            group_index,
                            streams = ?group.ids(),
                            "Format group failed, falling back to next candidate"
                        );
                    }
                    failed_members.extend(members);
                }
            }
        }

        error!(media_id, failures = failed_members.len(), "All format groups failed");
        Err(EngineError::DownloadFailed {
            failed_members,
            fallback_available: false,
        })
    }

    /// Download only `groups[group_index]`, leaving fallback decisions to the
    /// caller. On failure `fallback_available` tells whether later candidates exist.
    pub async fn run_group(
        &self,
        media_id: &str,
        groups: &[FormatGroup],
        group_index: usize,
    ) -> Result<FinalArtifact, EngineError> {
        let group = groups.get(group_index).ok_or_else(|| {
            EngineError::configuration(format!("group index {group_index} out of range"))
        })?;
        match self.attempt_group(media_id, group_index, group).await {
            Ok(artifact) => Ok(artifact),
            Err(GroupFailure::Cancelled) => Err(EngineError::Cancelled),
            Err(GroupFailure::Failed(failed_members)) => Err(EngineError::DownloadFailed {
                failed_members,
                fallback_available: group_index + 1 < groups.len(),
            }),
        }
    }

    async fn attempt_group(
        &self,
        media_id: &str,
        group_index: usize,
        group: &FormatGroup,
    ) -> Result<FinalArtifact, GroupFailure> {
        info!(media_id, group_index, streams = ?group.ids(), "Downloading format group");

        let mut jobs: Vec<DownloadJob> = group
            .members()
            .iter()
            .map(|descriptor| {
                DownloadJob::new(
                    format!("{media_id}:{group_index}:{}", descriptor.id),
                    Arc::clone(descriptor),
                    self.layout.staging_path(media_id, group_index, descriptor),
                )
            })
            .collect();

        let group_token = self.token.child_token();
        let timed_out = {
            let downloads = join_all(jobs.iter_mut().map(|job| {
                let group_token = &group_token;
                async move {
                    let state = self.download_job(job, group_token).await;
                    // One failed member sinks the group; stop its siblings.
                    if state == JobState::Failed && !group_token.is_cancelled() {
                        debug!(stream = %job.descriptor.id, "Member failed, stopping group");
                        group_token.cancel();
                    }
                    state
                }
            }));
            tokio::pin!(downloads);

            let timed_out = match self.ctx.config.job_timeout() {
                Some(limit) => tokio::select! {
                    _ = &mut downloads => false,
                    _ = tokio::time::sleep(limit) => true,
                },
                None => {
                    (&mut downloads).await;
                    false
                }
            };
            if timed_out {
                warn!(media_id, group_index, "Job timeout reached, stopping downloads");
                group_token.cancel();
                (&mut downloads).await;
            }
            timed_out
        };

        if timed_out {
            let limit = self.ctx.config.job_timeout_secs.unwrap_or_default();
            let err = EngineError::timeout(format!("job exceeded {limit}s"));
            for job in jobs.iter_mut().filter(|j| j.state != JobState::Completed) {
                job.fail(&err);
            }
        } else if self.token.is_cancelled() {
            info!(media_id, group_index, "Download cancelled, jobs paused");
            return Err(GroupFailure::Cancelled);
        }

        // Members paused because a sibling failed are not failures themselves.
        let any_failed = jobs.iter().any(|job| job.state == JobState::Failed);
        let failed: Vec<FailedMember> = jobs
            .iter()
            .filter(|job| job.state != JobState::Completed)
            .filter(|job| !any_failed || job.state == JobState::Failed)
            .map(|job| {
                let (kind, message) = match &job.last_error {
                    Some(err) => (err.kind, err.message.clone()),
                    None => (ErrorKind::Cancelled, format!("job ended {}", job.state)),
                };
                FailedMember {
                    group_index,
                    descriptor_id: job.descriptor.id.clone(),
                    kind,
                    message,
                }
            })
            .collect();
        if !failed.is_empty() {
            for member in &failed {
                error!(media_id, %member, "Stream download failed");
            }
            return Err(GroupFailure::Failed(failed));
        }

        self.finalize(media_id, group_index, group, &jobs)
            .await
            .map_err(|e| {
                error!(media_id, group_index, error = %e, "Finalization failed");
                GroupFailure::Failed(vec![FailedMember {
                    group_index,
                    descriptor_id: group.ids().join("+"),
                    kind: e.kind(),
                    message: e.to_string(),
                }])
            })
    }

    async fn download_job(&self, job: &mut DownloadJob, token: &CancellationToken) -> JobState {
        match job.descriptor.kind() {
            StreamKind::Progressive => self.progressive.download(job, token).await,
            StreamKind::Fragmented => self.fragmented.download(job, token).await,
        }
    }

    async fn finalize(
        &self,
        media_id: &str,
        group_index: usize,
        group: &FormatGroup,
        jobs: &[DownloadJob],
    ) -> Result<FinalArtifact, EngineError> {
        let streams: Vec<StreamInfo> = jobs
            .iter()
            .map(|j| StreamInfo::from(&*j.descriptor))
            .collect();

        let (output_path, container) = match jobs {
            [job] => {
                let container = job.descriptor.container.clone();
                let output = self.layout.output_path(media_id, &container);
                promote(&job.staging_path, &output).await?;
                debug!(
                    from = %job.staging_path.display(),
                    to = %output.display(),
                    "Promoted staging file"
                );
                (output, container)
            }
            _ => {
                let container = self.merge_container(group);
                let output = self.layout.output_path(media_id, &container);
                ensure_parent(&output).await?;
                let request = MergeRequest {
                    media_id: media_id.to_string(),
                    inputs: jobs
                        .iter()
                        .map(|job| MergeInput {
                            path: job.staging_path.clone(),
                            stream: StreamInfo::from(&*job.descriptor),
                        })
                        .collect(),
                    output_path: output.clone(),
                    container: container.clone(),
                };
                self.postprocessor.merge(&request).await?;
                (output, container)
            }
        };

        self.cleanup(media_id, group_index, jobs).await;

        let size = tokio::fs::metadata(&output_path).await?.len();
        info!(
            media_id,
            path = %output_path.display(),
            size = %format_size(size, BINARY),
            streams = streams.len(),
            "Download finished"
        );
        Ok(FinalArtifact {
            path: output_path,
            container,
            size,
            streams,
        })
    }

    fn merge_container(&self, group: &FormatGroup) -> String {
        if let Some(container) = &self.ctx.config.staging.merge_container {
            return container.clone();
        }
        group
            .video()
            .or_else(|| group.members().first())
            .map_or_else(|| "mkv".to_string(), |d| d.container.clone())
    }

    /// Drop resume state and staging files of a finalized group.
    async fn cleanup(&self, media_id: &str, group_index: usize, jobs: &[DownloadJob]) {
        for job in jobs {
            if let Err(e) = remove_if_exists(&sidecar_path_for(&job.staging_path)).await {
                warn!(path = %job.staging_path.display(), error = %e, "Failed to remove resume state");
            }
        }
        if self.ctx.config.staging.keep_staging_on_success {
            return;
        }

        let group_dir = self.layout.group_dir(media_id, group_index);
        if let Err(e) = tokio::fs::remove_dir_all(&group_dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %group_dir.display(), error = %e, "Failed to remove staging directory");
        }
        // Only succeeds once no other group left partial state behind.
        let _ = tokio::fs::remove_dir(self.layout.media_dir(media_id)).await;
    }
}
