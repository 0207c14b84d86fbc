// Progressive Downloader: a single-URL stream written to one staging file.
//
// Resume appends from the staging length with a `Range` request. A server
// that ignores ranges is handled by the fetcher (held prefix discarded) and
// recorded in the sidecar so the next run restarts cleanly instead.

use async_trait::async_trait;
use humansize::{BINARY, format_size};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::descriptor::ByteRange;
use crate::downloader::{DownloadContext, StreamDownloader};
use crate::error::EngineError;
use crate::fetcher::{FetchRequest, FileSink};
use crate::job::{DownloadJob, JobState};
use crate::progress::ProgressTracker;
use crate::sidecar::{ResumeData, ResumeState};
use crate::staging::{ensure_parent, file_len};

/// Outcome of one run that did not fail.
enum RunOutcome {
    Completed,
    Paused,
}

#[derive(Debug, Clone)]
pub struct ProgressiveDownloader {
    ctx: DownloadContext,
}

impl ProgressiveDownloader {
    pub fn new(ctx: DownloadContext) -> Self {
        Self { ctx }
    }

    async fn run(
        &self,
        job: &mut DownloadJob,
        token: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let descriptor = job.descriptor.clone();
        let url = descriptor.progressive_url()?;
        ensure_parent(&job.staging_path).await?;
        let sidecar_path = job.sidecar_path();

        let resume_enabled = self.ctx.config.staging.resume;
        let (mut recorded_total, accepts_ranges) = if resume_enabled {
            match ResumeState::load(&sidecar_path, &descriptor).await.map(|s| s.data) {
                Some(ResumeData::Progressive {
                    total_bytes,
                    accepts_ranges,
                }) => (total_bytes, accepts_ranges),
                _ => (None, None),
            }
        } else {
            (None, None)
        };

        let existing = file_len(&job.staging_path).await?.unwrap_or(0);
        let mut offset = if resume_enabled && existing > 0 && accepts_ranges != Some(false) {
            existing
        } else {
            if existing > 0 {
                debug!(path = %job.staging_path.display(), "Discarding partial data without range support");
            }
            0
        };

        let mut tracker = ProgressTracker::new(
            job.job_id.clone(),
            &self.ctx.config.progress,
            self.ctx.listener.clone(),
        );

        // At most one restart from zero, after a 416 that does not mean "already complete".
        let mut restarted = false;
        loop {
            let mut sink = if offset > 0 {
                FileSink::append_to(&job.staging_path).await?
            } else {
                FileSink::truncate(&job.staging_path).await?
            };
            job.bytes_written = offset;
            job.total_bytes = recorded_total.or(job.total_bytes);
            tracker.start_at(offset);
            tracker.set_total(job.total_bytes);

            if offset > 0 {
                info!(
                    job_id = %job.job_id,
                    resume_at = %format_size(offset, BINARY),
                    "Resuming progressive download"
                );
            }

            let request = FetchRequest::new(url.clone())
                .with_range((offset > 0).then(|| ByteRange::from_offset(offset)))
                .with_headers(&descriptor.http_headers)?
                .with_expected_total(recorded_total);

            let start = offset;
            let result = self
                .ctx
                .fetcher
                .fetch(&request, &mut sink, token, &mut |n| tracker.update(start + n))
                .await;

            match result {
                Ok(fetched) => {
                    job.bytes_written = offset + fetched.bytes_transferred;
                    if fetched.content_length.is_some() {
                        recorded_total = fetched.content_length;
                        job.total_bytes = recorded_total;
                    }
                    tracker.set_total(job.total_bytes);
                    tracker.update(job.bytes_written);
                    job.retry_count += fetched.attempts.saturating_sub(1);

                    self.save_sidecar(job, recorded_total, Some(fetched.accepts_ranges))
                        .await;

                    if !fetched.r#final {
                        tracker.finish();
                        return Ok(RunOutcome::Paused);
                    }
                    if let Some(total) = recorded_total
                        && job.bytes_written != total
                    {
                        return Err(EngineError::inconsistent(
                            url.as_str(),
                            format!(
                                "staging holds {} bytes, server reported {total}",
                                job.bytes_written
                            ),
                        ));
                    }
                    tracker.finish();
                    return Ok(RunOutcome::Completed);
                }
                Err(EngineError::RangeNotSatisfiable { total }) if offset > 0 => {
                    let known = total.or(recorded_total);
                    if known == Some(offset) {
                        debug!(job_id = %job.job_id, "Staging file already complete");
                        job.bytes_written = offset;
                        job.total_bytes = known;
                        tracker.finish();
                        return Ok(RunOutcome::Completed);
                    }
                    if restarted {
                        return Err(EngineError::RangeNotSatisfiable { total });
                    }
                    warn!(
                        job_id = %job.job_id,
                        staged = offset,
                        remote = ?total,
                        "Range not satisfiable, restarting from zero"
                    );
                    restarted = true;
                    offset = 0;
                    recorded_total = None;
                }
                Err(e) => {
                    job.bytes_written = sink.position();
                    self.save_sidecar(job, recorded_total, accepts_ranges).await;
                    return Err(e);
                }
            }
        }
    }

    async fn save_sidecar(
        &self,
        job: &DownloadJob,
        total_bytes: Option<u64>,
        accepts_ranges: Option<bool>,
    ) {
        let mut state = ResumeState::new(
            &job.descriptor,
            ResumeData::Progressive {
                total_bytes,
                accepts_ranges,
            },
        );
        if let Err(e) = state.save(&job.sidecar_path()).await {
            warn!(job_id = %job.job_id, error = %e, "Failed to persist resume state");
        }
    }
}

#[async_trait]
impl StreamDownloader for ProgressiveDownloader {
    #[instrument(skip(self, job, token), fields(job_id = %job.job_id), level = "debug")]
    async fn download(&self, job: &mut DownloadJob, token: &CancellationToken) -> JobState {
        job.start();
        match self.run(job, token).await {
            Ok(RunOutcome::Completed) => {
                info!(
                    job_id = %job.job_id,
                    size = %format_size(job.bytes_written, BINARY),
                    "Progressive download completed"
                );
                job.complete()
            }
            Ok(RunOutcome::Paused) | Err(EngineError::Cancelled) => {
                info!(job_id = %job.job_id, bytes = job.bytes_written, "Progressive download paused");
                job.pause()
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Progressive download failed");
                job.fail(&e)
            }
        }
    }
}
