// Fragment Downloader: ordered assembly of a fragmented stream.
//
// Fragments are fetched with bounded concurrency and may complete in any
// order. Completed bodies wait in a reorder buffer and are appended to the
// staging file strictly in fragment order, so the set of done fragments is
// always a contiguous prefix of the sequence.

mod reorder;

pub use reorder::ReorderBuffer;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use humansize::{BINARY, format_size};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::descriptor::StreamDescriptor;
use crate::downloader::{DownloadContext, StreamDownloader};
use crate::error::EngineError;
use crate::fetcher::{ByteSink, FetchRequest, FileSink};
use crate::job::{DownloadJob, FragmentState, FragmentStatus, JobState};
use crate::progress::ProgressTracker;
use crate::retry::{RetryExhausted, RetryPolicy, retry_with_backoff};
use crate::sidecar::{ResumeData, ResumeState};
use crate::staging::{ensure_parent, file_len};

enum RunOutcome {
    Completed,
    Paused,
}

/// A fetched fragment body and the retries it took.
type FragmentResult = (usize, Result<(Bytes, u32), RetryExhausted>);

#[derive(Debug, Clone)]
pub struct FragmentDownloader {
    ctx: DownloadContext,
}

impl FragmentDownloader {
    pub fn new(ctx: DownloadContext) -> Self {
        Self { ctx }
    }

    fn fragment_policy(&self) -> RetryPolicy {
        let policy = self.ctx.fetcher.policy().clone();
        match self.ctx.config.fragment.fragment_retries {
            Some(retries) => policy.with_max_retries(retries),
            None => policy,
        }
    }

    async fn run(
        &self,
        job: &mut DownloadJob,
        token: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let descriptor = job.descriptor.clone();
        let count = descriptor.fragments().len();
        ensure_parent(&job.staging_path).await?;
        let sidecar_path = job.sidecar_path();

        let mut states: Vec<FragmentState> = (0..count).map(FragmentState::pending).collect();
        let staged = file_len(&job.staging_path).await?.unwrap_or(0);
        let saved = if self.ctx.config.staging.resume {
            ResumeState::load(&sidecar_path, &descriptor).await
        } else {
            None
        };
        let saved_fragments = saved.as_ref().and_then(ResumeState::fragments);
        let (done_prefix, prefix_bytes) = match saved_fragments {
            Some(fragments) => resume_prefix(&descriptor, fragments, staged),
            None => (0, 0),
        };

        // Bytes past the verified prefix belong to fragments that never
        // finished; drop them before appending.
        let mut sink = FileSink::truncate_to(&job.staging_path, prefix_bytes).await?;
        if let Some(fragments) = saved_fragments
            && done_prefix > 0
        {
            states[..done_prefix].copy_from_slice(&fragments[..done_prefix]);
            info!(
                job_id = %job.job_id,
                fragments_done = done_prefix,
                fragments_total = count,
                resume_at = %format_size(prefix_bytes, BINARY),
                "Resuming fragmented download"
            );
        }

        job.bytes_written = prefix_bytes;
        job.total_bytes = expected_total(&descriptor).or(job.total_bytes);

        let mut resume_state = ResumeState::new(
            &descriptor,
            ResumeData::Fragmented {
                fragments: states.clone(),
            },
        );
        resume_state.save(&sidecar_path).await?;

        let mut tracker = ProgressTracker::new(
            job.job_id.clone(),
            &self.ctx.config.progress,
            self.ctx.listener.clone(),
        );
        tracker.start_at(prefix_bytes);
        tracker.set_total(job.total_bytes);

        let policy = self.fragment_policy();
        let concurrency = self.ctx.config.fragment.concurrency.max(1);
        let window = self.ctx.config.fragment.max_buffered_fragments.max(concurrency);

        let mut reorder = ReorderBuffer::new(done_prefix);
        let mut next_launch = done_prefix;
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<EngineError> = None;
        let mut cancelled = false;

        loop {
            while failure.is_none()
                && !cancelled
                && !token.is_cancelled()
                && in_flight.len() < concurrency
                && next_launch < count
                && next_launch < reorder.next_index() + window
            {
                states[next_launch].status = FragmentStatus::Fetching;
                trace!(job_id = %job.job_id, index = next_launch, "Launching fragment");
                in_flight.push(self.fetch_fragment(&descriptor, next_launch, &policy, token));
                next_launch += 1;
            }

            let Some((index, result)) = in_flight.next().await else {
                break;
            };

            match result {
                Ok((body, retries)) => {
                    states[index].retry_count = retries;
                    job.retry_count += retries;
                    reorder.insert(index, body);

                    let mut flushed = false;
                    while let Some((ready, body)) = reorder.pop_ready() {
                        sink.append(&body).await?;
                        let state = &mut states[ready];
                        state.status = FragmentStatus::Done;
                        state.byte_count = Some(body.len() as u64);
                        job.bytes_written += body.len() as u64;
                        flushed = true;
                    }
                    if flushed {
                        sink.flush().await?;
                        resume_state.data = ResumeData::Fragmented {
                            fragments: states.clone(),
                        };
                        if let Err(e) = resume_state.save(&sidecar_path).await {
                            warn!(job_id = %job.job_id, error = %e, "Failed to persist resume state");
                        }
                        tracker.update(job.bytes_written);
                    }
                }
                Err(RetryExhausted {
                    error: EngineError::Cancelled,
                    ..
                }) => {
                    cancelled = true;
                    states[index].status = FragmentStatus::Pending;
                }
                Err(RetryExhausted { error, attempts }) => {
                    error!(
                        job_id = %job.job_id,
                        index,
                        attempts,
                        error = %error,
                        "Fragment exhausted its retries"
                    );
                    let state = &mut states[index];
                    state.status = FragmentStatus::Failed;
                    state.retry_count = attempts.saturating_sub(1);
                    job.retry_count += state.retry_count;
                    if failure.is_none() {
                        failure = Some(EngineError::FragmentUnrecoverable {
                            index,
                            attempts,
                            reason: error.to_string(),
                        });
                    }
                }
            }
        }

        // Fetched-but-unflushed bodies are discarded with the buffer.
        for state in &mut states {
            if state.status == FragmentStatus::Fetching {
                state.status = FragmentStatus::Pending;
            }
        }
        resume_state.data = ResumeData::Fragmented {
            fragments: states.clone(),
        };
        resume_state.save(&sidecar_path).await?;
        tracker.finish();

        if let Some(err) = failure {
            return Err(err);
        }
        if cancelled || token.is_cancelled() {
            debug!(
                job_id = %job.job_id,
                next_fragment = reorder.next_index(),
                "Fragmented download interrupted"
            );
            return Ok(RunOutcome::Paused);
        }
        if reorder.next_index() != count {
            return Err(EngineError::inconsistent(
                descriptor.id.as_str(),
                format!("assembled {} of {count} fragments", reorder.next_index()),
            ));
        }
        if job.total_bytes.is_none() {
            job.total_bytes = Some(job.bytes_written);
        }
        Ok(RunOutcome::Completed)
    }

    /// Fetch one fragment into memory, retrying the whole fragment with a fresh
    /// buffer on each attempt.
    async fn fetch_fragment(
        &self,
        descriptor: &StreamDescriptor,
        index: usize,
        policy: &RetryPolicy,
        token: &CancellationToken,
    ) -> FragmentResult {
        let fetcher = &self.ctx.fetcher;
        let expected = descriptor.fragments()[index].expected_size();

        let result = retry_with_backoff(policy, token, move |attempt| async move {
            let url = descriptor.fragment_url(index)?;
            let request = FetchRequest::new(url)
                .with_range(descriptor.fragments()[index].byte_range)
                .with_headers(&descriptor.http_headers)?;

            let mut body = Vec::with_capacity(expected.unwrap_or(0) as usize);
            let fetched = fetcher
                .fetch_once(&request, &mut body, token, &mut |_| {})
                .await?;
            if !fetched.r#final {
                return Err(EngineError::Cancelled);
            }
            if let Some(expected) = expected
                && body.len() as u64 != expected
            {
                return Err(EngineError::transient(
                    request.url.as_str(),
                    format!("fragment body is {} bytes, expected {expected}", body.len()),
                ));
            }
            Ok((Bytes::from(body), attempt))
        })
        .await;

        (index, result)
    }
}

/// Sum of fragment sizes, when every fragment is a bounded byte range.
fn expected_total(descriptor: &StreamDescriptor) -> Option<u64> {
    descriptor
        .fragments()
        .iter()
        .map(|f| f.expected_size())
        .sum::<Option<u64>>()
}

/// Longest prefix of saved fragment states that is done, consistent with the
/// descriptor and fully present in the staging file.
///
/// Returns the prefix length in fragments and in bytes.
fn resume_prefix(
    descriptor: &StreamDescriptor,
    saved: &[FragmentState],
    staged_bytes: u64,
) -> (usize, u64) {
    let fragments = descriptor.fragments();
    if saved.len() != fragments.len() {
        return (0, 0);
    }

    let mut done = 0;
    let mut bytes = 0u64;
    for (position, state) in saved.iter().enumerate() {
        if state.index != position || state.status != FragmentStatus::Done {
            break;
        }
        let Some(count) = state.byte_count else {
            break;
        };
        if fragments[position]
            .expected_size()
            .is_some_and(|expected| expected != count)
        {
            break;
        }
        if bytes + count > staged_bytes {
            break;
        }
        bytes += count;
        done += 1;
    }
    (done, bytes)
}

#[async_trait]
impl StreamDownloader for FragmentDownloader {
    #[instrument(skip(self, job, token), fields(job_id = %job.job_id), level = "debug")]
    async fn download(&self, job: &mut DownloadJob, token: &CancellationToken) -> JobState {
        job.start();
        match self.run(job, token).await {
            Ok(RunOutcome::Completed) => {
                info!(
                    job_id = %job.job_id,
                    fragments = job.descriptor.fragments().len(),
                    size = %format_size(job.bytes_written, BINARY),
                    "Fragmented download completed"
                );
                job.complete()
            }
            Ok(RunOutcome::Paused) | Err(EngineError::Cancelled) => {
                info!(job_id = %job.job_id, bytes = job.bytes_written, "Fragmented download paused");
                job.pause()
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Fragmented download failed");
                job.fail(&e)
            }
        }
    }
}
