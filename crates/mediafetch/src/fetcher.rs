// Chunked Fetcher: one HTTP body or byte range, streamed into an append-only sink.
//
// Retries resume from the bytes already delivered to the sink, so no byte
// range is ever written twice. A server that ignores `Range` has the
// already-held prefix read and discarded.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::client::header_map;
use crate::descriptor::ByteRange;
use crate::error::{EngineError, is_transient_reqwest_error};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::throttle::Throttle;

/// Append-only byte destination.
#[async_trait]
pub trait ByteSink: Send {
    async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()>;

    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

/// Buffered append-only writer over a staging file.
pub struct FileSink {
    writer: BufWriter<tokio::fs::File>,
    position: u64,
}

impl FileSink {
    /// Open `path` for appending, creating it when missing.
    pub async fn append_to(path: &std::path::Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let position = file.metadata().await?.len();
        Ok(Self {
            writer: BufWriter::with_capacity(256 * 1024, file),
            position,
        })
    }

    /// Truncate (or create) `path` and open it for appending.
    pub async fn truncate(path: &std::path::Path) -> std::io::Result<Self> {
        Self::truncate_to(path, 0).await
    }

    /// Cut `path` down to `len` bytes and open it for appending.
    pub async fn truncate_to(path: &std::path::Path, len: u64) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await?;
        file.set_len(len).await?;
        drop(file);
        Self::append_to(path).await
    }

    /// Bytes in the file, including buffered ones.
    pub fn position(&self) -> u64 {
        self.position
    }
}

#[async_trait]
impl ByteSink for FileSink {
    async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(chunk).await?;
        self.position += chunk.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await
    }
}

/// One fetch: a URL, an optional byte range and per-stream headers.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub range: Option<ByteRange>,
    pub headers: HeaderMap,
    /// Resource size learned from an earlier response. A different size
    /// reported now means the remote content changed.
    pub expected_total: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            range: None,
            headers: HeaderMap::new(),
            expected_total: None,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }

    pub fn with_headers(mut self, headers: &BTreeMap<String, String>) -> Result<Self, EngineError> {
        self.headers = header_map(headers)?;
        Ok(self)
    }

    pub fn with_expected_total(mut self, total: Option<u64>) -> Self {
        self.expected_total = total;
        self
    }
}

/// Result of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResult {
    /// Bytes appended to the sink by this fetch.
    pub bytes_transferred: u64,
    /// `false` when the fetch stopped early because of cancellation.
    pub r#final: bool,
    /// Total size of the remote resource, when the server reported it.
    pub content_length: Option<u64>,
    /// Whether the server advertised or honoured byte ranges.
    pub accepts_ranges: bool,
    /// Attempts made, including the first.
    pub attempts: u32,
}

/// Mutable state carried across the attempts of one fetch.
#[derive(Debug, Default)]
struct AttemptState {
    transferred: u64,
    known_total: Option<u64>,
    accepts_ranges: bool,
}

enum AttemptOutcome {
    Complete,
    Cancelled,
}

/// Performs HTTP whole-body or byte-range fetches with retry, throttling and resume.
#[derive(Debug, Clone)]
pub struct ChunkedFetcher {
    client: Client,
    throttle: Throttle,
    policy: RetryPolicy,
    read_timeout: Duration,
}

impl ChunkedFetcher {
    pub fn new(client: Client, throttle: Throttle, policy: RetryPolicy, read_timeout: Duration) -> Self {
        Self {
            client,
            throttle,
            policy,
            read_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch `request` into `sink`, retrying transient failures.
    ///
    /// A retry after a partial transfer resumes at `bytes_transferred`.
    /// `progress` receives the cumulative byte count of this fetch.
    pub async fn fetch<S>(
        &self,
        request: &FetchRequest,
        sink: &mut S,
        token: &CancellationToken,
        progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<FetchResult, EngineError>
    where
        S: ByteSink + ?Sized,
    {
        let mut state = AttemptState {
            known_total: request.expected_total,
            ..Default::default()
        };
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let err = match self
                .attempt(request, &mut state, sink, token, progress)
                .await
            {
                Ok(outcome) => {
                    sink.flush().await?;
                    return Ok(FetchResult {
                        bytes_transferred: state.transferred,
                        r#final: matches!(outcome, AttemptOutcome::Complete),
                        content_length: state.known_total,
                        accepts_ranges: state.accepts_ranges,
                        attempts,
                    });
                }
                Err(err) => err,
            };

            // Keep what was received so far durable before sleeping.
            sink.flush().await?;

            match self.policy.next_delay(attempts, err.kind()) {
                RetryDecision::Retry(delay) => {
                    let delay = self.policy.with_hint(delay, err.retry_after_secs());
                    warn!(
                        url = %request.url,
                        attempt = attempts,
                        resume_at = state.transferred,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Ok(FetchResult {
                                bytes_transferred: state.transferred,
                                r#final: false,
                                content_length: state.known_total,
                                accepts_ranges: state.accepts_ranges,
                                attempts,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => return Err(Self::surface(err, attempts, &request.url)),
            }
        }
    }

    /// Single attempt without retries. Used where the caller owns the retry
    /// loop and discards partial output on failure (fragments).
    pub async fn fetch_once<S>(
        &self,
        request: &FetchRequest,
        sink: &mut S,
        token: &CancellationToken,
        progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<FetchResult, EngineError>
    where
        S: ByteSink + ?Sized,
    {
        let mut state = AttemptState {
            known_total: request.expected_total,
            ..Default::default()
        };
        let outcome = self
            .attempt(request, &mut state, sink, token, progress)
            .await?;
        sink.flush().await?;
        Ok(FetchResult {
            bytes_transferred: state.transferred,
            r#final: matches!(outcome, AttemptOutcome::Complete),
            content_length: state.known_total,
            accepts_ranges: state.accepts_ranges,
            attempts: 1,
        })
    }

    fn surface(err: EngineError, attempts: u32, url: &Url) -> EngineError {
        match err {
            EngineError::Cancelled
            | EngineError::InconsistentResource { .. }
            | EngineError::RangeNotSatisfiable { .. }
            | EngineError::Io { .. } => err,
            other => EngineError::FetchFailed {
                kind: other.kind(),
                attempts,
                url: url.to_string(),
                reason: other.to_string(),
            },
        }
    }

    async fn attempt<S>(
        &self,
        request: &FetchRequest,
        state: &mut AttemptState,
        sink: &mut S,
        token: &CancellationToken,
        progress: &mut (dyn FnMut(u64) + Send),
    ) -> Result<AttemptOutcome, EngineError>
    where
        S: ByteSink + ?Sized,
    {
        let effective = match request.range {
            Some(range) => Some(range.advanced_by(state.transferred)),
            None if state.transferred > 0 => Some(ByteRange::from_offset(state.transferred)),
            None => None,
        };
        if effective.is_some_and(|r| r.length == Some(0)) {
            return Ok(AttemptOutcome::Complete);
        }

        let mut builder = self
            .client
            .get(request.url.clone())
            .headers(request.headers.clone())
            // Byte offsets must refer to the stored representation.
            .header(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if let Some(range) = effective {
            builder = builder.header(header::RANGE, range.header_value());
        }

        trace!(url = %request.url, range = ?effective, "Sending request");
        let response = tokio::select! {
            _ = token.cancelled() => return Ok(AttemptOutcome::Cancelled),
            response = builder.send() => response.map_err(|e| classify_reqwest_error(&request.url, e))?,
        };

        let status = response.status();
        let (mut skip, body_limit) = match status {
            StatusCode::PARTIAL_CONTENT => {
                state.accepts_ranges = true;
                let content_range = parse_content_range(response.headers());
                if let (Some((start, _, _)), Some(range)) = (content_range, effective)
                    && start != range.start
                {
                    return Err(EngineError::inconsistent(
                        request.url.as_str(),
                        format!("asked for offset {} but server sent {}", range.start, start),
                    ));
                }
                let total = content_range.and_then(|(_, _, total)| total);
                self.check_total(request, state, total)?;
                (0, response.content_length())
            }
            s if s.is_success() => {
                state.accepts_ranges = advertises_ranges(response.headers());
                let total = response.content_length();
                self.check_total(request, state, total)?;
                match effective {
                    Some(range) if range.start > 0 => {
                        debug!(
                            url = %request.url,
                            skip = range.start,
                            "Server ignored Range, discarding held prefix"
                        );
                        let remaining = total.map(|t| t.saturating_sub(range.start));
                        (range.start, range.length.or(remaining))
                    }
                    Some(range) => (0, range.length.or(total)),
                    None => (0, total),
                }
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let total = parse_content_range(response.headers()).and_then(|(_, _, t)| t);
                return Err(EngineError::RangeNotSatisfiable { total });
            }
            _ => return Err(classify_status(&request.url, &response)),
        };

        let host = request.url.host_str().unwrap_or_default().to_string();
        let mut received_for_body: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Ok(AttemptOutcome::Cancelled),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    return Err(EngineError::transient(
                        request.url.as_str(),
                        format!("no data for {:?}", self.read_timeout),
                    ));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(EngineError::transient(request.url.as_str(), e.to_string()));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            let mut data: &[u8] = &chunk;
            if skip > 0 {
                let dropped = skip.min(data.len() as u64);
                data = &data[dropped as usize..];
                skip -= dropped;
            }
            if let Some(limit) = body_limit {
                let room = limit.saturating_sub(received_for_body);
                if (data.len() as u64) > room {
                    data = &data[..room as usize];
                }
            }
            if data.is_empty() {
                if body_limit.is_some_and(|limit| received_for_body >= limit) {
                    break;
                }
                continue;
            }

            self.throttle.acquire(&host, data.len() as u64).await;
            sink.append(data).await?;
            received_for_body += data.len() as u64;
            state.transferred += data.len() as u64;
            progress(state.transferred);
        }

        if let Some(limit) = body_limit
            && received_for_body < limit
        {
            return Err(EngineError::transient(
                request.url.as_str(),
                format!("body truncated at {received_for_body} of {limit} bytes"),
            ));
        }

        Ok(AttemptOutcome::Complete)
    }

    fn check_total(
        &self,
        request: &FetchRequest,
        state: &mut AttemptState,
        total: Option<u64>,
    ) -> Result<(), EngineError> {
        // Partial requests of a sub-range do not describe the whole resource.
        let Some(total) = total else {
            return Ok(());
        };
        match state.known_total {
            Some(known) if known != total => Err(EngineError::inconsistent(
                request.url.as_str(),
                format!("resource size changed from {known} to {total} bytes"),
            )),
            _ => {
                state.known_total = Some(total);
                Ok(())
            }
        }
    }
}

fn classify_reqwest_error(url: &Url, e: reqwest::Error) -> EngineError {
    if is_transient_reqwest_error(&e) {
        EngineError::transient(url.as_str(), e.to_string())
    } else {
        EngineError::from(e)
    }
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn advertises_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
}

/// Map a non-success status onto the error taxonomy.
///
/// 408, 429 and 5xx are transient; so is a 404 carrying `Retry-After`.
fn classify_status(url: &Url, response: &Response) -> EngineError {
    let status = response.status();
    let hint = retry_after(response.headers());
    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || (status == StatusCode::NOT_FOUND && hint.is_some());
    if transient {
        EngineError::TransientNetwork {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
            retry_after_secs: hint,
        }
    } else {
        EngineError::server_rejected(status, url.as_str())
    }
}

/// Parse `Content-Range: bytes start-end/total` (or `bytes */total`).
fn parse_content_range(headers: &HeaderMap) -> Option<(u64, u64, Option<u64>)> {
    let value = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    if span.trim() == "*" {
        return Some((0, 0, total));
    }
    let (start, end) = span.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(
            parse_content_range(&headers(&[("content-range", "bytes 100-199/1000")])),
            Some((100, 199, Some(1000)))
        );
        assert_eq!(
            parse_content_range(&headers(&[("content-range", "bytes 0-9/*")])),
            Some((0, 9, None))
        );
        assert_eq!(
            parse_content_range(&headers(&[("content-range", "bytes */1000")])),
            Some((0, 0, Some(1000)))
        );
        assert_eq!(
            parse_content_range(&headers(&[("content-range", "items 0-1/2")])),
            None
        );
    }

    #[test]
    fn accept_ranges_detection() {
        assert!(advertises_ranges(&headers(&[("accept-ranges", "bytes")])));
        assert!(!advertises_ranges(&headers(&[("accept-ranges", "none")])));
        assert!(!advertises_ranges(&HeaderMap::new()));
    }

    #[tokio::test]
    async fn vec_sink_appends() {
        let mut sink = Vec::<u8>::new();
        ByteSink::append(&mut sink, b"ab").await.unwrap();
        ByteSink::append(&mut sink, b"cd").await.unwrap();
        assert_eq!(sink, b"abcd");
    }

    #[tokio::test]
    async fn file_sink_appends_after_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.part");
        tokio::fs::write(&path, b"hello ").await.unwrap();

        let mut sink = FileSink::append_to(&path).await.unwrap();
        assert_eq!(sink.position(), 6);
        sink.append(b"world").await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");

        let mut sink = FileSink::truncate(&path).await.unwrap();
        assert_eq!(sink.position(), 0);
        sink.append(b"x").await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"x");
    }
}
