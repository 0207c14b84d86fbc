//! Shared fixtures: a local HTTP server with range support and fault injection.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use mediafetch::client::create_client;
use mediafetch::{
    ChunkedFetcher, DownloadContext, EngineConfig, RetryPolicy, SharedProgressListener, Throttle,
};

const PACE_CHUNK: usize = 4 * 1024;

/// One injected failure, consumed by the next request for a path.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with this status and no body.
    Status(StatusCode),
    /// Announce the full length, send `n` bytes, then drop the connection.
    Truncate(usize),
}

#[derive(Debug, Clone)]
struct Resource {
    data: Bytes,
    ranges: bool,
    faults: VecDeque<Fault>,
    always: Option<StatusCode>,
    delay: Option<Duration>,
    pace: Option<Duration>,
}

/// What a single request will be served with.
struct Plan {
    data: Bytes,
    ranges: bool,
    fault: Option<Fault>,
    delay: Option<Duration>,
    pace: Option<Duration>,
}

impl Resource {
    fn plan(&mut self) -> Plan {
        let fault = match self.always {
            Some(status) => Some(Fault::Status(status)),
            None => self.faults.pop_front(),
        };
        Plan {
            data: self.data.clone(),
            ranges: self.ranges,
            fault,
            delay: self.delay,
            pace: self.pace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLog {
    pub path: String,
    pub range: Option<String>,
}

#[derive(Default)]
struct ServerState {
    resources: Mutex<HashMap<String, Resource>>,
    requests: Mutex<Vec<RequestLog>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Counts a request as in flight until the handler returns.
struct InFlight<'a>(&'a ServerState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a ServerState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TestServer {
    base_url: String,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .fallback(serve)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Serve `data` at `path` with byte-range support.
    pub fn add(&self, path: &str, data: impl Into<Bytes>) {
        self.state.resources.lock().insert(
            path.to_string(),
            Resource {
                data: data.into(),
                ranges: true,
                faults: VecDeque::new(),
                always: None,
                delay: None,
                pace: None,
            },
        );
    }

    fn update(&self, path: &str, f: impl FnOnce(&mut Resource)) {
        let mut resources = self.state.resources.lock();
        let resource = resources
            .get_mut(path)
            .unwrap_or_else(|| panic!("no resource at {path}"));
        f(resource);
    }

    /// Replace the content served at `path`, keeping its behaviour.
    pub fn replace(&self, path: &str, data: impl Into<Bytes>) {
        let data = data.into();
        self.update(path, |r| r.data = data);
    }

    /// Ignore `Range` headers and stop advertising `Accept-Ranges`.
    pub fn disable_ranges(&self, path: &str) {
        self.update(path, |r| r.ranges = false);
    }

    pub fn inject(&self, path: &str, fault: Fault) {
        self.update(path, |r| r.faults.push_back(fault));
    }

    pub fn fail_times(&self, path: &str, times: usize, status: StatusCode) {
        self.update(path, |r| {
            r.faults
                .extend(std::iter::repeat_n(Fault::Status(status), times))
        });
    }

    pub fn always_fail(&self, path: &str, status: StatusCode) {
        self.update(path, |r| r.always = Some(status));
    }

    /// Wait before sending response headers.
    pub fn delay(&self, path: &str, delay: Duration) {
        self.update(path, |r| r.delay = Some(delay));
    }

    /// Stream the body in small chunks with `interval` between them.
    pub fn pace(&self, path: &str, interval: Duration) {
        self.update(path, |r| r.pace = Some(interval));
    }

    pub fn requests(&self) -> Vec<RequestLog> {
        self.state.requests.lock().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<RequestLog> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.requests_for(path).len()
    }

    /// Highest number of requests handled at the same time. A request stops
    /// counting once its headers are sent.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

async fn serve(State(state): State<Arc<ServerState>>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().push(RequestLog {
        path: path.clone(),
        range: range.clone(),
    });
    let _in_flight = InFlight::enter(&state);

    let plan = {
        let mut resources = state.resources.lock();
        match resources.get_mut(&path) {
            Some(resource) => resource.plan(),
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };

    if let Some(delay) = plan.delay {
        tokio::time::sleep(delay).await;
    }
    if let Some(Fault::Status(status)) = plan.fault {
        return status.into_response();
    }

    let total = plan.data.len() as u64;
    let requested = if plan.ranges {
        range.as_deref().and_then(parse_range)
    } else {
        None
    };
    let (status, start, end) = match requested {
        Some((start, _)) if start >= total => {
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{total}"))],
            )
                .into_response();
        }
        Some((start, end)) => {
            let end = end.map_or(total, |e| (e + 1).min(total));
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
        None => (StatusCode::OK, 0, total),
    };

    let body = plan.data.slice(start as usize..end as usize);
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, body.len().to_string())
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if plan.ranges {
        builder = builder.header(header::ACCEPT_RANGES, "bytes");
    }
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{}/{total}", end.saturating_sub(1)),
        );
    }

    let body = match (plan.fault, plan.pace) {
        (Some(Fault::Truncate(at)), _) => {
            let prefix = body.slice(..at.min(body.len()));
            Body::from_stream(dropped_after(prefix))
        }
        (_, Some(interval)) => Body::from_stream(paced(body, interval)),
        _ => Body::from(body),
    };
    builder.body(body).unwrap()
}

/// `bytes=start-` or `bytes=start-end`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start = start.parse().ok()?;
    let end = match end {
        "" => None,
        e => Some(e.parse().ok()?),
    };
    Some((start, end))
}

fn dropped_after(prefix: Bytes) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold(Some(prefix), |pending| async move {
        match pending {
            Some(prefix) => Some((Ok(prefix), None)),
            None => {
                // Give the prefix time to reach the client before the reset.
                tokio::time::sleep(Duration::from_millis(50)).await;
                Some((Err(std::io::Error::other("connection dropped")), None))
            }
        }
    })
}

fn paced(body: Bytes, interval: Duration) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    futures::stream::unfold(0usize, move |offset| {
        let body = body.clone();
        async move {
            if offset >= body.len() {
                return None;
            }
            if offset > 0 {
                tokio::time::sleep(interval).await;
            }
            let end = (offset + PACE_CHUNK).min(body.len());
            Some((Ok(body.slice(offset..end)), end))
        }
    })
}

/// Deterministic, non-repeating-looking test payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mediafetch=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Fast retries, no system proxy, staging and output under `dir`.
pub fn test_config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::builder()
        .with_retry(
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50))
                .without_jitter(),
        )
        .with_read_timeout(Duration::from_secs(5))
        .with_progress_interval(Duration::ZERO)
        .with_staging_dir(dir.join("staging"))
        .with_output_dir(dir.join("out"))
        .build()
        .unwrap();
    config.http.use_system_proxy = false;
    config
}

pub fn fetcher(config: &EngineConfig) -> ChunkedFetcher {
    let client = create_client(&config.http).unwrap();
    ChunkedFetcher::new(
        client,
        Throttle::new(config.throttle.clone()),
        config.retry.clone(),
        config.http.read_timeout(),
    )
}

pub fn context(config: EngineConfig, listener: Option<SharedProgressListener>) -> DownloadContext {
    let fetcher = fetcher(&config);
    DownloadContext::new(fetcher, Arc::new(config), listener)
}
