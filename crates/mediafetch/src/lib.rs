//! Mediafetch: a format-selecting, resumable media download engine.
//!
//! An [`Extractor`] turns a page reference into a [`MediaItem`] listing the
//! available streams. A [`FormatSelector`] expression picks one or more
//! [`FormatGroup`]s from those streams, and the [`DownloadCoordinator`]
//! downloads the first group that succeeds, merging multi-stream groups
//! through a [`Postprocessor`].
//!
//! ## Component Overview
//!
//! - `selector`: format expressions, filters and quality ordering
//! - `fetcher`: ranged HTTP transfers with retry, throttling and read timeouts
//! - `progressive`: single-file downloads with byte-offset resume
//! - `fragment`: segmented downloads assembled strictly in order
//! - `sidecar`: persisted resume state next to each staging file
//! - `coordinator`: group download, fallback, job timeout and finalization
//! - `engine`: the [`MediaEngine`] facade
//!
//! Cancelling the engine's token pauses running jobs; running the same
//! request again resumes from the staged bytes.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod descriptor;
mod downloader;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod fragment;
pub mod job;
pub mod progress;
pub mod progressive;
pub mod proxy;
pub mod retry;
pub mod selector;
pub mod sidecar;
pub mod staging;
pub mod throttle;

// Re-exports for easier access
pub use config::{
    EngineConfig, EngineConfigBuilder, FragmentConfig, HttpConfig, ProgressConfig,
    StagingConfig,
};
pub use coordinator::{
    DownloadCoordinator, FinalArtifact, MergeInput, MergeRequest, NoMerge, Postprocessor,
    StreamInfo,
};
pub use descriptor::{
    ByteRange, Extractor, FragmentRef, MediaItem, Protocol, StreamDescriptor, StreamKind,
    StreamSource, TrackType,
};
pub use downloader::{DownloadContext, StreamDownloader};
pub use engine::MediaEngine;
pub use error::{EngineError, ErrorKind, FailedMember};
pub use fetcher::{ByteSink, ChunkedFetcher, FetchRequest, FetchResult, FileSink};
pub use fragment::FragmentDownloader;
pub use job::{DownloadJob, FragmentState, FragmentStatus, JobState};
pub use progress::{ProgressEvent, ProgressListener, SharedProgressListener, channel_listener};
pub use progressive::ProgressiveDownloader;
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use retry::{RetryDecision, RetryPolicy};
pub use selector::{FormatGroup, FormatSelector};
pub use sidecar::ResumeState;
pub use throttle::{Throttle, ThrottleConfig};
