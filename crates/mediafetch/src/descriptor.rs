//! Canonical stream descriptors produced by extractors.
//!
//! A [`StreamDescriptor`] is immutable once emitted. Fragment sequences are
//! order-significant: the staging file is the concatenation of fragment bodies
//! in the order they appear here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::EngineError;

/// How a stream is retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// One continuous body, optionally resumed via byte ranges.
    Progressive,
    /// Many independently addressable fragments.
    Fragmented,
}

/// Transport used to reach the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    DirectHttp,
    SegmentedHttp,
    Manifest,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectHttp => "http",
            Self::SegmentedHttp => "http_dash_segments",
            Self::Manifest => "m3u8_native",
        }
    }
}

/// Logical track type. Streams sharing a download are muxed together later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Video,
    Audio,
    /// Muxed audio + video.
    Combined,
}

impl TrackType {
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video | Self::Combined)
    }

    pub fn has_audio(&self) -> bool {
        matches!(self, Self::Audio | Self::Combined)
    }

    /// Derive the track type from codec hints, where `"none"` marks an absent track.
    pub fn from_codecs(vcodec: Option<&str>, acodec: Option<&str>) -> Self {
        let absent = |c: Option<&str>| c.is_some_and(|c| c.eq_ignore_ascii_case("none"));
        match (absent(vcodec), absent(acodec)) {
            (true, false) => Self::Audio,
            (false, true) => Self::Video,
            _ => Self::Combined,
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Combined => "combined",
        })
    }
}

/// Inclusive-start byte range. `length = None` means "to the end of the resource".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self {
            start,
            length: Some(length),
        }
    }

    pub fn from_offset(start: u64) -> Self {
        Self {
            start,
            length: None,
        }
    }

    /// Inclusive end offset, when bounded.
    pub fn end_inclusive(&self) -> Option<u64> {
        self.length
            .filter(|len| *len > 0)
            .map(|len| self.start + len - 1)
    }

    /// The same range with `consumed` bytes removed from its head.
    pub fn advanced_by(&self, consumed: u64) -> Self {
        Self {
            start: self.start + consumed,
            length: self.length.map(|len| len.saturating_sub(consumed)),
        }
    }

    /// Value for the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        match self.end_inclusive() {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// One addressable piece of a fragmented stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentRef {
    /// Absolute URL, or a path relative to the descriptor's `fragment_base_url`.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
    /// Playback duration in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl FragmentRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            byte_range: None,
            duration: None,
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.byte_range = Some(range);
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    /// Expected body size, when the fragment is a bounded byte range.
    pub fn expected_size(&self) -> Option<u64> {
        self.byte_range.and_then(|r| r.length)
    }
}

/// Where the bytes of a stream live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamSource {
    Progressive {
        url: String,
    },
    Fragmented {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_url: Option<String>,
        fragments: Arc<[FragmentRef]>,
    },
}

/// Canonical representation of one retrievable stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: String,
    pub source: StreamSource,
    pub protocol: Protocol,
    pub track: TrackType,
    /// Container / file extension, e.g. `mp4`, `webm`, `m4a`.
    pub container: String,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// Total bitrate in kbit/s.
    #[serde(default)]
    pub tbr: Option<f64>,
    /// Audio bitrate in kbit/s.
    #[serde(default)]
    pub abr: Option<f64>,
    /// Video bitrate in kbit/s.
    #[serde(default)]
    pub vbr: Option<f64>,
    /// Exact size in bytes.
    #[serde(default)]
    pub filesize: Option<u64>,
    /// Estimated size in bytes.
    #[serde(default)]
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub format_note: Option<String>,
    /// Extractor ranking hint; outranks every measured attribute.
    #[serde(default)]
    pub preference: Option<i32>,
    /// Extra request headers this stream requires (Referer, cookies set by the extractor...).
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
}

impl StreamDescriptor {
    pub fn progressive(id: impl Into<String>, url: impl Into<String>, track: TrackType) -> Self {
        Self::with_source(
            id,
            StreamSource::Progressive { url: url.into() },
            Protocol::DirectHttp,
            track,
        )
    }

    /// Progressive stream whose track type follows from its codec hints.
    pub fn progressive_with_codecs(
        id: impl Into<String>,
        url: impl Into<String>,
        vcodec: Option<&str>,
        acodec: Option<&str>,
    ) -> Self {
        Self::progressive(id, url, TrackType::from_codecs(vcodec, acodec))
            .with_codecs(vcodec, acodec)
    }

    pub fn fragmented(
        id: impl Into<String>,
        fragments: Vec<FragmentRef>,
        protocol: Protocol,
        track: TrackType,
    ) -> Self {
        Self::with_source(
            id,
            StreamSource::Fragmented {
                base_url: None,
                fragments: fragments.into(),
            },
            protocol,
            track,
        )
    }

    fn with_source(
        id: impl Into<String>,
        source: StreamSource,
        protocol: Protocol,
        track: TrackType,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            protocol,
            track,
            container: "mp4".to_string(),
            vcodec: None,
            acodec: None,
            width: None,
            height: None,
            fps: None,
            tbr: None,
            abr: None,
            vbr: None,
            filesize: None,
            filesize_approx: None,
            language: None,
            format_note: None,
            preference: None,
            http_headers: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self.source {
            StreamSource::Progressive { .. } => StreamKind::Progressive,
            StreamSource::Fragmented { .. } => StreamKind::Fragmented,
        }
    }

    pub fn fragments(&self) -> &[FragmentRef] {
        match &self.source {
            StreamSource::Fragmented { fragments, .. } => fragments,
            StreamSource::Progressive { .. } => &[],
        }
    }

    /// Best available bitrate figure, in kbit/s.
    pub fn bitrate(&self) -> Option<f64> {
        self.tbr.or_else(|| match (self.vbr, self.abr) {
            (Some(v), Some(a)) => Some(v + a),
            (v, a) => v.or(a),
        })
    }

    /// Declared size, exact preferred over estimated.
    pub fn declared_size(&self) -> Option<u64> {
        self.filesize.or(self.filesize_approx)
    }

    /// Resolve the URL of the progressive body.
    pub fn progressive_url(&self) -> Result<Url, EngineError> {
        match &self.source {
            StreamSource::Progressive { url } => {
                Url::parse(url).map_err(|e| EngineError::invalid_url(url, e.to_string()))
            }
            StreamSource::Fragmented { .. } => Err(EngineError::configuration(format!(
                "stream `{}` is fragmented, not progressive",
                self.id
            ))),
        }
    }

    /// Resolve the URL of fragment `index`, joining relative paths onto the base URL.
    pub fn fragment_url(&self, index: usize) -> Result<Url, EngineError> {
        let StreamSource::Fragmented {
            base_url,
            fragments,
        } = &self.source
        else {
            return Err(EngineError::configuration(format!(
                "stream `{}` has no fragments",
                self.id
            )));
        };
        let fragment = fragments.get(index).ok_or_else(|| {
            EngineError::configuration(format!(
                "fragment {index} out of range for stream `{}`",
                self.id
            ))
        })?;

        match Url::parse(&fragment.url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = base_url.as_deref().ok_or_else(|| {
                    EngineError::invalid_url(&fragment.url, "relative fragment without base URL")
                })?;
                Url::parse(base)
                    .and_then(|base| base.join(&fragment.url))
                    .map_err(|e| EngineError::invalid_url(&fragment.url, e.to_string()))
            }
            Err(e) => Err(EngineError::invalid_url(&fragment.url, e.to_string())),
        }
    }

    // --- builder-style setters used by extractors and tests ---

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_tbr(mut self, kbps: f64) -> Self {
        self.tbr = Some(kbps);
        self
    }

    pub fn with_abr(mut self, kbps: f64) -> Self {
        self.abr = Some(kbps);
        self
    }

    pub fn with_filesize(mut self, bytes: u64) -> Self {
        self.filesize = Some(bytes);
        self
    }

    pub fn with_codecs(mut self, vcodec: Option<&str>, acodec: Option<&str>) -> Self {
        self.vcodec = vcodec.map(str::to_string);
        self.acodec = acodec.map(str::to_string);
        self
    }

    pub fn with_fragment_base(mut self, base: impl Into<String>) -> Self {
        if let StreamSource::Fragmented { base_url, .. } = &mut self.source {
            *base_url = Some(base.into());
        }
        self
    }

    pub fn with_preference(mut self, preference: i32) -> Self {
        self.preference = Some(preference);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers.insert(name.into(), value.into());
        self
    }
}

/// One media item as produced by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    /// Stable identifier; staging paths are derived from it.
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub streams: Vec<StreamDescriptor>,
}

/// Site-specific adapter mapping a page or API reference to stream descriptors.
///
/// The engine only depends on this contract; concrete extractors live outside
/// this crate.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether this extractor recognises `reference`.
    fn suitable(&self, reference: &str) -> bool;

    async fn extract(&self, reference: &str) -> Result<MediaItem, EngineError>;
}
