//! A Rust library implementing the streaming core of an adaptive media player for
//! MPEG-DASH content.
//!
//! [DASH](https://en.wikipedia.org/wiki/Dynamic_Adaptive_Streaming_over_HTTP) (dynamic adaptive
//! streaming over HTTP), also called MPEG-DASH, is a technology used for media streaming over the
//! web, commonly used for video on demand (VOD) and live/OTT services. A DASH client reads a Media
//! Presentation Description (MPD) manifest describing the available media, then fetches and
//! appends media segments to a playback buffer, adapting the selected representation to network
//! conditions.
//!
//! This library provides the [StreamingEngine](crate::engine::StreamingEngine): the component
//! that, given a parsed manifest, a network [Fetcher](crate::fetch::Fetcher) and a
//! [BufferSink](crate::sink::BufferSink), decides which segments to fetch, when to fetch them, how
//! to order appends across media types, and how to react to seeks, variant switches, live manifest
//! updates and network or buffer errors. It also provides the live-manifest side the engine
//! depends on: a [ManifestUpdater](crate::patch::ManifestUpdater) applying MPD-Patch documents
//! (ISO/IEC 23009-1, schema `urn:mpeg:dash:schema:mpd-patch:2020`) to the manifest in place of
//! full refetches.
//!
//! ## Features supported
//!
//! - VOD (static) and dynamic manifests, multi-period content
//! - SegmentTemplate addressing with `$Number$`/`$Time$` substitution and SegmentTimeline
//! - MPD-Patch application with rollback to full refetch on invalid patches
//! - Variant and text-stream switching with in-flight request abort
//! - Trick-mode playback through an alternate video stream
//! - In-band `emsg` event extraction (ISO/IEC 23009-1 §5.10.3.3), including the
//!   `urn:mpeg:dash:event:2012` manifest-update signal
//!
//! ## Limitations / unsupported features
//!
//! - No media decoding or demuxing beyond top-level MP4 box inspection
//! - No DRM/EME license plumbing (encrypted variants can be excluded via
//!   `allowed_by_key_system`)
//! - The Media Source buffer itself is abstract; callers supply the sink implementation

#![forbid(unsafe_code)]

pub mod emsg;
pub mod engine;
pub mod fetch;
pub mod manifest;
pub mod mpd;
pub mod patch;
pub mod segment;
pub mod select;
pub mod sink;
pub mod timeline;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the streaming engine and its collaborators.
///
/// An aborted network operation is not an error: it is reported as
/// [FetchOutcome::Aborted](crate::fetch::FetchOutcome) so that control flow never confuses a
/// deliberate cancellation with a failure.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MseError {
    /// XML or manifest structure that we could not make sense of.
    #[error("parsing DASH XML: {0}")]
    Parsing(String),

    /// An MPD patch whose `mpdId` or `originalPublishTime` does not match the manifest it is
    /// being applied to, or whose operations are malformed. Recoverable by refetching the full
    /// manifest.
    #[error("invalid MPD patch: {0}")]
    DashInvalidPatch(String),

    /// Patch-based updating is not usable (missing `PatchLocation`, missing `publishTime`, or
    /// the patch TTL has expired) and the caller must fall back to a full manifest fetch.
    #[error("MPD patch unusable: {0}")]
    DashPatchUnusable(String),

    /// Non-2xx HTTP status on a media or manifest request.
    #[error("HTTP status {status} fetching {context}")]
    BadHttpStatus { status: u16, context: String },

    /// Transport-level network failure.
    #[error("network error: {0}")]
    Http(String),

    /// A network attempt exceeded the per-attempt timeout from [RetryParameters].
    #[error("network timeout: {0}")]
    Timeout(String),

    /// An append/remove/duration operation on the buffer sink failed.
    #[error("media source operation failed: {0}")]
    MediaSourceOperationFailed(String),

    /// The buffer sink rejected an append because the underlying source buffer is full.
    #[error("media source buffer quota exceeded on {0} track")]
    QuotaExceeded(TrackType),

    /// A stream could not be prepared for playback (segment index creation failed).
    #[error("stream setup failed: {0}")]
    StreamSetup(String),

    /// The operation raced `destroy()`.
    #[error("streaming engine destroyed")]
    Destroyed,

    #[error("{0}")]
    Other(String),
}

/// How bad an error is: whether playback can in principle continue after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Critical,
}

/// The subsystem an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Network,
    Media,
    Manifest,
    Player,
    Text,
    Drm,
}

impl MseError {
    /// Default severity classification. The engine may escalate (a second quota error within a
    /// short window becomes critical, an init-segment append failure is always critical).
    pub fn default_severity(&self) -> Severity {
        match self {
            MseError::BadHttpStatus { .. }
            | MseError::Http(_)
            | MseError::Timeout(_)
            | MseError::DashInvalidPatch(_)
            | MseError::DashPatchUnusable(_)
            | MseError::QuotaExceeded(_) => Severity::Recoverable,
            MseError::MediaSourceOperationFailed(_) | MseError::Destroyed => Severity::Critical,
            MseError::Parsing(_) | MseError::StreamSetup(_) | MseError::Other(_) => {
                Severity::Critical
            }
        }
    }

    pub fn category(&self) -> Category {
        match self {
            MseError::BadHttpStatus { .. } | MseError::Http(_) | MseError::Timeout(_) => {
                Category::Network
            }
            MseError::Parsing(_)
            | MseError::DashInvalidPatch(_)
            | MseError::DashPatchUnusable(_) => Category::Manifest,
            MseError::MediaSourceOperationFailed(_) | MseError::QuotaExceeded(_) => Category::Media,
            MseError::StreamSetup(_) | MseError::Destroyed | MseError::Other(_) => Category::Player,
        }
    }
}

/// The media types an active playback session streams. Each active track is driven by its own
/// update cycle inside the engine. Trick-mode video plays on the [TrackType::Video] track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Audio,
    Video,
    Text,
}

impl TrackType {
    pub const ALL: [TrackType; 3] = [TrackType::Audio, TrackType::Video, TrackType::Text];
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackType::Audio => write!(f, "audio"),
            TrackType::Video => write!(f, "video"),
            TrackType::Text => write!(f, "text"),
        }
    }
}

/// Parameters controlling the retry behaviour of a category of network requests, and the
/// per-attempt timeout.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryParameters {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt. Subsequent delays are multiplied by `backoff_factor`.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Each delay is fuzzed to `delay * (1 ± fuzz_factor * r)` with `r` uniform in [0, 1].
    pub fuzz_factor: f64,
    /// Per-attempt timeout. A timed-out attempt counts against `max_attempts`.
    pub timeout: Duration,
}

impl Default for RetryParameters {
    fn default() -> Self {
        RetryParameters {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            fuzz_factor: 0.5,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryParameters {
    /// A policy that never retries, for requests the caller prefers to fail fast.
    pub fn no_retries() -> Self {
        RetryParameters { max_attempts: 1, ..Default::default() }
    }
}

/// An error report delivered to the owner through the engine event channel, and to the configured
/// failure callback. Setting `handled` from the callback suppresses the engine's default
/// reaction (scheduling a retry for recoverable network errors).
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: MseError,
    pub severity: Severity,
    pub category: Category,
    /// The track the error arose on, when it was track-specific.
    pub track: Option<TrackType>,
    pub handled: bool,
}

/// Callback invoked when a MediaState has exhausted its retries. May mutate the event, in
/// particular set `handled = true` to take over recovery.
pub type FailureCallback = Arc<dyn Fn(&mut ErrorEvent) + Send + Sync>;

/// Tunables for the streaming engine. All fields can be hot-replaced through
/// [StreamingEngine::configure](crate::engine::StreamingEngine::configure).
#[derive(Clone)]
pub struct StreamingConfig {
    /// Seconds of content ahead of the playhead the engine tries to keep buffered.
    pub buffering_goal: f64,
    /// Seconds that must be buffered after a stall before playback may resume; also gates
    /// completion of `start()`.
    pub rebuffering_goal: f64,
    /// Seconds of already-played content retained behind the playhead for backward seeks.
    /// A soft target: eviction never removes content closer than the manifest `minBufferTime`.
    pub buffer_behind: f64,
    /// Retry policy for segment requests.
    pub retry: RetryParameters,
    /// When true, a text stream that keeps failing is torn down without stopping playback of
    /// the audio and video tracks.
    pub ignore_text_stream_failures: bool,
    /// Stream text even while the text track is not being displayed.
    pub always_stream_text: bool,
    /// Minimum number of outstanding bytes on an in-flight request before a variant switch will
    /// abort it in favour of the new variant's segment.
    pub abort_switch_threshold_bytes: u64,
    /// Extra tolerance on the fair-buffer rule: a track may run at most one segment duration
    /// plus this many seconds ahead of the slowest active track.
    pub fair_buffer_slack: f64,
    /// Idle delay before re-running a track's update cycle when there is nothing to do.
    pub update_backoff: f64,
    /// Allowed discrepancy between a segment's declared end time and the sink's reported
    /// buffered end after appending it.
    pub drift_tolerance: f64,
    /// Invoked when a track pauses on an exhausted error; see [FailureCallback].
    pub failure_callback: Option<FailureCallback>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        StreamingConfig {
            buffering_goal: 10.0,
            rebuffering_goal: 2.0,
            buffer_behind: 30.0,
            retry: RetryParameters::default(),
            ignore_text_stream_failures: false,
            always_stream_text: false,
            abort_switch_threshold_bytes: 16 * 1024,
            fair_buffer_slack: 1.0,
            update_backoff: 0.5,
            drift_tolerance: 0.3,
            failure_callback: None,
        }
    }
}

impl fmt::Debug for StreamingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingConfig")
            .field("buffering_goal", &self.buffering_goal)
            .field("rebuffering_goal", &self.rebuffering_goal)
            .field("buffer_behind", &self.buffer_behind)
            .field("retry", &self.retry)
            .field("ignore_text_stream_failures", &self.ignore_text_stream_failures)
            .field("always_stream_text", &self.always_stream_text)
            .field("abort_switch_threshold_bytes", &self.abort_switch_threshold_bytes)
            .field("fair_buffer_slack", &self.fair_buffer_slack)
            .field("update_backoff", &self.update_backoff)
            .field("drift_tolerance", &self.drift_tolerance)
            .field("failure_callback", &self.failure_callback.as_ref().map(|_| "…"))
            .finish()
    }
}

// Parse an XML duration string, as per https://www.w3.org/TR/xmlschema-2/#duration
//
// The lexical representation for duration is the ISO 8601 extended format PnYnMnDTnHnMnS, where
// nY represents the number of years, nM the number of months, nD the number of days, 'T' is the
// date/time separator, nH the number of hours, nM the number of minutes and nS the number of
// seconds, possibly with decimal digits.
//
// Examples: "PT0H0M30.030S", "PT1.2S", "PT1004199059S", "P0Y20M0D"
pub(crate) fn parse_xs_duration(s: &str) -> Result<Duration, MseError> {
    match iso8601::duration(s) {
        Ok(iso_duration) => match iso_duration {
            iso8601::Duration::Weeks(w) => Ok(Duration::new(w as u64 * 60 * 60 * 24 * 7, 0)),
            iso8601::Duration::YMDHMS { year, month, day, hour, minute, second, millisecond } => {
                // a year/month count can't be converted exactly; close enough for manifests
                let mut secs: u64 = second.into();
                secs += minute as u64 * 60;
                secs += hour as u64 * 60 * 60;
                secs += day as u64 * 60 * 60 * 24;
                secs += month as u64 * 60 * 60 * 24 * 31;
                secs += year as u64 * 60 * 60 * 24 * 31 * 365;
                Ok(Duration::new(secs, millisecond * 1_000_000))
            }
        },
        Err(e) => Err(MseError::Parsing(format!("xs:duration {s}: {e:?}"))),
    }
}

pub(crate) fn parse_xs_duration_secs(s: &str) -> Result<f64, MseError> {
    parse_xs_duration(s).map(|d| d.as_secs_f64())
}

// Parse a range specifier of the form "45-67", as used by Initialization@range and
// SegmentBase@indexRange attributes.
pub(crate) fn parse_range(range: &str) -> Result<(u64, u64), MseError> {
    let v: Vec<&str> = range.split_terminator('-').collect();
    if v.len() != 2 {
        return Err(MseError::Parsing(format!("invalid range specifier: {range}")));
    }
    let start: u64 = v[0].parse()
        .map_err(|_| MseError::Parsing(String::from("invalid start for range specifier")))?;
    let end: u64 = v[1].parse()
        .map_err(|_| MseError::Parsing(String::from("invalid end for range specifier")))?;
    Ok((start, end))
}
