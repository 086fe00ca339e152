//! The abstract media-source buffer the engine appends into.
//
// The real sink wraps platform Media Source buffers; tests use an in-memory implementation. The
// engine relies on a few behavioural guarantees: operations on one track are serialised by the
// sink itself, queries are cheap and synchronous, and a failed append either raises
// QuotaExceeded (recoverable, the engine evicts and retries) or MediaSourceOperationFailed
// (critical). Async operations are returned as boxed futures so the trait stays object-safe.

use crate::{MseError, TrackType};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::collections::HashMap;

/// Track metadata the sink needs to open a source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTrackInit {
    pub mime: String,
    pub codecs: String,
}

/// Per-track append/remove/query surface over the playback buffer.
pub trait BufferSink: Send + Sync + 'static {
    /// Open (or reopen) source buffers for the given tracks. Reopening a track discards its
    /// buffered content and pending operations.
    fn init(
        &self,
        tracks: HashMap<TrackType, SinkTrackInit>,
        for_dash: bool,
    ) -> BoxFuture<'_, Result<(), MseError>>;

    /// Append media bytes. The append window clips frames outside `[window_start, window_end]`
    /// and `timestamp_offset` shifts the segment's internal timestamps onto the presentation
    /// timeline.
    fn append(
        &self,
        track: TrackType,
        bytes: Bytes,
        window_start: f64,
        window_end: f64,
        timestamp_offset: f64,
    ) -> BoxFuture<'_, Result<(), MseError>>;

    /// Remove buffered content in `[start, end)`.
    fn remove(&self, track: TrackType, start: f64, end: f64) -> BoxFuture<'_, Result<(), MseError>>;

    /// Remove everything buffered for the track and reset its parser state.
    fn clear(&self, track: TrackType) -> BoxFuture<'_, Result<(), MseError>>;

    /// Update the append window and timestamp offset without appending.
    fn set_stream_properties(
        &self,
        track: TrackType,
        timestamp_offset: f64,
        window_start: f64,
        window_end: f64,
    ) -> BoxFuture<'_, Result<(), MseError>>;

    fn buffer_start(&self, track: TrackType) -> Option<f64>;

    fn buffer_end(&self, track: TrackType) -> Option<f64>;

    /// Seconds buffered contiguously ahead of `t`; zero when `t` itself is not buffered.
    fn buffered_ahead_of(&self, track: TrackType, t: f64) -> f64;

    fn is_buffered(&self, track: TrackType, t: f64) -> bool;

    fn set_duration(&self, duration: f64) -> BoxFuture<'_, Result<(), MseError>>;

    fn get_duration(&self) -> f64;

    /// Drop closed-caption parser state; called when the video stream changes to a stream with
    /// different caption semantics.
    fn reset_caption_parser(&self);

    fn set_selected_closed_caption_id(&self, id: &str);

    /// Signal that no further appends will happen on any track.
    fn end_of_stream(&self) -> BoxFuture<'_, Result<(), MseError>>;
}

// Media buffers report coverage with sub-millisecond jitter; ranges closer than this are
// considered contiguous.
const GAP_TOLERANCE: f64 = 0.001;

/// Sorted, disjoint set of buffered time ranges. The arithmetic sink implementations need to
/// answer the engine's queries.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RangeSet {
    ranges: Vec<(f64, f64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        RangeSet::default()
    }

    pub fn ranges(&self) -> &[(f64, f64)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn start(&self) -> Option<f64> {
        self.ranges.first().map(|r| r.0)
    }

    pub fn end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.1)
    }

    pub fn add(&mut self, start: f64, end: f64) {
        if end <= start {
            return;
        }
        self.ranges.push((start, end));
        self.ranges.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut merged: Vec<(f64, f64)> = Vec::with_capacity(self.ranges.len());
        for &(s, e) in &self.ranges {
            match merged.last_mut() {
                Some(last) if s <= last.1 + GAP_TOLERANCE => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.ranges = merged;
    }

    pub fn remove(&mut self, start: f64, end: f64) {
        if end <= start {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                out.push((s, e));
                continue;
            }
            if s < start {
                out.push((s, start));
            }
            if e > end {
                out.push((end, e));
            }
        }
        self.ranges = out;
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn contains(&self, t: f64) -> bool {
        self.ranges.iter().any(|&(s, e)| t >= s - GAP_TOLERANCE && t < e)
    }

    /// Seconds covered contiguously ahead of `t`, zero when `t` is outside every range.
    pub fn ahead_of(&self, t: f64) -> f64 {
        self.ranges
            .iter()
            .find(|&&(s, e)| t >= s - GAP_TOLERANCE && t < e)
            .map(|&(_, e)| e - t)
            .unwrap_or(0.0)
    }
}
