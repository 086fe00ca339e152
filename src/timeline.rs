//! Mapping between wall-clock time and presentation time, and the live availability window.
//
// A VOD presentation is fully available: the window is [0, duration]. A live presentation only
// keeps segments available for the manifest's timeShiftBufferDepth behind the live edge, so the
// window slides forward as wall-clock time advances. All queries take an explicit wall-clock
// instant (seconds since the Unix epoch) so the arithmetic stays pure; callers obtain the instant
// from a [Clock].

use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Source of wall-clock time, in seconds since the Unix epoch. Injected into the engine so tests
/// can drive live-window arithmetic deterministically.
pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> f64;
}

/// The production clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Wall-clock ↔ media-time mapping for one presentation.
#[derive(Debug, Clone)]
pub struct PresentationTimeline {
    availability_start: Option<DateTime<Utc>>,
    /// Total presentation duration in seconds; `f64::INFINITY` for an open-ended live stream.
    duration: f64,
    max_segment_duration: f64,
    time_shift_buffer_depth: Option<f64>,
    suggested_presentation_delay: f64,
    is_live: bool,
}

impl PresentationTimeline {
    /// A static (VOD) presentation, fully available over `[0, duration]`.
    pub fn new_vod(duration: f64) -> Self {
        PresentationTimeline {
            availability_start: None,
            duration,
            max_segment_duration: 0.0,
            time_shift_buffer_depth: None,
            suggested_presentation_delay: 0.0,
            is_live: false,
        }
    }

    /// A dynamic (live) presentation anchored at `availability_start`.
    pub fn new_live(
        availability_start: DateTime<Utc>,
        time_shift_buffer_depth: Option<f64>,
        suggested_presentation_delay: f64,
        max_segment_duration: f64,
    ) -> Self {
        PresentationTimeline {
            availability_start: Some(availability_start),
            duration: f64::INFINITY,
            max_segment_duration,
            time_shift_buffer_depth,
            suggested_presentation_delay,
            is_live: true,
        }
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn max_segment_duration(&self) -> f64 {
        self.max_segment_duration
    }

    pub fn set_max_segment_duration(&mut self, d: f64) {
        self.max_segment_duration = d;
    }

    pub fn availability_start(&self) -> Option<DateTime<Utc>> {
        self.availability_start
    }

    pub fn suggested_presentation_delay(&self) -> f64 {
        self.suggested_presentation_delay
    }

    /// Shrink the presentation duration. The sink's duration is authoritative once media has been
    /// appended, and it only ever reports a shorter presentation than the manifest promised, so
    /// growth requests are ignored. Manifest updates change the duration through
    /// [set_duration_from_manifest](Self::set_duration_from_manifest) instead.
    pub fn set_duration(&mut self, duration: f64) {
        if duration > 0.0 && duration < self.duration {
            debug!("presentation duration {} -> {duration}", self.duration);
            self.duration = duration;
        }
    }

    /// Replace the duration from a manifest update, in either direction.
    pub fn set_duration_from_manifest(&mut self, duration: f64) {
        self.duration = duration;
    }

    /// Transition a dynamic presentation to static (live stream ended): the whole timeline
    /// becomes available and the duration is fixed.
    pub fn make_static(&mut self, duration: f64) {
        self.is_live = false;
        self.duration = duration;
    }

    /// Seconds of presentation time elapsed at wall-clock `now`. Zero for VOD or before the
    /// availability start.
    fn elapsed(&self, now_epoch: f64) -> f64 {
        match self.availability_start {
            Some(start) => (now_epoch - start.timestamp_millis() as f64 / 1000.0).max(0.0),
            None => 0.0,
        }
    }

    /// The earliest presentation time whose segments are still available at `now`.
    pub fn availability_window_start(&self, now_epoch: f64) -> f64 {
        if !self.is_live {
            return 0.0;
        }
        match self.time_shift_buffer_depth {
            Some(depth) => (self.availability_window_end(now_epoch) - depth).max(0.0),
            None => 0.0,
        }
    }

    /// The latest presentation time whose segments are available at `now`.
    pub fn availability_window_end(&self, now_epoch: f64) -> f64 {
        if !self.is_live {
            return self.duration;
        }
        self.elapsed(now_epoch).min(self.duration)
    }

    /// Whether a segment spanning `[start_time, end_time)` is inside the availability window.
    pub fn is_available(&self, start_time: f64, end_time: f64, now_epoch: f64) -> bool {
        end_time > self.availability_window_start(now_epoch)
            && start_time < self.availability_window_end(now_epoch)
    }

    /// The range a playhead may seek to. For live this stays behind the availability end by the
    /// suggested presentation delay.
    pub fn seek_range(&self, now_epoch: f64) -> (f64, f64) {
        if !self.is_live {
            return (0.0, self.duration);
        }
        let start = self.availability_window_start(now_epoch);
        let end = (self.availability_window_end(now_epoch) - self.suggested_presentation_delay)
            .max(start);
        (start, end)
    }
}
