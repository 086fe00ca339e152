//! The streaming engine: one update cycle per active track, feeding the buffer sink from the
//! segment indexes.
//
// Concurrency model: every active track (audio, video, text) owns a MediaState and a tokio task
// running its update cycle. All shared state lives behind short-lived std mutexes; no lock is
// ever held across an await. An iteration suspends at most once (a fetch or a sink operation);
// commands arriving during the suspension bump the state's generation counter, and the iteration
// re-reads the generation after every await, dropping its work when it lost the race. Aborting an
// in-flight request resolves it with a non-error outcome, so a cancelled iteration unwinds
// through ordinary control flow.

use crate::emsg::{scan_segment, EmsgEvent};
use crate::fetch::{BandwidthEstimator, FetchOutcome, Fetcher, RequestHandle, RequestSpec};
use crate::manifest::{SharedManifest, StreamId};
use crate::segment::{InitSegmentReference, SegmentCursor, SegmentIndex, SegmentReference};
use crate::sink::{BufferSink, SinkTrackInit};
use crate::timeline::{Clock, SystemClock};
use crate::{Category, ErrorEvent, MseError, Severity, StreamingConfig, TrackType};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

// A second quota error this close (wall-clock seconds) after the first one is fatal.
const QUOTA_ESCALATION_WINDOW: f64 = 30.0;
// Fraction of buffer_behind given up after a quota error.
const QUOTA_BUFFER_REDUCTION: f64 = 0.2;

/// The owner's playback position. Monotone between seeks; the owner signals seeks through
/// [StreamingEngine::seeked].
pub trait Playhead: Send + Sync + 'static {
    fn position(&self) -> f64;
}

/// Engine-to-owner notifications, delivered on the channel returned by the builder.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Error(ErrorEvent),
    /// An in-band `urn:mpeg:dash:event:2012` signal: refresh the manifest now.
    ManifestUpdateNeeded,
    /// An in-band event on a scheme the application subscribed to.
    Emsg(EmsgEvent),
    /// The text track was torn down after persistent failures
    /// (`ignore_text_stream_failures`); audio and video continue.
    TextTrackDisabled,
}

/// Counters exposed through [StreamingEngine::stats]. Aborted transfers count only as aborts.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub segments_appended: u64,
    pub bytes_fetched: u64,
    pub requests_aborted: u64,
}

#[derive(Debug)]
struct MediaState {
    stream: StreamId,
    cursor: Option<SegmentCursor>,
    last_segment_reference: Option<Arc<SegmentReference>>,
    last_init_reference: Option<Arc<InitSegmentReference>>,
    last_appended_stream_id: Option<StreamId>,
    performing_update: bool,
    waiting_to_clear_buffer: bool,
    clear_buffer_safely: bool,
    clear_safe_margin: f64,
    recovering_from_drift_skip: bool,
    end_of_stream: bool,
    operation: Option<RequestHandle>,
    operation_reference: Option<Arc<SegmentReference>>,
    /// Bumped by every command that invalidates in-flight work (switch, seek, clear, destroy).
    generation: u64,
    paused_on_error: bool,
    last_quota_error_at: Option<f64>,
    /// First media append landed; gates completion of `start()`.
    has_started: bool,
    start_error: Option<MseError>,
    /// Normal video stream to return to when trick play disengages.
    restore_after_trick: Option<StreamId>,
    /// The sink must (re)open this track's source buffer before the next append.
    needs_sink_reinit: bool,
}

impl MediaState {
    fn new(stream: StreamId) -> Self {
        MediaState {
            stream,
            cursor: None,
            last_segment_reference: None,
            last_init_reference: None,
            last_appended_stream_id: None,
            performing_update: false,
            waiting_to_clear_buffer: false,
            clear_buffer_safely: false,
            clear_safe_margin: 0.0,
            recovering_from_drift_skip: false,
            end_of_stream: false,
            operation: None,
            operation_reference: None,
            generation: 0,
            paused_on_error: false,
            last_quota_error_at: None,
            has_started: false,
            start_error: None,
            restore_after_trick: None,
            needs_sink_reinit: false,
        }
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        if let Some(op) = self.operation.take() {
            op.abort();
        }
        self.operation_reference = None;
    }
}

struct TrackTask {
    track: TrackType,
    state: Mutex<MediaState>,
    wake: Notify,
    loop_running: AtomicBool,
}

impl TrackTask {
    fn new(track: TrackType, stream: StreamId) -> Arc<Self> {
        Arc::new(TrackTask {
            track,
            state: Mutex::new(MediaState::new(stream)),
            wake: Notify::new(),
            loop_running: AtomicBool::new(false),
        })
    }
}

// What an update iteration decided to do next.
enum StepOutcome {
    /// Run again after this delay (zero means immediately).
    Rearm(Duration),
    /// Nothing to do until a command wakes us.
    AwaitWake,
    /// The track is gone (unloaded text, destroy).
    Exit,
}

struct Inner {
    manifest: SharedManifest,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn BufferSink>,
    playhead: Arc<dyn Playhead>,
    clock: Arc<dyn Clock>,
    bandwidth: Arc<BandwidthEstimator>,
    config: Mutex<StreamingConfig>,
    states: Mutex<HashMap<TrackType, Arc<TrackTask>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    destroyed: AtomicBool,
    started: AtomicBool,
    ended: AtomicBool,
    fatal_quota: AtomicBool,
    append_notify: Notify,
    stats: Mutex<EngineStats>,
}

impl Inner {
    fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn config(&self) -> StreamingConfig {
        self.config.lock().unwrap().clone()
    }

    fn task(&self, track: TrackType) -> Option<Arc<TrackTask>> {
        self.states.lock().unwrap().get(&track).cloned()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn record_append(&self, bytes: usize) {
        let mut stats = self.stats.lock().unwrap();
        stats.segments_appended += 1;
        stats.bytes_fetched += bytes as u64;
    }

    fn record_abort(&self) {
        self.stats.lock().unwrap().requests_aborted += 1;
    }
}

fn retry_all(inner: &Arc<Inner>) {
    let tasks: Vec<_> = inner.states.lock().unwrap().values().cloned().collect();
    for task in tasks {
        task.state.lock().unwrap().paused_on_error = false;
        task.wake.notify_one();
    }
}

// Deliver an error to the owner: failure callback first, then the event channel unless the
// callback claimed it. Recoverable unhandled network errors get an automatic delayed retry.
fn report_error(inner: &Arc<Inner>, track: Option<TrackType>, error: MseError, severity: Severity) {
    let category = if track == Some(TrackType::Text) && error.category() == Category::Network {
        Category::Text
    } else {
        error.category()
    };
    let mut event = ErrorEvent { error, severity, category, track, handled: false };
    let callback = inner.config.lock().unwrap().failure_callback.clone();
    if let Some(cb) = callback {
        cb(&mut event);
    }
    let schedule_retry = !event.handled
        && event.severity == Severity::Recoverable
        && event.category == Category::Network;
    if !event.handled {
        inner.emit(EngineEvent::Error(event));
    }
    if schedule_retry {
        let delay = inner.config.lock().unwrap().retry.base_delay;
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                if !inner.destroyed() {
                    debug!("automatic retry after transient failure");
                    retry_all(&inner);
                }
            }
        });
    }
}

/// Builder for [StreamingEngine]; the clock and bandwidth estimator default to production
/// implementations and are injectable for tests.
pub struct EngineBuilder {
    manifest: SharedManifest,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn BufferSink>,
    playhead: Arc<dyn Playhead>,
    config: StreamingConfig,
    clock: Arc<dyn Clock>,
    bandwidth: Arc<BandwidthEstimator>,
}

impl EngineBuilder {
    pub fn config(mut self, config: StreamingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn bandwidth_estimator(mut self, bandwidth: Arc<BandwidthEstimator>) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    pub fn build(self) -> (StreamingEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            manifest: self.manifest,
            fetcher: self.fetcher,
            sink: self.sink,
            playhead: self.playhead,
            clock: self.clock,
            bandwidth: self.bandwidth,
            config: Mutex::new(self.config),
            states: Mutex::new(HashMap::new()),
            events: tx,
            destroyed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            fatal_quota: AtomicBool::new(false),
            append_notify: Notify::new(),
            stats: Mutex::new(EngineStats::default()),
        });
        (StreamingEngine { inner }, rx)
    }
}

/// Drives per-track fetch/append loops against the buffer sink. See the crate documentation for
/// the overall control flow.
pub struct StreamingEngine {
    inner: Arc<Inner>,
}

impl StreamingEngine {
    pub fn builder(
        manifest: SharedManifest,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn BufferSink>,
        playhead: Arc<dyn Playhead>,
    ) -> EngineBuilder {
        EngineBuilder {
            manifest,
            fetcher,
            sink,
            playhead,
            config: StreamingConfig::default(),
            clock: Arc::new(SystemClock),
            bandwidth: Arc::new(BandwidthEstimator::default()),
        }
    }

    /// Hot-replace the engine tunables.
    pub fn configure(&self, config: StreamingConfig) {
        *self.inner.config.lock().unwrap() = config;
        let tasks: Vec<_> = self.inner.states.lock().unwrap().values().cloned().collect();
        for t in tasks {
            t.wake.notify_one();
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.stats.lock().unwrap().clone()
    }

    /// Whether every active track has reached the rebuffering goal (or finished).
    pub fn buffering_satisfied(&self) -> bool {
        let config = self.inner.config();
        let goal = config.rebuffering_goal.max(self.inner.manifest.read().min_buffer_time);
        let playhead = self.inner.playhead.position();
        let tasks: Vec<_> = self.inner.states.lock().unwrap().values().cloned().collect();
        tasks.iter().all(|t| {
            t.state.lock().unwrap().end_of_stream
                || self.inner.sink.buffered_ahead_of(t.track, playhead) >= goal
        })
    }

    /// Make `variant` the active variant. Streams shared with the previous variant keep their
    /// buffers; changed streams optionally clear theirs (a safe margin keeps the next
    /// `safe_margin` seconds ahead of the playhead to avoid stuttering the current frames).
    pub fn switch_variant(&self, variant_id: u32, clear_buffer: bool, safe_margin: f64) {
        let (audio, video) = {
            let manifest = self.inner.manifest.read();
            match manifest.variant(variant_id) {
                Some(v) => (v.audio, v.video),
                None => {
                    warn!("switch_variant: unknown variant {variant_id}");
                    return;
                }
            }
        };
        for (track, stream) in [(TrackType::Audio, audio), (TrackType::Video, video)] {
            if let Some(stream) = stream {
                self.switch_stream(track, stream, clear_buffer, safe_margin);
            }
        }
    }

    /// Activate `stream` as the text track and (re)initialise its sink buffer. The caption
    /// parser is deliberately left alone: captions ride the video stream.
    pub fn switch_text_stream(&self, stream: StreamId) {
        self.activate_text(stream);
    }

    /// Stop streaming text and drop the text MediaState.
    pub fn unload_text_stream(&self) {
        let task = self.inner.states.lock().unwrap().remove(&TrackType::Text);
        if let Some(task) = task {
            task.state.lock().unwrap().invalidate();
            task.wake.notify_one();
            info!("text stream unloaded");
        }
    }

    /// Clear any existing text buffer, reinitialise the sink for `stream` and begin streaming
    /// it.
    pub fn load_new_text_stream(&self, stream: StreamId) {
        self.activate_text(stream);
    }

    fn activate_text(&self, stream: StreamId) {
        let mut states = self.inner.states.lock().unwrap();
        let task = states
            .entry(TrackType::Text)
            .or_insert_with(|| TrackTask::new(TrackType::Text, stream))
            .clone();
        drop(states);
        {
            let mut st = task.state.lock().unwrap();
            st.invalidate();
            st.stream = stream;
            st.cursor = None;
            st.last_segment_reference = None;
            st.last_init_reference = None;
            st.last_appended_stream_id = None;
            st.end_of_stream = false;
            st.paused_on_error = false;
            st.waiting_to_clear_buffer = true;
            st.clear_buffer_safely = false;
            st.needs_sink_reinit = true;
        }
        if self.inner.started.load(Ordering::Acquire) {
            spawn_update_loop(&self.inner, task.clone());
        }
        task.wake.notify_one();
    }

    fn switch_stream(&self, track: TrackType, new_stream: StreamId, clear_buffer: bool, safe_margin: f64) {
        let mut states = self.inner.states.lock().unwrap();
        let created = !states.contains_key(&track);
        let task = states
            .entry(track)
            .or_insert_with(|| TrackTask::new(track, new_stream))
            .clone();
        drop(states);
        if created && self.inner.started.load(Ordering::Acquire) {
            spawn_update_loop(&self.inner, task.clone());
        }

        let mut st = task.state.lock().unwrap();
        if !created && st.stream == new_stream && st.restore_after_trick.is_none() {
            trace!("switch_variant: {track} already on {new_stream}");
            return;
        }
        if created {
            drop(st);
            task.wake.notify_one();
            return;
        }
        // abort an in-flight fetch when the replacement download is smaller than what is still
        // outstanding, and the outstanding tail is big enough to be worth the round trip
        if let (Some(op), Some(in_flight)) = (&st.operation, &st.operation_reference) {
            let remaining_old = op.bytes_remaining();
            let threshold = self.inner.config.lock().unwrap().abort_switch_threshold_bytes;
            let new_total = self.estimate_switch_fetch_bytes(track, new_stream, in_flight, &st);
            if new_total < remaining_old && remaining_old > threshold {
                info!("{track}: aborting in-flight fetch ({remaining_old}B left) for switch \
                       (new fetch ~{new_total}B)");
                op.abort();
                self.inner.record_abort();
            }
        }
        info!("{track}: switching {} -> {new_stream}", st.stream);
        st.invalidate();
        st.stream = new_stream;
        st.restore_after_trick = None;
        st.cursor = None;
        st.last_segment_reference = None;
        // force an init-segment append for the new stream before its first media append
        st.last_init_reference = None;
        st.last_appended_stream_id = None;
        st.end_of_stream = false;
        if clear_buffer {
            st.waiting_to_clear_buffer = true;
            st.clear_buffer_safely = safe_margin > 0.0;
            st.clear_safe_margin = safe_margin;
        }
        drop(st);
        task.wake.notify_one();
    }

    // Estimated bytes needed to replace `in_flight` on `new_stream`: the matching segment plus
    // the new init segment when the init reference changes. Unknown sizes fall back to
    // bandwidth × duration.
    fn estimate_switch_fetch_bytes(
        &self,
        _track: TrackType,
        new_stream: StreamId,
        in_flight: &Arc<SegmentReference>,
        st: &MediaState,
    ) -> u64 {
        let manifest = self.inner.manifest.read();
        let Some(stream) = manifest.stream(new_stream) else { return u64::MAX };
        let bps = if stream.bandwidth > 0 {
            stream.bandwidth as f64
        } else {
            self.inner.bandwidth.estimate_bps()
        };
        let from_bandwidth = |duration: f64| (bps * duration / 8.0) as u64;
        let (segment_bytes, new_init) = match &stream.segment_index {
            Some(index) => match index.find(in_flight.start_time).and_then(|p| index.get(p)) {
                Some(r) => (
                    r.size_bytes().unwrap_or_else(|| from_bandwidth(r.duration())),
                    r.init.clone(),
                ),
                None => (from_bandwidth(in_flight.duration()), None),
            },
            None => (from_bandwidth(in_flight.duration()), None),
        };
        let init_bytes = match &new_init {
            Some(init) if st.last_init_reference.as_deref() != Some(init.as_ref()) => {
                init.size_bytes().unwrap_or(2048)
            }
            _ => 0,
        };
        segment_bytes + init_bytes
    }

    /// Engage or disengage trick-mode playback. Engaging swaps the video track onto the active
    /// stream's trick-mode stream without clearing; disengaging clears the trick buffer and
    /// resumes the normal stream, starting with a fresh init segment.
    pub fn set_trick_play(&self, on: bool) {
        let Some(task) = self.inner.task(TrackType::Video) else { return };
        let mut st = task.state.lock().unwrap();
        if on {
            if st.restore_after_trick.is_some() {
                return; // already in trick mode
            }
            let trick = {
                let manifest = self.inner.manifest.read();
                manifest.stream(st.stream).and_then(|s| s.trick_mode_video)
            };
            let Some(trick) = trick else {
                debug!("set_trick_play: active stream has no trick-mode video");
                return;
            };
            info!("trick play engaged on {trick}");
            let normal = st.stream;
            st.invalidate();
            st.restore_after_trick = Some(normal);
            st.stream = trick;
            st.cursor = None;
            st.last_segment_reference = None;
            st.last_init_reference = None;
            st.last_appended_stream_id = None;
        } else {
            let Some(normal) = st.restore_after_trick.take() else { return };
            info!("trick play disengaged, resuming {normal}");
            st.invalidate();
            st.stream = normal;
            st.cursor = None;
            st.last_segment_reference = None;
            st.last_init_reference = None;
            st.last_appended_stream_id = None;
            st.waiting_to_clear_buffer = true;
            st.clear_buffer_safely = false;
        }
        drop(st);
        task.wake.notify_one();
    }

    /// Initialise the sink and begin streaming. Completes once the first media segment of every
    /// active track has been appended (or a track finished/failed).
    pub async fn start(&self) -> Result<(), MseError> {
        let inner = &self.inner;
        if inner.destroyed() {
            return Err(MseError::Destroyed);
        }
        let tasks: Vec<_> = inner.states.lock().unwrap().values().cloned().collect();
        if tasks.is_empty() {
            return Err(MseError::StreamSetup(String::from(
                "start() before switch_variant: no active tracks")));
        }
        let mut track_inits = HashMap::new();
        {
            let manifest = inner.manifest.read();
            for task in &tasks {
                let stream_id = task.state.lock().unwrap().stream;
                if let Some(s) = manifest.stream(stream_id) {
                    track_inits.insert(task.track, SinkTrackInit {
                        mime: s.mime.clone(),
                        codecs: s.codecs.clone(),
                    });
                }
            }
        }
        inner.sink.init(track_inits, true).await?;
        let duration = inner.manifest.read().timeline.duration();
        if duration.is_finite() {
            inner.sink.set_duration(duration).await?;
        }
        inner.started.store(true, Ordering::Release);
        for task in &tasks {
            // a fresh session starts with clean buffers; don't re-run the initial clear
            {
                let mut st = task.state.lock().unwrap();
                st.waiting_to_clear_buffer = false;
                st.needs_sink_reinit = false;
            }
            spawn_update_loop(inner, task.clone());
        }
        info!("streaming engine started with {} track(s)", tasks.len());
        loop {
            if inner.destroyed() {
                return Err(MseError::Destroyed);
            }
            let mut pending = false;
            for task in &tasks {
                let st = task.state.lock().unwrap();
                if let Some(e) = &st.start_error {
                    return Err(e.clone());
                }
                if !st.has_started && !st.end_of_stream && !st.paused_on_error {
                    pending = true;
                }
            }
            if !pending {
                return Ok(());
            }
            // notifications can race the re-check, so bound each wait and poll again
            let _ = tokio::time::timeout(
                Duration::from_millis(200),
                inner.append_notify.notified(),
            ).await;
        }
    }

    /// Reconcile every track's buffer with the playhead after a seek.
    pub fn seeked(&self) {
        let playhead = self.inner.playhead.position();
        let config = self.inner.config();
        let tasks: Vec<_> = self.inner.states.lock().unwrap().values().cloned().collect();
        let mut any_cleared = false;
        for task in &tasks {
            let track = task.track;
            if self.inner.sink.is_buffered(track, playhead) {
                trace!("seeked: {track} already buffered at {playhead}");
                continue;
            }
            // a tiny gap right after the buffered end extends seamlessly; anything further
            // needs a clear and a refetch from the playhead
            let seamless = self.inner.sink.buffer_end(track)
                .is_some_and(|end| playhead >= end && playhead - end <= config.drift_tolerance);
            let mut st = task.state.lock().unwrap();
            st.invalidate();
            st.cursor = None;
            st.last_segment_reference = None;
            st.end_of_stream = false;
            if !seamless && self.inner.sink.buffer_start(track).is_some() {
                st.waiting_to_clear_buffer = true;
                st.clear_buffer_safely = false;
                any_cleared = true;
            }
            drop(st);
            task.wake.notify_one();
        }
        if any_cleared {
            self.inner.sink.reset_caption_parser();
        }
        // a seek can leave an ended presentation mid-stream again
        self.inner.ended.store(false, Ordering::Release);
    }

    /// Resume all tracks after a recoverable error. Returns `false` when the engine is destroyed
    /// or a quota error was escalated to fatal.
    pub fn retry(&self) -> bool {
        if self.inner.destroyed() || self.inner.fatal_quota.load(Ordering::Acquire) {
            return false;
        }
        retry_all(&self.inner);
        true
    }

    /// Abort all in-flight work and stop every update cycle. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("destroying streaming engine");
        let tasks: Vec<_> = self.inner.states.lock().unwrap().values().cloned().collect();
        for task in tasks {
            task.state.lock().unwrap().invalidate();
            task.wake.notify_one();
        }
        self.inner.append_notify.notify_waiters();
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn spawn_update_loop(inner: &Arc<Inner>, task: Arc<TrackTask>) {
    if task.loop_running.swap(true, Ordering::AcqRel) {
        return;
    }
    let inner = inner.clone();
    tokio::spawn(async move {
        update_loop(inner, task).await;
    });
}

async fn update_loop(inner: Arc<Inner>, task: Arc<TrackTask>) {
    let track = task.track;
    let mut next: StepOutcome = StepOutcome::Rearm(Duration::ZERO);
    loop {
        match next {
            StepOutcome::Exit => break,
            StepOutcome::AwaitWake => task.wake.notified().await,
            StepOutcome::Rearm(delay) if delay > Duration::ZERO => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task.wake.notified() => {}
                }
            }
            StepOutcome::Rearm(_) => {}
        }
        if inner.destroyed() {
            break;
        }
        // the task may have been replaced or removed (text unload)
        let current = inner.task(track);
        if !current.as_ref().is_some_and(|t| Arc::ptr_eq(t, &task)) {
            break;
        }
        enum NextAction {
            AwaitWake,
            Rearm(Duration),
            RunUpdate,
        }
        let action = {
            let mut st = task.state.lock().unwrap();
            if st.paused_on_error {
                NextAction::AwaitWake
            } else if st.performing_update {
                // re-entrancy guard; only possible if a previous iteration leaked, which
                // would be a bug, so back off rather than run concurrently
                NextAction::Rearm(Duration::from_millis(100))
            } else {
                st.performing_update = true;
                NextAction::RunUpdate
            }
        };
        next = match action {
            NextAction::AwaitWake => StepOutcome::AwaitWake,
            NextAction::Rearm(d) => StepOutcome::Rearm(d),
            NextAction::RunUpdate => {
                let outcome = run_update(&inner, &task).await;
                task.state.lock().unwrap().performing_update = false;
                outcome
            }
        };
    }
    task.loop_running.store(false, Ordering::Release);
    trace!("{track} update loop exited");
}

fn backoff(config: &StreamingConfig) -> StepOutcome {
    StepOutcome::Rearm(Duration::from_secs_f64(config.update_backoff.max(0.01)))
}

// One iteration of the per-track update cycle. At most one suspension per logical step; the
// generation counter is re-checked after every await.
async fn run_update(inner: &Arc<Inner>, task: &Arc<TrackTask>) -> StepOutcome {
    let track = task.track;
    let config = inner.config();
    let playhead = inner.playhead.position();
    let now = inner.clock.now_epoch();

    // pending buffer clear takes priority over everything else
    let clear = {
        let st = task.state.lock().unwrap();
        if st.waiting_to_clear_buffer {
            Some((st.clear_buffer_safely, st.clear_safe_margin, st.generation))
        } else {
            None
        }
    };
    if let Some((safely, margin, generation)) = clear {
        return perform_clear(inner, task, safely, margin, generation, playhead).await;
    }

    let reinit = {
        let st = task.state.lock().unwrap();
        if st.needs_sink_reinit { Some((st.stream, st.generation)) } else { None }
    };
    if let Some((stream, generation)) = reinit {
        return perform_sink_reinit(inner, task, stream, generation).await;
    }

    // target time: next unbuffered instant for this track
    let buffered_ahead = inner.sink.buffered_ahead_of(track, playhead);
    let target = playhead + buffered_ahead;

    // buffering-goal check
    if buffered_ahead >= config.buffering_goal {
        trace!("{track}: buffered {buffered_ahead:.1}s >= goal, idling");
        return backoff(&config);
    }

    // fair-buffer rule: never run more than one segment duration (plus slack) ahead of the
    // slowest active sibling, so one track cannot starve the others' bandwidth
    let (max_seg, live, duration) = {
        let m = inner.manifest.read();
        (m.timeline.max_segment_duration(), m.timeline.is_live(), m.timeline.duration())
    };
    if let Some(min_other) = slowest_other_track(inner, task, playhead) {
        let my_end = inner.sink.buffer_end(track).unwrap_or(playhead);
        if my_end > min_other + max_seg + config.fair_buffer_slack {
            trace!("{track}: {my_end:.1} too far ahead of slowest sibling {min_other:.1}");
            return backoff(&config);
        }
    }

    // make sure the segment index exists before consulting it
    let (stream_id, generation) = {
        let st = task.state.lock().unwrap();
        (st.stream, st.generation)
    };
    let index = match ensure_segment_index(inner, task, stream_id, generation).await {
        Ok(Some(index)) => index,
        Ok(None) => return StepOutcome::Rearm(Duration::ZERO),
        Err(outcome) => return outcome,
    };

    // choose the next segment
    enum ReferenceStep {
        Rearm,
        EndOfIndex,
        Reference(Arc<SegmentReference>),
    }
    let step = 'lock: {
        let mut st = task.state.lock().unwrap();
        if st.generation != generation {
            break 'lock ReferenceStep::Rearm;
        }
        if st.cursor.is_none() {
            // resume after the last appended segment when we have one (a live index grown
            // underneath us); otherwise resolve from the target time
            let resume_from = st
                .last_segment_reference
                .as_ref()
                .map(|r| r.end_time)
                .unwrap_or(target);
            match index.find(resume_from) {
                Some(pos) => st.cursor = Some(index.iterator_from_position(pos)),
                None => break 'lock ReferenceStep::EndOfIndex,
            }
        }
        match st.cursor.as_ref().and_then(|c| c.peek()) {
            Some(r) => ReferenceStep::Reference(r),
            None => ReferenceStep::EndOfIndex,
        }
    };
    let reference = match step {
        ReferenceStep::Rearm => return StepOutcome::Rearm(Duration::ZERO),
        ReferenceStep::EndOfIndex => {
            return end_of_index(inner, task, live, duration, target, max_seg, &config).await;
        }
        ReferenceStep::Reference(r) => r,
    };

    // availability window check for live content
    if live {
        let m = inner.manifest.read();
        let window_start = m.timeline.availability_window_start(now);
        let window_end = m.timeline.availability_window_end(now);
        drop(m);
        if reference.start_time >= window_end {
            // not produced yet; half a segment duration is the natural poll interval
            trace!("{track}: segment at {} not yet available", reference.start_time);
            return StepOutcome::Rearm(Duration::from_secs_f64((max_seg / 2.0).max(0.1)));
        }
        if reference.end_time <= window_start {
            // we drifted behind the window; skip forward to content that still exists
            warn!("{track}: segment ending {} fell out of the availability window, skipping forward",
                  reference.end_time);
            let mut st = task.state.lock().unwrap();
            if st.generation != generation {
                return StepOutcome::Rearm(Duration::ZERO);
            }
            st.recovering_from_drift_skip = true;
            st.cursor = index.find(window_start).map(|p| index.iterator_from_position(p));
            st.last_segment_reference = None;
            return StepOutcome::Rearm(Duration::ZERO);
        }
    }

    // init segment first whenever the init reference or the stream identity changed
    let needs_init = {
        let st = task.state.lock().unwrap();
        st.last_appended_stream_id != Some(stream_id)
            || st.last_init_reference.as_deref() != reference.init.as_deref()
    };
    if needs_init {
        match append_init(inner, task, stream_id, &reference, generation, &config).await {
            Ok(true) => {}
            Ok(false) => return StepOutcome::Rearm(Duration::ZERO),
            Err(outcome) => return outcome,
        }
    }

    // fetch the media segment
    let spec = RequestSpec::segment(
        reference.uris.clone(),
        reference.byte_range,
        config.retry.clone(),
        track,
        false,
    );
    let pending = inner.fetcher.request(spec);
    {
        let mut st = task.state.lock().unwrap();
        if st.generation != generation {
            pending.handle().abort();
            return StepOutcome::Rearm(Duration::ZERO);
        }
        st.operation = Some(pending.handle());
        st.operation_reference = Some(reference.clone());
    }
    let outcome = pending.wait().await;
    {
        let mut st = task.state.lock().unwrap();
        st.operation = None;
        st.operation_reference = None;
        if st.generation != generation {
            return StepOutcome::Rearm(Duration::ZERO);
        }
    }
    let bytes = match outcome {
        Ok(FetchOutcome::Complete(response)) => response.bytes,
        Ok(FetchOutcome::Aborted) => {
            debug!("{track}: fetch aborted");
            inner.record_abort();
            return StepOutcome::Rearm(Duration::ZERO);
        }
        Err(e) => return media_fetch_failed(inner, task, e, &config),
    };

    // surface in-band events before handing the bytes to the sink
    scan_for_events(inner, track, stream_id, &reference, &bytes);

    // append, with the quota-recovery path
    if let Err(outcome) =
        append_media(inner, task, &reference, bytes, generation, playhead, now, &config).await
    {
        return outcome;
    }

    // post-append bookkeeping
    {
        let mut st = task.state.lock().unwrap();
        if st.generation == generation {
            if let Some(c) = st.cursor.as_mut() {
                c.next();
            }
            if st.recovering_from_drift_skip {
                info!("{track}: recovered from availability drift at {}", reference.start_time);
                st.recovering_from_drift_skip = false;
            }
            st.last_segment_reference = Some(reference.clone());
            st.has_started = true;
        }
    }
    inner.append_notify.notify_waiters();
    let buffered_end = inner.sink.buffer_end(track).unwrap_or(0.0);
    if (buffered_end - reference.end_time).abs() > config.drift_tolerance {
        debug!("{track}: buffered end {buffered_end:.3} vs reference end {:.3} exceeds drift tolerance",
               reference.end_time);
    }
    evict(inner, track, playhead, &config).await;
    update_duration(inner).await;
    StepOutcome::Rearm(Duration::ZERO)
}

// Buffered end of the slowest other active track, or None when this is the only one.
fn slowest_other_track(inner: &Arc<Inner>, task: &Arc<TrackTask>, playhead: f64) -> Option<f64> {
    let tasks: Vec<_> = inner.states.lock().unwrap().values().cloned().collect();
    tasks
        .iter()
        .filter(|t| t.track != task.track)
        .filter(|t| {
            let st = t.state.lock().unwrap();
            !st.end_of_stream && !st.paused_on_error
        })
        .map(|t| inner.sink.buffer_end(t.track).unwrap_or(playhead))
        .min_by(|a, b| a.total_cmp(b))
}

async fn perform_clear(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    safely: bool,
    margin: f64,
    generation: u64,
    playhead: f64,
) -> StepOutcome {
    let track = task.track;
    debug!("{track}: clearing buffer (safely={safely})");
    let result = if safely {
        inner.sink.remove(track, playhead + margin, f64::INFINITY).await
    } else {
        inner.sink.clear(track).await
    };
    let mut st = task.state.lock().unwrap();
    st.waiting_to_clear_buffer = false;
    st.clear_buffer_safely = false;
    st.clear_safe_margin = 0.0;
    if st.generation == generation {
        st.cursor = None;
        st.last_segment_reference = None;
    }
    drop(st);
    match result {
        Ok(()) => StepOutcome::Rearm(Duration::ZERO),
        Err(e) => {
            error!("{track}: buffer clear failed: {e}");
            let err = MseError::MediaSourceOperationFailed(format!("clear: {e}"));
            pause_with_error(inner, task, err, Severity::Critical)
        }
    }
}

async fn perform_sink_reinit(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    stream: StreamId,
    generation: u64,
) -> StepOutcome {
    let track = task.track;
    let init = {
        let manifest = inner.manifest.read();
        manifest.stream(stream).map(|s| SinkTrackInit { mime: s.mime.clone(), codecs: s.codecs.clone() })
    };
    let Some(init) = init else {
        return pause_with_error(
            inner, task,
            MseError::StreamSetup(format!("{stream} vanished from the manifest")),
            Severity::Critical,
        );
    };
    let result = inner.sink.init(HashMap::from([(track, init)]), true).await;
    let mut st = task.state.lock().unwrap();
    if st.generation == generation {
        st.needs_sink_reinit = false;
    }
    drop(st);
    match result {
        Ok(()) => StepOutcome::Rearm(Duration::ZERO),
        Err(e) => {
            let err = MseError::MediaSourceOperationFailed(format!("sink init: {e}"));
            pause_with_error(inner, task, err, Severity::Critical)
        }
    }
}

// Materialise the stream's segment index if needed. Ok(Some) = ready, Ok(None) = try again
// shortly (someone else is creating it, or we just published it).
async fn ensure_segment_index(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    stream_id: StreamId,
    generation: u64,
) -> Result<Option<SegmentIndex>, StepOutcome> {
    {
        let manifest = inner.manifest.read();
        let Some(stream) = manifest.stream(stream_id) else {
            return Err(pause_with_error(
                inner, task,
                MseError::StreamSetup(format!("{stream_id} vanished from the manifest")),
                Severity::Critical,
            ));
        };
        if let Some(index) = stream.segment_index.clone() {
            return Ok(Some(index));
        }
    }
    let factory = inner.manifest.modify(|m| m.take_index_factory(stream_id));
    let Some(factory) = factory else {
        // creation already in flight (or impossible); poll again shortly
        let config = inner.config();
        if inner.manifest.read().stream(stream_id).is_some_and(|s| s.index_factory.is_none()) {
            return Err(pause_with_error(
                inner, task,
                MseError::StreamSetup(format!("{stream_id} has no segment index source")),
                Severity::Critical,
            ));
        }
        return Err(backoff(&config));
    };
    debug!("{}: creating segment index for {stream_id}", task.track);
    let created = factory().await;
    match created {
        Ok(index) => {
            inner.manifest.modify(|m| m.finish_index_creation(stream_id, Some(index)));
            let st = task.state.lock().unwrap();
            if st.generation != generation {
                return Err(StepOutcome::Rearm(Duration::ZERO));
            }
            Ok(None)
        }
        Err(e) => {
            inner.manifest.modify(|m| m.finish_index_creation(stream_id, None));
            warn!("{}: segment index creation failed: {e}", task.track);
            Err(fetch_setup_failed(inner, task, e))
        }
    }
}

// The cursor ran out of references: either the presentation is over or a live update will grow
// the index.
async fn end_of_index(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    live: bool,
    duration: f64,
    target: f64,
    max_seg: f64,
    config: &StreamingConfig,
) -> StepOutcome {
    let track = task.track;
    if live || duration.is_infinite() || target < duration - config.drift_tolerance {
        // more references should appear; poll at half a segment duration
        return StepOutcome::Rearm(Duration::from_secs_f64((max_seg / 2.0).max(0.1)));
    }
    {
        let mut st = task.state.lock().unwrap();
        if !st.end_of_stream {
            info!("{track}: end of stream reached");
            st.end_of_stream = true;
        }
    }
    inner.append_notify.notify_waiters();
    // once every active track is finished, close the presentation exactly once
    let tasks: Vec<_> = inner.states.lock().unwrap().values().cloned().collect();
    let all_done = tasks.iter().all(|t| t.state.lock().unwrap().end_of_stream);
    if all_done && !inner.ended.swap(true, Ordering::AcqRel) {
        info!("all tracks finished; signalling end of stream");
        if let Err(e) = inner.sink.end_of_stream().await {
            inner.ended.store(false, Ordering::Release);
            let err = MseError::MediaSourceOperationFailed(format!("end_of_stream: {e}"));
            return pause_with_error(inner, task, err, Severity::Critical);
        }
    }
    StepOutcome::AwaitWake
}

// Fetch and append the init segment for `reference`. Ok(true) = appended (or not needed),
// Ok(false) = iteration lost a race and should re-arm.
async fn append_init(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    stream_id: StreamId,
    reference: &Arc<SegmentReference>,
    generation: u64,
    config: &StreamingConfig,
) -> Result<bool, StepOutcome> {
    let track = task.track;
    let Some(init) = reference.init.clone() else {
        // self-initialising stream: just record the identity switch
        let mut st = task.state.lock().unwrap();
        if st.generation == generation {
            maybe_reset_captions(inner, track, &st, stream_id);
            st.last_appended_stream_id = Some(stream_id);
            st.last_init_reference = None;
        }
        return Ok(true);
    };
    debug!("{track}: appending init segment for {stream_id}");
    let spec = RequestSpec::segment(
        init.uris.clone(),
        init.byte_range,
        config.retry.clone(),
        track,
        true,
    );
    let pending = inner.fetcher.request(spec);
    {
        let mut st = task.state.lock().unwrap();
        if st.generation != generation {
            pending.handle().abort();
            return Ok(false);
        }
        st.operation = Some(pending.handle());
        st.operation_reference = Some(reference.clone());
    }
    let outcome = pending.wait().await;
    {
        let mut st = task.state.lock().unwrap();
        st.operation = None;
        st.operation_reference = None;
        if st.generation != generation {
            return Ok(false);
        }
    }
    let bytes = match outcome {
        Ok(FetchOutcome::Complete(r)) => r.bytes,
        Ok(FetchOutcome::Aborted) => {
            inner.record_abort();
            return Ok(false);
        }
        Err(e) => return Err(media_fetch_failed(inner, task, e, config)),
    };
    if let Err(e) = inner
        .sink
        .set_stream_properties(track, reference.timestamp_offset,
                               reference.append_window_start, reference.append_window_end)
        .await
    {
        let err = MseError::MediaSourceOperationFailed(format!("stream properties: {e}"));
        return Err(pause_with_error(inner, task, err, Severity::Critical));
    }
    let appended = inner
        .sink
        .append(track, bytes, reference.append_window_start, reference.append_window_end,
                reference.timestamp_offset)
        .await;
    match appended {
        Ok(()) => {
            let mut st = task.state.lock().unwrap();
            if st.generation == generation {
                maybe_reset_captions(inner, track, &st, stream_id);
                st.last_init_reference = Some(init);
                st.last_appended_stream_id = Some(stream_id);
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Err(e) => {
            // an init segment the sink cannot accept is unrecoverable for this stream
            error!("{track}: init segment append failed: {e}");
            let err = MseError::MediaSourceOperationFailed(format!("init append: {e}"));
            Err(pause_with_error(inner, task, err, Severity::Critical))
        }
    }
}

fn maybe_reset_captions(inner: &Arc<Inner>, track: TrackType, st: &MediaState, new_stream: StreamId) {
    if track == TrackType::Video
        && st.last_appended_stream_id.is_some_and(|prev| prev != new_stream)
    {
        inner.sink.reset_caption_parser();
    }
}

fn scan_for_events(
    inner: &Arc<Inner>,
    track: TrackType,
    stream_id: StreamId,
    reference: &SegmentReference,
    bytes: &Bytes,
) {
    if track != TrackType::Video {
        return;
    }
    let schemes = {
        let manifest = inner.manifest.read();
        match manifest.stream(stream_id) {
            Some(s) if !s.emsg_scheme_id_uris.is_empty() => s.emsg_scheme_id_uris.clone(),
            _ => return,
        }
    };
    let scan = scan_segment(bytes, reference.start_time, &schemes);
    if scan.manifest_update {
        info!("in-band manifest update signal at {}", reference.start_time);
        inner.emit(EngineEvent::ManifestUpdateNeeded);
    }
    for event in scan.events {
        inner.emit(EngineEvent::Emsg(event));
    }
}

// Append a media segment, absorbing the first quota error per the recovery policy: shrink the
// back-buffer, evict, retry once. A second quota error within the escalation window is fatal.
#[allow(clippy::too_many_arguments)]
async fn append_media(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    reference: &Arc<SegmentReference>,
    bytes: Bytes,
    generation: u64,
    playhead: f64,
    now: f64,
    config: &StreamingConfig,
) -> Result<(), StepOutcome> {
    let track = task.track;
    let size = bytes.len();
    let mut attempt_bytes = bytes;
    let mut media_retry_used = false;
    loop {
        let result = inner
            .sink
            .append(track, attempt_bytes.clone(), reference.append_window_start,
                    reference.append_window_end, reference.timestamp_offset)
            .await;
        {
            let st = task.state.lock().unwrap();
            if st.generation != generation {
                return Err(StepOutcome::Rearm(Duration::ZERO));
            }
        }
        match result {
            Ok(()) => {
                inner.record_append(size);
                return Ok(());
            }
            Err(MseError::QuotaExceeded(_)) => {
                let escalate = {
                    let mut st = task.state.lock().unwrap();
                    let previous = st.last_quota_error_at.replace(now);
                    previous.is_some_and(|t| now - t < QUOTA_ESCALATION_WINDOW)
                };
                if escalate {
                    error!("{track}: repeated quota errors; giving up");
                    inner.fatal_quota.store(true, Ordering::Release);
                    return Err(pause_with_error(
                        inner, task, MseError::QuotaExceeded(track), Severity::Critical));
                }
                // shrink the retained back-buffer and evict before retrying once
                let new_behind = {
                    let mut cfg = inner.config.lock().unwrap();
                    cfg.buffer_behind *= 1.0 - QUOTA_BUFFER_REDUCTION;
                    cfg.buffer_behind
                };
                warn!("{track}: quota exceeded; buffer_behind reduced to {new_behind:.1}s");
                report_error(inner, Some(track), MseError::QuotaExceeded(track),
                             Severity::Recoverable);
                let reduced = inner.config();
                evict(inner, track, playhead, &reduced).await;
                {
                    let st = task.state.lock().unwrap();
                    if st.generation != generation {
                        return Err(StepOutcome::Rearm(Duration::ZERO));
                    }
                }
                continue;
            }
            Err(e) if !media_retry_used => {
                // a media append may glitch once (decoder buffer churn); one retry only
                warn!("{track}: media append failed ({e}); retrying once");
                media_retry_used = true;
                continue;
            }
            Err(e) => {
                let err = MseError::MediaSourceOperationFailed(format!("append: {e}"));
                return Err(pause_with_error(inner, task, err, Severity::Critical));
            }
        }
    }
}

// Drop played-out content behind the playhead, but never closer than the manifest's minimum
// buffer.
async fn evict(inner: &Arc<Inner>, track: TrackType, playhead: f64, config: &StreamingConfig) {
    let min_buffer_time = inner.manifest.read().min_buffer_time;
    let evict_to = (playhead - config.buffer_behind).min(playhead - min_buffer_time);
    let Some(buffered_start) = inner.sink.buffer_start(track) else { return };
    if evict_to <= buffered_start {
        return;
    }
    trace!("{track}: evicting [{buffered_start:.1}, {evict_to:.1})");
    if let Err(e) = inner.sink.remove(track, buffered_start, evict_to).await {
        warn!("{track}: eviction failed: {e}");
    }
    // evict matching references so live indexes do not grow without bound
    let index = {
        let manifest = inner.manifest.read();
        inner
            .task(track)
            .map(|t| t.state.lock().unwrap().stream)
            .and_then(|sid| manifest.stream(sid).and_then(|s| s.segment_index.clone()))
    };
    if let Some(index) = index {
        index.evict(evict_to);
    }
}

// The sink's duration is authoritative once media is appended, and only ever shrinks the
// timeline. Spurious zero durations are ignored.
async fn update_duration(inner: &Arc<Inner>) {
    let reported = inner.sink.get_duration();
    if reported <= 0.0 {
        return;
    }
    let current = inner.manifest.read().timeline.duration();
    if reported < current {
        inner.manifest.modify(|m| m.timeline.set_duration(reported));
        let _ = inner.sink.set_duration(reported).await;
    }
}

fn fetch_setup_failed(inner: &Arc<Inner>, task: &Arc<TrackTask>, error: MseError) -> StepOutcome {
    let severity = error.default_severity();
    pause_with_error(inner, task, error, severity)
}

// A media fetch exhausted its retries. Text tracks may be configured to die quietly; other
// tracks pause until retry().
fn media_fetch_failed(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    error: MseError,
    config: &StreamingConfig,
) -> StepOutcome {
    let track = task.track;
    if track == TrackType::Text && config.ignore_text_stream_failures {
        warn!("text stream failed persistently; disabling text ({error})");
        // finished as far as the rest of the engine is concerned: start() must not wait for it
        // and end-of-stream accounting must not count it
        task.state.lock().unwrap().end_of_stream = true;
        inner.states.lock().unwrap().remove(&TrackType::Text);
        inner.emit(EngineEvent::TextTrackDisabled);
        inner.append_notify.notify_waiters();
        return StepOutcome::Exit;
    }
    let severity = error.default_severity();
    pause_with_error(inner, task, error, severity)
}

fn pause_with_error(
    inner: &Arc<Inner>,
    task: &Arc<TrackTask>,
    error: MseError,
    severity: Severity,
) -> StepOutcome {
    let track = task.track;
    warn!("{track}: pausing on error: {error}");
    {
        let mut st = task.state.lock().unwrap();
        st.paused_on_error = true;
        if !st.has_started && st.start_error.is_none() {
            st.start_error = Some(error.clone());
        }
    }
    inner.append_notify.notify_waiters();
    report_error(inner, Some(track), error, severity);
    StepOutcome::AwaitWake
}
