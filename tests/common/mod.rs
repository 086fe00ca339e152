// Shared code for our test harness: scripted network and sink fakes, controllable clock and
// playhead, and small manifest builders.
//
// The fakes speak a tiny payload convention so the sink can reconstruct buffered ranges without
// parsing media: an init segment's body is `init:<tag>` and a media segment's body is
// `media:<tag>:<start>:<end>` with presentation times in seconds.

#![allow(dead_code)]

use bytes::Bytes;
use dash_mse::engine::Playhead;
use dash_mse::fetch::{Fetcher, PendingRequest, RequestSpec, RequestType, Response};
use dash_mse::manifest::{ContentType, Manifest, Stream, StreamId, Variant};
use dash_mse::segment::{InitSegmentReference, SegmentIndex, SegmentReference};
use dash_mse::sink::{BufferSink, RangeSet, SinkTrackInit};
use dash_mse::timeline::Clock;
use dash_mse::{MseError, TrackType};
use futures_util::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use url::Url;

static TRACING_INIT: Once = Once::new();

pub fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    TRACING_INIT.call_once(|| {
        let fmt_layer = fmt::layer().compact().with_target(false);
        let filter_layer = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .expect("initializing logging");
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    });
}

pub fn url(s: &str) -> Url {
    Url::parse(s).expect("test URL")
}

// ---------------------------------------------------------------------------------------------
// clock and playhead

#[derive(Debug, Clone, Default)]
pub struct FakeClock {
    now: Arc<Mutex<f64>>,
}

impl FakeClock {
    pub fn at(now: f64) -> Arc<Self> {
        Arc::new(FakeClock { now: Arc::new(Mutex::new(now)) })
    }

    pub fn set(&self, now: f64) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock().unwrap() += secs;
    }
}

impl Clock for FakeClock {
    fn now_epoch(&self) -> f64 {
        *self.now.lock().unwrap()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakePlayhead {
    position: Arc<Mutex<f64>>,
}

impl FakePlayhead {
    pub fn at(t: f64) -> Arc<Self> {
        Arc::new(FakePlayhead { position: Arc::new(Mutex::new(t)) })
    }

    pub fn set(&self, t: f64) {
        *self.position.lock().unwrap() = t;
    }
}

impl Playhead for FakePlayhead {
    fn position(&self) -> f64 {
        *self.position.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------------------------
// scripted fetcher

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub bytes: Bytes,
    pub delay: Duration,
    /// Reported on the request handle while the transfer is in flight (defaults to body size).
    pub bytes_remaining: Option<u64>,
    /// Fail this many requests for the URL before succeeding.
    pub fail_times: u32,
}

impl ScriptedResponse {
    pub fn body(text: &str) -> Self {
        ScriptedResponse {
            bytes: Bytes::from(text.to_string()),
            delay: Duration::ZERO,
            bytes_remaining: None,
            fail_times: 0,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn remaining(mut self, n: u64) -> Self {
        self.bytes_remaining = Some(n);
        self
    }

    pub fn failing(mut self, times: u32) -> Self {
        self.fail_times = times;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub url: String,
    pub request_type: RequestType,
}

#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, ScriptedResponse>>,
    log: Mutex<Vec<RequestRecord>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeFetcher::default())
    }

    pub fn route(&self, url: &str, response: ScriptedResponse) {
        self.routes.lock().unwrap().insert(url.to_string(), response);
    }

    pub fn requested_urls(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|r| r.url.clone()).collect()
    }

    pub fn requested(&self, url: &str) -> bool {
        self.log.lock().unwrap().iter().any(|r| r.url == url)
    }
}

impl Fetcher for FakeFetcher {
    fn request(&self, spec: RequestSpec) -> PendingRequest {
        let url = spec.uris[0].to_string();
        self.log.lock().unwrap().push(RequestRecord {
            url: url.clone(),
            request_type: spec.context.request_type,
        });
        let script = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&url) {
                Some(s) if s.fail_times > 0 => {
                    s.fail_times -= 1;
                    None
                }
                Some(s) => Some(s.clone()),
                None => None,
            }
        };
        let initial = script
            .as_ref()
            .map(|s| s.bytes_remaining.unwrap_or(s.bytes.len() as u64))
            .unwrap_or(0);
        PendingRequest::spawn(initial, move |_handle| async move {
            match script {
                Some(s) => {
                    if s.delay > Duration::ZERO {
                        tokio::time::sleep(s.delay).await;
                    }
                    Ok(Response { uri: Url::parse(&url).unwrap(), bytes: s.bytes })
                }
                None => Err(MseError::Http(format!("no scripted response for {url}"))),
            }
        })
    }
}

// ---------------------------------------------------------------------------------------------
// in-memory buffer sink

#[derive(Debug, Default)]
struct SinkState {
    buffers: HashMap<TrackType, RangeSet>,
    appends: Vec<(TrackType, String)>,
    append_errors: HashMap<TrackType, VecDeque<MseError>>,
    inits: Vec<Vec<TrackType>>,
    clears: Vec<TrackType>,
    removes: Vec<(TrackType, f64, f64)>,
    duration: f64,
    caption_resets: u32,
    end_of_stream_calls: u32,
}

#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySink::default())
    }

    /// Queue an error for the next append on `track` (consumed one per append attempt).
    pub fn fail_next_append(&self, track: TrackType, error: MseError) {
        let mut st = self.state.lock().unwrap();
        st.append_errors.entry(track).or_default().push_back(error);
    }

    pub fn appended(&self, track: TrackType) -> Vec<String> {
        let st = self.state.lock().unwrap();
        st.appends.iter().filter(|(t, _)| *t == track).map(|(_, s)| s.clone()).collect()
    }

    pub fn all_appends(&self) -> Vec<(TrackType, String)> {
        self.state.lock().unwrap().appends.clone()
    }

    pub fn init_calls(&self) -> Vec<Vec<TrackType>> {
        self.state.lock().unwrap().inits.clone()
    }

    pub fn clear_calls(&self) -> Vec<TrackType> {
        self.state.lock().unwrap().clears.clone()
    }

    pub fn remove_calls(&self) -> Vec<(TrackType, f64, f64)> {
        self.state.lock().unwrap().removes.clone()
    }

    pub fn caption_resets(&self) -> u32 {
        self.state.lock().unwrap().caption_resets
    }

    pub fn end_of_stream_calls(&self) -> u32 {
        self.state.lock().unwrap().end_of_stream_calls
    }

    /// Pretend the underlying media reported a different duration (e.g. shorter real content).
    pub fn force_duration(&self, duration: f64) {
        self.state.lock().unwrap().duration = duration;
    }

    pub fn buffered(&self, track: TrackType) -> Vec<(f64, f64)> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(&track)
            .map(|r| r.ranges().to_vec())
            .unwrap_or_default()
    }
}

impl BufferSink for MemorySink {
    fn init(
        &self,
        tracks: HashMap<TrackType, SinkTrackInit>,
        _for_dash: bool,
    ) -> BoxFuture<'_, Result<(), MseError>> {
        Box::pin(async move {
            let mut st = self.state.lock().unwrap();
            let mut opened: Vec<TrackType> = tracks.keys().copied().collect();
            opened.sort();
            for track in &opened {
                st.buffers.insert(*track, RangeSet::new());
            }
            st.inits.push(opened);
            Ok(())
        })
    }

    fn append(
        &self,
        track: TrackType,
        bytes: Bytes,
        window_start: f64,
        window_end: f64,
        _timestamp_offset: f64,
    ) -> BoxFuture<'_, Result<(), MseError>> {
        Box::pin(async move {
            let mut st = self.state.lock().unwrap();
            if let Some(e) = st.append_errors.get_mut(&track).and_then(|q| q.pop_front()) {
                return Err(e);
            }
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if let Some(rest) = text.strip_prefix("media:") {
                let parts: Vec<&str> = rest.split(':').collect();
                if parts.len() == 3 {
                    let start: f64 = parts[1].parse().expect("media payload start");
                    let end: f64 = parts[2].parse().expect("media payload end");
                    st.buffers
                        .entry(track)
                        .or_default()
                        .add(start.max(window_start), end.min(window_end));
                }
            }
            st.appends.push((track, text));
            Ok(())
        })
    }

    fn remove(&self, track: TrackType, start: f64, end: f64) -> BoxFuture<'_, Result<(), MseError>> {
        Box::pin(async move {
            let mut st = self.state.lock().unwrap();
            st.removes.push((track, start, end));
            st.buffers.entry(track).or_default().remove(start, end);
            Ok(())
        })
    }

    fn clear(&self, track: TrackType) -> BoxFuture<'_, Result<(), MseError>> {
        Box::pin(async move {
            let mut st = self.state.lock().unwrap();
            st.clears.push(track);
            st.buffers.entry(track).or_default().clear();
            Ok(())
        })
    }

    fn set_stream_properties(
        &self,
        _track: TrackType,
        _timestamp_offset: f64,
        _window_start: f64,
        _window_end: f64,
    ) -> BoxFuture<'_, Result<(), MseError>> {
        Box::pin(async { Ok(()) })
    }

    fn buffer_start(&self, track: TrackType) -> Option<f64> {
        self.state.lock().unwrap().buffers.get(&track).and_then(|r| r.start())
    }

    fn buffer_end(&self, track: TrackType) -> Option<f64> {
        self.state.lock().unwrap().buffers.get(&track).and_then(|r| r.end())
    }

    fn buffered_ahead_of(&self, track: TrackType, t: f64) -> f64 {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(&track)
            .map(|r| r.ahead_of(t))
            .unwrap_or(0.0)
    }

    fn is_buffered(&self, track: TrackType, t: f64) -> bool {
        self.state
            .lock()
            .unwrap()
            .buffers
            .get(&track)
            .map(|r| r.contains(t))
            .unwrap_or(false)
    }

    fn set_duration(&self, duration: f64) -> BoxFuture<'_, Result<(), MseError>> {
        Box::pin(async move {
            self.state.lock().unwrap().duration = duration;
            Ok(())
        })
    }

    fn get_duration(&self) -> f64 {
        self.state.lock().unwrap().duration
    }

    fn reset_caption_parser(&self) {
        self.state.lock().unwrap().caption_resets += 1;
    }

    fn set_selected_closed_caption_id(&self, _id: &str) {}

    fn end_of_stream(&self) -> BoxFuture<'_, Result<(), MseError>> {
        Box::pin(async move {
            self.state.lock().unwrap().end_of_stream_calls += 1;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------------------------
// manifest builders

pub const ORIGIN: &str = "https://origin.example.com";

/// Consecutive `count` segments of `seg_dur` seconds starting at `t0`, sharing one init segment,
/// with URIs under `ORIGIN/<prefix>/`.
pub fn segment_run(prefix: &str, count: usize, seg_dur: f64, t0: f64) -> Vec<SegmentReference> {
    let init = Arc::new(InitSegmentReference::new(
        vec![url(&format!("{ORIGIN}/{prefix}/init.mp4"))],
        (0, None),
    ));
    (0..count)
        .map(|i| SegmentReference {
            start_time: t0 + i as f64 * seg_dur,
            end_time: t0 + (i + 1) as f64 * seg_dur,
            uris: vec![url(&format!("{ORIGIN}/{prefix}/seg{i}.mp4"))],
            byte_range: (0, None),
            init: Some(init.clone()),
            timestamp_offset: t0,
            append_window_start: 0.0,
            append_window_end: f64::INFINITY,
        })
        .collect()
}

/// Register fetcher routes for a segment run: `init:<prefix>` and `media:<prefix>/segN:<s>:<e>`.
pub fn register_run(fetcher: &FakeFetcher, prefix: &str, refs: &[SegmentReference]) {
    fetcher.route(
        &format!("{ORIGIN}/{prefix}/init.mp4"),
        ScriptedResponse::body(&format!("init:{prefix}")),
    );
    for (i, r) in refs.iter().enumerate() {
        fetcher.route(
            &format!("{ORIGIN}/{prefix}/seg{i}.mp4"),
            ScriptedResponse::body(&format!("media:{prefix}/seg{i}:{}:{}", r.start_time, r.end_time)),
        );
    }
}

/// Add a stream with a materialised index over `refs`.
pub fn add_stream(
    manifest: &mut Manifest,
    kind: ContentType,
    refs: Vec<SegmentReference>,
) -> StreamId {
    let (mime, codecs) = match kind {
        ContentType::Audio => ("audio/mp4", "mp4a.40.2"),
        ContentType::Text => ("text/vtt", ""),
        _ => ("video/mp4", "avc1.42c01e"),
    };
    let stream = Stream::new(kind, mime, codecs).with_index(SegmentIndex::new(refs));
    manifest.add_stream(stream)
}

pub fn add_variant(
    manifest: &mut Manifest,
    id: u32,
    audio: Option<StreamId>,
    video: Option<StreamId>,
) {
    manifest.variants.push(Variant {
        id,
        audio,
        video,
        bandwidth: 1_000_000,
        language: None,
        allowed_by_application: true,
        allowed_by_key_system: true,
    });
}

// ---------------------------------------------------------------------------------------------
// async test utilities

/// Poll `cond` under paused tokio time until it holds; panics after a generous virtual timeout.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Give background update loops a slice of virtual time without waiting for anything specific.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}
