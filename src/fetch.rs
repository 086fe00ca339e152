//! Network plumbing: typed requests, abortable in-flight transfers, retry policy and bandwidth
//! estimation.
//
// The engine only sees the [Fetcher] trait and the [PendingRequest] it returns. A pending request
// exposes a cheap cloneable [RequestHandle] carrying an abort latch and a live estimate of the
// bytes still outstanding; `abort()` is O(1) and resolves the transfer with
// [FetchOutcome::Aborted] rather than an error, so cancellation never travels through error
// handling. Aborted transfers contribute nothing to the bandwidth estimate.

use crate::{MseError, RetryParameters, TrackType};
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use url::Url;

/// What a request is for; lets fetcher implementations shape headers, priorities and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    Manifest,
    Mpd,
    MpdPatch,
    Segment,
    InitSegment,
    License,
    Key,
    Timing,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_type: RequestType,
    /// Track the payload is destined for, when it is media.
    pub track: Option<TrackType>,
}

/// One network request. `uris` are alternatives for the same resource, tried in order.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub context: RequestContext,
    pub uris: Vec<Url>,
    /// `(first_byte, last_byte)`; `(0, None)` requests the whole resource.
    pub byte_range: (u64, Option<u64>),
    pub retry: RetryParameters,
}

impl RequestSpec {
    pub fn segment(uris: Vec<Url>, byte_range: (u64, Option<u64>), retry: RetryParameters,
                   track: TrackType, is_init: bool) -> Self {
        RequestSpec {
            context: RequestContext {
                request_type: if is_init { RequestType::InitSegment } else { RequestType::Segment },
                track: Some(track),
            },
            uris,
            byte_range,
            retry,
        }
    }

    /// Known total size of the requested range, if the range is bounded.
    pub fn known_size(&self) -> Option<u64> {
        self.byte_range.1.map(|end| end + 1 - self.byte_range.0)
    }
}

/// A completed transfer. `uri` is the final URI after redirects; relative references in the
/// payload must resolve against it.
#[derive(Debug, Clone)]
pub struct Response {
    pub uri: Url,
    pub bytes: Bytes,
}

/// How a pending request resolved. Aborting is a normal completion, not an error.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Complete(Response),
    Aborted,
}

#[derive(Debug, Default)]
struct AbortLatch {
    flag: AtomicBool,
    notify: Notify,
}

/// Cloneable view of an in-flight request: lets the engine abort it and read how many bytes are
/// still outstanding while the transfer task owns the actual I/O.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    latch: Arc<AbortLatch>,
    bytes_remaining: Arc<AtomicU64>,
}

impl RequestHandle {
    fn new(initial_bytes: u64) -> Self {
        RequestHandle {
            latch: Arc::new(AbortLatch::default()),
            bytes_remaining: Arc::new(AtomicU64::new(initial_bytes)),
        }
    }

    /// Request cancellation. Completes in O(1); the transfer resolves with
    /// [FetchOutcome::Aborted] shortly after.
    pub fn abort(&self) {
        self.latch.flag.store(true, Ordering::Release);
        self.latch.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.latch.flag.load(Ordering::Acquire)
    }

    /// Estimated bytes left to transfer. Updated live by the transfer task.
    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining.load(Ordering::Acquire)
    }

    pub fn set_bytes_remaining(&self, n: u64) {
        self.bytes_remaining.store(n, Ordering::Release)
    }

    async fn aborted(&self) {
        while !self.is_aborted() {
            self.latch.notify.notified().await;
        }
    }
}

/// An in-flight request. Await it with [wait](Self::wait); abort it through the handle.
pub struct PendingRequest {
    handle: RequestHandle,
    rx: oneshot::Receiver<Result<FetchOutcome, MseError>>,
}

impl PendingRequest {
    /// Drive `f` on a background task, racing it against the abort latch. The future is dropped
    /// the moment the request is aborted.
    pub fn spawn<F, Fut>(initial_bytes: u64, f: F) -> PendingRequest
    where
        F: FnOnce(RequestHandle) -> Fut,
        Fut: Future<Output = Result<Response, MseError>> + Send + 'static,
    {
        let handle = RequestHandle::new(initial_bytes);
        let (tx, rx) = oneshot::channel();
        let task_handle = handle.clone();
        let fut = f(handle.clone());
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task_handle.aborted() => Ok(FetchOutcome::Aborted),
                r = fut => r.map(FetchOutcome::Complete),
            };
            let _ = tx.send(outcome);
        });
        PendingRequest { handle, rx }
    }

    /// A request that resolves immediately; useful for fakes.
    pub fn ready(response: Response) -> PendingRequest {
        PendingRequest::spawn(0, |_| async move { Ok(response) })
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle.clone()
    }

    pub async fn wait(self) -> Result<FetchOutcome, MseError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // the transfer task disappeared (runtime shutdown); treat as abort
            Err(_) => Ok(FetchOutcome::Aborted),
        }
    }
}

/// Abstract network engine.
pub trait Fetcher: Send + Sync + 'static {
    fn request(&self, spec: RequestSpec) -> PendingRequest;
}

const DEFAULT_BANDWIDTH_BPS: f64 = 500_000.0;
const EWMA_WEIGHT: f64 = 0.85;

/// Exponentially-weighted moving average of observed throughput, shared read-only with the
/// engine (which uses it for switch-abort decisions and unknown-size estimates).
#[derive(Debug)]
pub struct BandwidthEstimator {
    state: Mutex<(f64, u64)>, // (bps estimate, sample count)
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        BandwidthEstimator { state: Mutex::new((DEFAULT_BANDWIDTH_BPS, 0)) }
    }
}

impl BandwidthEstimator {
    /// Record a completed transfer. Aborted transfers must not be reported.
    pub fn sample(&self, duration_secs: f64, bytes: u64) {
        if duration_secs <= 0.0 || bytes == 0 {
            return;
        }
        let bps = bytes as f64 * 8.0 / duration_secs;
        let mut state = self.state.lock().unwrap();
        state.0 = if state.1 == 0 { bps } else { EWMA_WEIGHT * state.0 + (1.0 - EWMA_WEIGHT) * bps };
        state.1 += 1;
        debug!("bandwidth sample {bps:.0} bps -> estimate {:.0} bps", state.0);
    }

    /// Current estimate in bits per second.
    pub fn estimate_bps(&self) -> f64 {
        self.state.lock().unwrap().0
    }
}

/// Fuzz a retry delay to `delay * (1 ± fuzz_factor * r)`, spreading simultaneous retries apart.
pub(crate) fn fuzzed_delay(delay: std::time::Duration, fuzz_factor: f64) -> std::time::Duration {
    use rand::Rng;
    let r: f64 = rand::thread_rng().gen_range(-1.0..1.0);
    delay.mul_f64((1.0 + fuzz_factor * r).max(0.0))
}

#[cfg(feature = "http")]
pub use http_fetcher::HttpFetcher;

#[cfg(feature = "http")]
mod http_fetcher {
    use super::*;
    use reqwest::header::RANGE;
    use reqwest::StatusCode;
    use tokio::time::Instant;

    /// The production [Fetcher], backed by a reqwest `Client`.
    pub struct HttpFetcher {
        client: reqwest::Client,
        estimator: Arc<BandwidthEstimator>,
    }

    struct AttemptError {
        error: MseError,
        transient: bool,
    }

    impl HttpFetcher {
        pub fn new(estimator: Arc<BandwidthEstimator>) -> Result<Self, MseError> {
            let client = reqwest::Client::builder()
                .build()
                .map_err(|e| MseError::Http(format!("building HTTP client: {e}")))?;
            Ok(HttpFetcher { client, estimator })
        }

        pub fn with_client(client: reqwest::Client, estimator: Arc<BandwidthEstimator>) -> Self {
            HttpFetcher { client, estimator }
        }
    }

    fn transient_status(status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::SERVICE_UNAVAILABLE
            || status == StatusCode::GATEWAY_TIMEOUT
    }

    fn network_error(context: &str, e: reqwest::Error) -> AttemptError {
        if e.is_timeout() {
            AttemptError { error: MseError::Timeout(format!("{context}: {e}")), transient: true }
        } else if e.is_connect() {
            AttemptError { error: MseError::Http(format!("{context}: {e}")), transient: true }
        } else {
            AttemptError { error: MseError::Http(format!("{context}: {e}")), transient: false }
        }
    }

    async fn fetch_one(
        client: &reqwest::Client,
        spec: &RequestSpec,
        uri: &Url,
        handle: &RequestHandle,
    ) -> Result<Response, AttemptError> {
        let context = format!("{:?} {uri}", spec.context.request_type);
        let mut req = client.get(uri.clone());
        match spec.byte_range {
            (0, None) => {}
            (start, None) => {
                req = req.header(RANGE, format!("bytes={start}-"));
            }
            (start, Some(end)) => {
                req = req.header(RANGE, format!("bytes={start}-{end}"));
            }
        }
        let resp = req.send().await.map_err(|e| network_error(&context, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AttemptError {
                error: MseError::BadHttpStatus { status: status.as_u16(), context },
                transient: transient_status(status),
            });
        }
        let final_uri = resp.url().clone();
        if let Some(len) = resp.content_length() {
            handle.set_bytes_remaining(len);
        }
        let mut body = Vec::with_capacity(resp.content_length().unwrap_or(0) as usize);
        let mut resp = resp;
        while let Some(chunk) = resp.chunk().await.map_err(|e| network_error(&context, e))? {
            body.extend_from_slice(&chunk);
            let remaining = handle.bytes_remaining().saturating_sub(chunk.len() as u64);
            handle.set_bytes_remaining(remaining);
        }
        handle.set_bytes_remaining(0);
        Ok(Response { uri: final_uri, bytes: Bytes::from(body) })
    }

    // One attempt tries each alternative URI in order; the attempt fails with the last error.
    async fn attempt(
        client: &reqwest::Client,
        spec: &RequestSpec,
        handle: &RequestHandle,
    ) -> Result<Response, AttemptError> {
        let mut last = None;
        for uri in &spec.uris {
            match fetch_one(client, spec, uri, handle).await {
                Ok(r) => return Ok(r),
                Err(e) => {
                    warn!("fetch of {uri} failed: {}", e.error);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(AttemptError {
            error: MseError::Http(String::from("request with no URIs")),
            transient: false,
        }))
    }

    impl Fetcher for HttpFetcher {
        fn request(&self, spec: RequestSpec) -> PendingRequest {
            let client = self.client.clone();
            let estimator = self.estimator.clone();
            let initial = spec.known_size().unwrap_or(0);
            PendingRequest::spawn(initial, move |handle| async move {
                let retry = spec.retry.clone();
                let mut delay = retry.base_delay;
                let started = Instant::now();
                let mut attempt_no = 0;
                loop {
                    attempt_no += 1;
                    let r = tokio::time::timeout(retry.timeout, attempt(&client, &spec, &handle)).await;
                    let err = match r {
                        Ok(Ok(response)) => {
                            estimator.sample(started.elapsed().as_secs_f64(),
                                             response.bytes.len() as u64);
                            return Ok(response);
                        }
                        Ok(Err(e)) => e,
                        Err(_) => AttemptError {
                            error: MseError::Timeout(format!(
                                "{:?} attempt {attempt_no} exceeded {:?}",
                                spec.context.request_type, retry.timeout)),
                            transient: true,
                        },
                    };
                    if attempt_no >= retry.max_attempts || !err.transient {
                        return Err(err.error);
                    }
                    let pause = fuzzed_delay(delay, retry.fuzz_factor);
                    warn!("attempt {attempt_no} failed ({}), retrying in {pause:?}", err.error);
                    tokio::time::sleep(pause).await;
                    delay = delay.mul_f64(retry.backoff_factor);
                }
            })
        }
    }
}
