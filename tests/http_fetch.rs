// Behaviour of the reqwest-backed fetcher against a local HTTP origin: byte ranges, retry of
// transient failures, hard failures, and O(1) aborts of in-flight transfers.
//
// To run tests while enabling printing to stdout/stderr
//
//    cargo test --test http_fetch -- --show-output

#![cfg(feature = "http")]

pub mod common;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use common::setup_logging;
use dash_mse::fetch::{BandwidthEstimator, FetchOutcome, Fetcher, HttpFetcher, RequestSpec};
use dash_mse::{MseError, RetryParameters, TrackType};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fetcher() -> (HttpFetcher, Arc<BandwidthEstimator>) {
    let estimator = Arc::new(BandwidthEstimator::default());
    (HttpFetcher::new(estimator.clone()).unwrap(), estimator)
}

fn media_url(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{addr}{path}")).unwrap()
}

fn quick_retries() -> RetryParameters {
    RetryParameters {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
        backoff_factor: 2.0,
        fuzz_factor: 0.5,
        timeout: Duration::from_secs(5),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_byte_range_request() -> anyhow::Result<()> {
    setup_logging();
    let app = Router::new().route(
        "/media.mp4",
        get(|headers: HeaderMap| async move {
            let body: Vec<u8> = (0u8..=255).collect();
            match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
                Some(range) => {
                    let spec = range.trim_start_matches("bytes=");
                    let (start, end) = spec.split_once('-').unwrap();
                    let start: usize = start.parse().unwrap();
                    let end: usize = end.parse().unwrap();
                    (StatusCode::PARTIAL_CONTENT, body[start..=end].to_vec())
                }
                None => (StatusCode::OK, body),
            }
        }),
    );
    let addr = serve(app).await;
    let (fetcher, _) = fetcher();
    let spec = RequestSpec::segment(
        vec![media_url(addr, "/media.mp4")],
        (10, Some(19)),
        quick_retries(),
        TrackType::Video,
        false,
    );
    match fetcher.request(spec).wait().await? {
        FetchOutcome::Complete(r) => {
            assert_eq!(&r.bytes[..], &(10u8..=19).collect::<Vec<u8>>()[..]);
        }
        FetchOutcome::Aborted => panic!("not aborted"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_status_is_retried() {
    setup_logging();
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/flaky.mp4",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::SERVICE_UNAVAILABLE, Vec::new())
                } else {
                    (StatusCode::OK, b"payload".to_vec())
                }
            }),
        )
        .with_state(hits.clone());
    let addr = serve(app).await;
    let (fetcher, estimator) = fetcher();
    let spec = RequestSpec::segment(
        vec![media_url(addr, "/flaky.mp4")],
        (0, None),
        quick_retries(),
        TrackType::Video,
        false,
    );
    match fetcher.request(spec).wait().await.unwrap() {
        FetchOutcome::Complete(r) => assert_eq!(&r.bytes[..], b"payload"),
        FetchOutcome::Aborted => panic!("not aborted"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    // the successful transfer fed the bandwidth estimator
    assert_ne!(estimator.estimate_bps(), 500_000.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hard_status_is_not_retried() {
    setup_logging();
    let hits = Arc::new(AtomicU32::new(0));
    let app = Router::new()
        .route(
            "/gone.mp4",
            get(|State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::NOT_FOUND
            }),
        )
        .with_state(hits.clone());
    let addr = serve(app).await;
    let (fetcher, _) = fetcher();
    let spec = RequestSpec::segment(
        vec![media_url(addr, "/gone.mp4")],
        (0, None),
        quick_retries(),
        TrackType::Video,
        false,
    );
    match fetcher.request(spec).wait().await {
        Err(MseError::BadHttpStatus { status: 404, .. }) => {}
        other => panic!("expected 404 error, got {other:?}"),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_resolves_in_flight_transfer() {
    setup_logging();
    let app = Router::new().route(
        "/slow.mp4",
        get(|| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            (StatusCode::OK, b"never".to_vec())
        }),
    );
    let addr = serve(app).await;
    let (fetcher, _) = fetcher();
    let spec = RequestSpec::segment(
        vec![media_url(addr, "/slow.mp4")],
        (0, None),
        quick_retries(),
        TrackType::Video,
        false,
    );
    let pending = fetcher.request(spec);
    let handle = pending.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    });
    let started = std::time::Instant::now();
    match pending.wait().await.unwrap() {
        FetchOutcome::Aborted => {}
        FetchOutcome::Complete(_) => panic!("expected abort"),
    }
    assert!(started.elapsed() < Duration::from_secs(5), "abort should resolve promptly");
}
