//! Delivery tests against a scripted local HTTP receiver.
//!
//! The receiver is a bare TCP loop so the tests can observe the exact
//! bytes and headers on the wire, including attempt timing.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use fetchd_core::events::WebhookEvent;
use fetchd_core::job::{JobId, JobProgress, ProgressFrame};
use fetchd_core::ports::EventSink;
use fetchd_webhook::{SIGNATURE_HEADER, WebhookConfig, WebhookDispatcher, verify};

const SECRET: &[u8] = b"test-signing-secret";

/// One request the receiver saw.
#[derive(Debug, Clone)]
struct Received {
    at: Instant,
    signature: Option<String>,
    user_agent: Option<String>,
    body: Vec<u8>,
}

/// Serve `statuses.len()` requests, answering each with the scripted
/// status, and report every request through the channel.
async fn run_receiver(
    listener: TcpListener,
    statuses: Vec<u16>,
    tx: mpsc::UnboundedSender<Received>,
) {
    for status in statuses {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let (headers_end, header_text) = loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break (buf.len(), String::from_utf8_lossy(&buf).into_owned());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find_headers_end(&buf) {
                break (pos, String::from_utf8_lossy(&buf[..pos]).into_owned());
            }
        };

        let content_length = header_value(&header_text, "content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let body_start = (headers_end + 4).min(buf.len());
        while buf.len() < body_start + content_length {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = buf[body_start..].to_vec();

        let _ = tx.send(Received {
            at: Instant::now(),
            signature: header_value(&header_text, &SIGNATURE_HEADER.to_lowercase()),
            user_agent: header_value(&header_text, "user-agent"),
            body,
        });

        let response = format!(
            "HTTP/1.1 {status} Scripted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
        let _ = socket.write_all(response.as_bytes()).await;
        let _ = socket.shutdown().await;
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn header_value(headers: &str, name: &str) -> Option<String> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

async fn scripted_receiver(statuses: Vec<u16>) -> (String, mpsc::UnboundedReceiver<Received>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_receiver(listener, statuses, tx));
    (url, rx)
}

fn dispatcher(max_attempts: u32, retry_base: Duration) -> WebhookDispatcher {
    WebhookDispatcher::new(WebhookConfig {
        enabled: true,
        timeout: Duration::from_secs(10),
        max_attempts,
        retry_base,
        signing_secret: SECRET.to_vec(),
        progress_min_interval: Duration::from_secs(1),
        user_agent: "fetchd-test".to_string(),
    })
    .unwrap()
}

fn progress_event(job: &str, downloaded: u64, seq: u64) -> WebhookEvent {
    let mut progress = JobProgress::default();
    progress.apply(&ProgressFrame {
        downloaded_bytes: downloaded,
        total_bytes: Some(1000),
        ..ProgressFrame::default()
    });
    WebhookEvent::progress(JobId::new(job), &progress, seq)
}

#[tokio::test]
async fn retries_transient_failures_with_backoff() {
    let (url, mut rx) = scripted_receiver(vec![503, 503, 200]).await;
    let dispatcher = dispatcher(3, Duration::from_secs(1));

    let event = WebhookEvent::started(JobId::new("retry-job"), "https://ex/v.mp4");
    let started = Instant::now();
    dispatcher.deliver(&url, &event).await.unwrap();

    let mut requests = Vec::new();
    while let Ok(req) = rx.try_recv() {
        requests.push(req);
    }
    assert_eq!(requests.len(), 3, "exactly three POSTs expected");

    // Gaps approximate 1s then 2s.
    let gap1 = requests[1].at.duration_since(requests[0].at);
    let gap2 = requests[2].at.duration_since(requests[1].at);
    assert!(
        (Duration::from_millis(800)..Duration::from_millis(1400)).contains(&gap1),
        "first backoff was {gap1:?}"
    );
    assert!(
        (Duration::from_millis(1800)..Duration::from_millis(2400)).contains(&gap2),
        "second backoff was {gap2:?}"
    );
    assert!(started.elapsed() >= Duration::from_secs(3));

    // Every attempt carries a signature over the exact transmitted bytes.
    for req in &requests {
        let signature = req.signature.as_deref().expect("signature header present");
        assert!(verify(SECRET, &req.body, signature), "signature must verify");
        assert_eq!(req.user_agent.as_deref(), Some("fetchd-test"));
    }

    // All attempts transmit identical bytes.
    assert_eq!(requests[0].body, requests[1].body);
    assert_eq!(requests[1].body, requests[2].body);

    let envelope: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(envelope["event"], "download.started");
    assert_eq!(envelope["request_id"], "retry-job");
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (url, mut rx) = scripted_receiver(vec![404, 200]).await;
    let dispatcher = dispatcher(3, Duration::from_millis(50));

    let event = WebhookEvent::started(JobId::new("reject-job"), "https://ex/v.mp4");
    let err = dispatcher.deliver(&url, &event).await.unwrap_err();
    assert!(err.to_string().contains("404"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    assert_eq!(count, 1, "4xx must not be retried");
}

#[tokio::test]
async fn exhausted_attempts_give_up() {
    let (url, mut rx) = scripted_receiver(vec![503, 503]).await;
    let dispatcher = dispatcher(2, Duration::from_millis(50));

    let event = WebhookEvent::started(JobId::new("doomed-job"), "https://ex/v.mp4");
    let err = dispatcher.deliver(&url, &event).await.unwrap_err();
    assert!(err.to_string().contains("2 attempts"));

    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    assert_eq!(count, 2);
}

#[tokio::test]
async fn progress_is_throttled_per_job() {
    let (url, mut rx) = scripted_receiver(vec![200, 200, 200]).await;
    let dispatcher = dispatcher(1, Duration::from_millis(50));

    // Three rapid frames for the same job: only the first passes the gate.
    dispatcher.progress(&url, progress_event("throttled", 100, 1));
    dispatcher.progress(&url, progress_event("throttled", 200, 2));
    dispatcher.progress(&url, progress_event("throttled", 300, 3));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut bodies = Vec::new();
    while let Ok(req) = rx.try_recv() {
        bodies.push(req.body);
    }
    assert_eq!(bodies.len(), 1, "intermediates inside the window are elided");

    let envelope: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
    assert_eq!(envelope["data"]["sequence"], 1);
}

#[tokio::test]
async fn release_reopens_the_gate() {
    let (url, mut rx) = scripted_receiver(vec![200, 200]).await;
    let dispatcher = dispatcher(1, Duration::from_millis(50));

    dispatcher.progress(&url, progress_event("gated", 100, 1));
    dispatcher.release(&JobId::new("gated"));
    dispatcher.progress(&url, progress_event("gated", 200, 2));

    tokio::time::sleep(Duration::from_millis(400)).await;
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    assert_eq!(count, 2);
}
