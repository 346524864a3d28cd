//! Shared test doubles: a scripted downloader and a recording event sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fetchd_core::error::ServiceError;
use fetchd_core::events::{EventData, EventKind, WebhookEvent};
use fetchd_core::job::ProgressFrame;
use fetchd_core::listing::RemoteEntry;
use fetchd_core::ports::{Downloader, EventSink, FetchRequest, FetchedMedia, ProgressSink};

/// What the scripted driver does for one URL.
#[derive(Clone)]
pub enum Script {
    /// Emit the progress steps, write a file of `size` bytes, succeed.
    Success {
        steps: Vec<(u64, u64)>,
        step_delay: Duration,
        size: u64,
        title: Option<String>,
    },
    /// Sleep, then fail with the given error.
    Fail { after: Duration, error: ServiceError },
    /// Sleep for a long time (cancellable), then succeed with a tiny file.
    Sleep { duration: Duration },
}

impl Script {
    pub fn quick_success(size: u64) -> Self {
        Self::Success {
            steps: vec![(0, size), (size / 2, size), (size, size)],
            step_delay: Duration::from_millis(20),
            size,
            title: Some("Scripted Video".to_string()),
        }
    }
}

/// A downloader that follows per-URL scripts and records its concurrency.
pub struct ScriptedDriver {
    scripts: Mutex<HashMap<String, Script>>,
    listing: Mutex<Vec<RemoteEntry>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            listing: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, url: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), script);
    }

    pub fn set_listing(&self, entries: Vec<RemoteEntry>) {
        *self.listing.lock().unwrap() = entries;
    }

    /// Highest number of simultaneously running fetches observed.
    pub fn max_concurrent_seen(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Downloader for ScriptedDriver {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
    ) -> Result<FetchedMedia, ServiceError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| Script::quick_success(1024));

        self.enter();
        let result = run_script(script, &request, &progress).await;
        self.exit();
        result
    }

    async fn probe(&self, _url: &str) -> Result<Vec<RemoteEntry>, ServiceError> {
        let listing = self.listing.lock().unwrap().clone();
        if listing.is_empty() {
            return Err(ServiceError::metadata("no scripted listing"));
        }
        Ok(listing)
    }
}

async fn run_script(
    script: Script,
    request: &FetchRequest,
    progress: &ProgressSink,
) -> Result<FetchedMedia, ServiceError> {
    match script {
        Script::Success {
            steps,
            step_delay,
            size,
            title,
        } => {
            for (downloaded, total) in steps {
                tokio::select! {
                    () = request.cancel.cancelled() => return Err(ServiceError::Cancelled),
                    () = tokio::time::sleep(step_delay) => {}
                }
                progress.as_ref()(ProgressFrame {
                    downloaded_bytes: downloaded,
                    total_bytes: Some(total),
                    speed_bps: Some(1_000_000.0),
                    eta_seconds: Some(1.0),
                    filename: None,
                })?;
            }

            let path = request.workdir.join("media.mp4");
            #[allow(clippy::cast_possible_truncation)]
            std::fs::write(&path, vec![0u8; size as usize])
                .map_err(|e| ServiceError::storage(e.to_string()))?;
            Ok(FetchedMedia {
                path,
                filename: "media.mp4".to_string(),
                size_bytes: size,
                title,
                uploader: Some("scripted".to_string()),
                duration_secs: Some(12.0),
            })
        }

        Script::Fail { after, error } => {
            tokio::select! {
                () = request.cancel.cancelled() => Err(ServiceError::Cancelled),
                () = tokio::time::sleep(after) => Err(error),
            }
        }

        Script::Sleep { duration } => {
            tokio::select! {
                () = request.cancel.cancelled() => Err(ServiceError::Cancelled),
                () = tokio::time::sleep(duration) => {
                    let path = request.workdir.join("media.mp4");
                    std::fs::write(&path, b"slow")
                        .map_err(|e| ServiceError::storage(e.to_string()))?;
                    Ok(FetchedMedia {
                        path,
                        filename: "media.mp4".to_string(),
                        size_bytes: 4,
                        title: None,
                        uploader: None,
                        duration_secs: None,
                    })
                }
            }
        }
    }
}

/// One recorded event.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub job_id: String,
    pub kind: EventKind,
    pub error_kind: Option<String>,
}

/// An event sink that remembers everything it saw.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, job_id: &str) -> Vec<Recorded> {
        self.events()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }

    fn record(&self, event: &WebhookEvent) {
        let error_kind = match &event.data {
            EventData::Failed { error_kind, .. } => Some(error_kind.clone()),
            _ => None,
        };
        self.events.lock().unwrap().push(Recorded {
            job_id: event.job_id.as_str().to_string(),
            kind: event.kind,
            error_kind,
        });
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn lifecycle(&self, _url: &str, event: WebhookEvent) {
        self.record(&event);
    }

    fn progress(&self, _url: &str, event: WebhookEvent) {
        self.record(&event);
    }

    fn release(&self, _job_id: &fetchd_core::job::JobId) {}
}

/// Poll until `check` passes or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
