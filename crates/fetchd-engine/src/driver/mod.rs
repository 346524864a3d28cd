//! Downloader driver.
//!
//! Spawns the external downloader with an argument vector, streams its
//! JSON-line progress protocol into the caller's sink, enforces the
//! overall and stall deadlines, and classifies failures into the service
//! error taxonomy.

mod args;
mod classify;
mod protocol;
mod terminate;

pub use args::{build_fetch_args, build_probe_args};
pub use classify::classify_failure;
pub use protocol::{ProtocolError, ProtocolEvent, parse_line};

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};

use fetchd_core::config::ServiceConfig;
use fetchd_core::error::ServiceError;
use fetchd_core::job::LogLevel;
use fetchd_core::listing::RemoteEntry;
use fetchd_core::ports::{Downloader, FetchRequest, FetchedMedia, ProgressSink};

/// Consecutive progress-sink failures tolerated before the job is failed.
const MAX_SINK_FAILURES: u32 = 3;

/// Staging name inside the working directory. The real name is assigned
/// at placement time, after metadata is known.
const STAGE_TEMPLATE: &str = "media.%(ext)s";

/// Sidecar extensions that do not count as the produced media file.
const SIDECAR_EXTENSIONS: &[&str] = &["json", "srt", "vtt", "part", "ytdl"];

/// Driver for a yt-dlp-compatible downloader binary.
pub struct YtDlpDriver {
    bin: PathBuf,
    probe_timeout: std::time::Duration,
}

impl YtDlpDriver {
    /// Create a driver from the service configuration.
    #[must_use]
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            bin: config.downloader_bin.clone(),
            probe_timeout: std::time::Duration::from_secs(120),
        }
    }
}

#[async_trait]
impl Downloader for YtDlpDriver {
    async fn fetch(
        &self,
        request: FetchRequest,
        progress: ProgressSink,
    ) -> Result<FetchedMedia, ServiceError> {
        let stage = request.workdir.join(STAGE_TEMPLATE);
        let argv = build_fetch_args(
            &request.url,
            &request.options,
            &stage.to_string_lossy(),
            request.cookies_file.as_deref(),
        );

        tracing::debug!(
            target: "fetchd.driver",
            id = %request.job_id,
            bin = %self.bin.display(),
            "Spawning downloader"
        );

        let mut child = Command::new(&self.bin)
            .args(&argv)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ServiceError::download(format!("cannot spawn {}: {e}", self.bin.display()))
            })?;

        let outcome = drive_child(&mut child, &request, &progress).await;

        match outcome {
            StreamOutcome::Finished => {
                let (status, stderr) = wait_and_collect(child).await?;
                if !status.success() {
                    let error = classify_failure(&stderr, status.code());
                    log_stderr(&request, &stderr);
                    return Err(error);
                }
                collect_media(&request.workdir)
            }
            StreamOutcome::ProtocolError(message) => {
                let _ = terminate::terminate_child(child).await;
                Err(ServiceError::download(message))
            }
            StreamOutcome::CallbackStorm => {
                let _ = terminate::terminate_child(child).await;
                Err(ServiceError::download(
                    "progress callback storm: sink failed repeatedly",
                ))
            }
            StreamOutcome::Cancelled => {
                let _ = terminate::terminate_child(child).await;
                Err(ServiceError::Cancelled)
            }
            StreamOutcome::OverallTimeout => {
                let _ = terminate::terminate_child(child).await;
                Err(ServiceError::timeout(format!(
                    "job exceeded {}s wall clock",
                    request.timeout.as_secs()
                )))
            }
            StreamOutcome::Stalled => {
                let _ = terminate::terminate_child(child).await;
                Err(ServiceError::timeout(format!(
                    "no progress for {}s",
                    request.stall_timeout.as_secs()
                )))
            }
            StreamOutcome::Io(e) => {
                let _ = terminate::terminate_child(child).await;
                Err(ServiceError::download(format!("stdout stream failed: {e}")))
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<Vec<RemoteEntry>, ServiceError> {
        let output = tokio::time::timeout(
            self.probe_timeout,
            Command::new(&self.bin)
                .args(build_probe_args(url))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ServiceError::timeout("listing probe timed out"))?
        .map_err(|e| ServiceError::download(format!("cannot spawn {}: {e}", self.bin.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, output.status.code()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let entries: Vec<RemoteEntry> = stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(parse_listing_line)
            .collect();

        if entries.is_empty() {
            return Err(ServiceError::metadata(format!(
                "listing for {url} contained no playable entries"
            )));
        }
        Ok(entries)
    }
}

/// Why the stdout stream loop ended.
enum StreamOutcome {
    Finished,
    ProtocolError(String),
    CallbackStorm,
    Cancelled,
    OverallTimeout,
    Stalled,
    Io(std::io::Error),
}

/// Pump the protocol stream until EOF or an abort condition.
async fn drive_child(
    child: &mut Child,
    request: &FetchRequest,
    progress: &ProgressSink,
) -> StreamOutcome {
    let Some(stdout) = child.stdout.take() else {
        return StreamOutcome::Io(std::io::Error::other("missing stdout"));
    };
    let mut lines = BufReader::new(stdout).lines();

    let overall_deadline = tokio::time::Instant::now() + request.timeout;
    let mut stall_deadline = tokio::time::Instant::now() + request.stall_timeout;
    let mut sink_failures = 0u32;

    loop {
        tokio::select! {
            biased;

            () = request.cancel.cancelled() => return StreamOutcome::Cancelled,

            () = tokio::time::sleep_until(overall_deadline) => {
                return StreamOutcome::OverallTimeout;
            }

            () = tokio::time::sleep_until(stall_deadline) => {
                return StreamOutcome::Stalled;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => return StreamOutcome::Finished,
                    Err(e) => return StreamOutcome::Io(e),
                };
                if line.trim().is_empty() {
                    continue;
                }

                match parse_line(&line) {
                    Ok(ProtocolEvent::Downloading(frame)) => {
                        stall_deadline = tokio::time::Instant::now() + request.stall_timeout;
                        match progress.as_ref()(frame) {
                            Ok(()) => sink_failures = 0,
                            Err(e) => {
                                sink_failures += 1;
                                tracing::warn!(
                                    target: "fetchd.driver",
                                    id = %request.job_id,
                                    failures = sink_failures,
                                    error = %e,
                                    "Progress sink failed"
                                );
                                if sink_failures >= MAX_SINK_FAILURES {
                                    return StreamOutcome::CallbackStorm;
                                }
                            }
                        }
                    }
                    Ok(ProtocolEvent::Finished { filename, .. }) => {
                        stall_deadline = tokio::time::Instant::now() + request.stall_timeout;
                        if let Some(name) = filename {
                            request.log.as_ref()(LogLevel::Info, format!("finished writing {name}"));
                        }
                    }
                    Ok(ProtocolEvent::Error { message }) => {
                        return StreamOutcome::ProtocolError(message);
                    }
                    Err(_) => {
                        // Plain downloader chatter; keep it in the job log.
                        request.log.as_ref()(LogLevel::Debug, line);
                    }
                }
            }
        }
    }
}

/// Wait for exit and collect stderr.
async fn wait_and_collect(
    mut child: Child,
) -> Result<(std::process::ExitStatus, String), ServiceError> {
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut buf).await;
        }
        buf
    });

    let status = child
        .wait()
        .await
        .map_err(|e| ServiceError::download(format!("wait failed: {e}")))?;
    let stderr_buf = stderr_task.await.unwrap_or_default();
    Ok((status, String::from_utf8_lossy(&stderr_buf).into_owned()))
}

fn log_stderr(request: &FetchRequest, stderr: &str) {
    for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
        request.log.as_ref()(LogLevel::Warning, line.to_string());
    }
}

/// Extracted metadata sidecar written by `--write-info-json`.
#[derive(Deserialize, Default)]
struct InfoSidecar {
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
}

/// Find the single produced media file and pair it with its metadata.
///
/// Exit code zero with exactly one produced file is success; anything
/// else is a download error.
fn collect_media(workdir: &Path) -> Result<FetchedMedia, ServiceError> {
    let mut media_files = Vec::new();
    let mut sidecar: Option<PathBuf> = None;

    let entries = std::fs::read_dir(workdir)
        .map_err(|e| ServiceError::storage(format!("cannot read workdir: {e}")))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".info.json"))
        {
            sidecar = Some(path);
        } else if !SIDECAR_EXTENSIONS.contains(&ext.as_str()) {
            media_files.push(path);
        }
    }

    if media_files.len() != 1 {
        return Err(ServiceError::download(format!(
            "expected exactly one produced file, found {}",
            media_files.len()
        )));
    }
    let path = media_files.remove(0);

    let info = sidecar
        .as_deref()
        .and_then(|p| std::fs::read(p).ok())
        .and_then(|bytes| serde_json::from_slice::<InfoSidecar>(&bytes).ok())
        .unwrap_or_default();
    if let Some(sidecar) = sidecar {
        let _ = std::fs::remove_file(sidecar);
    }

    let size_bytes = std::fs::metadata(&path)
        .map_err(|e| ServiceError::storage(format!("cannot stat artifact: {e}")))?
        .len();
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("media")
        .to_string();

    Ok(FetchedMedia {
        path,
        filename,
        size_bytes,
        title: info.title,
        uploader: info.uploader,
        duration_secs: info.duration,
    })
}

/// Flat-listing JSON line from the probe.
#[derive(Deserialize)]
struct RawListingEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    view_count: Option<u64>,
    upload_date: Option<String>,
}

fn parse_listing_line(line: &str) -> Option<RemoteEntry> {
    let raw: RawListingEntry = serde_json::from_str(line).ok()?;
    let url = raw.url.or(raw.webpage_url)?;
    Some(RemoteEntry {
        id: raw.id,
        title: raw.title,
        url,
        duration_secs: raw.duration,
        view_count: raw.view_count,
        upload_date: raw.upload_date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_lines_prefer_url_over_webpage_url() {
        let entry = parse_listing_line(
            r#"{"id": "abc", "title": "T", "url": "https://a", "webpage_url": "https://b"}"#,
        )
        .unwrap();
        assert_eq!(entry.url, "https://a");

        let entry =
            parse_listing_line(r#"{"id": "abc", "webpage_url": "https://b"}"#).unwrap();
        assert_eq!(entry.url, "https://b");

        assert!(parse_listing_line(r#"{"id": "abc"}"#).is_none());
        assert!(parse_listing_line("not json").is_none());
    }

    #[test]
    fn collect_media_requires_exactly_one_file() {
        let dir = tempfile::tempdir().unwrap();

        // No files at all.
        assert!(collect_media(dir.path()).is_err());

        // One media file plus ignorable sidecars.
        std::fs::write(dir.path().join("media.mp4"), vec![0u8; 64]).unwrap();
        std::fs::write(
            dir.path().join("media.info.json"),
            br#"{"title": "T", "uploader": "U", "duration": 12.5}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("media.en.srt"), b"1").unwrap();

        let media = collect_media(dir.path()).unwrap();
        assert_eq!(media.filename, "media.mp4");
        assert_eq!(media.size_bytes, 64);
        assert_eq!(media.title.as_deref(), Some("T"));
        assert_eq!(media.uploader.as_deref(), Some("U"));
        assert_eq!(media.duration_secs, Some(12.5));
        // The sidecar is consumed.
        assert!(!dir.path().join("media.info.json").exists());

        // A second media file makes the outcome ambiguous.
        std::fs::write(dir.path().join("extra.mkv"), b"x").unwrap();
        assert!(collect_media(dir.path()).is_err());
    }
}
