//! Downloader argument synthesis.
//!
//! Turns a validated option set into the downloader's argument vector.
//! The binary is always invoked with an argument vector, never a shell
//! string; the option layer has already rejected format selectors with
//! shell metacharacters.

use std::path::Path;

use fetchd_core::options::{Container, DownloadOptions};

/// Progress template asking the downloader to emit our JSON-line protocol
/// on stdout.
const PROGRESS_TEMPLATE: &str = concat!(
    r#"{"status":"%(progress.status)s","#,
    r#""downloaded_bytes":%(progress.downloaded_bytes|0)d,"#,
    r#""total_bytes":%(progress.total_bytes|0)d,"#,
    r#""speed":%(progress.speed|0)f,"#,
    r#""eta":%(progress.eta|0)f,"#,
    r#""filename":"%(progress.filename|)s"}"#,
);

/// Build the argument vector for one media download.
///
/// `output_template` is the downloader-native output template the file is
/// staged under inside the working directory; final placement under the
/// storage root happens after the process exits.
#[must_use]
pub fn build_fetch_args(
    url: &str,
    options: &DownloadOptions,
    output_template: &str,
    cookies_file: Option<&Path>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--no-playlist".into(),
        "--newline".into(),
        "--progress-template".into(),
        PROGRESS_TEMPLATE.into(),
        "--write-info-json".into(),
        "-f".into(),
        options.effective_format().to_string(),
        "-o".into(),
        output_template.to_string(),
    ];

    match options.container {
        Container::Best => {}
        container if container.is_audio() => {
            args.push("-x".into());
            args.push("--audio-format".into());
            args.push(container.as_str().into());
        }
        container => {
            args.push("--merge-output-format".into());
            args.push(container.as_str().into());
        }
    }

    if options.quality.is_audio_only() && !options.container.is_audio() {
        // Audio preset with a non-audio container still extracts audio.
        args.push("-x".into());
    }

    if options.subtitles.is_enabled() {
        if !options.subtitles.languages.is_empty() {
            args.push("--write-subs".into());
            args.push("--sub-langs".into());
            args.push(options.subtitles.languages.join(","));
        }
        if options.subtitles.auto_generated {
            args.push("--write-auto-subs".into());
        }
        if options.subtitles.embed {
            args.push("--embed-subs".into());
        }
    }

    if options.embed_thumbnail {
        args.push("--embed-thumbnail".into());
    }
    if options.embed_metadata {
        args.push("--embed-metadata".into());
    }

    if let Some(cookies) = cookies_file {
        args.push("--cookies".into());
        args.push(cookies.display().to_string());
    }

    args.push(url.to_string());
    args
}

/// Build the argument vector for a metadata-only listing probe.
#[must_use]
pub fn build_probe_args(url: &str) -> Vec<String> {
    vec![
        "--dump-json".into(),
        "--flat-playlist".into(),
        "--skip-download".into(),
        "--no-warnings".into(),
        url.to_string(),
    ]
}
