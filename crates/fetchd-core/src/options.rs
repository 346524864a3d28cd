//! Typed download option set with constructor validation.
//!
//! The request layer hands the core an untrusted option set; everything
//! that could smuggle shell syntax or nonsense values is rejected here,
//! before any component acts on it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ServiceError;

/// Characters that disqualify a custom format string.
///
/// The downloader is always invoked with an argument vector, but format
/// selectors are still kept free of shell metacharacters so they can never
/// become dangerous if a deployment wraps the binary in a script.
pub const FORBIDDEN_FORMAT_CHARS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>'];

/// Quality preset for format selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    /// Best available video+audio.
    #[default]
    Best,
    /// Capped at 2160p.
    #[serde(rename = "2160p")]
    P2160,
    /// Capped at 1080p.
    #[serde(rename = "1080p")]
    P1080,
    /// Capped at 720p.
    #[serde(rename = "720p")]
    P720,
    /// Capped at 480p.
    #[serde(rename = "480p")]
    P480,
    /// Capped at 360p.
    #[serde(rename = "360p")]
    P360,
    /// Audio only.
    Audio,
}

impl QualityPreset {
    /// The canonical string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::P2160 => "2160p",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
            Self::Audio => "audio",
        }
    }

    /// The downloader format selector this preset maps to.
    ///
    /// The mapping is deterministic; two jobs with the same preset always
    /// hand the downloader the same selector.
    #[must_use]
    pub const fn format_selector(&self) -> &'static str {
        match self {
            Self::Best => "bestvideo+bestaudio/best",
            Self::P2160 => "bestvideo[height<=2160]+bestaudio/best[height<=2160]",
            Self::P1080 => "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
            Self::P720 => "bestvideo[height<=720]+bestaudio/best[height<=720]",
            Self::P480 => "bestvideo[height<=480]+bestaudio/best[height<=480]",
            Self::P360 => "bestvideo[height<=360]+bestaudio/best[height<=360]",
            Self::Audio => "bestaudio/best",
        }
    }

    /// Whether this preset produces audio-only output.
    #[must_use]
    pub const fn is_audio_only(&self) -> bool {
        matches!(self, Self::Audio)
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityPreset {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(Self::Best),
            "2160p" | "4k" => Ok(Self::P2160),
            "1080p" => Ok(Self::P1080),
            "720p" => Ok(Self::P720),
            "480p" => Ok(Self::P480),
            "360p" => Ok(Self::P360),
            "audio" => Ok(Self::Audio),
            other => Err(ServiceError::validation(format!(
                "unknown quality preset '{other}'"
            ))),
        }
    }
}

/// Container/codec target for the produced file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    /// Let the downloader keep whatever it fetched.
    #[default]
    Best,
    Mp4,
    Mkv,
    Webm,
    Mp3,
    M4a,
    Opus,
}

impl Container {
    /// The canonical string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Webm => "webm",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Opus => "opus",
        }
    }

    /// Whether this container only carries audio.
    #[must_use]
    pub const fn is_audio(&self) -> bool {
        matches!(self, Self::Mp3 | Self::M4a | Self::Opus)
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subtitle handling for a job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitlePolicy {
    /// Languages to fetch (downloader language codes). Empty = none.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Also accept auto-generated subtitles.
    #[serde(default)]
    pub auto_generated: bool,
    /// Embed fetched subtitles into the media file.
    #[serde(default)]
    pub embed: bool,
}

impl SubtitlePolicy {
    /// Whether any subtitle work is requested.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.languages.is_empty() || self.auto_generated
    }
}

/// The validated option set attached to every job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Quality preset.
    pub quality: QualityPreset,
    /// Target container.
    pub container: Container,
    /// Raw downloader format selector, overriding `quality` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_format: Option<String>,
    /// Subtitle policy.
    pub subtitles: SubtitlePolicy,
    /// Embed the thumbnail into the media file.
    pub embed_thumbnail: bool,
    /// Embed extracted metadata into the media file.
    pub embed_metadata: bool,
    /// Output path template, relative to the storage root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_template: Option<String>,
    /// Per-job wall-clock timeout override, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Webhook URL for lifecycle/progress events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Reference to a stored cookie jar (managed outside the core).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie_id: Option<String>,
}

impl DownloadOptions {
    /// Validate the option set, consuming and returning it.
    ///
    /// Rejections are `ValidationFailed`: custom format selectors carrying
    /// shell metacharacters, zero timeouts, non-HTTP webhook URLs.
    pub fn validated(self) -> Result<Self, ServiceError> {
        if let Some(format) = &self.custom_format {
            if format.trim().is_empty() {
                return Err(ServiceError::validation("custom format must not be empty"));
            }
            if let Some(bad) = format.chars().find(|c| FORBIDDEN_FORMAT_CHARS.contains(c)) {
                return Err(ServiceError::validation(format!(
                    "custom format contains forbidden character '{bad}'"
                )));
            }
        }

        if self.timeout_secs == Some(0) {
            return Err(ServiceError::validation("timeout must be at least 1 second"));
        }

        if let Some(raw) = &self.webhook_url {
            let parsed = url::Url::parse(raw)
                .map_err(|e| ServiceError::validation(format!("webhook URL: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ServiceError::validation(format!(
                    "webhook URL scheme '{}' is not http(s)",
                    parsed.scheme()
                )));
            }
        }

        if let Some(template) = &self.output_template {
            if template.trim().is_empty() {
                return Err(ServiceError::validation(
                    "output template must not be empty",
                ));
            }
        }

        Ok(self)
    }

    /// The format selector this option set resolves to.
    #[must_use]
    pub fn effective_format(&self) -> &str {
        self.custom_format
            .as_deref()
            .unwrap_or_else(|| self.quality.format_selector())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_selectors_are_deterministic() {
        assert_eq!(
            QualityPreset::Best.format_selector(),
            "bestvideo+bestaudio/best"
        );
        assert_eq!(
            QualityPreset::P720.format_selector(),
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
        assert_eq!(QualityPreset::Audio.format_selector(), "bestaudio/best");
    }

    #[test]
    fn preset_parse_accepts_4k_alias() {
        assert_eq!("4k".parse::<QualityPreset>().unwrap(), QualityPreset::P2160);
        assert_eq!(
            "720p".parse::<QualityPreset>().unwrap(),
            QualityPreset::P720
        );
        assert!("8k".parse::<QualityPreset>().is_err());
    }

    #[test]
    fn custom_format_rejects_shell_metacharacters() {
        for bad in ["best; rm -rf /", "best|cat", "best`id`", "best$(id)", "a<b"] {
            let opts = DownloadOptions {
                custom_format: Some(bad.to_string()),
                ..DownloadOptions::default()
            };
            let err = opts.validated().unwrap_err();
            assert!(
                matches!(err, ServiceError::ValidationFailed { .. }),
                "{bad} should be rejected"
            );
        }

        let opts = DownloadOptions {
            custom_format: Some("bestvideo[height<=720]+bestaudio".to_string()),
            ..DownloadOptions::default()
        };
        // '<' and '>' are forbidden even inside selector filters; height
        // caps must come through presets.
        assert!(opts.validated().is_err());

        let opts = DownloadOptions {
            custom_format: Some("bestvideo+bestaudio/best".to_string()),
            ..DownloadOptions::default()
        };
        assert!(opts.validated().is_ok());
    }

    #[test]
    fn webhook_url_must_be_http() {
        let opts = DownloadOptions {
            webhook_url: Some("ftp://example.com/hook".to_string()),
            ..DownloadOptions::default()
        };
        assert!(opts.validated().is_err());

        let opts = DownloadOptions {
            webhook_url: Some("https://example.com/hook".to_string()),
            ..DownloadOptions::default()
        };
        assert!(opts.validated().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let opts = DownloadOptions {
            timeout_secs: Some(0),
            ..DownloadOptions::default()
        };
        assert!(opts.validated().is_err());
    }

    #[test]
    fn effective_format_prefers_custom() {
        let opts = DownloadOptions {
            quality: QualityPreset::P480,
            custom_format: Some("worstaudio".to_string()),
            ..DownloadOptions::default()
        };
        assert_eq!(opts.effective_format(), "worstaudio");

        let opts = DownloadOptions {
            quality: QualityPreset::P480,
            ..DownloadOptions::default()
        };
        assert_eq!(
            opts.effective_format(),
            QualityPreset::P480.format_selector()
        );
    }
}
