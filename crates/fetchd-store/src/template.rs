//! Output path template expansion.
//!
//! Templates turn job metadata into relative output paths, e.g.
//! `"{id}/{safe_title}.{ext}"`. Unknown tokens pass through literally so a
//! downloader-native template segment survives expansion untouched.

use crate::sanitize::sanitize_filename;

/// The metadata a template draws from.
///
/// `random` is drawn once at construction, so expanding the same context
/// twice yields the same path.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext {
    /// Job id.
    pub id: String,
    /// Media title, as extracted.
    pub title: Option<String>,
    /// File extension without the dot.
    pub ext: Option<String>,
    /// Uploader/channel name.
    pub uploader: Option<String>,
    /// Upload date, `YYYYMMDD`.
    pub upload_date: Option<String>,
    /// Playlist title, for playlist children.
    pub playlist: Option<String>,
    /// 1-based index within the playlist.
    pub playlist_index: Option<usize>,
    /// Channel name, for channel children.
    pub channel: Option<String>,
    /// Owning batch id.
    pub batch_id: Option<String>,
    /// Random token, stable for this context.
    random: String,
}

impl TemplateContext {
    /// Create a context for a job, drawing the `{random}` token.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let mut hex = uuid::Uuid::new_v4().simple().to_string();
        hex.truncate(8);
        Self {
            id: id.into(),
            random: hex,
            ..Self::default()
        }
    }

    /// The value a token expands to, or `None` for unknown tokens.
    fn lookup(&self, token: &str) -> Option<String> {
        match token {
            "id" => Some(self.id.clone()),
            "title" => Some(self.title.clone().unwrap_or_else(|| "untitled".into())),
            "safe_title" => Some(sanitize_or_fallback(self.title.as_deref())),
            "ext" => Some(self.ext.clone().unwrap_or_else(|| "bin".into())),
            "uploader" => Some(self.uploader.clone().unwrap_or_else(|| "unknown".into())),
            "upload_date" => Some(self.upload_date.clone().unwrap_or_else(|| "nodate".into())),
            "random" => Some(self.random.clone()),
            "playlist" => Some(self.playlist.clone().unwrap_or_default()),
            "playlist_index" => Some(
                self.playlist_index
                    .map(|i| i.to_string())
                    .unwrap_or_default(),
            ),
            "channel" => Some(self.channel.clone().unwrap_or_default()),
            "batch_id" => Some(self.batch_id.clone().unwrap_or_default()),
            _ => None,
        }
    }
}

fn sanitize_or_fallback(title: Option<&str>) -> String {
    let safe = sanitize_filename(title.unwrap_or(""));
    if safe.is_empty() {
        "untitled".to_string()
    } else {
        safe
    }
}

/// Expand `{token}` occurrences in a template.
///
/// Recognized tokens: `{id}`, `{title}`, `{safe_title}`, `{ext}`,
/// `{uploader}`, `{upload_date}`, `{random}`, `{playlist}`,
/// `{playlist_index}`, `{channel}`, `{batch_id}`. Anything else,
/// including unterminated braces, is copied through literally.
#[must_use]
pub fn expand_template(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                match ctx.lookup(token) {
                    Some(value) => out.push_str(&value),
                    None => {
                        // Unknown token stays literal.
                        out.push('{');
                        out.push_str(token);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                // Unterminated brace: keep the remainder as-is.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// The default template used when a job supplies none.
pub const DEFAULT_TEMPLATE: &str = "{id}/{safe_title}.{ext}";

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            title: Some("My: Video?".to_string()),
            ext: Some("mp4".to_string()),
            uploader: Some("chan".to_string()),
            upload_date: Some("20240601".to_string()),
            ..TemplateContext::new("job1")
        }
    }

    #[test]
    fn expands_known_tokens() {
        let expanded = expand_template("{id}/{safe_title}.{ext}", &ctx());
        assert_eq!(expanded, "job1/My_Video.mp4");
    }

    #[test]
    fn title_and_safe_title_differ() {
        let c = ctx();
        assert_eq!(expand_template("{title}", &c), "My: Video?");
        assert_eq!(expand_template("{safe_title}", &c), "My_Video");
    }

    #[test]
    fn unknown_tokens_stay_literal() {
        let expanded = expand_template("{id}-%(format)s-{nope}", &ctx());
        assert_eq!(expanded, "job1-%(format)s-{nope}");
    }

    #[test]
    fn unterminated_brace_is_copied() {
        assert_eq!(expand_template("a{id", &ctx()), "a{id");
    }

    #[test]
    fn missing_metadata_uses_fallbacks() {
        let c = TemplateContext::new("j");
        assert_eq!(expand_template("{title}", &c), "untitled");
        assert_eq!(expand_template("{safe_title}", &c), "untitled");
        assert_eq!(expand_template("{ext}", &c), "bin");
        assert_eq!(expand_template("{uploader}", &c), "unknown");
        assert_eq!(expand_template("{playlist_index}", &c), "");
    }

    #[test]
    fn same_context_expands_identically() {
        let c = ctx();
        let a = expand_template("{random}/{id}.{ext}", &c);
        let b = expand_template("{random}/{id}.{ext}", &c);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_contexts_draw_distinct_random_tokens() {
        let a = expand_template("{random}", &TemplateContext::new("j"));
        let b = expand_template("{random}", &TemplateContext::new("j"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
    }
}
