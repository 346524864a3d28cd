//! Remote listing types: channel/playlist entries, filters, sorting, and
//! playlist range selection.
//!
//! Everything here is pure; the expander in the engine crate probes the
//! remote listing and then drives these functions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// One entry of a flat channel or playlist listing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Platform video id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Title, if the listing carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Resolvable media URL. The only mandatory field.
    pub url: String,
    /// Duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    /// View count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    /// Upload date in `YYYYMMDD` form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

/// Conjunction of listing predicates.
///
/// A bound that is `None` is inactive. An entry missing a field some
/// active bound constrains is excluded; entries only pass on positive
/// evidence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingFilter {
    /// Inclusive lower bound on upload date (`YYYYMMDD`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_after: Option<String>,
    /// Inclusive upper bound on upload date (`YYYYMMDD`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_before: Option<String>,
    /// Inclusive lower bound on duration, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_duration: Option<f64>,
    /// Inclusive upper bound on duration, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<f64>,
    /// Inclusive lower bound on views.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_views: Option<u64>,
    /// Inclusive upper bound on views.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_views: Option<u64>,
}

impl ListingFilter {
    /// Whether no predicate is active.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.date_after.is_none()
            && self.date_before.is_none()
            && self.min_duration.is_none()
            && self.max_duration.is_none()
            && self.min_views.is_none()
            && self.max_views.is_none()
    }

    /// Validate bound shapes (dates must be 8 digits, ranges ordered).
    pub fn validated(self) -> Result<Self, ServiceError> {
        for date in [&self.date_after, &self.date_before].into_iter().flatten() {
            if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ServiceError::validation(format!(
                    "date filter '{date}' is not YYYYMMDD"
                )));
            }
        }
        if let (Some(after), Some(before)) = (&self.date_after, &self.date_before) {
            if after > before {
                return Err(ServiceError::validation("date_after is later than date_before"));
            }
        }
        if let (Some(min), Some(max)) = (self.min_duration, self.max_duration) {
            if min > max {
                return Err(ServiceError::validation("min_duration exceeds max_duration"));
            }
        }
        if let (Some(min), Some(max)) = (self.min_views, self.max_views) {
            if min > max {
                return Err(ServiceError::validation("min_views exceeds max_views"));
            }
        }
        Ok(self)
    }

    /// Evaluate the conjunction against one entry.
    #[must_use]
    pub fn matches(&self, entry: &RemoteEntry) -> bool {
        // Dates in YYYYMMDD compare correctly as strings.
        if self.date_after.is_some() || self.date_before.is_some() {
            let Some(date) = &entry.upload_date else {
                return false;
            };
            if let Some(after) = &self.date_after {
                if date < after {
                    return false;
                }
            }
            if let Some(before) = &self.date_before {
                if date > before {
                    return false;
                }
            }
        }

        if self.min_duration.is_some() || self.max_duration.is_some() {
            let Some(duration) = entry.duration_secs else {
                return false;
            };
            if self.min_duration.is_some_and(|min| duration < min) {
                return false;
            }
            if self.max_duration.is_some_and(|max| duration > max) {
                return false;
            }
        }

        if self.min_views.is_some() || self.max_views.is_some() {
            let Some(views) = entry.view_count else {
                return false;
            };
            if self.min_views.is_some_and(|min| views < min) {
                return false;
            }
            if self.max_views.is_some_and(|max| views > max) {
                return false;
            }
        }

        true
    }
}

/// Sort order for filtered listings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingSort {
    /// Newest first.
    #[default]
    UploadDate,
    /// Most viewed first.
    ViewCount,
    /// Longest first.
    Duration,
    /// Alphabetical.
    Title,
}

impl ListingSort {
    /// The canonical string form.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UploadDate => "upload_date",
            Self::ViewCount => "view_count",
            Self::Duration => "duration",
            Self::Title => "title",
        }
    }

    /// Sort entries in place. Entries missing the sort key go last,
    /// keeping their relative order.
    pub fn apply(&self, entries: &mut [RemoteEntry]) {
        match self {
            Self::UploadDate => entries.sort_by(|a, b| {
                descending_option(a.upload_date.as_ref(), b.upload_date.as_ref())
            }),
            Self::ViewCount => {
                entries.sort_by(|a, b| descending_option(a.view_count.as_ref(), b.view_count.as_ref()));
            }
            Self::Duration => entries.sort_by(|a, b| {
                descending_partial(a.duration_secs, b.duration_secs)
            }),
            Self::Title => {
                entries.sort_by(|a, b| ascending_option(a.title.as_ref(), b.title.as_ref()));
            }
        }
    }
}

impl fmt::Display for ListingSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListingSort {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload_date" | "date" => Ok(Self::UploadDate),
            "view_count" | "views" => Ok(Self::ViewCount),
            "duration" => Ok(Self::Duration),
            "title" => Ok(Self::Title),
            other => Err(ServiceError::validation(format!(
                "unknown sort key '{other}'"
            ))),
        }
    }
}

/// Descending comparison with `None` sorted last.
fn descending_option<T: Ord>(a: Option<&T>, b: Option<&T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Descending comparison for float keys with `None` sorted last.
fn descending_partial(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Ascending comparison with `None` sorted last.
fn ascending_option<T: Ord>(a: Option<&T>, b: Option<&T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Playlist item selection: a 1-based range expression plus a reverse flag.
///
/// The grammar accepts comma-separated terms, each either a single index
/// (`15`) or an inclusive span (`20-25`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistSelection {
    /// Parsed (start, end) inclusive spans, in expression order.
    spans: Vec<(usize, usize)>,
    /// Reverse the final order.
    pub reverse: bool,
}

impl PlaylistSelection {
    /// Parse a range expression like `"1-10,15,20-25"`.
    pub fn parse(expr: &str, reverse: bool) -> Result<Self, ServiceError> {
        let mut spans = Vec::new();
        for term in expr.split(',') {
            let term = term.trim();
            if term.is_empty() {
                return Err(ServiceError::validation(format!(
                    "empty term in selection '{expr}'"
                )));
            }
            let (start, end) = match term.split_once('-') {
                Some((lo, hi)) => (parse_index(lo, expr)?, parse_index(hi, expr)?),
                None => {
                    let idx = parse_index(term, expr)?;
                    (idx, idx)
                }
            };
            if start > end {
                return Err(ServiceError::validation(format!(
                    "descending span '{term}' in selection '{expr}'"
                )));
            }
            spans.push((start, end));
        }
        if spans.is_empty() {
            return Err(ServiceError::validation("empty selection expression"));
        }
        Ok(Self { spans, reverse })
    }

    /// Select everything, optionally reversed.
    #[must_use]
    pub const fn all(reverse: bool) -> Self {
        Self {
            spans: Vec::new(),
            reverse,
        }
    }

    /// Resolve the selection against a listing of `len` items.
    ///
    /// Returns 0-based indices in selection order; indices beyond the
    /// listing are silently dropped. An empty span list selects the whole
    /// listing.
    #[must_use]
    pub fn resolve(&self, len: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = if self.spans.is_empty() {
            (0..len).collect()
        } else {
            self.spans
                .iter()
                .flat_map(|&(start, end)| (start..=end))
                .filter(|&i| i >= 1 && i <= len)
                .map(|i| i - 1)
                .collect()
        };
        if self.reverse {
            indices.reverse();
        }
        indices
    }
}

fn parse_index(raw: &str, expr: &str) -> Result<usize, ServiceError> {
    let raw = raw.trim();
    let idx: usize = raw
        .parse()
        .map_err(|_| ServiceError::validation(format!("bad index '{raw}' in selection '{expr}'")))?;
    if idx == 0 {
        return Err(ServiceError::validation(format!(
            "selection indices are 1-based, got 0 in '{expr}'"
        )));
    }
    Ok(idx)
}
