//! Channel and playlist expansion.
//!
//! Probes a remote listing through the downloader's metadata-only mode,
//! then filters, sorts, caps, or range-selects the entries. The result
//! feeds the batch coordinator.

use std::sync::Arc;

use fetchd_core::error::ServiceError;
use fetchd_core::listing::{ListingFilter, ListingSort, PlaylistSelection, RemoteEntry};
use fetchd_core::ports::Downloader;

/// Listing expansion over a downloader port.
pub struct Expander {
    driver: Arc<dyn Downloader>,
}

impl Expander {
    /// Create an expander probing through `driver`.
    #[must_use]
    pub fn new(driver: Arc<dyn Downloader>) -> Self {
        Self { driver }
    }

    /// Expand a channel URL: filter, sort, cap.
    ///
    /// `cap` bounds the result size and must be at least 1. An empty
    /// post-cap list rejects the request.
    pub async fn expand_channel(
        &self,
        url: &str,
        filter: &ListingFilter,
        sort: ListingSort,
        cap: usize,
    ) -> Result<Vec<RemoteEntry>, ServiceError> {
        if cap == 0 {
            return Err(ServiceError::validation("max_downloads must be at least 1"));
        }
        let filter = filter.clone().validated()?;

        let listing = self.driver.probe(url).await?;
        let total = listing.len();

        let mut entries: Vec<RemoteEntry> = listing
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect();
        sort.apply(&mut entries);
        entries.truncate(cap);

        if entries.is_empty() {
            return Err(ServiceError::validation(format!(
                "no videos match the filters ({total} listed)"
            )));
        }

        tracing::debug!(
            target: "fetchd.expand",
            url,
            listed = total,
            selected = entries.len(),
            sort = %sort,
            "Channel expanded"
        );
        Ok(entries)
    }

    /// Expand a playlist URL, applying an optional range selection.
    pub async fn expand_playlist(
        &self,
        url: &str,
        selection: Option<&PlaylistSelection>,
    ) -> Result<Vec<RemoteEntry>, ServiceError> {
        let listing = self.driver.probe(url).await?;
        let total = listing.len();

        let entries: Vec<RemoteEntry> = match selection {
            Some(selection) => {
                let indices = selection.resolve(total);
                indices.into_iter().filter_map(|i| listing.get(i).cloned()).collect()
            }
            None => listing,
        };

        if entries.is_empty() {
            return Err(ServiceError::validation(format!(
                "playlist selection matches nothing ({total} listed)"
            )));
        }

        tracing::debug!(
            target: "fetchd.expand",
            url,
            listed = total,
            selected = entries.len(),
            "Playlist expanded"
        );
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fetchd_core::ports::{FetchRequest, FetchedMedia, ProgressSink};

    /// A downloader that only answers probes with a canned listing.
    struct ListingOnly(Vec<RemoteEntry>);

    #[async_trait]
    impl Downloader for ListingOnly {
        async fn fetch(
            &self,
            _request: FetchRequest,
            _progress: ProgressSink,
        ) -> Result<FetchedMedia, ServiceError> {
            Err(ServiceError::download("not a fetching mock"))
        }

        async fn probe(&self, _url: &str) -> Result<Vec<RemoteEntry>, ServiceError> {
            Ok(self.0.clone())
        }
    }

    fn entry(title: &str, views: u64, date: &str) -> RemoteEntry {
        RemoteEntry {
            id: Some(title.to_string()),
            title: Some(title.to_string()),
            url: format!("https://ex/{title}"),
            duration_secs: Some(60.0),
            view_count: Some(views),
            upload_date: Some(date.to_string()),
        }
    }

    fn expander(listing: Vec<RemoteEntry>) -> Expander {
        Expander::new(Arc::new(ListingOnly(listing)))
    }

    #[tokio::test]
    async fn channel_filters_sorts_and_caps() {
        let expander = expander(vec![
            entry("old", 50, "20230101"),
            entry("hot", 9000, "20240301"),
            entry("mid", 400, "20240201"),
            entry("new", 100, "20240401"),
        ]);

        let filter = ListingFilter {
            date_after: Some("20240101".into()),
            ..ListingFilter::default()
        };
        let picked = expander
            .expand_channel("https://ex/channel", &filter, ListingSort::ViewCount, 2)
            .await
            .unwrap();

        let titles: Vec<_> = picked.iter().map(|e| e.title.clone().unwrap()).collect();
        assert_eq!(titles, ["hot", "mid"]);
    }

    #[tokio::test]
    async fn channel_rejects_empty_result() {
        let expander = expander(vec![entry("only", 10, "20200101")]);
        let filter = ListingFilter {
            min_views: Some(1_000_000),
            ..ListingFilter::default()
        };
        let err = expander
            .expand_channel("https://ex/channel", &filter, ListingSort::UploadDate, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationFailed { .. }));
    }

    #[tokio::test]
    async fn channel_rejects_zero_cap() {
        let expander = expander(vec![entry("a", 1, "20240101")]);
        assert!(expander
            .expand_channel(
                "https://ex/channel",
                &ListingFilter::default(),
                ListingSort::UploadDate,
                0
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn playlist_selection_orders_and_reverses() {
        let expander = expander(vec![
            entry("one", 1, "20240101"),
            entry("two", 2, "20240102"),
            entry("three", 3, "20240103"),
            entry("four", 4, "20240104"),
        ]);

        let selection = PlaylistSelection::parse("2-3,1", false).unwrap();
        let picked = expander
            .expand_playlist("https://ex/pl", Some(&selection))
            .await
            .unwrap();
        let titles: Vec<_> = picked.iter().map(|e| e.title.clone().unwrap()).collect();
        assert_eq!(titles, ["two", "three", "one"]);

        let reversed = PlaylistSelection::parse("1-2", true).unwrap();
        let picked = expander
            .expand_playlist("https://ex/pl", Some(&reversed))
            .await
            .unwrap();
        let titles: Vec<_> = picked.iter().map(|e| e.title.clone().unwrap()).collect();
        assert_eq!(titles, ["two", "one"]);
    }

    #[tokio::test]
    async fn playlist_without_selection_keeps_everything() {
        let expander = expander(vec![entry("a", 1, "20240101"), entry("b", 2, "20240102")]);
        let picked = expander
            .expand_playlist("https://ex/pl", None)
            .await
            .unwrap();
        assert_eq!(picked.len(), 2);
    }

    #[tokio::test]
    async fn playlist_selection_out_of_range_rejects() {
        let expander = expander(vec![entry("a", 1, "20240101")]);
        let selection = PlaylistSelection::parse("5-9", false).unwrap();
        assert!(expander
            .expand_playlist("https://ex/pl", Some(&selection))
            .await
            .is_err());
    }
}
