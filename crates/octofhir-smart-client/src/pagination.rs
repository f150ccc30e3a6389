//! Bundle pagination.
//!
//! [`walk_pages`] turns a first page (or the URL of one) into a lazy stream
//! of pages that follows `link[relation = "next"]`. Fetching and post
//! processing a page is delegated to a [`PageSource`], so the walker only
//! owns the budget, cancellation and link-following rules.

use async_trait::async_trait;
use futures_util::Stream;
use futures_util::stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::SmartResult;
use crate::resolver::References;

/// A Bundle page with the references resolved for it out of band.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub bundle: Value,
    pub references: References,
}

/// Where a walk starts.
#[derive(Debug, Clone)]
pub enum PageStart {
    /// An already fetched first page.
    Page(Page),
    /// The URL of the first page.
    Url(String),
}

/// Fetches one page and applies per-page processing.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> SmartResult<Page>;
}

/// `true` when `value` is a Bundle resource.
#[must_use]
pub fn is_bundle(value: &Value) -> bool {
    value.get("resourceType").and_then(Value::as_str) == Some("Bundle")
}

/// URL of the `next` link of `bundle`.
#[must_use]
pub fn next_link(bundle: &Value) -> Option<&str> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
}

/// The `entry[].resource` values of `bundle`, in order.
#[must_use]
pub fn bundle_resources(bundle: &Value) -> Vec<Value> {
    bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("resource").cloned())
                .collect()
        })
        .unwrap_or_default()
}

struct Walk<S> {
    source: S,
    pending: Option<Page>,
    next_url: Option<String>,
    fetched: u32,
    page_limit: u32,
    signal: Option<CancellationToken>,
}

impl<S> Walk<S> {
    /// Counts `page` and decides whether a following page may be fetched.
    fn advance(&mut self, page: &Page) {
        self.fetched += 1;
        let budget_left = self.page_limit == 0 || self.fetched < self.page_limit;
        self.next_url = budget_left
            .then(|| next_link(&page.bundle).map(str::to_string))
            .flatten();
    }
}

/// Streams pages starting at `start`.
///
/// At most `page_limit` pages are yielded, counting the first; `0` means no
/// limit. The walk stops when a page has no `next` link or `signal` is
/// cancelled before the next fetch. A failed fetch is yielded as the last
/// item.
pub fn walk_pages<S>(
    source: S,
    start: PageStart,
    page_limit: u32,
    signal: Option<CancellationToken>,
) -> impl Stream<Item = SmartResult<Page>> + Send
where
    S: PageSource + 'static,
{
    let (pending, next_url) = match start {
        PageStart::Page(page) => (Some(page), None),
        PageStart::Url(url) => (None, Some(url)),
    };
    let walk = Walk {
        source,
        pending,
        next_url,
        fetched: 0,
        page_limit,
        signal,
    };

    stream::unfold(walk, |mut walk| async move {
        if let Some(page) = walk.pending.take() {
            walk.advance(&page);
            return Some((Ok(page), walk));
        }

        let url = walk.next_url.take()?;
        let signal = walk.signal.as_ref();
        if signal.is_some_and(CancellationToken::is_cancelled) {
            debug!(%url, "Pagination cancelled");
            return None;
        }

        debug!(%url, page = walk.fetched + 1, "Fetching next page");
        match walk.source.fetch_page(&url).await {
            Ok(page) => {
                walk.advance(&page);
                Some((Ok(page), walk))
            }
            Err(error) => Some((Err(error), walk)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SmartError;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bundle(id: &str, next: Option<&str>) -> Value {
        let mut links = vec![json!({"relation": "self", "url": format!("page/{id}")})];
        if let Some(next) = next {
            links.push(json!({"relation": "next", "url": next}));
        }
        json!({
            "resourceType": "Bundle",
            "id": id,
            "link": links,
            "entry": [{"resource": {"resourceType": "Patient", "id": format!("p{id}")}}]
        })
    }

    /// Serves a chain `page/1 -> page/2 -> page/3`.
    #[derive(Clone, Default)]
    struct Chain {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PageSource for Chain {
        async fn fetch_page(&self, url: &str) -> SmartResult<Page> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let bundle = match url {
                "page/1" => bundle("1", Some("page/2")),
                "page/2" => bundle("2", Some("page/3")),
                "page/3" => bundle("3", None),
                _ => return Err(SmartError::validation("unknown page")),
            };
            Ok(Page {
                bundle,
                references: References::new(),
            })
        }
    }

    async fn ids(source: Chain, start: PageStart, limit: u32) -> Vec<String> {
        walk_pages(source, start, limit, None)
            .map(|page| page.unwrap().bundle["id"].as_str().unwrap().to_string())
            .collect()
            .await
    }

    #[test]
    fn test_next_link_and_resources() {
        let page = bundle("1", Some("page/2"));
        assert_eq!(next_link(&page), Some("page/2"));
        assert_eq!(next_link(&bundle("3", None)), None);
        let patient = json!({"resourceType": "Patient", "id": "p1"});
        assert_eq!(bundle_resources(&page), vec![patient]);
        assert!(is_bundle(&page));
        assert!(!is_bundle(&json!({"resourceType": "Patient"})));
    }

    #[tokio::test]
    async fn test_page_limit_counts_first_page() {
        let source = Chain::default();
        let pages = ids(source.clone(), PageStart::Url("page/1".into()), 2).await;
        assert_eq!(pages, vec!["1", "2"]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_walks_whole_chain() {
        let source = Chain::default();
        let first = Page {
            bundle: bundle("1", Some("page/2")),
            references: References::new(),
        };
        let pages = ids(source.clone(), PageStart::Page(first), 0).await;
        assert_eq!(pages, vec!["1", "2", "3"]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_signal_stops_before_next_fetch() {
        let source = Chain::default();
        let signal = CancellationToken::new();
        let mut pages = Box::pin(walk_pages(
            source.clone(),
            PageStart::Url("page/1".into()),
            0,
            Some(signal.clone()),
        ));

        assert!(pages.next().await.unwrap().is_ok());
        signal.cancel();
        assert!(pages.next().await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let source = Chain::default();
        let mut pages = Box::pin(walk_pages(source, PageStart::Url("nope".into()), 0, None));
        assert!(pages.next().await.unwrap().is_err());
        assert!(pages.next().await.is_none());
    }
}
