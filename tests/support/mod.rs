//! Scripted upstream shared by the integration suites

use async_trait::async_trait;
use listing_scraper::fetcher::retry::RetryPolicy;
use listing_scraper::fetcher::{
    Channel, ChannelLimit, FetcherError, FetcherResult, PageFetcher, PageResponse,
};
use listing_scraper::jobs::{JobId, ProgressEvent};
use listing_scraper::{OrchestratorConfig, RawListing};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast::Receiver;
use tokio::time::Instant;

/// One upstream call as observed by the fake
#[derive(Debug, Clone, Copy)]
pub struct Call {
    pub page: u32,
    pub at: Instant,
}

/// Upstream that serves fixed pages, with scripted failures in front of them.
///
/// Queued failures are returned first, one per call, whatever page is asked for. After that,
/// `always_fail` (if set) fails every call and `fail_page` fails every call for one page;
/// otherwise page `n` returns `pages[n - 1]`, and pages past the end are empty. Calls for pages
/// at or above `hold_from` never return.
pub struct ScriptedUpstream {
    pages: Vec<Vec<RawListing>>,
    failures: Mutex<VecDeque<FetcherError>>,
    always_fail: Option<u16>,
    failing_page: Option<(u32, u16)>,
    hold_from: Option<u32>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedUpstream {
    pub fn new(pages: Vec<Vec<RawListing>>) -> Self {
        Self {
            pages,
            failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            failing_page: None,
            hold_from: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing(status: u16) -> Self {
        Self {
            always_fail: Some(status),
            ..Self::new(Vec::new())
        }
    }

    pub fn fail_first(self, errors: impl IntoIterator<Item = FetcherError>) -> Self {
        self.failures.lock().unwrap().extend(errors);
        self
    }

    pub fn fail_page(mut self, page: u32, status: u16) -> Self {
        self.failing_page = Some((page, status));
        self
    }

    pub fn hold_from(mut self, page: u32) -> Self {
        self.hold_from = Some(page);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pages_requested(&self) -> Vec<u32> {
        self.calls().iter().map(|c| c.page).collect()
    }
}

#[async_trait]
impl PageFetcher for ScriptedUpstream {
    async fn fetch_page(
        &self,
        _keyword: &str,
        page_index: u32,
        _channel: Channel,
    ) -> FetcherResult<PageResponse> {
        self.calls.lock().unwrap().push(Call {
            page: page_index,
            at: Instant::now(),
        });

        if self.hold_from.is_some_and(|from| page_index >= from) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(status) = self.always_fail {
            return Err(status_error(status));
        }
        if let Some((page, status)) = self.failing_page {
            if page == page_index {
                return Err(status_error(status));
            }
        }

        let records = self
            .pages
            .get(page_index as usize - 1)
            .cloned()
            .unwrap_or_default();
        Ok(PageResponse::new(records))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn status_error(status: u16) -> FetcherError {
    FetcherError::UpstreamStatus {
        status,
        message: format!("upstream returned {status}"),
    }
}

pub fn rate_limited() -> FetcherError {
    FetcherError::UpstreamRateLimited { retry_after: None }
}

/// `count` distinct listings for `page`.
pub fn listings(page: u32, count: usize) -> Vec<RawListing> {
    (0..count)
        .map(|i| {
            let id = format!("{page}{i:07}");
            RawListing::new(
                format!("Desk Lamp model {id}"),
                format!("https://www.target.com/p/desk-lamp/-/A-{id}?ref=search"),
                id,
            )
        })
        .collect()
}

/// No jitter and rate limits high enough never to delay a test.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_retry_policy(RetryPolicy::default().without_jitter())
        .with_channel_limit(Channel::KeywordSearch, ChannelLimit::new(1000.0, 1000))
        .with_channel_limit(Channel::Batch, ChannelLimit::new(1000.0, 1000))
}

/// Events of `job_id` until (and including) its terminal event.
pub async fn collect_events(events: &mut Receiver<ProgressEvent>, job_id: JobId) -> Vec<ProgressEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv().await {
        if event.job_id != job_id {
            continue;
        }
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}
