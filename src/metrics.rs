//! Observability metrics for the listing scraper
//!
//! Counters and histograms for upstream calls, retries, rate-limit waits, record rejections and
//! job outcomes.
//!
//! ## Architecture
//!
//! - Uses the `metrics` crate facade; recording is a no-op until a recorder is installed
//! - Optional Prometheus exporter serving a scrape endpoint (for example `:9090/metrics`)

use crate::fetcher::Channel;
use crate::validator::{RejectionReason, RejectionSummary};
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Global metrics registry initialization flag
static METRICS_INITIALIZED: Lazy<Arc<RwLock<bool>>> = Lazy::new(|| Arc::new(RwLock::new(false)));

/// Initialize metrics with a Prometheus exporter listening on `addr`.
///
/// Idempotent: later calls are ignored.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    info!("Initializing metrics system on {}", addr);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        "upstream_requests_total",
        Unit::Count,
        "Requests sent to the scraping proxy"
    );
    describe_counter!(
        "upstream_retries_total",
        Unit::Count,
        "Request-level retries scheduled"
    );
    describe_histogram!(
        "retry_backoff_duration_seconds",
        Unit::Seconds,
        "Delay before each request-level retry"
    );
    describe_histogram!(
        "rate_limit_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for rate-limit tokens"
    );
    describe_counter!(
        "records_rejected_total",
        Unit::Count,
        "Raw records dropped by the validator"
    );
    describe_counter!("jobs_completed_total", Unit::Count, "Jobs that completed");
    describe_counter!(
        "jobs_dead_lettered_total",
        Unit::Count,
        "Jobs parked after exhausting recovery"
    );
    describe_counter!("jobs_cancelled_total", Unit::Count, "Jobs cancelled");

    *initialized = true;
    info!("Metrics system initialized successfully on {}", addr);
    Ok(())
}

/// Check if the exporter is installed
pub async fn is_initialized() -> bool {
    *METRICS_INITIALIZED.read().await
}

/// Record one upstream call; `status` is `None` for network failures.
pub fn record_upstream_request(channel: Channel, status: Option<u16>) {
    let status = status.map_or_else(|| "network_error".to_string(), |s| s.to_string());
    counter!(
        "upstream_requests_total",
        "channel" => channel.as_str(),
        "status" => status,
    )
    .increment(1);
}

/// Record a scheduled retry and its backoff
pub fn record_retry(delay: Duration) {
    counter!("upstream_retries_total").increment(1);
    histogram!("retry_backoff_duration_seconds").record(delay.as_secs_f64());
}

/// Record time spent waiting for tokens on `channel`
pub fn record_rate_limit_wait(channel: Channel, waited: Duration) {
    histogram!("rate_limit_wait_seconds", "channel" => channel.as_str())
        .record(waited.as_secs_f64());
}

/// Record the rejections of one validation pass, by reason
pub fn record_rejections(summary: &RejectionSummary) {
    for reason in [
        RejectionReason::MissingField,
        RejectionReason::Duplicate,
        RejectionReason::InvalidField,
    ] {
        let count = summary.count(reason);
        if count > 0 {
            counter!("records_rejected_total", "reason" => reason.as_str())
                .increment(count as u64);
        }
    }
}

/// Outcome metrics of one job
pub struct JobMetrics {
    channel: Channel,
    start_time: Instant,
}

impl JobMetrics {
    /// Start tracking a job searching on `channel`
    pub fn start(channel: Channel) -> Self {
        Self {
            channel,
            start_time: Instant::now(),
        }
    }

    /// Record completion with `records` surviving listings
    pub fn record_completed(&self, records: usize) {
        counter!("jobs_completed_total", "channel" => self.channel.as_str()).increment(1);
        debug!(
            channel = %self.channel,
            records = records,
            duration_secs = self.start_time.elapsed().as_secs(),
            "Job completion recorded"
        );
    }

    /// Record a dead-lettered job
    pub fn record_dead_lettered(&self) {
        counter!("jobs_dead_lettered_total", "channel" => self.channel.as_str()).increment(1);
    }

    /// Record a cancelled job
    pub fn record_cancelled(&self) {
        counter!("jobs_cancelled_total", "channel" => self.channel.as_str()).increment(1);
    }
}
