//! # Listing Scraper Library
//!
//! Collects product listings from a single e-commerce site by issuing keyword searches through a
//! third-party scraping proxy, and runs every search as an asynchronously trackable job.
//!
//! ## Features
//!
//! - **Rate Limiting**: per-channel token buckets shared by every job
//! - **Retries**: request-level classification with exponential backoff and `Retry-After` support
//! - **Pagination**: strictly ordered page retrieval with explicit and inferred stop conditions
//! - **Validation**: required-field checks, url normalization, deduplication and scoring
//! - **Recovery**: job-level retries at 1, 5 and 15 minutes, then dead-lettering
//! - **Progress**: a bounded stream of typed [`jobs::ProgressEvent`] values
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use listing_scraper::fetcher::proxy_http::{ProxyConfig, ProxyHttpClient};
//! use listing_scraper::jobs::{Orchestrator, OrchestratorConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = ProxyConfig::new("https://proxy.example.com/v1/queries", "user", "secret");
//! let fetcher = Arc::new(ProxyHttpClient::new(proxy)?);
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), fetcher)?;
//!
//! let job_id = orchestrator.submit_job("desk lamp", 5).await?;
//! let status = orchestrator.wait_for_terminal(job_id).await?;
//! println!("{} finished as {}", job_id, status.state);
//!
//! let records = orchestrator.fetch_results(job_id).await?;
//! println!("{} listings", records.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`fetcher`] - upstream page fetching, rate limiting, retries and pagination
//! - [`validator`] - cleaning, scoring and deduplication of raw listings
//! - [`recovery`] - job-level recovery schedule and the dead-letter queue
//! - [`jobs`] - job state machine, registry, progress events and the orchestrator
//! - [`output`] - CSV and JSON serializers for finished jobs
//! - [`metrics`] - counters and histograms for upstream calls and job outcomes

#![warn(missing_docs)]
#![warn(clippy::all)]

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// CLI command implementations
pub mod cli;

/// Upstream fetching, rate limiting, retries and pagination
pub mod fetcher;

/// Job orchestration
pub mod jobs;

/// Metrics collection
pub mod metrics;

/// Result serializers
pub mod output;

/// Job-level recovery and dead-lettering
pub mod recovery;

/// Cooperative cancellation shared across tasks
pub mod shutdown;

/// Listing validation and deduplication
pub mod validator;

pub use fetcher::Channel;
pub use jobs::{JobId, JobState, Orchestrator, OrchestratorConfig};

/// A listing as delivered by the upstream proxy, before validation.
///
/// Every field may be absent; the [`validator`] decides which listings survive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawListing {
    /// Listing title
    #[serde(default, alias = "listing_title")]
    pub title: Option<String>,
    /// Product page url, possibly with query string or fragment
    #[serde(default, alias = "listings_url")]
    pub url: Option<String>,
    /// Product image url
    #[serde(default)]
    pub image_url: Option<String>,
    /// Display price (e.g. "$12.99")
    #[serde(default, deserialize_with = "string_or_number")]
    pub price: Option<String>,
    /// ISO currency code
    #[serde(default)]
    pub currency: Option<String>,
    /// Marketplace name
    #[serde(default)]
    pub marketplace: Option<String>,
    /// Catalog item identifier (TCIN)
    #[serde(
        default,
        alias = "tcin",
        alias = "item_number",
        deserialize_with = "string_or_number"
    )]
    pub item_id: Option<String>,
    /// Brand name
    #[serde(default)]
    pub brand: Option<String>,
    /// Universal product code
    #[serde(default, deserialize_with = "string_or_number")]
    pub upc: Option<String>,
    /// Seller display name
    #[serde(default)]
    pub seller_name: Option<String>,
    /// Seller storefront url
    #[serde(default)]
    pub seller_url: Option<String>,
    /// Seller legal business name
    #[serde(default, alias = "seller_business")]
    pub seller_business_name: Option<String>,
    /// Seller postal address
    #[serde(default)]
    pub seller_address: Option<String>,
    /// Seller contact email
    #[serde(default)]
    pub seller_email: Option<String>,
    /// Seller contact phone
    #[serde(default)]
    pub seller_phone: Option<String>,
}

impl RawListing {
    /// Listing with only the three required fields set.
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            title: Some(title.into()),
            url: Some(url.into()),
            item_id: Some(item_id.into()),
            ..Self::default()
        }
    }
}

/// A validated listing.
///
/// Required fields are plain values; optional fields are `None` when the upstream did not
/// provide them. Scores are always within `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedRecord {
    /// Listing title
    pub title: String,
    /// Canonical url (query string and fragment removed)
    pub url: String,
    /// Catalog item identifier (TCIN)
    pub item_id: String,
    /// Product image url
    pub image_url: Option<String>,
    /// Parsed price
    pub price: Option<Decimal>,
    /// ISO currency code
    pub currency: Option<String>,
    /// Marketplace name
    pub marketplace: Option<String>,
    /// Brand name
    pub brand: Option<String>,
    /// Universal product code
    pub upc: Option<String>,
    /// Seller display name
    pub seller_name: Option<String>,
    /// Seller storefront url
    pub seller_url: Option<String>,
    /// Seller legal business name
    pub seller_business_name: Option<String>,
    /// Seller postal address
    pub seller_address: Option<String>,
    /// Seller contact email
    pub seller_email: Option<String>,
    /// Seller contact phone
    pub seller_phone: Option<String>,
    /// Weighted score of commercially relevant fields
    pub quality_score: f64,
    /// Fraction of optional fields present
    pub completeness_score: f64,
    /// Result page the listing came from (1-based)
    pub source_page: u32,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_listing_accepts_upstream_aliases() {
        let json = r#"{
            "listing_title": "Brass Desk Lamp",
            "listings_url": "https://www.target.com/p/brass-desk-lamp/-/A-12345678?ref=x",
            "tcin": "12345678",
            "price": 24.99
        }"#;

        let listing: RawListing = serde_json::from_str(json).unwrap();
        assert_eq!(listing.title.as_deref(), Some("Brass Desk Lamp"));
        assert_eq!(listing.item_id.as_deref(), Some("12345678"));
        assert_eq!(listing.price.as_deref(), Some("24.99"));
        assert!(listing.brand.is_none());
    }

    #[test]
    fn test_raw_listing_numeric_identifiers() {
        let listing: RawListing =
            serde_json::from_str(r#"{"tcin": 12345678, "upc": 490650112345}"#).unwrap();
        assert_eq!(listing.item_id.as_deref(), Some("12345678"));
        assert_eq!(listing.upc.as_deref(), Some("490650112345"));
    }

    #[test]
    fn test_raw_listing_price_as_string() {
        let listing: RawListing = serde_json::from_str(r#"{"price": "$1,299.00"}"#).unwrap();
        assert_eq!(listing.price.as_deref(), Some("$1,299.00"));

        let listing: RawListing = serde_json::from_str(r#"{"price": null}"#).unwrap();
        assert!(listing.price.is_none());
    }

    #[test]
    fn test_raw_listing_new_sets_required_fields() {
        let listing = RawListing::new("Lamp", "https://www.target.com/p/lamp/-/A-1", "1");
        assert_eq!(listing.title.as_deref(), Some("Lamp"));
        assert!(listing.seller_name.is_none());
    }
}
