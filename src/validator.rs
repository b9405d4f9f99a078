//! Cleaning, scoring and deduplication of raw listings
//!
//! A listing is dropped when a required field (title, url, item identifier) is missing, when
//! its title length is out of bounds, when its url is not a product page on the listing site,
//! when its item identifier is not a catalog number of at least [`MIN_ITEM_ID_DIGITS`] digits,
//! or when its item identifier or normalized url was already seen earlier in the same job.
//! Survivors keep their input order.
//!
//! ## Score weights
//!
//! `quality_score` weighs the commercially relevant optional fields:
//!
//! | Field | Weight |
//! |---|---|
//! | price | 0.30 |
//! | image url | 0.20 |
//! | seller name | 0.15 |
//! | seller url | 0.15 |
//! | brand | 0.10 |
//! | currency | 0.05 |
//! | marketplace | 0.05 |
//!
//! `completeness_score` is the fraction of the twelve optional fields that are present.

use crate::{RawListing, ScrapedRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Shortest accepted title, in characters
pub const MIN_TITLE_CHARS: usize = 3;
/// Longest accepted title, in characters
pub const MAX_TITLE_CHARS: usize = 500;
/// Rejections kept verbatim in a summary
pub const MAX_REJECTION_SAMPLES: usize = 20;
/// Fewest digits in a catalog item identifier
pub const MIN_ITEM_ID_DIGITS: usize = 8;
/// Hosts serving product pages
pub const LISTING_HOSTS: [&str; 2] = ["target.com", "www.target.com"];

/// Path segment that precedes the catalog number in a product url
const ITEM_ID_MARKER: &str = "/-/A-";

const OPTIONAL_FIELD_COUNT: f64 = 12.0;

const W_PRICE: f64 = 0.30;
const W_IMAGE: f64 = 0.20;
const W_SELLER_NAME: f64 = 0.15;
const W_SELLER_URL: f64 = 0.15;
const W_BRAND: f64 = 0.10;
const W_CURRENCY: f64 = 0.05;
const W_MARKETPLACE: f64 = 0.05;

/// Why a listing was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Title, url or item identifier absent
    MissingField,
    /// Item identifier or normalized url already accepted
    Duplicate,
    /// Title length out of bounds, url not a product page, or malformed item identifier
    InvalidField,
}

impl RejectionReason {
    /// Label used in reports and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::MissingField => "missing_field",
            RejectionReason::Duplicate => "duplicate",
            RejectionReason::InvalidField => "invalid_field",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dropped listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Page the listing came from
    pub page: u32,
    /// Position in the job's accumulated input (0-based)
    pub index: usize,
    /// Reason category
    pub reason: RejectionReason,
    /// Human-readable detail
    pub detail: String,
}

/// Tally of dropped listings for one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectionSummary {
    /// Listings examined
    pub total_input: usize,
    /// Listings kept
    pub accepted: usize,
    /// Dropped for a missing required field
    pub missing_field: usize,
    /// Dropped as duplicates
    pub duplicate: usize,
    /// Dropped for an unusable url or title
    pub invalid_field: usize,
    /// First few rejections, for inspection
    pub samples: Vec<Rejection>,
}

impl RejectionSummary {
    /// Total dropped listings
    pub fn rejected(&self) -> usize {
        self.missing_field + self.duplicate + self.invalid_field
    }

    /// Count for one reason
    pub fn count(&self, reason: RejectionReason) -> usize {
        match reason {
            RejectionReason::MissingField => self.missing_field,
            RejectionReason::Duplicate => self.duplicate,
            RejectionReason::InvalidField => self.invalid_field,
        }
    }

    fn record(&mut self, rejection: Rejection) {
        match rejection.reason {
            RejectionReason::MissingField => self.missing_field += 1,
            RejectionReason::Duplicate => self.duplicate += 1,
            RejectionReason::InvalidField => self.invalid_field += 1,
        }
        if self.samples.len() < MAX_REJECTION_SAMPLES {
            self.samples.push(rejection);
        }
    }
}

/// Validator output
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Surviving records in input order
    pub records: Vec<ScrapedRecord>,
    /// Rejection tally
    pub summary: RejectionSummary,
}

/// Validates and deduplicates a job's accumulated listings
#[derive(Debug, Clone, Default)]
pub struct ResultValidator;

impl ResultValidator {
    /// Create a validator.
    pub fn new() -> Self {
        Self
    }

    /// Validate `(page, listing)` pairs in order.
    pub fn validate<I>(&self, listings: I) -> ValidationReport
    where
        I: IntoIterator<Item = (u32, RawListing)>,
    {
        let mut report = ValidationReport::default();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut seen_urls: HashSet<String> = HashSet::new();

        for (index, (page, raw)) in listings.into_iter().enumerate() {
            report.summary.total_input += 1;

            let record = match clean(raw, page) {
                Ok(record) => record,
                Err((reason, detail)) => {
                    debug!(page = page, index = index, reason = %reason, "{}", detail);
                    report.summary.record(Rejection {
                        page,
                        index,
                        reason,
                        detail,
                    });
                    continue;
                }
            };

            if seen_ids.contains(&record.item_id) || seen_urls.contains(&record.url) {
                report.summary.record(Rejection {
                    page,
                    index,
                    reason: RejectionReason::Duplicate,
                    detail: format!("duplicate item {}", record.item_id),
                });
                continue;
            }

            seen_ids.insert(record.item_id.clone());
            seen_urls.insert(record.url.clone());
            report.records.push(record);
        }

        report.summary.accepted = report.records.len();
        if report.summary.rejected() > 0 {
            info!(
                total = report.summary.total_input,
                accepted = report.summary.accepted,
                missing_field = report.summary.missing_field,
                duplicate = report.summary.duplicate,
                invalid_field = report.summary.invalid_field,
                "Dropped listings during validation"
            );
        }
        crate::metrics::record_rejections(&report.summary);
        report
    }
}

fn clean(raw: RawListing, page: u32) -> Result<ScrapedRecord, (RejectionReason, String)> {
    let title = non_empty(raw.title);
    let url = non_empty(raw.url);
    let item_id = non_empty(raw.item_id);

    let missing: Vec<&str> = [
        ("title", title.is_none()),
        ("url", url.is_none()),
        ("item_id", item_id.is_none()),
    ]
    .iter()
    .filter(|(_, absent)| *absent)
    .map(|(name, _)| *name)
    .collect();

    let (Some(title), Some(url), Some(item_id)) = (title, url, item_id) else {
        return Err((
            RejectionReason::MissingField,
            format!("missing required field(s): {}", missing.join(", ")),
        ));
    };

    let title_chars = title.chars().count();
    if !(MIN_TITLE_CHARS..=MAX_TITLE_CHARS).contains(&title_chars) {
        return Err((
            RejectionReason::InvalidField,
            format!("title length {title_chars} outside {MIN_TITLE_CHARS}..={MAX_TITLE_CHARS}"),
        ));
    }

    let url = normalize_url(&url)
        .filter(|u| is_product_url(u))
        .ok_or_else(|| (RejectionReason::InvalidField, format!("not a product url: {url}")))?;

    if !is_item_id(&item_id) {
        return Err((
            RejectionReason::InvalidField,
            format!("malformed item id: {item_id}"),
        ));
    }

    let mut record = ScrapedRecord {
        title,
        url,
        item_id,
        image_url: non_empty(raw.image_url),
        price: raw.price.as_deref().and_then(parse_price),
        currency: non_empty(raw.currency),
        marketplace: non_empty(raw.marketplace),
        brand: non_empty(raw.brand),
        upc: non_empty(raw.upc),
        seller_name: non_empty(raw.seller_name),
        seller_url: non_empty(raw.seller_url),
        seller_business_name: non_empty(raw.seller_business_name),
        seller_address: non_empty(raw.seller_address),
        seller_email: non_empty(raw.seller_email),
        seller_phone: non_empty(raw.seller_phone),
        quality_score: 0.0,
        completeness_score: 0.0,
        source_page: page,
    };
    record.quality_score = quality_score(&record);
    record.completeness_score = completeness_score(&record);
    Ok(record)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Strip query string and fragment. Returns `None` for anything that is not an http(s) url.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = url::Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return None;
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

/// Whether `url` is an http(s) product page (`/p/...`) on one of [`LISTING_HOSTS`].
pub fn is_product_url(url: &str) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };
    let on_site = parsed
        .host_str()
        .is_some_and(|host| LISTING_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h)));
    matches!(parsed.scheme(), "http" | "https") && on_site && parsed.path().starts_with("/p/")
}

/// Whether `id` is all digits and at least [`MIN_ITEM_ID_DIGITS`] long.
pub fn is_item_id(id: &str) -> bool {
    id.len() >= MIN_ITEM_ID_DIGITS && id.bytes().all(|b| b.is_ascii_digit())
}

/// Catalog number embedded in a product url (`.../-/A-12345678`), if any.
pub fn item_id_from_url(url: &str) -> Option<String> {
    let (_, rest) = url.split_once(ITEM_ID_MARKER)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Parse a display price such as `"$1,299.99"` or `"$10.00 - $15.00"` (lower bound).
pub fn parse_price(raw: &str) -> Option<Decimal> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let number: String = raw[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    let price = Decimal::from_str(number.trim_end_matches('.')).ok()?;
    (price >= Decimal::ZERO).then_some(price)
}

/// Weighted presence of commercially relevant fields, in `[0, 1]`.
pub fn quality_score(record: &ScrapedRecord) -> f64 {
    let weighted = [
        (record.price.is_some(), W_PRICE),
        (record.image_url.is_some(), W_IMAGE),
        (record.seller_name.is_some(), W_SELLER_NAME),
        (record.seller_url.is_some(), W_SELLER_URL),
        (record.brand.is_some(), W_BRAND),
        (record.currency.is_some(), W_CURRENCY),
        (record.marketplace.is_some(), W_MARKETPLACE),
    ];
    let score: f64 = weighted
        .iter()
        .filter(|(present, _)| *present)
        .map(|(_, weight)| weight)
        .sum();
    score.clamp(0.0, 1.0)
}

/// Fraction of optional fields present, in `[0, 1]`.
pub fn completeness_score(record: &ScrapedRecord) -> f64 {
    let present = [
        record.image_url.is_some(),
        record.price.is_some(),
        record.currency.is_some(),
        record.marketplace.is_some(),
        record.brand.is_some(),
        record.upc.is_some(),
        record.seller_name.is_some(),
        record.seller_url.is_some(),
        record.seller_business_name.is_some(),
        record.seller_address.is_some(),
        record.seller_email.is_some(),
        record.seller_phone.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();
    (present as f64 / OPTIONAL_FIELD_COUNT).clamp(0.0, 1.0)
}
