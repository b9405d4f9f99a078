//! CSV writer using the marketplace listing column layout

use crate::ScrapedRecord;
use csv::{Writer, WriterBuilder};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::{debug, info};

use super::{ListingWriter, OutputError, OutputResult, OutputWriter};

const DEFAULT_BUFFER_SIZE: usize = 8192; // 8KB buffer

/// One CSV row. Columns marked `*` are mandatory in the marketplace import format.
#[derive(Debug, Serialize)]
struct ListingRow<'a> {
    #[serde(rename = "Listing Title*")]
    title: &'a str,
    #[serde(rename = "Listings URL*")]
    url: &'a str,
    #[serde(rename = "Image URL*")]
    image_url: &'a str,
    #[serde(rename = "Marketplace*")]
    marketplace: &'a str,
    #[serde(rename = "Price*")]
    price: String,
    #[serde(rename = "Shipping")]
    shipping: &'a str,
    #[serde(rename = "Units Available")]
    units_available: &'a str,
    #[serde(rename = "Item Number")]
    item_number: &'a str,
    #[serde(rename = "Brand")]
    brand: &'a str,
    #[serde(rename = "ASIN")]
    asin: &'a str,
    #[serde(rename = "UPC")]
    upc: &'a str,
    #[serde(rename = "Walmart ID")]
    walmart_id: &'a str,
    #[serde(rename = "Seller's Name*")]
    seller_name: &'a str,
    #[serde(rename = "Seller's URL*")]
    seller_url: &'a str,
    #[serde(rename = "Seller's Business Name")]
    seller_business_name: &'a str,
    #[serde(rename = "Seller's Address")]
    seller_address: &'a str,
    #[serde(rename = "Seller's Email")]
    seller_email: &'a str,
    #[serde(rename = "Seller's Phone Number")]
    seller_phone: &'a str,
}

impl<'a> From<&'a ScrapedRecord> for ListingRow<'a> {
    fn from(record: &'a ScrapedRecord) -> Self {
        let text = |value: &'a Option<String>| value.as_deref().unwrap_or("");
        Self {
            title: &record.title,
            url: &record.url,
            image_url: text(&record.image_url),
            marketplace: text(&record.marketplace),
            price: record
                .price
                .map(|p| format!("${:.2}", p))
                .unwrap_or_default(),
            shipping: "",
            units_available: "",
            item_number: &record.item_id,
            brand: text(&record.brand),
            asin: "",
            upc: text(&record.upc),
            walmart_id: "",
            seller_name: text(&record.seller_name),
            seller_url: text(&record.seller_url),
            seller_business_name: text(&record.seller_business_name),
            seller_address: text(&record.seller_address),
            seller_email: text(&record.seller_email),
            seller_phone: text(&record.seller_phone),
        }
    }
}

/// CSV writer for validated listings
pub struct CsvListingWriter {
    writer: Writer<BufWriter<File>>,
    records_written: u64,
}

impl CsvListingWriter {
    /// Create a new CSV listing writer
    pub fn new<P: AsRef<Path>>(path: P) -> OutputResult<Self> {
        Self::new_with_buffer_size(path, DEFAULT_BUFFER_SIZE)
    }

    /// Create a new CSV listing writer with a custom buffer size
    pub fn new_with_buffer_size<P: AsRef<Path>>(
        path: P,
        buffer_size: usize,
    ) -> OutputResult<Self> {
        let path = path.as_ref();
        info!("Creating CSV writer: path={}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OutputError::IoError(format!("Failed to create directory: {}", e)))?;
        }

        let file = File::create(path)
            .map_err(|e| OutputError::IoError(format!("Failed to create file: {}", e)))?;

        let buf_writer = BufWriter::with_capacity(buffer_size, file);
        let mut csv_writer = WriterBuilder::new()
            .has_headers(false)
            .from_writer(buf_writer);

        // Header is written up front so an empty result still yields a valid file
        csv_writer
            .write_record(COLUMNS)
            .map_err(|e| OutputError::CsvError(format!("Failed to write header: {}", e)))?;

        Ok(Self {
            writer: csv_writer,
            records_written: 0,
        })
    }

    /// Number of listings written so far
    pub fn records_written(&self) -> u64 {
        self.records_written
    }
}

/// Column headers in file order
pub const COLUMNS: [&str; 18] = [
    "Listing Title*",
    "Listings URL*",
    "Image URL*",
    "Marketplace*",
    "Price*",
    "Shipping",
    "Units Available",
    "Item Number",
    "Brand",
    "ASIN",
    "UPC",
    "Walmart ID",
    "Seller's Name*",
    "Seller's URL*",
    "Seller's Business Name",
    "Seller's Address",
    "Seller's Email",
    "Seller's Phone Number",
];

impl ListingWriter for CsvListingWriter {
    fn write_record(&mut self, record: &ScrapedRecord) -> OutputResult<()> {
        let row = ListingRow::from(record);
        self.writer
            .serialize(&row)
            .map_err(|e| OutputError::CsvError(format!("Failed to write listing: {}", e)))?;
        self.records_written += 1;
        Ok(())
    }
}

impl OutputWriter for CsvListingWriter {
    fn flush(&mut self) -> OutputResult<()> {
        self.writer
            .flush()
            .map_err(|e| OutputError::FlushError(format!("Failed to flush: {}", e)))
    }

    fn close(mut self) -> OutputResult<()> {
        debug!("Closing CSV writer: {} listings written", self.records_written);
        self.flush()?;

        let buf_writer = self.writer.into_inner().map_err(|e| {
            OutputError::IoError(format!("Failed to get inner writer: {}", e))
        })?;
        let file = buf_writer.into_inner().map_err(|e| {
            OutputError::IoError(format!("Failed to get file handle: {}", e))
        })?;
        file.sync_all()
            .map_err(|e| OutputError::IoError(format!("Failed to sync file: {}", e)))?;

        info!("CSV writer closed successfully: {} listings written", self.records_written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use tempfile::tempdir;

    fn record(id: &str) -> ScrapedRecord {
        ScrapedRecord {
            title: format!("Desk Lamp {id}"),
            url: format!("https://shop.example.com/p/{id}"),
            item_id: id.to_string(),
            image_url: Some("https://img.example.com/lamp.jpg".to_string()),
            price: Some(Decimal::from_str("24.5").unwrap()),
            currency: Some("USD".to_string()),
            marketplace: Some("Target".to_string()),
            brand: None,
            upc: None,
            seller_name: Some("Target".to_string()),
            seller_url: None,
            seller_business_name: None,
            seller_address: None,
            seller_email: None,
            seller_phone: None,
            quality_score: 0.8,
            completeness_score: 0.5,
            source_page: 1,
        }
    }

    #[test]
    fn test_csv_listing_writer_writes_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lamp_PRODUCTS.csv");

        let mut writer = CsvListingWriter::new(&path).unwrap();
        writer.write_records(&[record("1001"), record("1002")]).unwrap();
        assert_eq!(writer.records_written(), 2);
        writer.close().unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, COLUMNS);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "Desk Lamp 1001");
        assert_eq!(&rows[0][4], "$24.50");
        assert_eq!(&rows[0][7], "1001");
        assert_eq!(&rows[1][8], "");
    }

    #[test]
    fn test_empty_result_has_header_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("empty_PRODUCTS.csv");

        CsvListingWriter::new(&path).unwrap().close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.starts_with("Listing Title*,Listings URL*"));
    }
}
