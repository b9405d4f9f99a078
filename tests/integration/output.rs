//! Writing finished jobs to result files

use crate::support::{listings, test_config, ScriptedUpstream};
use listing_scraper::output::csv::COLUMNS;
use listing_scraper::output::{
    write_json_report, CsvListingWriter, JsonReport, ListingWriter, OutputFormat,
    OutputPathBuilder, OutputWriter,
};
use listing_scraper::Orchestrator;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_completed_job_written_as_csv() {
    let mut page = listings(1, 3);
    page[0].price = Some("$1,299.5".to_string());
    page[0].seller_name = Some("Target".to_string());

    let orchestrator =
        Orchestrator::new(test_config(), Arc::new(ScriptedUpstream::new(vec![page]))).unwrap();
    let job_id = orchestrator.submit_job("Desk Lamp (LED)", 1).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();
    let records = orchestrator.fetch_results(job_id).await.unwrap();

    let dir = tempdir().unwrap();
    let path = OutputPathBuilder::new(dir.path().to_path_buf(), &status.keyword)
        .build()
        .unwrap();
    assert_eq!(path.file_name().unwrap(), "desk_lamp_led_PRODUCTS.csv");

    let mut writer = CsvListingWriter::new(&path).unwrap();
    writer.write_records(&records).unwrap();
    writer.close().unwrap();

    let mut reader = csv::Reader::from_path(&path).unwrap();
    assert_eq!(reader.headers().unwrap().len(), COLUMNS.len());
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 3);
    assert_eq!(&rows[0][4], "$1299.50");
    assert_eq!(&rows[0][12], "Target");
    // Urls are written in canonical form
    assert!(!rows[0][1].contains('?'));
}

#[tokio::test]
async fn test_json_report_carries_rejections() {
    let mut page = listings(1, 2);
    page.push(page[0].clone());

    let orchestrator =
        Orchestrator::new(test_config(), Arc::new(ScriptedUpstream::new(vec![page]))).unwrap();
    let job_id = orchestrator.submit_job("desk lamp", 1).await.unwrap();
    let status = orchestrator.wait_for_terminal(job_id).await.unwrap();
    let records = orchestrator.fetch_results(job_id).await.unwrap();

    let dir = tempdir().unwrap();
    let path = OutputPathBuilder::new(dir.path().to_path_buf(), &status.keyword)
        .with_format(OutputFormat::Json)
        .build()
        .unwrap();
    let report = JsonReport::new(
        job_id,
        &status.keyword,
        status.state,
        records.to_vec(),
        status.rejection_summary.clone(),
    );
    write_json_report(&path, &report).unwrap();

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["record_count"], 2);
    assert_eq!(value["state"], "completed");
    assert_eq!(value["rejection_summary"]["duplicate"], 1);
    assert_eq!(value["records"].as_array().unwrap().len(), 2);
}
