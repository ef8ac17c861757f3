mod common;

use chrono::Utc;
use settlement_queue::interfaces::csv::transaction_reader::TransactionReader;
use std::fs::File;
use tempfile::tempdir;

#[test]
fn test_generate_simple_csv() {
    let dir = tempdir().unwrap();
    let output_path = dir.path().join("generated.csv");
    common::generate_csv(&output_path, 5).expect("Failed to generate CSV");

    let content = std::fs::read_to_string(&output_path).expect("Failed to read file");
    // Header + 5 rows
    assert_eq!(content.lines().count(), 6);
}

#[test]
fn test_generated_rows_parse() {
    let dir = tempdir().unwrap();
    let output_path = dir.path().join("generated.csv");
    common::generate_csv(&output_path, 500).expect("Failed to generate CSV");

    let reader = TransactionReader::new(File::open(&output_path).unwrap());
    let requests: Vec<_> = reader.requests(Utc::now()).collect();
    assert_eq!(requests.len(), 500);
    assert!(requests.iter().all(|request| request.is_ok()));
}
