//! Integration tests for items-list and credentials parsing.

use archive_batch_downloader::auth::{AuthError, Credentials};
use archive_batch_downloader::input::{load_identifiers, InputError};
use std::io::Write;
use tempfile::NamedTempFile;

fn temp_file_with(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_plain_text_items_file() {
    let file = temp_file_with(
        ".txt",
        "# favorites\ngreat-78s\n\nnight-of-the-living-dead\n  prelinger-0001  \n",
    );
    let identifiers = load_identifiers(file.path()).unwrap();
    assert_eq!(
        identifiers,
        vec!["great-78s", "night-of-the-living-dead", "prelinger-0001"]
    );
}

#[test]
fn test_csv_items_file_with_header() {
    let file = temp_file_with(
        ".csv",
        "title,identifier,year\nGrateful 78s,great-78s,1922\nNOTLD,night-of-the-living-dead,1968\n",
    );
    let identifiers = load_identifiers(file.path()).unwrap();
    assert_eq!(identifiers, vec!["great-78s", "night-of-the-living-dead"]);
}

#[test]
fn test_csv_without_identifier_column_rejected() {
    let file = temp_file_with(".csv", "title,year\nGrateful 78s,1922\n");
    assert!(matches!(
        load_identifiers(file.path()),
        Err(InputError::MissingIdentifierColumn)
    ));
}

#[test]
fn test_missing_items_file_rejected() {
    let missing = std::path::Path::new("/nonexistent/items.txt");
    assert!(matches!(
        load_identifiers(missing),
        Err(InputError::Unreadable(_))
    ));
}

#[test]
fn test_credentials_file_round_trip() {
    let file = temp_file_with(
        "",
        "# archive keys\nS3_ACCESS_KEY=AKIAEXAMPLE\nS3_SECRET_KEY=hunter2\n",
    );
    let creds = Credentials::load(file.path()).unwrap();
    assert_eq!(creds.authorization_header(), "LOW AKIAEXAMPLE:hunter2");
}

#[test]
fn test_credentials_missing_key_rejected() {
    let file = temp_file_with("", "S3_SECRET_KEY=hunter2\n");
    assert!(matches!(
        Credentials::load(file.path()),
        Err(AuthError::MissingKeys)
    ));
}
