use std::io::Write;

use pretty_assertions::assert_eq;
use scanx_pagemap::{Document, DocumentId, IgnoreConfig, IgnoreRegistry, InputError};
use tempfile::NamedTempFile;

mod common;

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn registry_file_is_looked_up_by_stem_or_doc_id() {
    common::setup();
    let file = write_temp(
        r#"{
            "documents": [
                {"pdf_name": "doc_7.pdf", "total_pages": 38, "ignore_pages": [3, 38],
                 "notes": "receipt pasted on page 3"},
                {"pdf_name": "scan-0012.pdf", "doc_id": "42", "ignore_pages": [1]}
            ]
        }"#,
    );
    let registry = IgnoreRegistry::from_file(file.path()).unwrap();
    assert_eq!(registry.len(), 2);

    let entry = registry.lookup("doc_7").unwrap();
    assert_eq!(entry.total_pages, Some(38));
    assert_eq!(entry.ignore_pages.iter().copied().collect::<Vec<_>>(), vec![3, 38]);
    assert!(registry.lookup("doc_7.pdf").is_some());
    assert_eq!(registry.lookup("42").unwrap().pdf_name, "scan-0012.pdf");
    assert!(registry.lookup("doc_8").is_none());
}

#[test]
fn single_entry_file_is_accepted() {
    let file = write_temp(r#"{"pdf_name": "a.pdf", "ignore_pages": [2]}"#);
    let registry = IgnoreRegistry::from_file(file.path()).unwrap();
    assert_eq!(registry.len(), 1);
    assert!(registry.lookup("a").is_some());
}

#[test]
fn empty_file_means_nothing_to_ignore() {
    let file = write_temp("  \n");
    let registry = IgnoreRegistry::from_file(file.path()).unwrap();
    assert!(registry.is_empty());
}

#[test]
fn malformed_registry_is_an_input_error() {
    let file = write_temp("{\"documents\": [");
    assert!(matches!(
        IgnoreRegistry::from_file(file.path()),
        Err(InputError::Json { .. })
    ));
    assert!(matches!(
        IgnoreRegistry::from_file("/nonexistent/ignore.json"),
        Err(InputError::Io { .. })
    ));
}

#[test]
fn apply_marks_pages_and_fills_gaps() {
    let mut doc = common::document_from_slots("doc", &[1, 2, 3, 4, 5]);
    // OCR lost page 4
    doc.pages.retain(|p| p.page_number != 4);

    let config = IgnoreConfig::new("doc.pdf", [2, 9]).with_total_pages(6);
    let outcome = config.apply(&mut doc);

    assert_eq!(outcome.ignored, vec![2]);
    assert_eq!(outcome.placeholders, vec![4, 6]);
    assert_eq!(outcome.out_of_range, vec![9]);

    let numbers: Vec<u32> = doc.pages.iter().map(|p| p.page_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    for page in &doc.pages {
        let expect_ignored = matches!(page.page_number, 2 | 4 | 6);
        assert_eq!(page.ignored, expect_ignored, "page {}", page.page_number);
        if page.ignored {
            assert!(page.lines.is_empty());
        }
    }
}

#[test]
fn page_zero_is_out_of_range() {
    let mut doc = Document::new(DocumentId::new("doc"), Vec::new());
    let outcome = IgnoreConfig::new("doc.pdf", [0]).apply(&mut doc);
    assert_eq!(outcome.out_of_range, vec![0]);
    assert!(doc.pages.is_empty());
}
