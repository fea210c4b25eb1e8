use std::path::{Path, PathBuf};

use ccal_adapters::{extract_listing, normalize_batch, ExtractError, SectionLocator};
use ccal_core::ContestKind;

fn fixture(relative: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(relative);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[test]
fn upcoming_page_reads_only_the_upcoming_section() {
    let html = fixture("upcoming/contests.html");
    let page = extract_listing(
        &html,
        &SectionLocator::for_kind(ContestKind::Upcoming),
        "https://atcoder.jp/contests/?lang=en",
    )
    .unwrap();

    let ids = page
        .rows
        .records
        .iter()
        .map(|r| r.identifier.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["agc028", "abc100", "hokudai-hitachi2018"]);
    assert_eq!(page.rows.records[1].title, "ABC 100");
    assert_eq!(page.rows.records[1].start_time_text, "2018-09-22 21:00:00+0900");
    assert_eq!(page.rows.issues.len(), 1);
    assert_eq!(page.rows.issues[0].error, ExtractError::RowShape { row: 4, cells: 1 });
    assert_eq!(page.page_count, 1);

    let batch = normalize_batch(&page.rows.records);
    let ordered = batch.contests.iter().map(|c| c.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ordered, vec!["abc100", "agc028", "hokudai-hitachi2018"]);
    assert_eq!(batch.contests[0].start_time, 1_537_617_600);
    assert_eq!(batch.contests[0].duration, 6000);
    assert_eq!(batch.contests[2].duration, 240 * 3600);
    assert_eq!(batch.contests[2].rated_range, "-");
    assert!(batch.failures.is_empty());
}

#[test]
fn archive_pages_use_first_table_and_advertise_page_count() {
    let first = extract_listing(
        &fixture("archive/page-1.html"),
        &SectionLocator::FirstTable,
        "https://atcoder.jp/contests/archive?lang=en",
    )
    .unwrap();
    assert_eq!(first.page_count, 3);
    assert_eq!(first.rows.records.len(), 2);
    assert_eq!(first.rows.records[0].rated_range_text, "- 2799");

    let second = extract_listing(
        &fixture("archive/page-2.html"),
        &SectionLocator::FirstTable,
        "https://atcoder.jp/contests/archive?lang=en&page=2",
    )
    .unwrap();
    let ids = second
        .rows
        .records
        .iter()
        .map(|r| r.identifier.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["abc108", "abc107"]);
    assert_eq!(second.rows.issues[0].error, ExtractError::RowShape { row: 3, cells: 3 });
}

#[test]
fn archive_page_has_no_upcoming_heading() {
    let err = extract_listing(
        &fixture("archive/page-1.html"),
        &SectionLocator::upcoming(),
        "https://atcoder.jp/contests/archive?lang=en",
    )
    .unwrap_err();
    assert!(matches!(err, ExtractError::SectionNotFound { .. }));
}
