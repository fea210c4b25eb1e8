//! Listing-page extraction: locating the contest table, reading its rows and normalizing
//! the free-text cells into canonical contest records.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use ccal_core::{
    ContestKind, ContestRecord, RawContestRecord, CONTEST_PATH_PREFIX, SOURCE_UTC_OFFSET_SECS,
    UPCOMING_SECTION_LABEL,
};
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use url::Url;

pub const CRATE_NAME: &str = "ccal-adapters";

/// Heading level the upcoming-contests label is rendered with.
pub const SECTION_HEADING_LEVEL: &str = "h3";

const PAGINATION_LINKS: &str = "ul.pagination a[href]";
const PAGE_QUERY_PARAM: &str = "page";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("no contest section found ({locator})")]
    SectionNotFound { locator: String },
    #[error("row {row} has {cells} cells, expected at least 4")]
    RowShape { row: usize, cells: usize },
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("malformed duration `{text}`")]
    MalformedDuration { text: String },
    #[error("malformed start time `{text}`")]
    MalformedTimestamp { text: String },
    #[error("contest `{title}` has no identifier")]
    MissingIdentifier { title: String },
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn normalized_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Duration / local time
// ---------------------------------------------------------------------------

fn all_ascii_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parses `H:MM` / `HH:MM` into seconds. Hours are unbounded, minutes must be `00..=59`.
pub fn parse_duration(text: &str) -> Result<i64, NormalizeError> {
    let malformed = || NormalizeError::MalformedDuration {
        text: text.to_string(),
    };

    let (hours, minutes) = text.split_once(':').ok_or_else(malformed)?;
    if !all_ascii_digits(hours) || minutes.len() != 2 || !all_ascii_digits(minutes) {
        return Err(malformed());
    }
    let hours: i64 = hours.parse().map_err(|_| malformed())?;
    let minutes: i64 = minutes.parse().map_err(|_| malformed())?;
    if minutes >= 60 {
        return Err(malformed());
    }

    hours
        .checked_mul(3600)
        .and_then(|h| h.checked_add(minutes * 60))
        .ok_or_else(malformed)
}

pub fn source_offset() -> Option<FixedOffset> {
    FixedOffset::east_opt(SOURCE_UTC_OFFSET_SECS)
}

/// Parses the listing's `YYYY-MM-DD HH:MM:SS+ZZZZ` start time into epoch seconds.
///
/// Only the leading `YYYY-MM-DD HH:MM` is read. The wall clock is always taken to be in
/// the source zone (UTC+9); the printed offset and seconds are ignored.
pub fn parse_local_time(text: &str) -> Result<i64, NormalizeError> {
    let malformed = || NormalizeError::MalformedTimestamp {
        text: text.to_string(),
    };

    let head = text.get(..16).ok_or_else(malformed)?;
    let field = |range: Range<usize>| -> Result<u32, NormalizeError> {
        let digits = head.get(range).ok_or_else(malformed)?;
        if !all_ascii_digits(digits) {
            return Err(malformed());
        }
        digits.parse().map_err(|_| malformed())
    };

    let year = field(0..4)? as i32;
    let month = field(5..7)?;
    let day = field(8..10)?;
    let hour = field(11..13)?;
    let minute = field(14..16)?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .ok_or_else(malformed)?;
    let offset = source_offset().ok_or_else(malformed)?;
    let start = offset
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(malformed)?;
    Ok(start.timestamp())
}

/// Renders epoch seconds the way the listing prints them, e.g. `2018-09-22 21:00:00+0900`.
pub fn format_local_time(epoch_seconds: i64) -> Option<String> {
    let offset = source_offset()?;
    let instant = DateTime::from_timestamp(epoch_seconds, 0)?;
    Some(
        instant
            .with_timezone(&offset)
            .format("%Y-%m-%d %H:%M:%S%z")
            .to_string(),
    )
}

// ---------------------------------------------------------------------------
// Section location
// ---------------------------------------------------------------------------

/// How to find the table-bearing container inside a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum SectionLocator {
    /// The element right after the heading whose text equals `label`.
    Heading { level: String, label: String },
    /// The first table anywhere in the document (archive pages).
    FirstTable,
}

impl SectionLocator {
    pub fn upcoming() -> Self {
        SectionLocator::Heading {
            level: SECTION_HEADING_LEVEL.to_string(),
            label: UPCOMING_SECTION_LABEL.to_string(),
        }
    }

    pub fn for_kind(kind: ContestKind) -> Self {
        match kind {
            ContestKind::Upcoming => Self::upcoming(),
            ContestKind::Archive => SectionLocator::FirstTable,
        }
    }
}

impl fmt::Display for SectionLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionLocator::Heading { level, label } => write!(f, "<{level}> heading `{label}`"),
            SectionLocator::FirstTable => f.write_str("first table"),
        }
    }
}

/// Returns the container the locator points at, or `None` when the page has no such section.
pub fn locate_section<'a>(
    document: &'a Html,
    locator: &SectionLocator,
) -> Result<Option<ElementRef<'a>>, ExtractError> {
    match locator {
        SectionLocator::Heading { level, label } => {
            let headings = selector(level)?;
            let wanted = label.trim();
            Ok(document
                .select(&headings)
                .find(|heading| normalized_text(*heading) == wanted)
                .and_then(|heading| heading.next_siblings().find_map(ElementRef::wrap)))
        }
        SectionLocator::FirstTable => {
            let tables = selector("table")?;
            Ok(document.select(&tables).next())
        }
    }
}

pub fn require_section<'a>(
    document: &'a Html,
    locator: &SectionLocator,
) -> Result<ElementRef<'a>, ExtractError> {
    locate_section(document, locator)?.ok_or_else(|| ExtractError::SectionNotFound {
        locator: locator.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Row extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIssue {
    /// 1-based position among the table body rows.
    pub row: usize,
    pub error: ExtractError,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedRows {
    pub records: Vec<RawContestRecord>,
    pub issues: Vec<RowIssue>,
}

/// Strips [`CONTEST_PATH_PREFIX`] from a contest link, keeping the first path segment after it.
/// Links that are not contest links yield an empty identifier.
pub fn contest_identifier(href: &str) -> String {
    let href = href.trim();
    let absolute_path;
    let path = match Url::parse(href) {
        Ok(url) => {
            absolute_path = url.path().to_string();
            absolute_path.as_str()
        }
        Err(_) => href,
    };

    let Some(rest) = path.strip_prefix(CONTEST_PATH_PREFIX) else {
        return String::new();
    };
    rest.split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Reads every body row of `container` as (start time, title, duration, rated range).
///
/// Rows with fewer than four cells are skipped and reported; the remaining rows are kept.
pub fn extract_rows(container: ElementRef<'_>) -> Result<ExtractedRows, ExtractError> {
    let rows = selector("tbody > tr")?;
    let links = selector("a[href]")?;
    let mut out = ExtractedRows::default();

    for (idx, row) in container.select(&rows).enumerate() {
        let row_no = idx + 1;
        let cells = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|cell| cell.value().name() == "td")
            .collect::<Vec<_>>();

        if cells.len() < 4 {
            warn!(row = row_no, cells = cells.len(), "skipping listing row with unexpected shape");
            out.issues.push(RowIssue {
                row: row_no,
                error: ExtractError::RowShape {
                    row: row_no,
                    cells: cells.len(),
                },
            });
            continue;
        }

        let title_link = cells[1].select(&links).next();
        let identifier = title_link
            .and_then(|a| a.value().attr("href"))
            .map(contest_identifier)
            .unwrap_or_default();
        let title = title_link
            .map(normalized_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| normalized_text(cells[1]));

        out.records.push(RawContestRecord {
            identifier,
            title,
            start_time_text: normalized_text(cells[0]),
            duration_text: normalized_text(cells[2]),
            rated_range_text: normalized_text(cells[3]),
        });
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// Pagination controls
// ---------------------------------------------------------------------------

/// Largest `page=N` advertised by the pagination links, or 1 when there are none.
pub fn page_count(document: &Html, base_url: &str) -> Result<usize, ExtractError> {
    let links = selector(PAGINATION_LINKS)?;
    let base = Url::parse(base_url).ok();

    let max_page = document
        .select(&links)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| match &base {
            Some(base) => base.join(href).ok(),
            None => Url::parse(href).ok(),
        })
        .filter_map(|url| {
            url.query_pairs()
                .find(|(key, _)| key == PAGE_QUERY_PARAM)
                .and_then(|(_, value)| value.parse::<usize>().ok())
        })
        .filter(|page| *page > 0)
        .max();

    Ok(max_page.unwrap_or(1))
}

/// Everything one fetched listing page yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingPage {
    pub rows: ExtractedRows,
    pub page_count: usize,
}

/// Parses `html`, locates the contest section and reads its rows and pagination controls.
pub fn extract_listing(
    html: &str,
    locator: &SectionLocator,
    page_url: &str,
) -> Result<ListingPage, ExtractError> {
    let document = Html::parse_document(html);
    let section = require_section(&document, locator)?;
    let rows = extract_rows(section)?;
    let page_count = page_count(&document, page_url)?;
    Ok(ListingPage { rows, page_count })
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

pub fn normalize_record(raw: &RawContestRecord) -> Result<ContestRecord, NormalizeError> {
    if raw.identifier.trim().is_empty() {
        return Err(NormalizeError::MissingIdentifier {
            title: raw.title.clone(),
        });
    }
    let duration = parse_duration(&raw.duration_text)?;
    let start_time = parse_local_time(&raw.start_time_text)?;

    Ok(ContestRecord {
        id: raw.identifier.trim().to_string(),
        title: raw.title.clone(),
        start_time,
        duration,
        rated_range: raw.rated_range_text.clone(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    /// Position of the raw record in the batch input.
    pub index: usize,
    pub identifier: String,
    pub error: NormalizeError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateRecord {
    pub identifier: String,
    pub first_index: usize,
    pub duplicate_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NormalizedBatch {
    /// Sorted ascending by start time; ties keep input order.
    pub contests: Vec<ContestRecord>,
    pub failures: Vec<RecordFailure>,
    pub duplicates: Vec<DuplicateRecord>,
}

/// Normalizes a whole crawl. Bad records and repeated identifiers are reported, not fatal.
pub fn normalize_batch(raws: &[RawContestRecord]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, raw) in raws.iter().enumerate() {
        let contest = match normalize_record(raw) {
            Ok(contest) => contest,
            Err(error) => {
                warn!(index, identifier = %raw.identifier, %error, "dropping contest row");
                batch.failures.push(RecordFailure {
                    index,
                    identifier: raw.identifier.clone(),
                    error,
                });
                continue;
            }
        };

        if let Some(&first_index) = seen.get(&contest.id) {
            warn!(identifier = %contest.id, first_index, index, "duplicate contest identifier");
            batch.duplicates.push(DuplicateRecord {
                identifier: contest.id,
                first_index,
                duplicate_index: index,
            });
            continue;
        }
        seen.insert(contest.id.clone(), index);
        batch.contests.push(contest);
    }

    batch.contests.sort_by_key(|c| c.start_time);
    batch
}
