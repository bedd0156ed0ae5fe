use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

use crate::config::{HtmlRules, Ruleset};
use crate::util::{canonicalize_url, clean_text, truncate_chars, MAX_SUMMARY_CHARS};

const LWN_HEADER: &str = "This is the LWN.net text headlines file.";
const LWN_SEPARATOR: &str = "&&";
const LWN_BLOCK_LINES: usize = 3;

/// Page-level failures. Record-level problems are [`RecordSkipped`] instead.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty payload")]
    Empty,
    #[error("Payload is not HTML: {0}")]
    NotHtml(String),
    #[error("Unrecoverable page structure: {0}")]
    Structural(String),
}

/// A record that failed required-field extraction. Counted, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("record skipped: {reason}")]
pub struct RecordSkipped {
    pub reason: String,
}

impl RecordSkipped {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A validated article candidate ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateArticle {
    /// Canonical absolute URL
    pub url: Url,
    pub title: String,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub category: Option<String>,
}

impl CandidateArticle {
    /// The identity used for deduplication
    pub fn natural_key(&self) -> &str {
        self.url.as_str()
    }
}

/// Raw field values as extracted from markup, before validation.
#[derive(Debug, Default)]
struct RawRecord {
    title: Option<String>,
    link: Option<String>,
    date: Option<String>,
    summary: Option<String>,
    category: Option<String>,
    /// Set when the record's shape was already wrong during extraction
    defect: Option<String>,
}

#[derive(Debug, Clone)]
enum DateRule {
    Absent,
    Lwn,
    Html { format: Option<String> },
}

/// The records extracted from one page.
#[derive(Debug)]
pub struct ParsedPage {
    base: Url,
    records: Vec<RawRecord>,
    date_rule: DateRule,
    default_category: Option<String>,
    /// Pagination cursor for the following page, if the page links one
    pub next_cursor: Option<String>,
}

impl ParsedPage {
    /// Validate every extracted record. Each call returns a fresh iterator over
    /// the same records.
    pub fn candidates(&self) -> impl Iterator<Item = Result<CandidateArticle, RecordSkipped>> + '_ {
        self.records.iter().map(move |raw| self.validate(raw))
    }

    /// Number of records found on the page, valid or not
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn validate(&self, raw: &RawRecord) -> Result<CandidateArticle, RecordSkipped> {
        if let Some(defect) = &raw.defect {
            return Err(RecordSkipped::new(defect.clone()));
        }

        let title = raw
            .title
            .as_deref()
            .and_then(clean_text)
            .ok_or_else(|| RecordSkipped::new("missing title"))?;

        let link = raw
            .link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| RecordSkipped::new(format!("missing link for '{title}'")))?;

        let url = canonicalize_url(&self.base, link)
            .map_err(|e| RecordSkipped::new(format!("unusable link '{link}': {e}")))?;

        let published = match &self.date_rule {
            DateRule::Absent => None,
            rule => {
                let raw_date = raw
                    .date
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| RecordSkipped::new(format!("missing date for {url}")))?;
                let parsed = match rule {
                    DateRule::Lwn => parse_lwn_date(raw_date),
                    DateRule::Html { format } => parse_date(raw_date, format.as_deref()),
                    DateRule::Absent => None,
                };
                Some(parsed.ok_or_else(|| {
                    RecordSkipped::new(format!("unparseable date '{raw_date}' for {url}"))
                })?)
            }
        };

        let summary = raw
            .summary
            .as_deref()
            .and_then(clean_text)
            .map(|s| truncate_chars(&s, MAX_SUMMARY_CHARS).into_owned());

        let category = raw
            .category
            .as_deref()
            .and_then(clean_text)
            .or_else(|| self.default_category.clone());

        Ok(CandidateArticle {
            url,
            title,
            published,
            summary,
            category,
        })
    }
}

/// Extract records from one fetched page.
///
/// `base` is the URL the page was fetched from; relative links resolve
/// against it. `default_category` applies to records without a category.
///
/// # Errors
///
/// - [`ParseError::Empty`] - payload is empty or whitespace
/// - [`ParseError::NotHtml`] - html ruleset given non-UTF-8 or markup-free bytes
/// - [`ParseError::Structural`] - lwn_text payload without the expected header
pub fn parse_page(
    bytes: &[u8],
    ruleset: &Ruleset,
    base: &Url,
    default_category: Option<&str>,
) -> Result<ParsedPage, ParseError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let (records, next_cursor, date_rule) = match ruleset {
        Ruleset::LwnText => (parse_lwn_text(bytes)?, None, DateRule::Lwn),
        Ruleset::Html(rules) => {
            let (records, next) = parse_html(bytes, rules)?;
            let date_rule = if rules.date.is_some() {
                DateRule::Html {
                    format: rules.date_format.clone(),
                }
            } else {
                DateRule::Absent
            };
            (records, next, date_rule)
        }
    };

    Ok(ParsedPage {
        base: base.clone(),
        records,
        date_rule,
        default_category: default_category.map(str::to_string),
        next_cursor,
    })
}

// ============================================================================
// LWN text headlines
// ============================================================================

/// Blocks of `headline / url / "Subject, Mon DD, YYYY HH:MM UTC (Day)"`
/// separated by `&&` lines, after a fixed header line.
fn parse_lwn_text(bytes: &[u8]) -> Result<Vec<RawRecord>, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::Structural(format!("headlines file is not UTF-8: {e}")))?;

    let mut lines = text
        .trim_start_matches('\u{feff}')
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .skip_while(|l| l.trim().is_empty());

    match lines.next() {
        Some(first) if first.trim() == LWN_HEADER => {}
        Some(first) => {
            return Err(ParseError::Structural(format!(
                "expected headlines header, got {first:?}"
            )))
        }
        None => return Err(ParseError::Empty),
    }

    let mut records = Vec::new();
    let mut block: Vec<&str> = Vec::with_capacity(LWN_BLOCK_LINES);

    for line in lines {
        if line.trim() == LWN_SEPARATOR {
            if !block.is_empty() {
                records.push(lwn_record(&block));
                block.clear();
            }
        } else if !line.trim().is_empty() {
            block.push(line);
        }
    }
    if !block.is_empty() {
        records.push(lwn_record(&block));
    }

    Ok(records)
}

fn lwn_record(block: &[&str]) -> RawRecord {
    if block.len() != LWN_BLOCK_LINES {
        return RawRecord {
            defect: Some(format!(
                "headline block has {} lines, expected {LWN_BLOCK_LINES}: {:?}",
                block.len(),
                block.first().copied().unwrap_or_default()
            )),
            ..Default::default()
        };
    }

    let (category, date) = match block[2].split_once(", ") {
        Some((subject, date)) => (Some(subject.to_string()), Some(date.to_string())),
        None => (None, None),
    };

    RawRecord {
        title: Some(block[0].to_string()),
        link: Some(block[1].to_string()),
        date,
        category,
        ..Default::default()
    }
}

/// Parses `Oct 10, 2024 14:13 UTC (Thu)`.
fn parse_lwn_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let s = match s.rfind(" (") {
        Some(i) if s.ends_with(')') => &s[..i],
        _ => s,
    };
    let s = s.trim_end_matches("UTC").trim_end();
    NaiveDateTime::parse_from_str(s, "%b %d, %Y %H:%M")
        .ok()
        .map(|n| n.and_utc())
}

// ============================================================================
// HTML listing pages
// ============================================================================

struct CompiledRules {
    item: Selector,
    title: Selector,
    link: Selector,
    date: Option<Selector>,
    summary: Option<Selector>,
    category: Option<Selector>,
    next_page: Option<Selector>,
}

fn compile(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector)
        .map_err(|e| ParseError::Structural(format!("invalid selector '{selector}': {e}")))
}

fn compile_opt(selector: Option<&str>) -> Result<Option<Selector>, ParseError> {
    selector.map(compile).transpose()
}

impl CompiledRules {
    fn new(rules: &HtmlRules) -> Result<Self, ParseError> {
        Ok(Self {
            item: compile(&rules.item)?,
            title: compile(&rules.title)?,
            link: compile(&rules.link)?,
            date: compile_opt(rules.date.as_deref())?,
            summary: compile_opt(rules.summary.as_deref())?,
            category: compile_opt(rules.category.as_deref())?,
            next_page: compile_opt(rules.next_page.as_deref())?,
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ")
}

fn first_text(scope: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    selector
        .and_then(|sel| scope.select(sel).next())
        .map(element_text)
}

fn first_attr_or_text(
    scope: ElementRef<'_>,
    selector: Option<&Selector>,
    attr: Option<&str>,
) -> Option<String> {
    let el = selector.and_then(|sel| scope.select(sel).next())?;
    match attr {
        Some(attr) => el.value().attr(attr).map(str::to_string),
        None => Some(element_text(el)),
    }
}

fn parse_html(bytes: &[u8], rules: &HtmlRules) -> Result<(Vec<RawRecord>, Option<String>), ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|e| ParseError::NotHtml(e.to_string()))?;
    if !text.contains('<') {
        return Err(ParseError::NotHtml("no markup found".to_string()));
    }

    let compiled = CompiledRules::new(rules)?;
    let document = Html::parse_document(text);
    let link_attr = rules.link_attr.as_deref().unwrap_or("href");

    let records = document
        .select(&compiled.item)
        .map(|item| RawRecord {
            title: first_text(item, Some(&compiled.title)),
            link: first_attr_or_text(item, Some(&compiled.link), Some(link_attr)),
            date: first_attr_or_text(item, compiled.date.as_ref(), rules.date_attr.as_deref()),
            summary: first_text(item, compiled.summary.as_ref()),
            category: first_text(item, compiled.category.as_ref()),
            defect: None,
        })
        .collect();

    let next_cursor = compiled.next_page.as_ref().and_then(|sel| {
        let el = document.select(sel).next()?;
        el.value()
            .attr("href")
            .map(str::to_string)
            .or_else(|| clean_text(&element_text(el)))
            .filter(|c| !c.trim().is_empty())
    });

    Ok((records, next_cursor))
}

/// RFC 3339 and RFC 2822 are always tried; `format` (chrono syntax) after
/// them, first with a zone, then as UTC date-time, then as a bare UTC date.
fn parse_date(s: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let format = format?;
    if let Ok(dt) = DateTime::parse_from_str(s, format) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, format) {
        return Some(ndt.and_utc());
    }
    NaiveDate::parse_from_str(s, format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc())
}
