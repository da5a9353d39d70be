//! Fund name detection from the free text surrounding a page's tables.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::models::{IngestionIssue, MergedTable, PageText};

/// Lines longer than this are prose, not titles.
const MAX_TITLE_WORDS: usize = 12;

static FUND_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bfunds?\b").unwrap());
static BARE_FUND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^funds?$").unwrap());
static MUTUAL_FUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.*?)\s*\bmutual\s+fund\b\s*$").unwrap());
static LABEL_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(portfolio\s+statement\s+of|portfolio\s+of|scheme\s+name|name\s+of\s+the\s+scheme)\s*[:\-]?\s*")
        .unwrap()
});
static AS_ON_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+as\s+(on|of|at)\b.*$").unwrap());

/// Best guess for one page.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageFundName {
    pub fund_name: Option<String>,
    /// AMC named by a "... Mutual Fund" line.
    pub amc_hint: Option<String>,
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop parentheticals, "Portfolio of"-style labels and "as on <date>" tails.
fn strip_decorations(raw: &str) -> String {
    let mut text = collapse_whitespace(raw);
    if let Some(pos) = text.find('(') {
        text.truncate(pos);
    }
    text = LABEL_PREFIX_RE.replace(&text, "").to_string();
    AS_ON_SUFFIX_RE.replace(&text, "").trim().to_string()
}

/// Cut plan/option suffixes that follow the last "Fund" word.
fn truncate_after_fund(text: &str) -> String {
    let mut out = text.to_string();
    if let Some(last) = FUND_WORD_RE.find_iter(text).last() {
        out.truncate(last.end());
    }
    out.trim_matches(|c: char| c.is_whitespace() || c == ':' || c == '-' || c == ',')
        .to_string()
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FundNameResolver;

impl FundNameResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve_page(&self, page: &PageText) -> PageFundName {
        let lines: Vec<String> = page.lines.iter().map(|l| collapse_whitespace(l)).collect();
        let mut candidates: Vec<(usize, String)> = Vec::new();
        let mut amc_lines: Vec<(String, String)> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            if !FUND_WORD_RE.is_match(line) {
                continue;
            }
            let stripped = strip_decorations(line);
            if stripped.split_whitespace().count() > MAX_TITLE_WORDS {
                continue;
            }
            // OCR often wraps "Fund" onto its own line.
            let wrapped = BARE_FUND_RE.is_match(&stripped)
                && idx > 0
                && !lines[idx - 1].is_empty()
                && !FUND_WORD_RE.is_match(&lines[idx - 1]);
            let joined = if wrapped {
                strip_decorations(&format!("{} {}", lines[idx - 1], stripped))
            } else {
                stripped
            };
            let candidate = truncate_after_fund(&joined);
            // Headings such as "Fund Manager" reduce to the bare word.
            if candidate.is_empty() || BARE_FUND_RE.is_match(&candidate) {
                continue;
            }
            if let Some(caps) = MUTUAL_FUND_RE.captures(&candidate) {
                let amc = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                amc_lines.push((candidate.clone(), amc.to_string()));
                continue;
            }
            candidates.push((idx, candidate));
        }

        let amc_hint = amc_lines
            .first()
            .map(|(_, amc)| amc.clone())
            .filter(|amc| !amc.is_empty());

        // Most specific wins: more words, then earlier line.
        let fund_name = candidates
            .iter()
            .max_by(|a, b| {
                let wa = a.1.split_whitespace().count();
                let wb = b.1.split_whitespace().count();
                wa.cmp(&wb).then(b.0.cmp(&a.0))
            })
            .map(|(_, name)| name.clone())
            .or_else(|| amc_lines.first().map(|(line, _)| line.clone()));

        debug!(
            page_index = page.page_index,
            fund_name = fund_name.as_deref().unwrap_or(""),
            "detected fund name"
        );
        PageFundName { fund_name, amc_hint }
    }

    pub fn resolve_pages(&self, pages: &[PageText]) -> BTreeMap<usize, PageFundName> {
        pages
            .iter()
            .map(|p| (p.page_index, self.resolve_page(p)))
            .collect()
    }

    /// Attach a fund name to `table`.
    ///
    /// The page holding the first row decides; when that page names no fund
    /// the nearest earlier page that does is used. Different names on other
    /// spanned pages are reported, never fatal.
    pub fn tag(
        &self,
        table: &mut MergedTable,
        names: &BTreeMap<usize, PageFundName>,
    ) -> Option<IngestionIssue> {
        let first_page = table.first_page()?;
        let carried = names
            .range(..=first_page)
            .rev()
            .find(|(_, guess)| guess.fund_name.is_some());

        table.fund_name = carried.and_then(|(_, g)| g.fund_name.clone());
        table.amc_hint = names
            .range(..=first_page)
            .rev()
            .find_map(|(_, g)| g.amc_hint.clone());

        let chosen = table.fund_name.clone()?;
        let mut others: Vec<String> = Vec::new();
        for page in table.pages.iter().filter(|p| **p != first_page) {
            if let Some(other) = names.get(page).and_then(|g| g.fund_name.as_ref()) {
                if !other.eq_ignore_ascii_case(&chosen) && !others.contains(other) {
                    others.push(other.clone());
                }
            }
        }
        if others.is_empty() {
            return None;
        }
        warn!(
            chosen = chosen.as_str(),
            others = ?others,
            "merged table spans pages naming different funds"
        );
        Some(IngestionIssue::AmbiguousFundName { chosen, others })
    }
}
