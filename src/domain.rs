use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Canonical "PMC"-prefixed PubMed Central identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pmcid(String);

impl Pmcid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pmcid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Pmcid {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("PMC")
            .or_else(|| trimmed.strip_prefix("pmc"))
            .or_else(|| trimmed.strip_prefix("Pmc"))
            .unwrap_or(trimmed);
        if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(HarvestError::InvalidPmcid(value.to_string()));
        }
        Ok(Self(format!("PMC{digits}")))
    }
}

/// Parses `PMC<start>_PMC<end>.xml.gz` into an inclusive PMCID range.
pub fn parse_package_range(filename: &str) -> Result<(u64, u64), HarvestError> {
    let stem = filename
        .strip_suffix(".xml.gz")
        .ok_or_else(|| HarvestError::InvalidPackageName(filename.to_string()))?;
    let (start, end) = stem
        .split_once('_')
        .ok_or_else(|| HarvestError::InvalidPackageName(filename.to_string()))?;
    let parse_part = |part: &str| -> Result<u64, HarvestError> {
        part.strip_prefix("PMC")
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| HarvestError::InvalidPackageName(filename.to_string()))
    };
    let start = parse_part(start)?;
    let end = parse_part(end)?;
    if start > end {
        return Err(HarvestError::InvalidPackageName(filename.to_string()));
    }
    Ok((start, end))
}

/// One figure entry from an article's figure index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Figure {
    pub label: String,
    pub caption: String,
    pub graphic_ref: String,
}

/// One parsed article. Produced by the streaming parser and consumed
/// immediately by the importer; never persisted itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticleMetadata {
    pub pmcid: String,
    pub pmid: Option<String>,
    pub doi: Option<String>,
    pub title: String,
    pub abstract_text: Option<String>,
    pub authors: Vec<String>,
    pub journal: Option<String>,
    pub publication_date: Option<String>,
    pub year: Option<i32>,
    pub full_text: String,
    pub license_url: Option<String>,
    pub keywords: Vec<String>,
    pub mesh_terms: Vec<String>,
    pub figures: BTreeMap<String, Figure>,
}

impl ArticleMetadata {
    pub fn article_url(&self) -> String {
        format!("https://www.ncbi.nlm.nih.gov/pmc/articles/{}/", self.pmcid)
    }
}

/// Clamps a JATS pub-date to valid calendar bounds and formats YYYY-MM-DD.
pub fn format_publication_date(year: i32, month: u32, day: u32) -> String {
    let month = month.clamp(1, 12);
    let day = day.clamp(1, days_in_month(year, month));
    format!("{year:04}-{month:02}-{day:02}")
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        _ => 31,
    }
}
