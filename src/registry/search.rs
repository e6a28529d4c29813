//! Instrument search with an F&O query parser.
//!
//! Queries like `NIFTY 26JUN2025 23500 CE`, `BANKNIFTY 20250626 PE`, or
//! `RELIANCE JUN FUT` are parsed into structured hints (underlying, expiry,
//! strike, option type) and run against the master with exact filters. A
//! query that parses to nothing structured — or a structured query with no
//! hits — falls back to fuzzy symbol matching.

use chrono::{Datelike, NaiveDate};

use super::InstrumentRegistry;
use crate::error::Result;
use crate::types::{InstrumentRecord, InstrumentType};

/// Structured hints extracted from a search query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FoQuery {
    /// Underlying name, upper-cased, space-joined.
    pub underlying: String,
    /// Exact expiry, when the query carried a full date.
    pub expiry: Option<NaiveDate>,
    /// Loose month hint (1–12), when only a month name was given.
    pub expiry_month: Option<u32>,
    /// Option strike.
    pub strike: Option<f64>,
    /// CE/PE, when present.
    pub option_type: Option<InstrumentType>,
}

impl FoQuery {
    /// Whether the query carried any structured hint beyond the underlying.
    pub fn is_structured(&self) -> bool {
        self.expiry.is_some()
            || self.expiry_month.is_some()
            || self.strike.is_some()
            || self.option_type.is_some()
    }
}

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

fn month_number(word: &str) -> Option<u32> {
    if !word.is_ascii() || word.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|m| *m == &word[..3])
        .map(|i| i as u32 + 1)
}

/// Parse `YYYYMMDD`.
fn parse_compact_date(word: &str) -> Option<NaiveDate> {
    if word.len() != 8 || !word.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = word[..4].parse().ok()?;
    let month: u32 = word[4..6].parse().ok()?;
    let day: u32 = word[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parse `DDMMMYYYY` / `DDMMMYY` (e.g. `26JUN2025`, `26JUN25`).
fn parse_broker_date(word: &str) -> Option<NaiveDate> {
    if word.len() < 7 || word.len() > 9 {
        return None;
    }
    let day: u32 = word.get(..2)?.parse().ok()?;
    let month = month_number(word.get(2..5)?)?;
    let year_part = word.get(5..)?;
    let year: i32 = match year_part.len() {
        2 => 2000 + year_part.parse::<i32>().ok()?,
        4 => year_part.parse().ok()?,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Extract structured F&O hints from a free-text query. Returns `None` for
/// an empty query.
pub fn parse_fo_query(query: &str) -> Option<FoQuery> {
    let upper = query.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }

    let mut out = FoQuery::default();
    let mut underlying_words: Vec<&str> = Vec::new();

    for word in upper.split_whitespace() {
        if word == "CE" {
            out.option_type = Some(InstrumentType::CE);
        } else if word == "PE" {
            out.option_type = Some(InstrumentType::PE);
        } else if word == "FUT" || word == "FUTURE" || word == "FUTURES" {
            // Futures keyword narrows nothing by itself; ignored.
        } else if let Some(date) = parse_compact_date(word).or_else(|| parse_broker_date(word)) {
            out.expiry = Some(date);
        } else if out.expiry.is_none() && word.len() <= 4 && month_number(word).is_some() {
            out.expiry_month = month_number(word);
        } else if !word.is_empty()
            && word.bytes().all(|b| b.is_ascii_digit() || b == b'.')
            && word.len() <= 9
        {
            out.strike = word.parse().ok();
        } else {
            underlying_words.push(word);
        }
    }

    out.underlying = underlying_words.join(" ");
    if out.underlying.is_empty() && !out.is_structured() {
        return None;
    }
    Some(out)
}

impl InstrumentRegistry {
    /// Search the instrument master. Structured F&O queries filter exactly;
    /// everything else (including empty structured results) goes fuzzy.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<InstrumentRecord>> {
        let Some(fo) = parse_fo_query(query) else {
            return Ok(Vec::new());
        };

        if fo.is_structured() && !fo.underlying.is_empty() {
            let mut hits = self
                .db()
                .search_structured(&fo.underlying, fo.expiry, fo.strike, fo.option_type, limit)
                .await?;
            if let Some(month) = fo.expiry_month {
                hits.retain(|r| r.expiry_date.is_none_or(|d| d.month() == month));
            }
            if !hits.is_empty() {
                return Ok(hits);
            }
        }

        self.db().search_fuzzy(query.trim(), limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_option_query() {
        let q = parse_fo_query("NIFTY 26JUN2025 23500 CE").unwrap();
        assert_eq!(q.underlying, "NIFTY");
        assert_eq!(q.expiry, NaiveDate::from_ymd_opt(2025, 6, 26));
        assert_eq!(q.strike, Some(23_500.0));
        assert_eq!(q.option_type, Some(InstrumentType::CE));
        assert!(q.is_structured());
    }

    #[test]
    fn parses_compact_date_form() {
        let q = parse_fo_query("BANKNIFTY 20250626 PE").unwrap();
        assert_eq!(q.expiry, NaiveDate::from_ymd_opt(2025, 6, 26));
        assert_eq!(q.option_type, Some(InstrumentType::PE));
    }

    #[test]
    fn parses_two_digit_year() {
        let q = parse_fo_query("RELIANCE 26JUN25 3000 CE").unwrap();
        assert_eq!(q.expiry, NaiveDate::from_ymd_opt(2025, 6, 26));
    }

    #[test]
    fn loose_month_becomes_a_month_hint() {
        let q = parse_fo_query("RELIANCE JUN FUT").unwrap();
        assert_eq!(q.underlying, "RELIANCE");
        assert_eq!(q.expiry, None);
        assert_eq!(q.expiry_month, Some(6));
    }

    #[test]
    fn plain_symbol_is_unstructured() {
        let q = parse_fo_query("tcs").unwrap();
        assert_eq!(q.underlying, "TCS");
        assert!(!q.is_structured());
    }

    #[test]
    fn multi_word_underlying_is_preserved() {
        let q = parse_fo_query("nifty fin service 23500 pe").unwrap();
        assert_eq!(q.underlying, "NIFTY FIN SERVICE");
        assert_eq!(q.strike, Some(23_500.0));
    }

    #[test]
    fn empty_query_parses_to_none() {
        assert_eq!(parse_fo_query("   "), None);
    }

    #[test]
    fn invalid_dates_are_not_dates() {
        assert_eq!(parse_compact_date("20251350"), None);
        assert_eq!(parse_broker_date("99JUN2025"), None);
        // An 8-digit number that isn't a valid date falls through to strike.
        let q = parse_fo_query("NIFTY 20259999").unwrap();
        assert_eq!(q.expiry, None);
        assert_eq!(q.strike, Some(20_259_999.0));
    }
}
