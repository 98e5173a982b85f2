//! Raw OCR rows → structured statement lines.
//!
//! One row shape is understood (whitespace-separated tokens):
//!
//! ```text
//! [consumption MM/DD] posting MM/DD  description…  twd_amount  [fx MM/DD] [CC] [CUR foreign_amount]
//! ```
//!
//! Rows are never dropped for being incomplete: whatever could not be read is
//! recorded as a [`ParseIssue`] on the line and the raw text is retained.

use std::collections::HashMap;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{FeeConfig, ReconConfig};
use crate::model::{BillMonth, CardMarker, MatchStatus, ParseIssue, RawRow, StatementLine};

// `12/5` or `12-05`; the dash form needs two digits each so `7-11` stays a word
static SHORT_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d{1,2})/(\d{1,2})|(\d{2})-(\d{2}))$").expect("short date regex")
});
static ISO_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-/](\d{1,2})[-/](\d{1,2})$").expect("iso date regex"));
static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d[\d,]*(?:\.\d{1,2})?$").expect("amount regex"));
static LEADING_AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(-?\d[\d,]*(?:\.\d{1,2})?)").expect("leading amount regex"));
static CURRENCY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3}$").expect("currency regex"));
static COUNTRY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{2}$").expect("country regex"));

/// Codes accepted as a foreign block even when no billed amount precedes them.
const BILLING_CURRENCIES: &[&str] = &[
    "AUD", "CAD", "CHF", "CNY", "DKK", "EUR", "GBP", "HKD", "IDR", "INR", "JPY", "KRW", "MOP", "MYR",
    "NOK", "NZD", "PHP", "SEK", "SGD", "THB", "USD", "VND",
];

/// The card in effect while scanning, threaded from row to row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardContext {
    pub card_label: String,
}

impl CardContext {
    pub fn new(card_label: impl Into<String>) -> Self {
        Self {
            card_label: card_label.into(),
        }
    }

    /// Context after seeing `row`: switched if the row is a segment marker.
    fn advance(self, row: &RawRow, markers: &[CardMarker]) -> (Self, bool) {
        match markers.iter().find(|m| row.text.contains(m.pattern.as_str())) {
            Some(marker) => (Self::new(marker.card_label.clone()), true),
            None => (self, false),
        }
    }
}

pub struct StatementNormalizer<'a> {
    markers: &'a [CardMarker],
    fees: &'a FeeConfig,
}

impl<'a> StatementNormalizer<'a> {
    pub fn new(config: &'a ReconConfig) -> Self {
        Self {
            markers: &config.cards,
            fees: &config.fees,
        }
    }

    /// Normalize rows in input order. Rows before the first marker belong to
    /// `default_card`.
    pub fn normalize(
        &self,
        rows: &[RawRow],
        bill_month: BillMonth,
        default_card: &str,
    ) -> Vec<StatementLine> {
        let mut lines = Vec::with_capacity(rows.len());
        let mut seen_ids: HashMap<String, u32> = HashMap::new();
        let mut ctx = CardContext::new(default_card);

        for row in rows {
            let (next, is_marker) = ctx.advance(row, self.markers);
            ctx = next;
            if is_marker {
                debug!(card = %ctx.card_label, page = row.page, position = row.position, "card segment marker");
                continue;
            }
            if row.text.trim().is_empty() {
                continue;
            }

            let base_id = format!(
                "stmt:{}:{}:{}:{}",
                ctx.card_label, bill_month, row.page, row.position
            );
            let seq = seen_ids.entry(base_id.clone()).or_insert(0);
            *seq += 1;
            let id = if *seq == 1 { base_id } else { format!("{base_id}:{seq}") };

            let line = self.parse_row(id, row, bill_month, &ctx);
            if !line.parse_issues.is_empty() {
                warn!(
                    line = %line.id,
                    issues = ?line.parse_issues,
                    "PARSE_INCOMPLETE: statement row kept with missing fields"
                );
            }
            lines.push(line);
        }

        lines
    }

    fn parse_row(&self, id: String, row: &RawRow, bill_month: BillMonth, ctx: &CardContext) -> StatementLine {
        let tokens: Vec<&str> = row.text.split_whitespace().collect();
        let mut issues = Vec::new();

        // Leading dates
        let mut start = 0;
        let mut dates: Vec<Option<NaiveDate>> = Vec::new();
        while start < tokens.len() && dates.len() < 2 {
            match parse_date_token(tokens[start], bill_month) {
                DateToken::Date(d) => dates.push(Some(d)),
                DateToken::Invalid => {
                    issues.push(ParseIssue::InvalidDate {
                        token: tokens[start].to_string(),
                    });
                    dates.push(None);
                }
                DateToken::NotDate => break,
            }
            start += 1;
        }
        let (consumption_date, posting_date) = match dates.as_slice() {
            [c, p] => (*c, *p),
            [p] => (None, *p),
            _ => (None, None),
        };
        if posting_date.is_none() && !issues.iter().any(|i| matches!(i, ParseIssue::InvalidDate { .. })) {
            issues.push(ParseIssue::MissingPostingDate);
        }

        // Trailing foreign block: [fx MM/DD] [CC] CUR amount
        let mut end = tokens.len();
        let mut currency = None;
        let mut foreign_amount_minor = None;
        let mut country = None;
        let mut fx_date = None;
        if let Some(block) = foreign_block(&tokens[start..], bill_month) {
            match parse_minor(block.amount_token) {
                Some(amount) => {
                    currency = Some(block.currency.to_string());
                    foreign_amount_minor = Some(amount);
                }
                None => issues.push(ParseIssue::BadForeignAmount {
                    token: block.amount_token.to_string(),
                }),
            }
            country = block.country.map(str::to_string);
            fx_date = block.fx_date;
            end -= block.width;
        }

        // Billed home-currency amount
        let mut twd_amount_minor = None;
        if end > start {
            if let Some(amount) = parse_minor(tokens[end - 1]) {
                twd_amount_minor = Some(amount);
                end -= 1;
            }
        }
        if twd_amount_minor.is_none() {
            issues.push(ParseIssue::MissingAmount);
        }

        let description = tokens[start..end].join(" ");
        let (is_fee, fee_reference_minor) = match self.fee_reference(&description) {
            FeeMarker::NotFee => (false, None),
            FeeMarker::Reference(amount) => (true, Some(amount)),
            FeeMarker::Unreadable => {
                issues.push(ParseIssue::FeeReference);
                (true, None)
            }
        };

        StatementLine {
            id,
            bill_month,
            card_label: ctx.card_label.clone(),
            consumption_date,
            posting_date,
            fx_date,
            country,
            twd_amount_minor,
            currency,
            foreign_amount_minor,
            description,
            is_fee,
            fee_reference_minor,
            raw_text: row.text.clone(),
            page: row.page,
            position: row.position,
            parse_issues: issues,
            match_status: MatchStatus::Unmatched,
            matched_ledger_ids: Vec::new(),
            fee_target_ids: Vec::new(),
        }
    }

    fn fee_reference(&self, description: &str) -> FeeMarker {
        let Some(rest) = description.strip_prefix(self.fees.marker.as_str()) else {
            return FeeMarker::NotFee;
        };

        // Earliest configured separator wins
        let after = self
            .fees
            .separators
            .iter()
            .filter_map(|sep| rest.find(sep.as_str()).map(|pos| (pos, sep.len())))
            .min_by_key(|(pos, _)| *pos)
            .map(|(pos, len)| &rest[pos + len..]);

        after
            .and_then(|s| LEADING_AMOUNT_RE.captures(s))
            .and_then(|c| c.get(1))
            .and_then(|m| parse_minor(m.as_str()))
            .map(FeeMarker::Reference)
            .unwrap_or(FeeMarker::Unreadable)
    }
}

struct ForeignBlock<'t> {
    currency: &'t str,
    amount_token: &'t str,
    country: Option<&'t str>,
    fx_date: Option<NaiveDate>,
    width: usize,
}

/// Trailing `[fx MM/DD] [CC] CUR amount` block.
///
/// Recognized when a billed amount precedes it. Without one, the code must be
/// a known billing currency: the home amount was lost, and a description
/// ending in a three-letter word is not mistaken for a currency.
fn foreign_block<'t>(tokens: &[&'t str], bill_month: BillMonth) -> Option<ForeignBlock<'t>> {
    let n = tokens.len();
    if n < 2 || !CURRENCY_RE.is_match(tokens[n - 2]) {
        return None;
    }
    let currency = tokens[n - 2];
    let mut end = n - 2;
    let mut country = None;
    let mut fx_date = None;
    if end > 1 && COUNTRY_RE.is_match(tokens[end - 1]) {
        country = Some(tokens[end - 1]);
        end -= 1;
    }
    if end > 1 {
        if let DateToken::Date(d) = parse_date_token(tokens[end - 1], bill_month) {
            fx_date = Some(d);
            end -= 1;
        }
    }
    let billed = end > 0 && parse_minor(tokens[end - 1]).is_some();
    if !billed && !BILLING_CURRENCIES.contains(&currency) {
        return None;
    }
    Some(ForeignBlock {
        currency,
        amount_token: tokens[n - 1],
        country,
        fx_date,
        width: n - end,
    })
}

enum FeeMarker {
    NotFee,
    Reference(i64),
    Unreadable,
}

enum DateToken {
    NotDate,
    Invalid,
    Date(NaiveDate),
}

fn parse_date_token(token: &str, bill_month: BillMonth) -> DateToken {
    if let Some(caps) = SHORT_DATE_RE.captures(token) {
        let part = |slash: usize, dash: usize| -> u32 {
            caps.get(slash)
                .or_else(|| caps.get(dash))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        let month = part(1, 3);
        let day = part(2, 4);
        return match bill_month.resolve_day(month, day) {
            Some(d) => DateToken::Date(d),
            None => DateToken::Invalid,
        };
    }
    if let Some(caps) = ISO_DATE_RE.captures(token) {
        let year = caps[1].parse().unwrap_or(0);
        let month = caps[2].parse().unwrap_or(0);
        let day = caps[3].parse().unwrap_or(0);
        return match NaiveDate::from_ymd_opt(year, month, day) {
            Some(d) => DateToken::Date(d),
            None => DateToken::Invalid,
        };
    }
    DateToken::NotDate
}

/// Parse `1,234.5` / `-88` style amounts into minor units (hundredths).
pub fn parse_minor(token: &str) -> Option<i64> {
    let token = token.trim();
    if !AMOUNT_RE.is_match(token) {
        return None;
    }
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let cleaned: String = digits.chars().filter(|c| *c != ',').collect();
    let (whole, frac) = cleaned.split_once('.').unwrap_or((cleaned.as_str(), ""));
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    let minor = whole.checked_mul(100)?.checked_add(frac)?;
    Some(if negative { -minor } else { minor })
}
