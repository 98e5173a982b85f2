use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Home currency of the ledger and the statement's billed amounts.
pub const HOME_CURRENCY: &str = "TWD";

// ---------------------------------------------------------------------------
// Bill month
// ---------------------------------------------------------------------------

/// Statement billing month, written `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillMonth {
    year: i32,
    month: u32,
}

impl BillMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1900..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Resolve a year-less `MM/DD` statement date.
    ///
    /// The statement cycle starts in the bill month, so a month earlier than
    /// the bill month belongs to the following year.
    pub fn resolve_day(&self, month: u32, day: u32) -> Option<NaiveDate> {
        let year = if month < self.month { self.year + 1 } else { self.year };
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

impl fmt::Display for BillMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| format!("bill month must be YYYY-MM, got '{s}'"))?;
        if y.len() != 4 || m.is_empty() || m.len() > 2 {
            return Err(format!("bill month must be YYYY-MM, got '{s}'"));
        }
        let year: i32 = y.parse().map_err(|_| format!("invalid year in '{s}'"))?;
        let month: u32 = m.parse().map_err(|_| format!("invalid month in '{s}'"))?;
        Self::new(year, month).ok_or_else(|| format!("bill month out of range: '{s}'"))
    }
}

impl TryFrom<String> for BillMonth {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BillMonth> for String {
    fn from(value: BillMonth) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// One raw OCR row as produced by the text-extraction collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub text: String,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub position: u32,
}

impl RawRow {
    pub fn new(page: u32, position: u32, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page,
            position,
        }
    }
}

/// Substring marker that switches the active card while scanning rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMarker {
    pub pattern: String,
    pub card_label: String,
}

// ---------------------------------------------------------------------------
// Statement lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Unmatched,
    Proposed,
    Matched,
    Ignored,
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmatched => write!(f, "unmatched"),
            Self::Proposed => write!(f, "proposed"),
            Self::Matched => write!(f, "matched"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

/// A sub-field the normalizer could not fill. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseIssue {
    MissingPostingDate,
    InvalidDate { token: String },
    MissingAmount,
    BadForeignAmount { token: String },
    FeeReference,
}

/// One charge or fee row extracted from a credit-card bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementLine {
    pub id: String,
    pub bill_month: BillMonth,
    pub card_label: String,
    pub consumption_date: Option<NaiveDate>,
    pub posting_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fx_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub twd_amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub foreign_amount_minor: Option<i64>,
    pub description: String,
    pub is_fee: bool,
    pub fee_reference_minor: Option<i64>,
    pub raw_text: String,
    pub page: u32,
    pub position: u32,
    #[serde(default)]
    pub parse_issues: Vec<ParseIssue>,
    #[serde(default)]
    pub match_status: MatchStatus,
    #[serde(default)]
    pub matched_ledger_ids: Vec<String>,
    /// Ledger entries that received this fee line's amount.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fee_target_ids: Vec<String>,
}

impl StatementLine {
    /// Date used to place the line on the ledger timeline.
    pub fn anchor_date(&self) -> Option<NaiveDate> {
        self.consumption_date.or(self.posting_date)
    }

    pub fn has_amount(&self) -> bool {
        self.twd_amount_minor.is_some() || self.foreign_amount_minor.is_some()
    }

    /// `(currency, amount)` when the line was billed in a foreign currency.
    pub fn foreign(&self) -> Option<(&str, i64)> {
        match (&self.currency, self.foreign_amount_minor) {
            (Some(cur), Some(amount)) => Some((cur.as_str(), amount)),
            _ => None,
        }
    }

    pub fn is_parse_complete(&self) -> bool {
        self.parse_issues.is_empty()
    }

    /// Whether a run still has work to do for this line.
    pub fn needs_reconciliation(&self) -> bool {
        match self.match_status {
            MatchStatus::Matched | MatchStatus::Ignored => false,
            MatchStatus::Unmatched | MatchStatus::Proposed => {
                !(self.is_fee && !self.fee_target_ids.is_empty())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// A previously recorded bookkeeping transaction, owned by the external ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub date: NaiveDate,
    pub card_label: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub transaction_id: String,
    pub currency: String,
    pub amount_minor: i64,
    #[serde(default)]
    pub fee_minor: i64,
    /// Home-currency units per one unit of `currency`, as recorded at entry time.
    #[serde(default)]
    pub exchange_rate: Option<f64>,
    /// Statement line this entry was already reconciled against.
    #[serde(default)]
    pub statement_line_id: Option<String>,
}

impl LedgerEntry {
    /// Amount in home-currency minor units, if it can be derived.
    pub fn home_amount_minor(&self) -> Option<i64> {
        if self.currency == HOME_CURRENCY {
            return Some(self.amount_minor);
        }
        let rate = self.exchange_rate.filter(|r| r.is_finite() && *r > 0.0)?;
        Some((self.amount_minor as f64 * rate).round() as i64)
    }
}

// ---------------------------------------------------------------------------
// Candidate groups
// ---------------------------------------------------------------------------

/// Identifier of a candidate group: a batch id or a singleton entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn batch(batch_id: &str) -> Self {
        Self(format!("batch:{batch_id}"))
    }

    pub fn singleton(entry_id: &str) -> Self {
        Self(format!("entry:{entry_id}"))
    }

    /// Group holding entries already reconciled against `line_id`.
    pub fn prior(line_id: &str) -> Self {
        Self(format!("line:{line_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Match results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountBasis {
    Home,
    Foreign,
}

/// One candidate group scored against a statement line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub group_id: GroupId,
    pub entry_ids: Vec<String>,
    pub sum_minor: i64,
    pub delta_minor: i64,
    pub date_diff_days: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedGroup {
    pub group: Candidate,
    pub basis: AmountBasis,
    pub card_label: String,
    pub anchor_date: NaiveDate,
    pub posting_date: Option<NaiveDate>,
    /// Home-currency amount printed on the statement line.
    pub billed_home_minor: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReason {
    NoAmount,
    NoDate,
    NoCandidate,
}

impl MissingReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoAmount => "NO_AMOUNT",
            Self::NoDate => "NO_DATE",
            Self::NoCandidate => "NO_CANDIDATE",
        }
    }
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched { matched: MatchedGroup },
    Proposed { alternatives: Vec<Candidate> },
    Missing { reason: MissingReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub statement_line_id: String,
    #[serde(flatten)]
    pub outcome: MatchOutcome,
}

impl MatchResult {
    pub fn matched(&self) -> Option<&MatchedGroup> {
        match &self.outcome {
            MatchOutcome::Matched { matched } => Some(matched),
            _ => None,
        }
    }

    /// Ledger entries claimed by this result. Empty unless matched.
    pub fn candidate_ids(&self) -> &[String] {
        self.matched().map(|m| m.group.entry_ids.as_slice()).unwrap_or(&[])
    }
}

// ---------------------------------------------------------------------------
// Fees + advisories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeShare {
    pub ledger_entry_id: String,
    pub allocated_minor: i64,
}

/// A fee line's amount distributed across the entries of one matched group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeAllocation {
    pub fee_line_id: String,
    pub group_id: GroupId,
    pub fee_minor: i64,
    pub shares: Vec<FeeShare>,
}

impl FeeAllocation {
    pub fn allocated_total(&self) -> i64 {
        self.shares.iter().map(|s| s.allocated_minor).sum()
    }

    pub fn target_ledger_ids(&self) -> Vec<String> {
        self.shares.iter().map(|s| s.ledger_entry_id.clone()).collect()
    }

    pub fn writes(&self) -> Vec<FeeWrite> {
        self.shares
            .iter()
            .map(|s| FeeWrite {
                ledger_entry_id: s.ledger_entry_id.clone(),
                fee_delta_minor: s.allocated_minor,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    NoReference,
    NoAmount,
    ReferenceNotFound,
    Ambiguous,
    ZeroBase,
}

impl DeferReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoReference => "FEE_NO_REFERENCE",
            Self::NoAmount => "FEE_NO_AMOUNT",
            Self::ReferenceNotFound => "FEE_REFERENCE_NOT_FOUND",
            Self::Ambiguous => "FEE_REFERENCE_AMBIGUOUS",
            Self::ZeroBase => "FEE_ZERO_BASE",
        }
    }
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FeeOutcome {
    Allocated { allocation: FeeAllocation },
    Deferred { reason: DeferReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeDeferral {
    pub fee_line_id: String,
    pub reason: DeferReason,
}

/// Advisory only; the core never rewrites a recorded rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateSuggestion {
    pub ledger_entry_id: String,
    pub statement_line_id: String,
    pub currency: String,
    pub recorded_rate: f64,
    pub implied_rate: f64,
    pub deviation: f64,
}

// ---------------------------------------------------------------------------
// Write-back
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeWrite {
    pub ledger_entry_id: String,
    pub fee_delta_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationWrite {
    pub ledger_entry_id: String,
    pub statement_line_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineUpdate {
    pub statement_line_id: String,
    pub match_status: MatchStatus,
    pub matched_ledger_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fee_target_ids: Vec<String>,
}

impl LineUpdate {
    /// Update carrying `line`'s current reconciliation state.
    pub fn from_line(line: &StatementLine) -> Self {
        Self {
            statement_line_id: line.id.clone(),
            match_status: line.match_status,
            matched_ledger_ids: line.matched_ledger_ids.clone(),
            fee_target_ids: line.fee_target_ids.clone(),
        }
    }
}

/// Everything a run asks the external stores to persist, emitted together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub line_updates: Vec<LineUpdate>,
    pub relations: Vec<RelationWrite>,
    pub fees: Vec<FeeWrite>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.line_updates.is_empty() && self.relations.is_empty() && self.fees.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Summary + Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedKind {
    Proposed,
    Missing,
    FeeDeferred,
}

/// Detail for one non-matched item, enough for a person to resolve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedItem {
    pub statement_line_id: String,
    pub kind: UnresolvedKind,
    pub reason: String,
    pub description: String,
    pub twd_amount_minor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_amount_minor: Option<i64>,
    pub date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub matched: usize,
    pub proposed: usize,
    pub missing: usize,
    pub fees_allocated: usize,
    pub fees_deferred: usize,
    /// Lines carried through untouched (already resolved or ignored).
    pub skipped: usize,
    /// Lines a person marked as not needing a ledger entry.
    pub ignored: usize,
    pub rate_suggestions: usize,
    pub items: Vec<UnresolvedItem>,
}
