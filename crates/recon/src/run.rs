//! One reconciliation pass for a single (card, month).
//!
//! ```text
//! Collecting ──run_matching──▶ Matching ──run_fee_matching──▶ FeeMatching ──summarize──▶ Summarized
//! ```
//!
//! There are no backward transitions. Write-back instructions exist only in
//! the [`RunReport`] returned by [`ReconciliationRun::summarize`]; a run
//! dropped earlier leaves nothing behind but its released lock.

use std::collections::HashSet;
use std::fmt;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ReconConfig;
use crate::error::ReconError;
use crate::evidence::compute_summary;
use crate::fees::{allocate, rate_suggestions};
use crate::index::CandidateIndex;
use crate::lock::{RunKey, RunLock};
use crate::matcher::match_line;
use crate::model::{
    AmountBasis, Candidate, FeeAllocation, FeeDeferral, FeeOutcome, LedgerEntry, LineUpdate,
    MatchOutcome, MatchResult, MatchStatus, MatchedGroup, RateSuggestion, RelationWrite,
    RunSummary, StatementLine, WriteBatch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Collecting,
    Matching,
    FeeMatching,
    Summarized,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collecting => write!(f, "collecting"),
            Self::Matching => write!(f, "matching"),
            Self::FeeMatching => write!(f, "fee_matching"),
            Self::Summarized => write!(f, "summarized"),
        }
    }
}

/// Final output of a run: statuses, write-back instructions, summary.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub key: RunKey,
    pub holder: String,
    pub state: RunState,
    pub lines: Vec<StatementLine>,
    pub results: Vec<MatchResult>,
    pub fee_allocations: Vec<FeeAllocation>,
    pub fee_deferrals: Vec<FeeDeferral>,
    pub rate_suggestions: Vec<RateSuggestion>,
    pub writes: WriteBatch,
    pub summary: RunSummary,
}

/// Closed date range covering every line's anchor date, widened by the window.
pub fn snapshot_range(lines: &[StatementLine], window_days: u32) -> Option<(NaiveDate, NaiveDate)> {
    let anchors = lines.iter().filter_map(StatementLine::anchor_date);
    let (min, max) = anchors.fold(None, |acc: Option<(NaiveDate, NaiveDate)>, d| match acc {
        None => Some((d, d)),
        Some((lo, hi)) => Some((lo.min(d), hi.max(d))),
    })?;
    let days = Days::new(u64::from(window_days));
    Some((
        min.checked_sub_days(days).unwrap_or(NaiveDate::MIN),
        max.checked_add_days(days).unwrap_or(NaiveDate::MAX),
    ))
}

pub struct ReconciliationRun {
    lock: RunLock,
    config: ReconConfig,
    state: RunState,
    snapshot: Vec<LedgerEntry>,
    lines: Vec<StatementLine>,
    index: Option<CandidateIndex>,
    /// Matches from earlier runs, visible to fee allocation only.
    prior: Vec<MatchResult>,
    results: Vec<MatchResult>,
    fee_outcomes: Vec<(String, FeeOutcome)>,
    rate_suggestions: Vec<RateSuggestion>,
    touched: HashSet<String>,
}

impl ReconciliationRun {
    /// Start collecting lines for the slot held by `lock`, against a
    /// point-in-time ledger `snapshot`.
    pub fn new(lock: RunLock, snapshot: Vec<LedgerEntry>, config: ReconConfig) -> Self {
        info!(key = %lock.key(), holder = lock.holder(), entries = snapshot.len(), "run started");
        Self {
            lock,
            config,
            state: RunState::Collecting,
            snapshot,
            lines: Vec::new(),
            index: None,
            prior: Vec::new(),
            results: Vec::new(),
            fee_outcomes: Vec::new(),
            rate_suggestions: Vec::new(),
            touched: HashSet::new(),
        }
    }

    pub fn key(&self) -> &RunKey {
        self.lock.key()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn lines(&self) -> &[StatementLine] {
        &self.lines
    }

    fn expect_state(&self, expected: RunState, action: &'static str) -> Result<(), ReconError> {
        if self.state != expected {
            return Err(ReconError::InvalidTransition {
                from: self.state,
                action,
            });
        }
        Ok(())
    }

    /// Add lines, possibly from several statement images. Returns how many
    /// were new; a line id seen before is ignored.
    pub fn collect(&mut self, lines: impl IntoIterator<Item = StatementLine>) -> Result<usize, ReconError> {
        self.expect_state(RunState::Collecting, "collect lines")?;
        let key = self.lock.key().clone();
        let mut known: HashSet<String> = self.lines.iter().map(|l| l.id.clone()).collect();
        let mut added = 0;
        for line in lines {
            if line.card_label != key.card_label || line.bill_month != key.bill_month {
                return Err(ReconError::LineOutOfScope { line_id: line.id, key });
            }
            if !known.insert(line.id.clone()) {
                continue;
            }
            self.lines.push(line);
            added += 1;
        }
        Ok(added)
    }

    /// Match every unresolved non-fee line in statement order
    /// (page, position, id), whatever order the lines were collected in.
    pub fn run_matching(&mut self) -> Result<&[MatchResult], ReconError> {
        self.expect_state(RunState::Collecting, "start matching")?;
        self.state = RunState::Matching;

        self.lines
            .sort_by(|a, b| (a.page, a.position, &a.id).cmp(&(b.page, b.position, &b.id)));
        let mut index = self.build_index();
        for i in 0..self.lines.len() {
            let line = &self.lines[i];
            if line.is_fee || !line.needs_reconciliation() {
                continue;
            }
            let result = match_line(line, &mut index, &self.config);
            if let Some(matched) = result.matched() {
                let suggestions = rate_suggestions(line, matched, &index, &self.config);
                self.rate_suggestions.extend(suggestions);
            }

            let line = &mut self.lines[i];
            match &result.outcome {
                MatchOutcome::Matched { matched } => {
                    line.match_status = MatchStatus::Matched;
                    line.matched_ledger_ids = matched.group.entry_ids.clone();
                }
                MatchOutcome::Proposed { .. } => {
                    line.match_status = MatchStatus::Proposed;
                    line.matched_ledger_ids.clear();
                }
                MatchOutcome::Missing { .. } => {
                    line.match_status = MatchStatus::Unmatched;
                    line.matched_ledger_ids.clear();
                }
            }
            self.touched.insert(line.id.clone());
            self.results.push(result);
        }

        info!(
            key = %self.lock.key(),
            results = self.results.len(),
            range = ?index.date_range(),
            live_groups = index.live_count(),
            "matching finished"
        );
        self.index = Some(index);
        Ok(&self.results)
    }

    /// Allocate every unresolved fee line against this run's matches and
    /// matches carried over from earlier runs.
    pub fn run_fee_matching(&mut self) -> Result<&[(String, FeeOutcome)], ReconError> {
        self.expect_state(RunState::Matching, "start fee matching")?;
        self.state = RunState::FeeMatching;

        let Some(index) = self.index.as_ref() else {
            return Err(ReconError::InvalidTransition {
                from: self.state,
                action: "start fee matching without an index",
            });
        };
        let known: Vec<MatchResult> = self.prior.iter().chain(self.results.iter()).cloned().collect();

        for line in self.lines.iter_mut() {
            if !line.is_fee || !line.needs_reconciliation() {
                continue;
            }
            let outcome = allocate(line, &known, index, &self.config);
            if let FeeOutcome::Allocated { allocation } = &outcome {
                line.fee_target_ids = allocation.target_ledger_ids();
            }
            self.touched.insert(line.id.clone());
            self.fee_outcomes.push((line.id.clone(), outcome));
        }

        Ok(&self.fee_outcomes)
    }

    /// Produce the report and all write-back instructions, then release the slot.
    pub fn summarize(mut self) -> Result<RunReport, ReconError> {
        self.expect_state(RunState::FeeMatching, "summarize")?;
        self.state = RunState::Summarized;

        let mut writes = WriteBatch::default();
        for line in self.lines.iter().filter(|l| self.touched.contains(&l.id)) {
            writes.line_updates.push(LineUpdate::from_line(line));
        }
        for result in &self.results {
            for entry_id in result.candidate_ids() {
                writes.relations.push(RelationWrite {
                    ledger_entry_id: entry_id.clone(),
                    statement_line_id: result.statement_line_id.clone(),
                });
            }
        }

        let mut fee_allocations = Vec::new();
        let mut fee_deferrals = Vec::new();
        for (line_id, outcome) in &self.fee_outcomes {
            match outcome {
                FeeOutcome::Allocated { allocation } => {
                    writes.fees.extend(allocation.writes());
                    fee_allocations.push(allocation.clone());
                }
                FeeOutcome::Deferred { reason } => fee_deferrals.push(FeeDeferral {
                    fee_line_id: line_id.clone(),
                    reason: *reason,
                }),
            }
        }

        let skipped = self.lines.len() - self.touched.len();
        let summary = compute_summary(
            &self.lines,
            &self.results,
            &self.fee_outcomes,
            self.rate_suggestions.len(),
            skipped,
        );

        info!(
            key = %self.lock.key(),
            matched = summary.matched,
            proposed = summary.proposed,
            missing = summary.missing,
            fees_allocated = summary.fees_allocated,
            fees_deferred = summary.fees_deferred,
            "run summarized"
        );

        Ok(RunReport {
            key: self.lock.key().clone(),
            holder: self.lock.holder().to_string(),
            state: self.state,
            lines: std::mem::take(&mut self.lines),
            results: std::mem::take(&mut self.results),
            fee_allocations,
            fee_deferrals,
            rate_suggestions: std::mem::take(&mut self.rate_suggestions),
            writes,
            summary,
        })
    }

    /// Run every phase in order.
    pub fn execute(mut self) -> Result<RunReport, ReconError> {
        self.run_matching()?;
        self.run_fee_matching()?;
        self.summarize()
    }

    fn build_index(&mut self) -> CandidateIndex {
        let key = self.lock.key().clone();
        let window = self.config.tolerance.date_window_days;
        let (from, to) = snapshot_range(&self.lines, window).unwrap_or_else(|| {
            let first = key.bill_month.resolve_day(key.bill_month.month(), 1).unwrap_or(NaiveDate::MIN);
            (first, first)
        });

        // Entries claimed by lines resolved in earlier runs
        let excluded: HashSet<String> = self
            .lines
            .iter()
            .filter(|l| l.match_status == MatchStatus::Matched)
            .flat_map(|l| l.matched_ledger_ids.iter().cloned())
            .collect();
        let mut index = CandidateIndex::build_excluding(&self.snapshot, &key.card_label, from, to, &excluded);

        let mut prior = Vec::new();
        for line in self.lines.iter().filter(|l| l.match_status == MatchStatus::Matched && !l.is_fee) {
            let entries: Vec<LedgerEntry> = self
                .snapshot
                .iter()
                .filter(|e| line.matched_ledger_ids.contains(&e.id))
                .cloned()
                .collect();
            if entries.len() != line.matched_ledger_ids.len() {
                warn!(line = %line.id, "earlier match references entries missing from snapshot");
            }
            let Some(group_id) = index.insert_prior(&line.id, entries) else {
                continue;
            };
            let Some(anchor_date) = line.anchor_date() else {
                continue;
            };
            let group = index.group(&group_id);
            prior.push(MatchResult {
                statement_line_id: line.id.clone(),
                outcome: MatchOutcome::Matched {
                    matched: MatchedGroup {
                        group: Candidate {
                            group_id: group_id.clone(),
                            entry_ids: group.map(|g| g.entry_ids()).unwrap_or_default(),
                            sum_minor: group.and_then(|g| g.home_sum()).unwrap_or(0),
                            delta_minor: 0,
                            date_diff_days: 0,
                        },
                        basis: if line.foreign().is_some() {
                            AmountBasis::Foreign
                        } else {
                            AmountBasis::Home
                        },
                        card_label: line.card_label.clone(),
                        anchor_date,
                        posting_date: line.posting_date,
                        billed_home_minor: line.twd_amount_minor,
                    },
                },
            });
        }
        self.prior = prior;
        index
    }
}
