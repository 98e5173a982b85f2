use tracing::{debug, warn};

use crate::config::ReconConfig;
use crate::index::{CandidateGroup, CandidateIndex};
use crate::model::{
    AmountBasis, Candidate, MatchOutcome, MatchResult, MatchedGroup, MissingReason, StatementLine,
};

/// Match one statement line against the live groups of `index`.
///
/// Exactly one group within tolerance is matched and consumed. Several are
/// proposed (nothing consumed). None, or a line without an amount or date,
/// is missing.
pub fn match_line(line: &StatementLine, index: &mut CandidateIndex, config: &ReconConfig) -> MatchResult {
    let missing = |reason: MissingReason| {
        debug!(line = %line.id, reason = reason.code(), "statement line missing");
        MatchResult {
            statement_line_id: line.id.clone(),
            outcome: MatchOutcome::Missing { reason },
        }
    };

    if !line.has_amount() {
        warn!(line = %line.id, reason = MissingReason::NoAmount.code(), "line has no comparable amount");
        return missing(MissingReason::NoAmount);
    }
    let Some(anchor) = line.anchor_date() else {
        warn!(line = %line.id, reason = MissingReason::NoDate.code(), "line has no usable date");
        return missing(MissingReason::NoDate);
    };
    if line.card_label != index.card_label() {
        warn!(line = %line.id, card = %line.card_label, index_card = index.card_label(), "card mismatch");
        return missing(MissingReason::NoCandidate);
    }

    let (basis, line_amount) = match line.foreign() {
        Some((_, amount)) => (AmountBasis::Foreign, amount),
        None => match line.twd_amount_minor {
            Some(amount) => (AmountBasis::Home, amount),
            None => return missing(MissingReason::NoAmount),
        },
    };

    let mut hits: Vec<Candidate> = index
        .window(anchor, config.tolerance.date_window_days)
        .into_iter()
        .filter_map(|group| {
            let sum = group_sum(group, line, basis)?;
            let delta = sum - line_amount;
            if delta.abs() > config.tolerance.amount_minor {
                return None;
            }
            Some(Candidate {
                group_id: group.id.clone(),
                entry_ids: group.entry_ids(),
                sum_minor: sum,
                delta_minor: delta,
                date_diff_days: (group.date - anchor).num_days().abs(),
            })
        })
        .collect();

    // Closest date first, then lowest entry id
    hits.sort_by(|a, b| {
        a.date_diff_days
            .cmp(&b.date_diff_days)
            .then_with(|| a.entry_ids.first().cmp(&b.entry_ids.first()))
    });

    let outcome = match hits.len() {
        0 => return missing(MissingReason::NoCandidate),
        1 => {
            let hit = hits.remove(0);
            if let Err(e) = index.consume(&hit.group_id) {
                // The window only yields live groups
                warn!(line = %line.id, group = %hit.group_id, error = %e, "consume failed");
                return missing(MissingReason::NoCandidate);
            }
            debug!(
                line = %line.id,
                group = %hit.group_id,
                date_diff_days = hit.date_diff_days,
                "statement line matched"
            );
            MatchOutcome::Matched {
                matched: MatchedGroup {
                    group: hit,
                    basis,
                    card_label: line.card_label.clone(),
                    anchor_date: anchor,
                    posting_date: line.posting_date,
                    billed_home_minor: line.twd_amount_minor,
                },
            }
        }
        n => {
            hits.truncate(config.matching.max_alternatives);
            debug!(line = %line.id, candidates = n, kept = hits.len(), "AMBIGUOUS_MATCH: proposing alternatives");
            MatchOutcome::Proposed { alternatives: hits }
        }
    };

    MatchResult {
        statement_line_id: line.id.clone(),
        outcome,
    }
}

fn group_sum(group: &CandidateGroup, line: &StatementLine, basis: AmountBasis) -> Option<i64> {
    match basis {
        AmountBasis::Foreign => line.foreign().and_then(|(cur, _)| group.currency_sum(cur)),
        AmountBasis::Home => group.home_sum(),
    }
}
