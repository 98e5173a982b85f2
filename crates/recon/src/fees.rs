//! Foreign-transaction fee allocation and exchange-rate advisories.

use tracing::{debug, warn};

use crate::config::ReconConfig;
use crate::index::CandidateIndex;
use crate::model::{
    DeferReason, FeeAllocation, FeeOutcome, FeeShare, MatchResult, MatchedGroup, RateSuggestion,
    StatementLine,
};

/// Tie a fee line to exactly one matched group and split its amount.
///
/// Zero or several candidate groups defer the fee; it is never resolved
/// ambiguously.
pub fn allocate(
    fee_line: &StatementLine,
    results: &[MatchResult],
    index: &CandidateIndex,
    config: &ReconConfig,
) -> FeeOutcome {
    let deferred = |reason: DeferReason| {
        warn!(line = %fee_line.id, reason = reason.code(), "fee allocation deferred");
        FeeOutcome::Deferred { reason }
    };

    let Some(reference) = fee_line.fee_reference_minor else {
        return deferred(DeferReason::NoReference);
    };
    let Some(fee_minor) = fee_line.twd_amount_minor else {
        return deferred(DeferReason::NoAmount);
    };
    let Some(fee_anchor) = fee_line.anchor_date() else {
        return deferred(DeferReason::ReferenceNotFound);
    };

    let window = i64::from(config.tolerance.date_window_days);
    let hits: Vec<&MatchedGroup> = results
        .iter()
        .filter_map(MatchResult::matched)
        .filter(|m| m.card_label == fee_line.card_label)
        .filter(|m| {
            let near_anchor = (m.anchor_date - fee_anchor).num_days().abs() <= window;
            let near_posting = m
                .posting_date
                .is_some_and(|p| (p - fee_anchor).num_days().abs() <= window);
            near_anchor || near_posting
        })
        .filter(|m| {
            let total = m.billed_home_minor.or_else(|| {
                index.group(&m.group.group_id).and_then(|g| g.home_sum())
            });
            total.is_some_and(|t| (t - reference).abs() <= config.tolerance.amount_minor)
        })
        .collect();

    let target = match hits.as_slice() {
        [] => return deferred(DeferReason::ReferenceNotFound),
        [one] => *one,
        _ => return deferred(DeferReason::Ambiguous),
    };

    let Some(group) = index.group(&target.group.group_id) else {
        return deferred(DeferReason::ReferenceNotFound);
    };
    let weights: Vec<(String, i64)> = group
        .entries
        .iter()
        .map(|e| (e.id.clone(), e.amount_minor.abs()))
        .collect();

    let Some(shares) = split_proportionally(fee_minor, &weights) else {
        return deferred(DeferReason::ZeroBase);
    };

    debug!(line = %fee_line.id, group = %group.id, fee_minor, "fee allocated");
    FeeOutcome::Allocated {
        allocation: FeeAllocation {
            fee_line_id: fee_line.id.clone(),
            group_id: group.id.clone(),
            fee_minor,
            shares,
        },
    }
}

/// Split `total` across `weights` so the shares sum to `total` exactly.
///
/// Each share is truncated; the remainder goes to the largest weight (lowest
/// id on ties). Returns `None` when the weights sum to zero.
pub fn split_proportionally(total: i64, weights: &[(String, i64)]) -> Option<Vec<FeeShare>> {
    let base: i128 = weights.iter().map(|(_, w)| i128::from(*w)).sum();
    if base == 0 {
        return None;
    }

    let mut shares: Vec<FeeShare> = weights
        .iter()
        .map(|(id, w)| FeeShare {
            ledger_entry_id: id.clone(),
            allocated_minor: (i128::from(total) * i128::from(*w) / base) as i64,
        })
        .collect();

    let assigned: i64 = shares.iter().map(|s| s.allocated_minor).sum();
    let remainder = total - assigned;
    if remainder != 0 {
        let largest = weights
            .iter()
            .enumerate()
            .max_by(|(_, (a_id, a)), (_, (b_id, b))| a.cmp(b).then_with(|| b_id.cmp(a_id)))
            .map(|(i, _)| i)?;
        shares[largest].allocated_minor += remainder;
    }

    Some(shares)
}

/// Rate advisories for a matched foreign line.
///
/// The implied rate is `twd / foreign`; entries whose recorded rate deviates
/// by more than `fees.rate_deviation` get a suggestion. Nothing is applied.
pub fn rate_suggestions(
    line: &StatementLine,
    matched: &MatchedGroup,
    index: &CandidateIndex,
    config: &ReconConfig,
) -> Vec<RateSuggestion> {
    let (Some((currency, foreign)), Some(twd)) = (line.foreign(), line.twd_amount_minor) else {
        return Vec::new();
    };
    if foreign == 0 {
        return Vec::new();
    }
    let Some(group) = index.group(&matched.group.group_id) else {
        return Vec::new();
    };

    let implied = twd as f64 / foreign as f64;
    group
        .entries
        .iter()
        .filter(|e| e.currency == currency)
        .filter_map(|e| {
            let recorded = e.exchange_rate.filter(|r| r.is_finite() && *r > 0.0)?;
            let deviation = (implied - recorded).abs() / recorded;
            if deviation <= config.fees.rate_deviation {
                return None;
            }
            debug!(entry = %e.id, recorded, implied, deviation, "exchange rate advisory");
            Some(RateSuggestion {
                ledger_entry_id: e.id.clone(),
                statement_line_id: line.id.clone(),
                currency: currency.to_string(),
                recorded_rate: recorded,
                implied_rate: implied,
                deviation,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AmountBasis, BillMonth, Candidate, GroupId, LedgerEntry, MatchOutcome, MatchStatus,
    };
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn entry(id: &str, batch: &str, cur: &str, amount: i64, rate: Option<f64>) -> LedgerEntry {
        LedgerEntry {
            id: id.into(),
            date: d("2025-12-20"),
            card_label: "X".into(),
            batch_id: Some(batch.into()),
            transaction_id: format!("tx-{id}"),
            currency: cur.into(),
            amount_minor: amount,
            fee_minor: 0,
            exchange_rate: rate,
            statement_line_id: None,
        }
    }

    fn fee_line(reference: Option<i64>, twd: i64) -> StatementLine {
        StatementLine {
            id: "fee1".into(),
            bill_month: BillMonth::new(2025, 12).unwrap(),
            card_label: "X".into(),
            consumption_date: None,
            posting_date: Some(d("2025-12-22")),
            fx_date: None,
            country: None,
            twd_amount_minor: Some(twd),
            currency: None,
            foreign_amount_minor: None,
            description: "國外交易服務費".into(),
            is_fee: true,
            fee_reference_minor: reference,
            raw_text: String::new(),
            page: 1,
            position: 9,
            parse_issues: vec![],
            match_status: MatchStatus::Unmatched,
            matched_ledger_ids: vec![],
            fee_target_ids: vec![],
        }
    }

    fn matched(line_id: &str, group: &str, billed: i64) -> MatchResult {
        MatchResult {
            statement_line_id: line_id.into(),
            outcome: MatchOutcome::Matched {
                matched: MatchedGroup {
                    group: Candidate {
                        group_id: GroupId::batch(group),
                        entry_ids: vec![],
                        sum_minor: 0,
                        delta_minor: 0,
                        date_diff_days: 0,
                    },
                    basis: AmountBasis::Foreign,
                    card_label: "X".into(),
                    anchor_date: d("2025-12-20"),
                    posting_date: Some(d("2025-12-22")),
                    billed_home_minor: Some(billed),
                },
            },
        }
    }

    fn index(entries: &[LedgerEntry]) -> CandidateIndex {
        CandidateIndex::build(entries, "X", d("2025-12-01"), d("2025-12-31"))
    }

    #[test]
    fn proportional_split_of_fee() {
        let idx = index(&[
            entry("e1", "B2", "JPY", 200_000, None),
            entry("e2", "B2", "JPY", 100_000, None),
        ]);
        let results = vec![matched("l1", "B2", 300_000)];
        let FeeOutcome::Allocated { allocation } =
            allocate(&fee_line(Some(300_000), 9300), &results, &idx, &ReconConfig::default())
        else {
            panic!("expected allocation");
        };
        assert_eq!(allocation.group_id, GroupId::batch("B2"));
        assert_eq!(allocation.shares[0].allocated_minor, 6200);
        assert_eq!(allocation.shares[1].allocated_minor, 3100);
        assert_eq!(allocation.allocated_total(), 9300);
    }

    #[test]
    fn remainder_goes_to_largest_share() {
        let weights = vec![("a".to_string(), 1), ("b".to_string(), 1), ("c".to_string(), 2)];
        let shares = split_proportionally(101, &weights).unwrap();
        let amounts: Vec<i64> = shares.iter().map(|s| s.allocated_minor).collect();
        assert_eq!(amounts, vec![25, 25, 51]);
    }

    #[test]
    fn remainder_tie_prefers_lowest_id() {
        let weights = vec![("b".to_string(), 1), ("a".to_string(), 1), ("c".to_string(), 1)];
        let shares = split_proportionally(100, &weights).unwrap();
        let amounts: Vec<i64> = shares.iter().map(|s| s.allocated_minor).collect();
        assert_eq!(amounts, vec![33, 34, 33]);
    }

    #[test]
    fn zero_weights_cannot_split() {
        assert!(split_proportionally(100, &[("a".to_string(), 0)]).is_none());
    }

    #[test]
    fn no_matching_group_defers() {
        let idx = index(&[entry("e1", "B2", "JPY", 200_000, None)]);
        let results = vec![matched("l1", "B2", 300_000)];
        let outcome = allocate(&fee_line(Some(123_400), 40), &results, &idx, &ReconConfig::default());
        assert_eq!(outcome, FeeOutcome::Deferred { reason: DeferReason::ReferenceNotFound });
    }

    #[test]
    fn two_matching_groups_defer() {
        let idx = index(&[
            entry("e1", "B2", "JPY", 200_000, None),
            entry("e2", "B3", "JPY", 200_000, None),
        ]);
        let results = vec![matched("l1", "B2", 300_000), matched("l2", "B3", 300_000)];
        let outcome = allocate(&fee_line(Some(300_000), 93), &results, &idx, &ReconConfig::default());
        assert_eq!(outcome, FeeOutcome::Deferred { reason: DeferReason::Ambiguous });
    }

    #[test]
    fn missing_reference_defers() {
        let idx = index(&[]);
        let outcome = allocate(&fee_line(None, 93), &[], &idx, &ReconConfig::default());
        assert_eq!(outcome, FeeOutcome::Deferred { reason: DeferReason::NoReference });
    }

    #[test]
    fn rate_advisory_above_threshold() {
        let idx = index(&[
            entry("e1", "J", "JPY", 500_000, Some(0.215)),
            entry("e2", "J", "JPY", 200_000, Some(0.25)),
        ]);
        let mut line = fee_line(None, 0);
        line.is_fee = false;
        line.twd_amount_minor = Some(150_000);
        line.currency = Some("JPY".into());
        line.foreign_amount_minor = Some(700_000);
        let m = matched(&line.id, "J", 150_000);
        let suggestions = rate_suggestions(&line, m.matched().unwrap(), &idx, &ReconConfig::default());
        // implied 0.2143; e1 within 1%, e2 is not
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].ledger_entry_id, "e2");
        assert!((suggestions[0].implied_rate - 150_000.0 / 700_000.0).abs() < 1e-12);
    }
}
