use std::collections::HashMap;

use crate::model::{
    FeeOutcome, MatchOutcome, MatchResult, MatchStatus, RunSummary, StatementLine, UnresolvedItem,
    UnresolvedKind,
};

/// Compute summary counts and per-item detail for everything not matched.
pub fn compute_summary(
    lines: &[StatementLine],
    results: &[MatchResult],
    fees: &[(String, FeeOutcome)],
    rate_suggestions: usize,
    skipped: usize,
) -> RunSummary {
    let by_id: HashMap<&str, &StatementLine> = lines.iter().map(|l| (l.id.as_str(), l)).collect();
    let mut summary = RunSummary {
        skipped,
        ignored: lines.iter().filter(|l| l.match_status == MatchStatus::Ignored).count(),
        rate_suggestions,
        ..RunSummary::default()
    };

    for r in results {
        let (kind, reason, alternatives) = match &r.outcome {
            MatchOutcome::Matched { .. } => {
                summary.matched += 1;
                continue;
            }
            MatchOutcome::Proposed { alternatives } => {
                summary.proposed += 1;
                let alts = alternatives.iter().map(|c| c.entry_ids.clone()).collect();
                (UnresolvedKind::Proposed, "AMBIGUOUS_MATCH".to_string(), alts)
            }
            MatchOutcome::Missing { reason } => {
                summary.missing += 1;
                (UnresolvedKind::Missing, reason.code().to_string(), Vec::new())
            }
        };
        if let Some(line) = by_id.get(r.statement_line_id.as_str()) {
            summary.items.push(item(line, kind, reason, alternatives));
        }
    }

    for (line_id, outcome) in fees {
        match outcome {
            FeeOutcome::Allocated { .. } => summary.fees_allocated += 1,
            FeeOutcome::Deferred { reason } => {
                summary.fees_deferred += 1;
                if let Some(line) = by_id.get(line_id.as_str()) {
                    summary.items.push(item(
                        line,
                        UnresolvedKind::FeeDeferred,
                        reason.code().to_string(),
                        Vec::new(),
                    ));
                }
            }
        }
    }

    summary
}

fn item(
    line: &StatementLine,
    kind: UnresolvedKind,
    reason: String,
    alternatives: Vec<Vec<String>>,
) -> UnresolvedItem {
    UnresolvedItem {
        statement_line_id: line.id.clone(),
        kind,
        reason,
        description: line.description.clone(),
        twd_amount_minor: line.twd_amount_minor,
        currency: line.currency.clone(),
        foreign_amount_minor: line.foreign_amount_minor,
        date: line.anchor_date(),
        alternatives,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BillMonth, Candidate, DeferReason, GroupId, MissingReason};

    fn line(id: &str) -> StatementLine {
        StatementLine {
            id: id.into(),
            bill_month: BillMonth::new(2025, 12).unwrap(),
            card_label: "X".into(),
            consumption_date: None,
            posting_date: None,
            fx_date: None,
            country: None,
            twd_amount_minor: Some(100),
            currency: None,
            foreign_amount_minor: None,
            description: format!("desc {id}"),
            is_fee: false,
            fee_reference_minor: None,
            raw_text: String::new(),
            page: 1,
            position: 1,
            parse_issues: vec![],
            match_status: MatchStatus::Unmatched,
            matched_ledger_ids: vec![],
            fee_target_ids: vec![],
        }
    }

    fn candidate(id: &str) -> Candidate {
        Candidate {
            group_id: GroupId::singleton(id),
            entry_ids: vec![id.into()],
            sum_minor: 100,
            delta_minor: 0,
            date_diff_days: 0,
        }
    }

    #[test]
    fn summary_counts_and_items() {
        let mut ignored = line("d");
        ignored.match_status = MatchStatus::Ignored;
        let lines = vec![line("a"), line("b"), line("c"), ignored];
        let results = vec![
            MatchResult {
                statement_line_id: "a".into(),
                outcome: MatchOutcome::Proposed {
                    alternatives: vec![candidate("e1"), candidate("e2")],
                },
            },
            MatchResult {
                statement_line_id: "b".into(),
                outcome: MatchOutcome::Missing {
                    reason: MissingReason::NoAmount,
                },
            },
        ];
        let fees = vec![(
            "c".to_string(),
            FeeOutcome::Deferred {
                reason: DeferReason::Ambiguous,
            },
        )];
        let summary = compute_summary(&lines, &results, &fees, 0, 2);
        assert_eq!(summary.matched, 0);
        assert_eq!(summary.proposed, 1);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.fees_deferred, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.items.len(), 3);
        assert_eq!(summary.items[0].alternatives, vec![vec!["e1"], vec!["e2"]]);
        assert_eq!(summary.items[1].reason, "NO_AMOUNT");
        assert_eq!(summary.items[2].kind, UnresolvedKind::FeeDeferred);
        assert_eq!(summary.items[2].description, "desc c");
    }
}
