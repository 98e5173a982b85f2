//! Collaborator seams: the statement-line store and the external ledger.
//!
//! The core never owns storage. It reads one ledger snapshot per run and hands
//! back one batch of writes; these traits are the only way it does either.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::error::StoreError;
use crate::model::{BillMonth, FeeWrite, LedgerEntry, LineUpdate, RelationWrite, StatementLine};

pub trait StatementStore {
    /// Append lines; ids already present are left as they are.
    fn append_lines(&mut self, lines: &[StatementLine]) -> Result<(), StoreError>;

    fn lines_for(&self, card_label: &str, bill_month: BillMonth) -> Result<Vec<StatementLine>, StoreError>;

    /// All-or-nothing: on error no line has changed.
    fn update_lines(&mut self, updates: &[LineUpdate]) -> Result<(), StoreError>;
}

pub trait LedgerStore {
    /// Point-in-time read of one card's entries within `[from, to]`.
    fn snapshot(&self, card_label: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<LedgerEntry>, StoreError>;

    /// All-or-nothing: on error no entry has changed.
    fn apply_writes(&mut self, relations: &[RelationWrite], fees: &[FeeWrite]) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// Statement lines kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatementStore {
    lines: Vec<StatementLine>,
}

impl MemoryStatementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_lines(lines: Vec<StatementLine>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[StatementLine] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<StatementLine> {
        self.lines
    }

    pub fn get(&self, id: &str) -> Option<&StatementLine> {
        self.lines.iter().find(|l| l.id == id)
    }

    /// Mark a line as manually ignored; it is skipped by later runs.
    pub fn ignore(&mut self, id: &str) -> Result<(), StoreError> {
        let line = self
            .lines
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| StoreError::new(format!("unknown statement line '{id}'")))?;
        line.match_status = crate::model::MatchStatus::Ignored;
        Ok(())
    }
}

impl StatementStore for MemoryStatementStore {
    fn append_lines(&mut self, lines: &[StatementLine]) -> Result<(), StoreError> {
        for line in lines {
            if self.get(&line.id).is_none() {
                self.lines.push(line.clone());
            }
        }
        Ok(())
    }

    fn lines_for(&self, card_label: &str, bill_month: BillMonth) -> Result<Vec<StatementLine>, StoreError> {
        Ok(self
            .lines
            .iter()
            .filter(|l| l.card_label == card_label && l.bill_month == bill_month)
            .cloned()
            .collect())
    }

    fn update_lines(&mut self, updates: &[LineUpdate]) -> Result<(), StoreError> {
        let positions: HashMap<&str, usize> =
            self.lines.iter().enumerate().map(|(i, l)| (l.id.as_str(), i)).collect();
        // Validate everything before touching anything
        let targets: Vec<usize> = updates
            .iter()
            .map(|u| {
                positions
                    .get(u.statement_line_id.as_str())
                    .copied()
                    .ok_or_else(|| StoreError::new(format!("unknown statement line '{}'", u.statement_line_id)))
            })
            .collect::<Result<_, _>>()?;

        for (update, i) in updates.iter().zip(targets) {
            let line = &mut self.lines[i];
            line.match_status = update.match_status;
            line.matched_ledger_ids = update.matched_ledger_ids.clone();
            line.fee_target_ids = update.fee_target_ids.clone();
        }
        Ok(())
    }
}

/// Ledger entries keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    entries: Vec<LedgerEntry>,
}

impl MemoryLedger {
    pub fn new(entries: Vec<LedgerEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LedgerEntry> {
        self.entries
    }

    pub fn get(&self, id: &str) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

impl LedgerStore for MemoryLedger {
    fn snapshot(&self, card_label: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.card_label == card_label && e.date >= from && e.date <= to)
            .cloned()
            .collect())
    }

    fn apply_writes(&mut self, relations: &[RelationWrite], fees: &[FeeWrite]) -> Result<(), StoreError> {
        let positions: HashMap<String, usize> =
            self.entries.iter().enumerate().map(|(i, e)| (e.id.clone(), i)).collect();
        let lookup = |id: &str| {
            positions
                .get(id)
                .copied()
                .ok_or_else(|| StoreError::new(format!("unknown ledger entry '{id}'")))
        };
        let relation_targets: Vec<usize> =
            relations.iter().map(|r| lookup(&r.ledger_entry_id)).collect::<Result<_, _>>()?;
        let fee_targets: Vec<usize> = fees.iter().map(|f| lookup(&f.ledger_entry_id)).collect::<Result<_, _>>()?;

        for (rel, i) in relations.iter().zip(relation_targets) {
            self.entries[i].statement_line_id = Some(rel.statement_line_id.clone());
        }
        for (fee, i) in fees.iter().zip(fee_targets) {
            self.entries[i].fee_minor += fee.fee_delta_minor;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MatchStatus;

    fn month() -> BillMonth {
        BillMonth::new(2025, 12).unwrap()
    }

    fn line(id: &str, card: &str) -> StatementLine {
        StatementLine {
            id: id.into(),
            bill_month: month(),
            card_label: card.into(),
            consumption_date: None,
            posting_date: None,
            fx_date: None,
            country: None,
            twd_amount_minor: Some(100),
            currency: None,
            foreign_amount_minor: None,
            description: "x".into(),
            is_fee: false,
            fee_reference_minor: None,
            raw_text: "x 1".into(),
            page: 1,
            position: 1,
            parse_issues: vec![],
            match_status: MatchStatus::Unmatched,
            matched_ledger_ids: vec![],
            fee_target_ids: vec![],
        }
    }

    fn entry(id: &str) -> LedgerEntry {
        LedgerEntry {
            id: id.into(),
            date: NaiveDate::from_ymd_opt(2025, 12, 20).unwrap(),
            card_label: "gogo".into(),
            batch_id: None,
            transaction_id: format!("tx-{id}"),
            currency: "TWD".into(),
            amount_minor: 10000,
            fee_minor: 0,
            exchange_rate: None,
            statement_line_id: None,
        }
    }

    #[test]
    fn append_keeps_existing_ids() {
        let mut store = MemoryStatementStore::new();
        store.append_lines(&[line("a", "gogo"), line("b", "gogo")]).unwrap();
        store.ignore("a").unwrap();
        store.append_lines(&[line("a", "gogo"), line("c", "richart")]).unwrap();

        assert_eq!(store.lines().len(), 3);
        assert_eq!(store.get("a").unwrap().match_status, MatchStatus::Ignored);
        assert_eq!(store.lines_for("gogo", month()).unwrap().len(), 2);
    }

    #[test]
    fn update_with_unknown_line_changes_nothing() {
        let mut store = MemoryStatementStore::from_lines(vec![line("a", "gogo")]);
        let update = |id: &str| LineUpdate {
            statement_line_id: id.into(),
            match_status: MatchStatus::Matched,
            matched_ledger_ids: vec!["e1".into()],
            fee_target_ids: vec![],
        };

        assert!(store.update_lines(&[update("a"), update("zz")]).is_err());
        assert_eq!(store.get("a").unwrap().match_status, MatchStatus::Unmatched);
        assert!(store.ignore("zz").is_err());
    }

    #[test]
    fn ledger_writes_are_all_or_nothing() {
        let mut ledger = MemoryLedger::new(vec![entry("e1"), entry("e2")]);
        let fees = [
            FeeWrite { ledger_entry_id: "e1".into(), fee_delta_minor: 62 },
            FeeWrite { ledger_entry_id: "missing".into(), fee_delta_minor: 31 },
        ];
        assert!(ledger.apply_writes(&[], &fees).is_err());
        assert_eq!(ledger.get("e1").unwrap().fee_minor, 0);

        let relations = [RelationWrite { ledger_entry_id: "e2".into(), statement_line_id: "s1".into() }];
        ledger.apply_writes(&relations, &fees[..1]).unwrap();
        assert_eq!(ledger.get("e1").unwrap().fee_minor, 62);
        assert_eq!(ledger.get("e2").unwrap().statement_line_id.as_deref(), Some("s1"));
    }

    #[test]
    fn snapshot_filters_card_and_closed_range() {
        let mut other = entry("e3");
        other.card_label = "richart".into();
        let mut late = entry("e4");
        late.date = NaiveDate::from_ymd_opt(2025, 12, 23).unwrap();
        let ledger = MemoryLedger::new(vec![entry("e1"), other, late]);

        let from = NaiveDate::from_ymd_opt(2025, 12, 18).unwrap();
        let to = NaiveDate::from_ymd_opt(2025, 12, 22).unwrap();
        let ids: Vec<String> = ledger.snapshot("gogo", from, to).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["e1"]);
        assert_eq!(ledger.snapshot("gogo", from, NaiveDate::from_ymd_opt(2025, 12, 23).unwrap()).unwrap().len(), 2);
    }
}
