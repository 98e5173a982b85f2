use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use tracing::debug;

use crate::error::ReconError;
use crate::model::{GroupId, LedgerEntry};

/// One batch (or singleton entry) considered as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    pub id: GroupId,
    pub card_label: String,
    /// Earliest member date.
    pub date: NaiveDate,
    /// Members, sorted by entry id.
    pub entries: Vec<LedgerEntry>,
}

impl CandidateGroup {
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    /// Lowest member id; the final tie-breaker between groups.
    pub fn lowest_entry_id(&self) -> &str {
        self.entries.first().map(|e| e.id.as_str()).unwrap_or("")
    }

    /// Sum of members recorded in `currency`, or `None` if there are none.
    pub fn currency_sum(&self, currency: &str) -> Option<i64> {
        let mut members = self.entries.iter().filter(|e| e.currency == currency).peekable();
        members.peek()?;
        Some(members.map(|e| e.amount_minor).sum())
    }

    /// Home-currency total; `None` if any member cannot be converted.
    pub fn home_sum(&self) -> Option<i64> {
        self.entries.iter().map(LedgerEntry::home_amount_minor).sum()
    }
}

/// Unconsumed ledger entries for one card, grouped by batch, for one run.
#[derive(Debug, Clone)]
pub struct CandidateIndex {
    card_label: String,
    date_from: NaiveDate,
    date_to: NaiveDate,
    groups: BTreeMap<GroupId, CandidateGroup>,
    consumed: BTreeSet<GroupId>,
}

impl CandidateIndex {
    /// Index entries on `card_label` dated within `[date_from, date_to]`.
    ///
    /// Entries already reconciled against a statement line are never
    /// candidates.
    pub fn build(
        entries: &[LedgerEntry],
        card_label: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Self {
        Self::build_excluding(entries, card_label, date_from, date_to, &HashSet::new())
    }

    /// Like [`build`](Self::build), additionally skipping `excluded` entry ids.
    pub fn build_excluding(
        entries: &[LedgerEntry],
        card_label: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
        excluded: &HashSet<String>,
    ) -> Self {
        let mut buckets: BTreeMap<GroupId, Vec<LedgerEntry>> = BTreeMap::new();

        for entry in entries {
            if entry.card_label != card_label
                || entry.date < date_from
                || entry.date > date_to
                || entry.statement_line_id.is_some()
                || excluded.contains(&entry.id)
            {
                continue;
            }
            let id = match entry.batch_id.as_deref().filter(|b| !b.is_empty()) {
                Some(batch) => GroupId::batch(batch),
                None => GroupId::singleton(&entry.id),
            };
            buckets.entry(id).or_default().push(entry.clone());
        }

        let groups: BTreeMap<GroupId, CandidateGroup> = buckets
            .into_iter()
            .filter_map(|(id, mut members)| {
                members.sort_by(|a, b| a.id.cmp(&b.id));
                let date = members.iter().map(|e| e.date).min()?;
                Some((
                    id.clone(),
                    CandidateGroup {
                        id,
                        card_label: card_label.to_string(),
                        date,
                        entries: members,
                    },
                ))
            })
            .collect();

        debug!(card = card_label, %date_from, %date_to, groups = groups.len(), "candidate index built");

        Self {
            card_label: card_label.to_string(),
            date_from,
            date_to,
            groups,
            consumed: BTreeSet::new(),
        }
    }

    /// Register entries already reconciled against `line_id` in an earlier
    /// run. The group is visible to [`group`](Self::group) but never a candidate.
    pub fn insert_prior(&mut self, line_id: &str, mut entries: Vec<LedgerEntry>) -> Option<GroupId> {
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let date = entries.iter().map(|e| e.date).min()?;
        let id = GroupId::prior(line_id);
        self.groups.insert(
            id.clone(),
            CandidateGroup {
                id: id.clone(),
                card_label: self.card_label.clone(),
                date,
                entries,
            },
        );
        self.consumed.insert(id.clone());
        Some(id)
    }

    pub fn card_label(&self) -> &str {
        &self.card_label
    }

    pub fn date_range(&self) -> (NaiveDate, NaiveDate) {
        (self.date_from, self.date_to)
    }

    /// Live groups dated within `anchor ± days`, in group-id order.
    pub fn window(&self, anchor: NaiveDate, days: u32) -> Vec<&CandidateGroup> {
        let days = i64::from(days);
        self.groups
            .values()
            .filter(|g| !self.consumed.contains(&g.id))
            .filter(|g| (g.date - anchor).num_days().abs() <= days)
            .collect()
    }

    /// Remove a group from candidacy for the rest of the run.
    pub fn consume(&mut self, id: &GroupId) -> Result<&CandidateGroup, ReconError> {
        if !self.groups.contains_key(id) {
            return Err(ReconError::UnknownGroup(id.clone()));
        }
        if !self.consumed.insert(id.clone()) {
            return Err(ReconError::GroupConsumed(id.clone()));
        }
        debug!(group = %id, "candidate group consumed");
        self.groups.get(id).ok_or_else(|| ReconError::UnknownGroup(id.clone()))
    }

    /// Any group known to the index, consumed or not.
    pub fn group(&self, id: &GroupId) -> Option<&CandidateGroup> {
        self.groups.get(id)
    }

    pub fn is_consumed(&self, id: &GroupId) -> bool {
        self.consumed.contains(id)
    }

    pub fn live_count(&self) -> usize {
        self.groups.len() - self.consumed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn entry(id: &str, date: &str, batch: Option<&str>, amount: i64) -> LedgerEntry {
        LedgerEntry {
            id: id.into(),
            date: d(date),
            card_label: "gogo".into(),
            batch_id: batch.map(Into::into),
            transaction_id: format!("tx-{id}"),
            currency: "TWD".into(),
            amount_minor: amount,
            fee_minor: 0,
            exchange_rate: None,
            statement_line_id: None,
        }
    }

    #[test]
    fn groups_by_batch_and_singletons() {
        let entries = vec![
            entry("e2", "2025-12-20", Some("b1"), 15000),
            entry("e1", "2025-12-21", Some("b1"), 20000),
            entry("e3", "2025-12-20", None, 39500),
        ];
        let index = CandidateIndex::build(&entries, "gogo", d("2025-12-01"), d("2025-12-31"));
        assert_eq!(index.live_count(), 2);
        let b1 = index.group(&GroupId::batch("b1")).unwrap();
        assert_eq!(b1.entry_ids(), vec!["e1", "e2"]);
        assert_eq!(b1.date, d("2025-12-20"));
        assert_eq!(b1.currency_sum("TWD"), Some(35000));
        assert!(index.group(&GroupId::singleton("e3")).is_some());
    }

    #[test]
    fn filters_card_range_and_linked_entries() {
        let mut other_card = entry("e1", "2025-12-20", None, 100);
        other_card.card_label = "richart".into();
        let mut linked = entry("e2", "2025-12-20", None, 100);
        linked.statement_line_id = Some("stmt:old".into());
        let entries = vec![
            other_card,
            linked,
            entry("e3", "2025-11-01", None, 100),
            entry("e4", "2025-12-20", None, 100),
        ];
        let index = CandidateIndex::build(&entries, "gogo", d("2025-12-01"), d("2025-12-31"));
        assert_eq!(index.live_count(), 1);
        assert!(index.group(&GroupId::singleton("e4")).is_some());
    }

    #[test]
    fn window_is_closed_interval() {
        let entries = vec![
            entry("e1", "2025-12-18", None, 100),
            entry("e2", "2025-12-22", None, 100),
            entry("e3", "2025-12-23", None, 100),
        ];
        let index = CandidateIndex::build(&entries, "gogo", d("2025-12-01"), d("2025-12-31"));
        let ids: Vec<_> = index
            .window(d("2025-12-20"), 2)
            .iter()
            .map(|g| g.lowest_entry_id().to_string())
            .collect();
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[test]
    fn consume_removes_group_once() {
        let entries = vec![entry("e1", "2025-12-20", None, 100)];
        let mut index = CandidateIndex::build(&entries, "gogo", d("2025-12-01"), d("2025-12-31"));
        let id = GroupId::singleton("e1");
        assert!(index.consume(&id).is_ok());
        assert!(index.window(d("2025-12-20"), 2).is_empty());
        assert!(matches!(index.consume(&id), Err(ReconError::GroupConsumed(_))));
        assert!(matches!(
            index.consume(&GroupId::singleton("nope")),
            Err(ReconError::UnknownGroup(_))
        ));
        // Still retrievable for fee allocation
        assert!(index.group(&id).is_some());
    }

    #[test]
    fn prior_groups_are_never_candidates() {
        let mut index = CandidateIndex::build(&[], "gogo", d("2025-12-01"), d("2025-12-31"));
        let id = index
            .insert_prior("stmt:1", vec![entry("e9", "2025-12-20", None, 500)])
            .unwrap();
        assert!(index.is_consumed(&id));
        assert!(index.window(d("2025-12-20"), 2).is_empty());
        assert_eq!(index.group(&id).unwrap().entry_ids(), vec!["e9"]);
    }

    #[test]
    fn home_sum_requires_rates_for_foreign_members() {
        let mut jpy = entry("e1", "2025-12-20", Some("b"), 200_000);
        jpy.currency = "JPY".into();
        let entries = vec![jpy.clone(), entry("e2", "2025-12-20", Some("b"), 100)];
        let index = CandidateIndex::build(&entries, "gogo", d("2025-12-01"), d("2025-12-31"));
        assert_eq!(index.group(&GroupId::batch("b")).unwrap().home_sum(), None);

        jpy.exchange_rate = Some(0.215);
        let entries = vec![jpy, entry("e2", "2025-12-20", Some("b"), 100)];
        let index = CandidateIndex::build(&entries, "gogo", d("2025-12-01"), d("2025-12-31"));
        assert_eq!(index.group(&GroupId::batch("b")).unwrap().home_sum(), Some(43_100));
    }
}
