//! The two commands a host exposes: import a statement, run reconciliation.

use tracing::{error, info, warn};

use crate::config::ReconConfig;
use crate::error::ReconError;
use crate::lock::{RunKey, RunSlots};
use crate::model::{BillMonth, LineUpdate, RawRow, StatementLine};
use crate::normalize::StatementNormalizer;
use crate::run::{snapshot_range, ReconciliationRun, RunReport};
use crate::store::{LedgerStore, StatementStore};

/// Validate the (card, month) pair every command is scoped to.
pub fn parse_run_key(card_label: &str, bill_month: &str) -> Result<RunKey, ReconError> {
    let card_label = card_label.trim();
    if card_label.is_empty() {
        return Err(ReconError::InvalidInput("card is required".into()));
    }
    let month: BillMonth = bill_month.parse().map_err(ReconError::InvalidInput)?;
    Ok(RunKey::new(card_label, month))
}

pub struct Reconciler<S, L> {
    config: ReconConfig,
    slots: RunSlots,
    holder: String,
    statements: S,
    ledger: L,
}

impl<S: StatementStore, L: LedgerStore> Reconciler<S, L> {
    pub fn new(config: ReconConfig, slots: RunSlots, holder: impl Into<String>, statements: S, ledger: L) -> Self {
        Self {
            config,
            slots,
            holder: holder.into(),
            statements,
            ledger,
        }
    }

    pub fn statements(&self) -> &S {
        &self.statements
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn into_parts(self) -> (S, L) {
        (self.statements, self.ledger)
    }

    /// Normalize raw rows and append them to the statement store.
    ///
    /// Returns the ids of every line produced, including ones the store
    /// already held from an earlier import of the same rows.
    pub fn import_statement(
        &mut self,
        card_label: &str,
        bill_month: &str,
        rows: &[RawRow],
    ) -> Result<Vec<String>, ReconError> {
        let key = parse_run_key(card_label, bill_month)?;
        let lines = StatementNormalizer::new(&self.config).normalize(rows, key.bill_month, &key.card_label);
        self.statements.append_lines(&lines)?;

        let incomplete = lines.iter().filter(|l| !l.is_parse_complete()).count();
        info!(%key, lines = lines.len(), incomplete, "statement imported");
        Ok(lines.into_iter().map(|l| l.id).collect())
    }

    /// Reconcile and commit the write batch.
    ///
    /// Statement lines are written first and the ledger second. A failure at
    /// either step leaves both stores as they were before the run, so the
    /// run can be retried.
    pub fn run_reconciliation(&mut self, card_label: &str, bill_month: &str) -> Result<RunReport, ReconError> {
        let key = parse_run_key(card_label, bill_month)?;
        let (report, before) = self.plan(key)?;
        let writes = &report.writes;

        self.statements.update_lines(&writes.line_updates)?;
        if let Err(e) = self.ledger.apply_writes(&writes.relations, &writes.fees) {
            let restore: Vec<LineUpdate> = writes
                .line_updates
                .iter()
                .filter_map(|u| before.iter().find(|l| l.id == u.statement_line_id))
                .map(LineUpdate::from_line)
                .collect();
            match self.statements.update_lines(&restore) {
                Ok(()) => warn!(key = %report.key, error = %e, "ledger write failed; statement lines restored"),
                Err(restore_err) => error!(
                    key = %report.key,
                    error = %e,
                    restore_error = %restore_err,
                    "ledger write failed and statement lines could not be restored"
                ),
            }
            return Err(e.into());
        }
        Ok(report)
    }

    /// Reconcile without writing anything back.
    pub fn plan_reconciliation(&self, card_label: &str, bill_month: &str) -> Result<RunReport, ReconError> {
        let key = parse_run_key(card_label, bill_month)?;
        self.plan(key).map(|(report, _)| report)
    }

    /// Run under the slot for `key`. Also returns the lines as read, before
    /// the run changed them.
    fn plan(&self, key: RunKey) -> Result<(RunReport, Vec<StatementLine>), ReconError> {
        let lock = self.slots.acquire(key.clone(), self.holder.clone())?;

        let lines = self.statements.lines_for(&key.card_label, key.bill_month)?;
        let snapshot = match snapshot_range(&lines, self.config.tolerance.date_window_days) {
            Some((from, to)) => self.ledger.snapshot(&key.card_label, from, to)?,
            None => Vec::new(),
        };

        let mut run = ReconciliationRun::new(lock, snapshot, self.config.clone());
        run.collect(lines.iter().cloned())?;
        Ok((run.execute()?, lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_key_requires_card_and_month() {
        assert!(matches!(parse_run_key("", "2025-12"), Err(ReconError::InvalidInput(_))));
        assert!(matches!(parse_run_key("gogo", "2025/12"), Err(ReconError::InvalidInput(_))));
        assert!(matches!(parse_run_key("gogo", "2025-13"), Err(ReconError::InvalidInput(_))));
        let key = parse_run_key(" gogo ", "2025-12").unwrap();
        assert_eq!(key.card_label, "gogo");
        assert_eq!(key.bill_month.to_string(), "2025-12");
    }
}
