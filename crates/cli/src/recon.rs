//! `cardrecon import-statement`, `run-reconciliation`, `validate-config`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use cardrecon::model::{RawRow, UnresolvedKind};
use cardrecon::service::parse_run_key;
use cardrecon::{MemoryLedger, ReconConfig, Reconciler, RunReport, RunSlots};

use crate::store::FileStore;
use crate::CliError;

fn holder() -> String {
    format!("cardrecon:{}", std::process::id())
}

fn load_config(path: Option<&Path>) -> Result<ReconConfig, CliError> {
    let Some(path) = path else {
        return Ok(ReconConfig::default());
    };
    let data = std::fs::read_to_string(path)
        .map_err(|e| CliError::args(format!("cannot read config {}: {e}", path.display())))?;
    Ok(ReconConfig::from_toml(&data)?)
}

/// Rows from a JSON array, or a CSV file with `page,position,text` headers.
fn read_rows(path: &Path) -> Result<Vec<RawRow>, CliError> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| CliError::args(format!("cannot read rows {}: {e}", path.display())))?;
    let is_csv = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

    let rows = if is_csv {
        csv::Reader::from_reader(data.as_bytes())
            .deserialize::<RawRow>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CliError::args(format!("invalid rows CSV {}: {e}", path.display())))?
    } else {
        serde_json::from_str(&data).map_err(|e| {
            CliError::args(format!("invalid rows JSON {}: {e}", path.display()))
                .with_hint("expected an array of {\"page\", \"position\", \"text\"} objects")
        })?
    };
    Ok(rows)
}

#[derive(Serialize)]
struct ImportOutput {
    card: String,
    bill_month: String,
    line_ids: Vec<String>,
    incomplete: usize,
}

pub fn cmd_import_statement(
    store_dir: PathBuf,
    card: String,
    month: String,
    rows_path: PathBuf,
    config_path: Option<PathBuf>,
    json_output: bool,
) -> Result<(), CliError> {
    let config = load_config(config_path.as_deref())?;
    let key = parse_run_key(&card, &month)?;
    let rows = read_rows(&rows_path)?;

    let store = FileStore::open(&store_dir)?;
    let _lock = store.lock(&key, &holder())?;
    let statements = store.load_statements()?;

    let mut reconciler = Reconciler::new(config, RunSlots::new(), holder(), statements, MemoryLedger::default());
    let line_ids = reconciler.import_statement(&key.card_label, &month, &rows)?;
    let incomplete = line_ids
        .iter()
        .filter_map(|id| reconciler.statements().get(id))
        .filter(|l| !l.is_parse_complete())
        .count();

    let (statements, _) = reconciler.into_parts();
    store.save_statements(statements)?;

    eprintln!(
        "{key}: imported {} lines from {} rows ({incomplete} with parse issues)",
        line_ids.len(),
        rows.len()
    );
    if json_output {
        let output = ImportOutput {
            card: key.card_label.clone(),
            bill_month: key.bill_month.to_string(),
            line_ids,
            incomplete,
        };
        let json = serde_json::to_string_pretty(&output)
            .map_err(|e| CliError::io(format!("JSON serialization error: {e}")))?;
        println!("{json}");
    }
    Ok(())
}

pub fn cmd_run_reconciliation(
    store_dir: PathBuf,
    card: String,
    month: String,
    config_path: Option<PathBuf>,
    json_output: bool,
    dry_run: bool,
) -> Result<(), CliError> {
    let config = load_config(config_path.as_deref())?;
    let key = parse_run_key(&card, &month)?;

    let store = FileStore::open(&store_dir)?;
    let _lock = store.lock(&key, &holder())?;
    let statements = store.load_statements()?;
    let ledger = store.load_ledger()?;

    let original_statements = statements.clone();

    let mut reconciler = Reconciler::new(config, RunSlots::new(), holder(), statements, ledger);
    let report = if dry_run {
        reconciler.plan_reconciliation(&key.card_label, &month)?
    } else {
        let report = reconciler.run_reconciliation(&key.card_label, &month)?;
        let (statements, ledger) = reconciler.into_parts();
        // Same order as the engine: lines, then ledger, undoing the lines if
        // the ledger cannot be saved.
        store.save_statements(statements)?;
        if let Err(e) = store.save_ledger(ledger) {
            if let Err(restore) = store.save_statements(original_statements) {
                warn!(%key, error = %restore.message, "cannot restore statement lines");
            }
            return Err(e);
        }
        info!(%key, "write-back saved");
        report
    };

    print_summary(&report, dry_run);
    if json_output {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| CliError::io(format!("JSON serialization error: {e}")))?;
        println!("{json}");
    }
    Ok(())
}

pub fn cmd_validate_config(path: PathBuf) -> Result<(), CliError> {
    let config = load_config(Some(&path))?;
    eprintln!(
        "{}: ok (tolerance {}, window ±{} days, {} card markers)",
        path.display(),
        format_minor(config.tolerance.amount_minor),
        config.tolerance.date_window_days,
        config.cards.len()
    );
    Ok(())
}

/// Human summary on stderr, so `--json` stdout stays machine-readable.
fn print_summary(report: &RunReport, dry_run: bool) {
    let s = &report.summary;
    eprintln!(
        "{}: {} matched, {} proposed, {} missing; fees {} allocated, {} deferred; {} skipped",
        report.key, s.matched, s.proposed, s.missing, s.fees_allocated, s.fees_deferred, s.skipped,
    );
    for item in &s.items {
        let kind = match item.kind {
            UnresolvedKind::Proposed => "proposed",
            UnresolvedKind::Missing => "missing",
            UnresolvedKind::FeeDeferred => "fee",
        };
        let amount = item.twd_amount_minor.map(format_minor).unwrap_or_else(|| "?".into());
        let date = item.date.map(|d| d.to_string()).unwrap_or_else(|| "?".into());
        eprintln!(
            "  {kind:<8} {:<28} {date:<10} {amount:>12}  {}  [{}]",
            item.statement_line_id, item.description, item.reason
        );
        for alt in &item.alternatives {
            eprintln!("           candidate: {}", alt.join(", "));
        }
    }
    if s.rate_suggestions > 0 {
        eprintln!("{} exchange-rate suggestions (see --json)", s.rate_suggestions);
    }
    if dry_run {
        let w = &report.writes;
        eprintln!(
            "dry run: {} line updates, {} ledger relations, {} fee writes not applied",
            w.line_updates.len(),
            w.relations.len(),
            w.fees.len()
        );
    }
}

fn format_minor(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_format_with_two_decimals() {
        assert_eq!(format_minor(39500), "395.00");
        assert_eq!(format_minor(7), "0.07");
        assert_eq!(format_minor(-8850), "-88.50");
    }

    #[test]
    fn csv_rows_are_read_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        std::fs::write(&path, "page,position,text\n1,1,12/20 12/22 全聯 395\n1,2,\"12/21 12/23 A, B 100\"\n").unwrap();
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].text, "12/21 12/23 A, B 100");
        assert_eq!(rows[1].position, 2);
    }

    #[test]
    fn bad_rows_file_is_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_rows(&path).unwrap_err();
        assert_eq!(err.code, crate::exit_codes::EXIT_USAGE);
    }
}
