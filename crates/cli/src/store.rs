//! JSON file store: `DIR/ledger.json`, `DIR/statement_lines.json`, `DIR/locks/`.
//!
//! Files are loaded into the engine's in-memory stores, and saved back by
//! writing a sibling temp file and renaming it over the original.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use cardrecon::{MemoryLedger, MemoryStatementStore, RunKey};

use crate::exit_codes::{EXIT_ERROR, EXIT_RUN_ACTIVE};
use crate::CliError;

const LEDGER_FILE: &str = "ledger.json";
const STATEMENTS_FILE: &str = "statement_lines.json";
const LOCKS_DIR: &str = "locks";

pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, CliError> {
        fs::create_dir_all(dir.join(LOCKS_DIR))
            .map_err(|e| CliError::io(format!("cannot create store {}: {e}", dir.display())))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    pub fn load_ledger(&self) -> Result<MemoryLedger, CliError> {
        Ok(MemoryLedger::new(read_array(&self.dir.join(LEDGER_FILE))?))
    }

    pub fn load_statements(&self) -> Result<MemoryStatementStore, CliError> {
        Ok(MemoryStatementStore::from_lines(read_array(&self.dir.join(STATEMENTS_FILE))?))
    }

    pub fn save_ledger(&self, ledger: MemoryLedger) -> Result<(), CliError> {
        write_array(&self.dir.join(LEDGER_FILE), &ledger.into_entries())
    }

    pub fn save_statements(&self, statements: MemoryStatementStore) -> Result<(), CliError> {
        write_array(&self.dir.join(STATEMENTS_FILE), &statements.into_lines())
    }

    /// Cross-process guard for one (card, month). Fails with exit 3 while
    /// another process holds it.
    pub fn lock(&self, key: &RunKey, holder: &str) -> Result<LockFile, CliError> {
        let path = self.dir.join(LOCKS_DIR).join(lock_file_name(key));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let current = fs::read_to_string(&path).unwrap_or_default();
                return Err(CliError {
                    code: EXIT_RUN_ACTIVE,
                    message: format!("run already active for {key} (held by '{}')", current.trim()),
                    hint: Some(format!(
                        "wait for it to finish, or remove {} if that process is gone",
                        path.display()
                    )),
                });
            }
            Err(e) => return Err(CliError::io(format!("cannot create {}: {e}", path.display()))),
        };
        file.write_all(holder.as_bytes())
            .map_err(|e| CliError::io(format!("cannot write {}: {e}", path.display())))?;
        debug!(%key, path = %path.display(), "lock file created");
        Ok(LockFile { path })
    }
}

/// Removes its lock file on drop.
pub struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "cannot remove lock file");
        }
    }
}

/// `{card}@{month}.lock`. Characters other than alphanumerics and `-` are
/// written as `_` plus the hex of their UTF-8 bytes, so distinct cards never
/// share a file.
fn lock_file_name(key: &RunKey) -> String {
    let mut card = String::with_capacity(key.card_label.len());
    for c in key.card_label.chars() {
        if c.is_alphanumeric() || c == '-' {
            card.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                card.push_str(&format!("_{b:02x}"));
            }
        }
    }
    format!("{card}@{}.lock", key.bill_month)
}

/// A missing file is an empty collection.
fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, CliError> {
    let data = match fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CliError::io(format!("cannot read {}: {e}", path.display()))),
    };
    serde_json::from_str(&data).map_err(|e| CliError {
        code: EXIT_ERROR,
        message: format!("{} is not valid: {e}", path.display()),
        hint: None,
    })
}

fn write_array<T: Serialize>(path: &Path, items: &[T]) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(items)
        .map_err(|e| CliError::io(format!("JSON serialization error: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json + "\n").map_err(|e| CliError::io(format!("cannot write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| CliError::io(format!("cannot replace {}: {e}", path.display())))
}
