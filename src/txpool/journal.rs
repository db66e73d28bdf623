//! Durable journal of local transactions.
//!
//! Append-only file of line-delimited JSON-encoded transactions, replayed
//! on startup so a restart recovers everything submitted through the local
//! entry point. Rotation rewrites the file compactly through a tmp file and
//! rename; corrupt lines are skipped with a warning, never a panic.

use crate::types::Tx;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal is not open")]
    NotOpen,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct TxJournal {
    path: PathBuf,
    writer: Option<File>,
}

impl TxJournal {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), writer: None }
    }

    /// Replay every parsable transaction into `add`, then open the file for
    /// appending. Called once at pool startup, before the first rotation.
    pub fn load(&mut self, mut add: impl FnMut(Tx)) -> Result<(), JournalError> {
        if self.path.exists() {
            let f = File::open(&self.path)?;
            let reader = BufReader::new(f);
            let mut total = 0usize;
            let mut corrupt = 0usize;
            for (lineno, line) in reader.lines().enumerate() {
                let line = match line {
                    Ok(l) if l.trim().is_empty() => continue,
                    Ok(l) => l,
                    Err(e) => {
                        warn!(lineno, "journal read error: {e}");
                        corrupt += 1;
                        continue;
                    }
                };
                match serde_json::from_str::<Tx>(&line) {
                    Ok(tx) => {
                        add(tx);
                        total += 1;
                    }
                    Err(e) => {
                        warn!(lineno, "journal corrupt line: {e}");
                        corrupt += 1;
                    }
                }
            }
            info!(total, corrupt, path = %self.path.display(), "transaction journal loaded");
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.writer = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        Ok(())
    }

    /// Append one transaction. The pool only journals local submissions.
    pub fn insert(&mut self, tx: &Tx) -> Result<(), JournalError> {
        let w = self.writer.as_mut().ok_or(JournalError::NotOpen)?;
        let line = serde_json::to_vec(tx)?;
        w.write_all(&line)?;
        w.write_all(b"\n")?;
        w.sync_data()?;
        Ok(())
    }

    /// Rewrite the journal to exactly the given live set. Atomic: written
    /// to a tmp file and renamed over the old journal.
    pub fn rotate(&mut self, live: &[Tx]) -> Result<(), JournalError> {
        self.writer = None;
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            for tx in live {
                let line = serde_json::to_vec(tx)?;
                f.write_all(&line)?;
                f.write_all(b"\n")?;
            }
            f.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.writer = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        info!(live = live.len(), path = %self.path.display(), "transaction journal rotated");
        Ok(())
    }

    pub fn close(&mut self) {
        self.writer = None;
    }
}
