//! src/services/state_store.rs
//!
//! StateStore: the two append-only, line-oriented records of which files
//! have been handled. One filename per line, no escaping. Both files must
//! exist before a run starts; the job refuses to guess what was processed.

use crate::models::processing_state::ProcessingState;
use std::{
    collections::BTreeSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state record `{}` not found", .0.display())]
    Missing(PathBuf),
    #[error("name `{0}` cannot be stored in a line-oriented record")]
    InvalidName(String),
    #[error("state record `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

/// Which of the two records an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Posted,
    Failed,
}

/// StateStore loads both records once and then appends outcomes as they
/// happen. Entries are never rewritten or removed.
#[derive(Debug)]
pub struct StateStore {
    posted_path: PathBuf,
    failed_path: PathBuf,

    /// Snapshot taken at load, used only for skip filtering.
    prior: ProcessingState,

    /// Prior entries plus everything recorded during this run.
    current: ProcessingState,
}

impl StateStore {
    /// Open the store, reading both records.
    ///
    /// A missing record is fatal: without it the job cannot tell which files
    /// were already delivered.
    pub async fn open(
        posted_path: impl Into<PathBuf>,
        failed_path: impl Into<PathBuf>,
    ) -> StateStoreResult<Self> {
        let posted_path = posted_path.into();
        let failed_path = failed_path.into();
        let prior = ProcessingState {
            posted: read_record(&posted_path).await?,
            failed: read_record(&failed_path).await?,
        };
        debug!(
            posted = prior.posted.len(),
            failed = prior.failed.len(),
            total = prior.len(),
            "loaded processing state"
        );

        Ok(Self {
            posted_path,
            failed_path,
            current: prior.clone(),
            prior,
        })
    }

    /// State as loaded at the start of the run.
    pub fn prior(&self) -> &ProcessingState {
        &self.prior
    }

    /// State including outcomes recorded during this run.
    pub fn current(&self) -> &ProcessingState {
        &self.current
    }

    /// True if `name` was handled by an earlier run.
    pub fn is_known(&self, name: &str) -> bool {
        self.prior.is_known(name)
    }

    pub async fn record_posted(&mut self, name: &str) -> StateStoreResult<()> {
        self.record(Outcome::Posted, name).await
    }

    pub async fn record_failed(&mut self, name: &str) -> StateStoreResult<()> {
        self.record(Outcome::Failed, name).await
    }

    /// Append `name` to the chosen record and fsync before returning.
    ///
    /// Names already present in that record are not written again.
    pub async fn record(&mut self, outcome: Outcome, name: &str) -> StateStoreResult<()> {
        ensure_name_storable(name)?;

        let (path, set) = match outcome {
            Outcome::Posted => (&self.posted_path, &mut self.current.posted),
            Outcome::Failed => (&self.failed_path, &mut self.current.failed),
        };
        if set.contains(name) {
            debug!(file = name, ?outcome, "already recorded, skipping write");
            return Ok(());
        }

        append_line(path, name).await?;
        set.insert(name.to_string());
        Ok(())
    }
}

/// Reject names that would corrupt the line-oriented format.
pub fn ensure_name_storable(name: &str) -> StateStoreResult<()> {
    if name.trim().is_empty() || name.contains(['\n', '\r']) {
        return Err(StateStoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Read one record into a set.
///
/// Only the line terminator is stripped, so names compare exactly as they
/// were written. Blank lines are ignored.
async fn read_record(path: &Path) -> StateStoreResult<BTreeSet<String>> {
    let contents = fs::read_to_string(path).await.map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            StateStoreError::Missing(path.to_path_buf())
        } else {
            StateStoreError::Io {
                path: path.to_path_buf(),
                source: err,
            }
        }
    })?;

    Ok(contents
        .lines()
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// Append `line\n` and make it durable.
///
/// The record must already exist; it is never created here.
async fn append_line(path: &Path, line: &str) -> StateStoreResult<()> {
    let io_err = |source| StateStoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StateStoreError::Missing(path.to_path_buf())
            } else {
                io_err(err)
            }
        })?;

    let mut entry = String::with_capacity(line.len() + 1);
    entry.push_str(line);
    entry.push('\n');

    file.write_all(entry.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    Ok(())
}
