//! Exclusive lock file guarding against overlapping runs.
//!
//! Two runs against the same state records could both decide a file is new
//! and deliver it twice. The lock is a plain file created with `create_new`;
//! it is removed when the guard drops. A crashed run leaves it behind and an
//! operator must delete it.

use chrono::Utc;
use std::{
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock `{}` is held by another run ({holder})", path.display())]
    Held { path: PathBuf, holder: String },
    #[error("could not create lock `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".into());
                return Err(LockError::Held { path, holder });
            }
            Err(source) => return Err(LockError::Io { path, source }),
        };

        let stamp = format!("pid {} since {}\n", std::process::id(), Utc::now().to_rfc3339());
        if let Err(source) = file.write_all(stamp.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(LockError::Io { path, source });
        }
        debug!(lock = %path.display(), "acquired run lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to remove run lock");
        }
    }
}
