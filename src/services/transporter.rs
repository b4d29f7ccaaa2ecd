//! src/services/transporter.rs
//!
//! Transporter: delivers one payload to the remote drop directory and checks
//! that it landed intact. The protocol lives behind `SftpConnector` /
//! `RemoteSession`; this file owns the per-transfer state machine:
//!
//! `Disconnected → Connected → LayoutVerified → Uploaded → Verified → Closed`
//!
//! Any failure jumps straight to `Closed`. Nothing is resumed; the next run
//! starts again from `Disconnected`.

use crate::{
    errors::{TransferError, TransferResult},
    models::receipt::UploadReceipt,
};
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

/// Directory of the login directory as seen by `list_dir`.
pub const LOGIN_DIR: &str = ".";

/// Blocking operations on an authenticated remote session.
///
/// Paths are `/`-separated and relative to the login directory.
pub trait RemoteSession: Send {
    /// Names of the entries directly inside `dir`.
    fn list_dir(&mut self, dir: &str) -> TransferResult<Vec<String>>;

    /// Create or truncate `path` and write `payload` to it.
    fn write_file(&mut self, path: &str, payload: &[u8]) -> TransferResult<()>;

    /// Size of `path`, or `None` when it does not exist.
    fn file_size(&mut self, path: &str) -> TransferResult<Option<u64>>;

    /// Tear the session down. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Opens authenticated sessions against the configured host.
pub trait SftpConnector: Send + Sync {
    type Session: RemoteSession;

    fn connect(&self) -> TransferResult<Self::Session>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStage {
    Disconnected,
    Connected,
    LayoutVerified,
    Uploaded,
    Verified,
    Closed,
}

/// Names of the directories that must already exist remotely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteLayout {
    /// Drop directory inside the login directory. Uploads land here.
    pub base_dir: String,

    /// Directory the receiving side moves processed files into. Only its
    /// presence is checked.
    pub staging_dir: String,
}

/// A verified remote directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, name: &str) -> String {
        format!("{}/{}", self.0, name)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open session plus the stage it has reached.
///
/// Dropping it closes the underlying session if that has not happened yet.
pub struct Session<S: RemoteSession> {
    inner: S,
    stage: TransferStage,
}

impl<S: RemoteSession> Session<S> {
    pub fn stage(&self) -> TransferStage {
        self.stage
    }

    fn advance(&mut self, stage: TransferStage) {
        debug!(from = ?self.stage, to = ?stage, "transfer stage");
        self.stage = stage;
    }
}

impl<S: RemoteSession> Drop for Session<S> {
    fn drop(&mut self) {
        if self.stage != TransferStage::Closed {
            self.inner.close();
            self.stage = TransferStage::Closed;
        }
    }
}

/// Transporter runs the connect → layout → upload → verify → close sequence.
pub struct Transporter<C: SftpConnector> {
    connector: C,
    layout: RemoteLayout,
}

impl<C: SftpConnector> Transporter<C> {
    pub fn new(connector: C, layout: RemoteLayout) -> Self {
        Self { connector, layout }
    }

    /// Open an authenticated session.
    pub fn connect(&self) -> TransferResult<Session<C::Session>> {
        let inner = self.connector.connect()?;
        let mut session = Session {
            inner,
            stage: TransferStage::Disconnected,
        };
        session.advance(TransferStage::Connected);
        Ok(session)
    }

    /// Check that the base and staging directories exist.
    ///
    /// Never creates them: writing into a freshly created directory would
    /// hide a misconfigured account.
    pub fn ensure_remote_layout(
        &self,
        session: &mut Session<C::Session>,
    ) -> TransferResult<RemotePath> {
        let base = &self.layout.base_dir;
        if !session.inner.list_dir(LOGIN_DIR)?.iter().any(|e| e == base) {
            return Err(TransferError::Layout {
                missing: base.clone(),
            });
        }

        let staging = &self.layout.staging_dir;
        if !session.inner.list_dir(base)?.iter().any(|e| e == staging) {
            return Err(TransferError::Layout {
                missing: format!("{base}/{staging}"),
            });
        }

        session.advance(TransferStage::LayoutVerified);
        Ok(RemotePath(base.clone()))
    }

    /// Write `payload` to `path/name`, overwriting any existing file.
    pub fn upload(
        &self,
        session: &mut Session<C::Session>,
        path: &RemotePath,
        name: &str,
        payload: &[u8],
    ) -> TransferResult<UploadReceipt> {
        let remote_path = path.join(name);
        ensure_name_safe(name, &remote_path)?;

        session.inner.write_file(&remote_path, payload)?;
        session.advance(TransferStage::Uploaded);
        Ok(UploadReceipt::for_payload(remote_path, payload))
    }

    /// True when `name` is listed in `path` and its size is `expected_size`.
    pub fn verify(
        &self,
        session: &mut Session<C::Session>,
        path: &RemotePath,
        name: &str,
        expected_size: u64,
    ) -> TransferResult<bool> {
        let matches = self.remote_size(session, path, name)? == Some(expected_size);
        if matches {
            session.advance(TransferStage::Verified);
        }
        Ok(matches)
    }

    /// Release the session. Safe to call more than once.
    pub fn close(&self, session: &mut Session<C::Session>) {
        if session.stage != TransferStage::Closed {
            session.inner.close();
            session.advance(TransferStage::Closed);
        }
    }

    /// Run the full sequence for one file, closing the session on every path.
    pub fn deliver(&self, name: &str, payload: &[u8]) -> TransferResult<UploadReceipt> {
        self.deliver_until(name, payload, &AtomicBool::new(false))
    }

    /// Same as `deliver`, but once `stop` is set no connect or upload is
    /// started and the call returns `Cancelled` after closing the session.
    /// A payload already written is still verified, so the result always
    /// says whether the file landed.
    pub fn deliver_until(
        &self,
        name: &str,
        payload: &[u8],
        stop: &AtomicBool,
    ) -> TransferResult<UploadReceipt> {
        check_stop(stop, name, "connect")?;
        let mut session = self.connect()?;
        let result = self.deliver_on(&mut session, name, payload, stop);
        if let Err(err) = &result {
            warn!(file = name, stage = ?session.stage(), error = %err, "delivery failed");
        }
        self.close(&mut session);
        result
    }

    fn deliver_on(
        &self,
        session: &mut Session<C::Session>,
        name: &str,
        payload: &[u8],
        stop: &AtomicBool,
    ) -> TransferResult<UploadReceipt> {
        check_stop(stop, name, "layout check")?;
        let path = self.ensure_remote_layout(session)?;
        check_stop(stop, name, "upload")?;
        let receipt = self.upload(session, &path, name, payload)?;

        if !self.verify(session, &path, name, receipt.size)? {
            let actual = self.remote_size(session, &path, name)?;
            return Err(TransferError::VerifyFailed {
                path: receipt.remote_path,
                expected: receipt.size,
                actual,
            });
        }
        Ok(receipt)
    }

    /// Size of `path/name` if it appears in the directory listing.
    fn remote_size(
        &self,
        session: &mut Session<C::Session>,
        path: &RemotePath,
        name: &str,
    ) -> TransferResult<Option<u64>> {
        if !session.inner.list_dir(path.as_str())?.iter().any(|e| e == name) {
            return Ok(None);
        }
        session.inner.file_size(&path.join(name))
    }
}

fn check_stop(stop: &AtomicBool, name: &str, stage: &'static str) -> TransferResult<()> {
    if stop.load(Ordering::SeqCst) {
        return Err(TransferError::Cancelled {
            path: name.to_string(),
            stage,
        });
    }
    Ok(())
}

/// Reject names that would escape the drop directory.
fn ensure_name_safe(name: &str, remote_path: &str) -> TransferResult<()> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.bytes().any(|b| b.is_ascii_control());
    if unsafe_name {
        return Err(TransferError::Transport {
            operation: "upload",
            path: remote_path.to_string(),
            reason: "filename is not a plain file name".into(),
        });
    }
    Ok(())
}
