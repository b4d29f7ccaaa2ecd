//! In-memory collaborators for tests. Nothing here touches the network.

use crate::{
    errors::{TransferError, TransferResult},
    models::file_record::FileRecord,
    services::{
        notifier::{Alert, Notifier},
        source::{Downloader, SourceLister},
        transporter::{LOGIN_DIR, RemoteSession, SftpConnector},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

/// Failures the fake remote can be told to produce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    RefuseConnect,
    RejectAuth,
    /// Writing this filename fails with a transport error.
    WriteFails(String),
    /// Writing this filename stores one byte less than sent.
    ShortWrite(String),
    /// The next directory listing blocks this long. Fires once.
    SlowListing(Duration),
    /// Writing this filename blocks this long before storing it.
    SlowWrite(String, Duration),
}

#[derive(Debug, Default)]
pub struct RemoteFs {
    pub dirs: BTreeSet<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    pub faults: Vec<Fault>,
    pub connects: usize,
    pub closes: usize,
    /// Sessions connected and not yet closed.
    pub open_sessions: usize,
    /// Highest `open_sessions` ever observed.
    pub max_open_sessions: usize,
}

impl RemoteFs {
    fn entries(&self, dir: &str) -> Option<Vec<String>> {
        let prefix = if dir == LOGIN_DIR {
            String::new()
        } else if self.dirs.contains(dir) {
            format!("{dir}/")
        } else {
            return None;
        };

        let children = self
            .dirs
            .iter()
            .chain(self.files.keys())
            .filter_map(|path| path.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Some(children)
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<RemoteFs>>,
}

impl FakeConnector {
    pub fn with_dirs(dirs: &[&str]) -> Self {
        let connector = Self::default();
        connector
            .fs()
            .dirs
            .extend(dirs.iter().map(|d| d.to_string()));
        connector
    }

    pub fn fs(&self) -> MutexGuard<'_, RemoteFs> {
        self.state.lock().unwrap()
    }

    pub fn inject(&self, fault: Fault) {
        self.fs().faults.push(fault);
    }
}

impl SftpConnector for FakeConnector {
    type Session = FakeSession;

    fn connect(&self) -> TransferResult<FakeSession> {
        let mut fs = self.fs();
        if fs.faults.contains(&Fault::RefuseConnect) {
            return Err(TransferError::Connect {
                host: "fake".into(),
                reason: "connection refused".into(),
            });
        }
        if fs.faults.contains(&Fault::RejectAuth) {
            return Err(TransferError::Auth {
                host: "fake".into(),
                reason: "public key rejected".into(),
            });
        }
        fs.connects += 1;
        fs.open_sessions += 1;
        fs.max_open_sessions = fs.max_open_sessions.max(fs.open_sessions);
        Ok(FakeSession {
            state: self.state.clone(),
            closed: false,
        })
    }
}

pub struct FakeSession {
    state: Arc<Mutex<RemoteFs>>,
    closed: bool,
}

impl RemoteSession for FakeSession {
    fn list_dir(&mut self, dir: &str) -> TransferResult<Vec<String>> {
        let stall = {
            let mut fs = self.state.lock().unwrap();
            let slow = fs
                .faults
                .iter()
                .position(|f| matches!(f, Fault::SlowListing(_)));
            let fault = slow.map(|i| fs.faults.remove(i));
            match fault {
                Some(Fault::SlowListing(delay)) => Some(delay),
                _ => None,
            }
        };
        if let Some(delay) = stall {
            thread::sleep(delay);
        }

        self.state
            .lock()
            .unwrap()
            .entries(dir)
            .ok_or_else(|| TransferError::Transport {
                operation: "list",
                path: dir.to_string(),
                reason: "no such file".into(),
            })
    }

    fn write_file(&mut self, path: &str, payload: &[u8]) -> TransferResult<()> {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let stall = self.state.lock().unwrap().faults.iter().find_map(|f| match f {
            Fault::SlowWrite(slow, delay) if *slow == name => Some(*delay),
            _ => None,
        });
        if let Some(delay) = stall {
            thread::sleep(delay);
        }

        let mut fs = self.state.lock().unwrap();
        if fs.faults.contains(&Fault::WriteFails(name.clone())) {
            return Err(TransferError::Transport {
                operation: "write",
                path: path.to_string(),
                reason: "broken pipe".into(),
            });
        }
        let mut stored = payload.to_vec();
        if fs.faults.contains(&Fault::ShortWrite(name)) {
            stored.pop();
        }
        fs.files.insert(path.to_string(), stored);
        Ok(())
    }

    fn file_size(&mut self, path: &str) -> TransferResult<Option<u64>> {
        let fs = self.state.lock().unwrap();
        Ok(fs.files.get(path).map(|data| data.len() as u64))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut fs = self.state.lock().unwrap();
            fs.closes += 1;
            fs.open_sessions -= 1;
        }
    }
}

/// Source listing and downloads served from memory.
#[derive(Default)]
pub struct FakeSource {
    pub listing: Vec<FileRecord>,
    pub contents: HashMap<String, Vec<u8>>,
    pub fail_listing: bool,
    pub listed_since: Mutex<Vec<DateTime<Utc>>>,
    pub downloads: Mutex<Vec<String>>,
}

impl FakeSource {
    /// Add a file; `id` is derived from `name`.
    pub fn with_file(mut self, name: &str, contents: &[u8]) -> Self {
        let id = format!("id-{name}");
        self.listing.push(FileRecord::new(&id, name));
        self.contents.insert(id, contents.to_vec());
        self
    }

    /// Add a listed file whose download fails.
    pub fn with_broken_file(mut self, name: &str) -> Self {
        self.listing.push(FileRecord::new(format!("id-{name}"), name));
        self
    }

    pub fn downloaded(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceLister for FakeSource {
    async fn list_since(
        &self,
        watermark: DateTime<Utc>,
        page_size: usize,
    ) -> TransferResult<Vec<FileRecord>> {
        if self.fail_listing {
            return Err(TransferError::Source("listing unavailable".into()));
        }
        self.listed_since.lock().unwrap().push(watermark);
        Ok(self.listing.iter().take(page_size).cloned().collect())
    }
}

#[async_trait]
impl Downloader for FakeSource {
    async fn download(&self, file: &FileRecord) -> TransferResult<Bytes> {
        self.downloads.lock().unwrap().push(file.name.clone());
        self.contents
            .get(&file.id)
            .map(|data| Bytes::from(data.clone()))
            .ok_or_else(|| TransferError::Source(format!("download of `{}` failed", file.id)))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
