//! src/services/orchestrator.rs
//!
//! Orchestrator runs one pass over the files modified since the watermark.
//! It skips what earlier runs handled, then downloads, cleans, delivers and
//! records each remaining file, strictly one at a time.
//!
//! Outcomes are appended to the state store as they happen, so a crash
//! mid-run leaves the records consistent with the files handled so far.

use crate::{
    errors::{TransferError, TransferResult},
    models::{
        file_record::FileRecord,
        receipt::UploadReceipt,
        report::{FailedFile, RunReport},
    },
    services::{
        notifier::{self, Alert, Notifier},
        source::{Downloader, SourceLister},
        state_store::{self, StateStore, StateStoreError},
        transformer::{self, Encoding},
        transporter::{SftpConnector, Transporter},
    },
};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{task::JoinError, time::timeout};
use tracing::{Instrument, info, info_span, warn};

/// What a per-file failure does to the rest of the batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FailureMode {
    /// Record the failure and continue with the next file.
    #[default]
    Isolate,
    /// Record the failure and stop; later files stay unrecorded and are
    /// picked up by the next run.
    Abort,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub page_size: usize,
    pub encoding: Encoding,
    pub failure_mode: FailureMode,
    /// Bound on each download.
    pub download_timeout: Duration,
    /// Bound on one whole connect-to-close delivery.
    pub transfer_timeout: Duration,
}

/// Conditions that end the run before or outside per-file handling.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("listing candidate files failed: {0}")]
    Listing(#[source] TransferError),
    #[error("recording outcome for `{name}` failed: {source}")]
    StateStore {
        name: String,
        #[source]
        source: StateStoreError,
    },
}

pub struct Orchestrator<C: SftpConnector + 'static> {
    lister: Arc<dyn SourceLister>,
    downloader: Arc<dyn Downloader>,
    transporter: Arc<Transporter<C>>,
    notifier: Arc<dyn Notifier>,
    settings: PipelineSettings,
}

impl<C: SftpConnector + 'static> Orchestrator<C> {
    pub fn new(
        lister: Arc<dyn SourceLister>,
        downloader: Arc<dyn Downloader>,
        transporter: Transporter<C>,
        notifier: Arc<dyn Notifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            lister,
            downloader,
            transporter: Arc::new(transporter),
            notifier,
            settings,
        }
    }

    /// Process every new file modified after `since`.
    pub async fn run(
        &self,
        store: &mut StateStore,
        since: DateTime<Utc>,
    ) -> Result<RunReport, RunError> {
        let mut report = RunReport::start();
        let span = info_span!("run", run_id = %report.run_id);
        let result = self.run_batch(store, since, &mut report).instrument(span).await;
        report.finish();

        match result {
            Ok(()) => {
                self.alert_on_failures(&report).await;
                Ok(report)
            }
            Err(err) => {
                let alert = Alert {
                    run_id: report.run_id,
                    subject: "relay run failed".into(),
                    detail: err.to_string(),
                    files: Vec::new(),
                };
                notifier::send(self.notifier.as_ref(), alert).await;
                Err(err)
            }
        }
    }

    async fn run_batch(
        &self,
        store: &mut StateStore,
        since: DateTime<Utc>,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        let candidates = self
            .lister
            .list_since(since, self.settings.page_size)
            .await
            .map_err(RunError::Listing)?;
        report.listed = candidates.len();

        // Provider order is newest first; deliver oldest first.
        let mut queue = candidates.into_iter().rev();
        while let Some(file) = queue.next() {
            // Delivering a name that cannot be recorded would repeat every run.
            if let Err(err) = state_store::ensure_name_storable(&file.name) {
                warn!(file = ?file.name, error = %err, "skipping, name cannot be recorded");
                report.invalid.push(file.name);
                continue;
            }
            if store.is_known(&file.name) {
                info!(file = %file.name, "skipping, handled by an earlier run");
                report.skipped.push(file.name);
                continue;
            }
            if store.current().is_known(&file.name) {
                warn!(file = %file.name, "skipping, listed twice in this run");
                report.skipped.push(file.name);
                continue;
            }

            info!(file = %file.name, "processing");
            let outcome = self
                .process(&file)
                .instrument(info_span!("file", file = %file.name))
                .await;

            match outcome {
                Ok(receipt) => {
                    record(store.record_posted(&file.name).await, &file)?;
                    info!(
                        file = %file.name,
                        remote = %receipt.remote_path,
                        bytes = receipt.size,
                        md5 = %receipt.md5,
                        "posted"
                    );
                    report.posted.push(file.name);
                }
                Err(err) => {
                    warn!(
                        file = %file.name,
                        kind = err.kind(),
                        retryable = err.is_retryable(),
                        error = %err,
                        "transfer failed"
                    );
                    record(store.record_failed(&file.name).await, &file)?;
                    report.failed.push(FailedFile {
                        name: file.name.clone(),
                        kind: err.kind().to_string(),
                        error: err.to_string(),
                        retryable: err.is_retryable(),
                    });

                    if self.settings.failure_mode == FailureMode::Abort {
                        report.aborted = true;
                        report.unattempted = queue
                            .by_ref()
                            .filter(|f| {
                                !store.current().is_known(&f.name)
                                    && state_store::ensure_name_storable(&f.name).is_ok()
                            })
                            .map(|f| f.name)
                            .collect();
                        warn!(
                            file = %file.name,
                            unattempted = report.unattempted.len(),
                            "aborting remaining batch"
                        );
                        let alert = Alert {
                            run_id: report.run_id,
                            subject: "relay batch aborted".into(),
                            detail: err.to_string(),
                            files: vec![file.name],
                        };
                        notifier::send(self.notifier.as_ref(), alert).await;
                        break;
                    }
                }
            }
        }

        info!(
            listed = report.listed,
            skipped = report.skipped.len(),
            posted = report.posted.len(),
            failed = report.failed.len(),
            invalid = report.invalid.len(),
            unattempted = report.unattempted.len(),
            "run complete"
        );
        Ok(())
    }

    /// Download, clean and deliver one file.
    async fn process(&self, file: &FileRecord) -> TransferResult<UploadReceipt> {
        let raw = timeout(
            self.settings.download_timeout,
            self.downloader.download(file),
        )
        .await
        .map_err(|_| TransferError::Timeout {
            operation: "download",
            elapsed: self.settings.download_timeout,
        })??;

        let cleaned = transformer::clean_with_stats(&raw, self.settings.encoding)?;
        info!(
            rows_in = cleaned.stats.rows_in,
            rows_kept = cleaned.stats.rows_kept,
            "cleaned payload"
        );

        let transporter = Arc::clone(&self.transporter);
        let stop = Arc::new(AtomicBool::new(false));
        let name = file.name.clone();
        let payload = cleaned.payload;
        let mut delivery = tokio::task::spawn_blocking({
            let stop = Arc::clone(&stop);
            move || transporter.deliver_until(&name, &payload, &stop)
        });

        let deadline = self.settings.transfer_timeout;
        match timeout(deadline, &mut delivery).await {
            Ok(joined) => delivery_result(joined, &file.name),
            Err(_) => {
                // The worker still holds a session; wait for it so only one
                // delivery is ever in flight.
                stop.store(true, Ordering::SeqCst);
                warn!(?deadline, "delivery past deadline, waiting for session to close");
                match delivery_result(delivery.await, &file.name) {
                    Ok(receipt) => {
                        warn!(?deadline, "delivery verified after deadline");
                        Ok(receipt)
                    }
                    Err(TransferError::Cancelled { .. }) => Err(TransferError::Timeout {
                        operation: "deliver",
                        elapsed: deadline,
                    }),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// One alert per run listing every file that failed in isolation or
    /// was skipped as unrecordable. An aborting failure was alerted already.
    async fn alert_on_failures(&self, report: &RunReport) {
        let mut lines = Vec::new();
        let mut files = Vec::new();
        if !report.aborted {
            for failed in &report.failed {
                lines.push(format!("{}: {}", failed.name, failed.error));
                files.push(failed.name.clone());
            }
        }
        for name in &report.invalid {
            lines.push(format!("{name:?}: name cannot be recorded"));
            files.push(name.clone());
        }
        if files.is_empty() {
            return;
        }

        let alert = Alert {
            run_id: report.run_id,
            subject: format!("{} file(s) failed to relay", files.len()),
            detail: lines.join("; "),
            files,
        };
        notifier::send(self.notifier.as_ref(), alert).await;
    }
}

fn delivery_result(
    joined: Result<TransferResult<UploadReceipt>, JoinError>,
    name: &str,
) -> TransferResult<UploadReceipt> {
    joined.unwrap_or_else(|join_err| {
        Err(TransferError::Transport {
            operation: "deliver",
            path: name.to_string(),
            reason: join_err.to_string(),
        })
    })
}

fn record(result: Result<(), StateStoreError>, file: &FileRecord) -> Result<(), RunError> {
    result.map_err(|source| RunError::StateStore {
        name: file.name.clone(),
        source,
    })
}
