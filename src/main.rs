use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt::Display, process::ExitCode, sync::Arc};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod errors;
mod models;
mod services;

use config::{AppConfig, Args};
use services::{
    drive::{DriveClient, ServiceAccountKey},
    notifier::{self, Alert, LogNotifier, Notifier, WebhookNotifier},
    orchestrator::Orchestrator,
    run_lock::RunLock,
    sftp::SshConnector,
    state_store::StateStore,
    transporter::{RemoteLayout, Transporter},
};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // --- Logging setup ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

/// Resolve config, take the run lock, load state and process one batch.
///
/// Returns the exit status for a completed run; errors are fatal.
async fn run(args: Args) -> Result<u8> {
    let report_json = args.report_json;

    // --- Config, validated before any network call ---
    let cfg = AppConfig::resolve(args, |key| env::var(key).ok())?;
    cfg.check_files()?;
    tracing::info!("Starting sftp-relay with config: {:?}", cfg);

    let notifier: Arc<dyn Notifier> = match &cfg.alert_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.as_str(), cfg.timeout)?),
        None => Arc::new(LogNotifier),
    };

    // --- Exclusive run + processing state ---
    let lock = or_alert(notifier.as_ref(), RunLock::acquire(&cfg.lock_path)).await?;
    tracing::debug!(lock = %lock.path().display(), "holding run lock");
    let mut store = or_alert(
        notifier.as_ref(),
        StateStore::open(&cfg.posted_path, &cfg.failed_path).await,
    )
    .await?;
    let overlap: Vec<_> = store.prior().overlap().cloned().collect();
    if !overlap.is_empty() {
        tracing::warn!(files = ?overlap, "names recorded as both posted and failed");
    }

    // --- Collaborators ---
    let drive = or_alert(
        notifier.as_ref(),
        ServiceAccountKey::from_file(&cfg.drive_credentials)
            .and_then(|key| DriveClient::new(key, cfg.timeout)),
    )
    .await
    .map(Arc::new)?;
    let transporter = Transporter::new(
        SshConnector {
            host: cfg.sftp_host.clone(),
            port: cfg.sftp_port,
            username: cfg.sftp_user.clone(),
            private_key: cfg.sftp_key.clone(),
            host_fingerprint: cfg.sftp_host_fingerprint.clone(),
            timeout: cfg.timeout,
        },
        RemoteLayout {
            base_dir: cfg.remote_base_dir.clone(),
            staging_dir: cfg.remote_staging_dir.clone(),
        },
    );
    let orchestrator = Orchestrator::new(
        drive.clone(),
        drive,
        transporter,
        notifier,
        cfg.pipeline_settings(),
    );

    // --- Run ---
    let report = orchestrator.run(&mut store, cfg.watermark).await?;
    if report_json {
        let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
        println!("{json}");
    }

    drop(lock);
    Ok(report.exit_code())
}

/// Pass a startup step through, alerting before its error ends the run.
async fn or_alert<T, E>(notifier: &dyn Notifier, step: Result<T, E>) -> Result<T>
where
    E: Display + Into<anyhow::Error>,
{
    let err = match step {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };
    let alert = Alert {
        run_id: Uuid::new_v4(),
        subject: "relay could not start".into(),
        detail: format!("{err:#}"),
        files: Vec::new(),
    };
    notifier::send(notifier, alert).await;
    Err(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::RecordingNotifier;

    #[tokio::test]
    async fn unreadable_credentials_alert_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = RecordingNotifier::default();

        let result = or_alert(
            &notifier,
            ServiceAccountKey::from_file(&dir.path().join("missing.json")),
        )
        .await;

        assert!(result.is_err());
        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].subject, "relay could not start");
        assert!(alerts[0].detail.contains("missing.json"));
    }

    #[tokio::test]
    async fn successful_step_sends_nothing() {
        let notifier = RecordingNotifier::default();

        let value = or_alert(&notifier, Ok::<_, anyhow::Error>(7)).await.unwrap();

        assert_eq!(value, 7);
        assert!(notifier.alerts().is_empty());
    }
}
