use crate::services::{
    orchestrator::{FailureMode, PipelineSettings},
    transformer::Encoding,
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, ValueEnum};
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

/// Largest page the Drive API accepts.
const MAX_PAGE_SIZE: usize = 1000;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub drive_credentials: PathBuf,
    pub page_size: usize,
    pub watermark: DateTime<Utc>,
    pub sftp_host: String,
    pub sftp_port: u16,
    pub sftp_user: String,
    pub sftp_key: PathBuf,
    pub sftp_host_fingerprint: Option<Vec<u8>>,
    pub remote_base_dir: String,
    pub remote_staging_dir: String,
    pub posted_path: PathBuf,
    pub failed_path: PathBuf,
    pub lock_path: PathBuf,
    pub timeout: Duration,
    pub transfer_timeout: Duration,
    pub failure_mode: FailureMode,
    pub encoding: Encoding,
    pub alert_webhook: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Relay new CSV results from Google Drive to an SFTP drop")]
pub struct Args {
    /// Service account key file (overrides RELAY_DRIVE_CREDENTIALS)
    #[arg(long)]
    pub drive_credentials: Option<PathBuf>,

    /// Files listed per run (overrides RELAY_PAGE_SIZE)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Only files modified after this time are candidates (overrides RELAY_WATERMARK)
    #[arg(long)]
    pub since: Option<String>,

    /// SFTP host (overrides RELAY_SFTP_HOST)
    #[arg(long)]
    pub sftp_host: Option<String>,

    /// SFTP port (overrides RELAY_SFTP_PORT)
    #[arg(long)]
    pub sftp_port: Option<u16>,

    /// SFTP username (overrides RELAY_SFTP_USER)
    #[arg(long)]
    pub sftp_user: Option<String>,

    /// Private key for SFTP auth (overrides RELAY_SFTP_KEY)
    #[arg(long)]
    pub sftp_key: Option<PathBuf>,

    /// Hex SHA-256 of the expected host key (overrides RELAY_SFTP_HOST_FINGERPRINT)
    #[arg(long)]
    pub sftp_host_fingerprint: Option<String>,

    /// Remote drop directory (overrides RELAY_REMOTE_BASE_DIR)
    #[arg(long)]
    pub remote_base_dir: Option<String>,

    /// Remote directory that must exist inside the drop directory (overrides RELAY_REMOTE_STAGING_DIR)
    #[arg(long)]
    pub remote_staging_dir: Option<String>,

    /// Record of posted files (overrides RELAY_POSTED_PATH)
    #[arg(long)]
    pub posted_path: Option<PathBuf>,

    /// Record of failed files (overrides RELAY_FAILED_PATH)
    #[arg(long)]
    pub failed_path: Option<PathBuf>,

    /// Lock file preventing overlapping runs (overrides RELAY_LOCK_PATH)
    #[arg(long)]
    pub lock_path: Option<PathBuf>,

    /// Per-call network timeout in seconds (overrides RELAY_TIMEOUT_SECS)
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Deadline for one whole delivery in seconds (overrides RELAY_TRANSFER_TIMEOUT_SECS)
    #[arg(long)]
    pub transfer_timeout_secs: Option<u64>,

    /// What a failed file does to the rest of the batch (overrides RELAY_FAILURE_MODE)
    #[arg(long, value_enum)]
    pub failure_mode: Option<FailureMode>,

    /// Encoding of downloaded CSV files (overrides RELAY_CSV_ENCODING)
    #[arg(long)]
    pub encoding: Option<String>,

    /// Webhook receiving alerts as JSON (overrides RELAY_ALERT_WEBHOOK)
    #[arg(long)]
    pub alert_webhook: Option<String>,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    pub report_json: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl AppConfig {
    /// Merge CLI args over environment values over defaults, then validate.
    ///
    /// `env` looks up one variable; blank values count as unset.
    pub fn resolve<F>(args: Args, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let watermark = match args.since.or_else(|| env("RELAY_WATERMARK")) {
            Some(raw) => parse_watermark(&raw)?,
            None => bail!("a watermark is required (--since or RELAY_WATERMARK)"),
        };

        let failure_mode = match args.failure_mode {
            Some(mode) => mode,
            None => match env("RELAY_FAILURE_MODE") {
                Some(raw) => <FailureMode as ValueEnum>::from_str(raw.trim(), true)
                    .map_err(|e| anyhow!("parsing RELAY_FAILURE_MODE value `{raw}`: {e}"))?,
                None => FailureMode::default(),
            },
        };

        let encoding = match args.encoding.or_else(|| env("RELAY_CSV_ENCODING")) {
            Some(raw) => raw.parse::<Encoding>().map_err(|e| anyhow!(e))?,
            None => Encoding::default(),
        };

        let sftp_host_fingerprint = args
            .sftp_host_fingerprint
            .or_else(|| env("RELAY_SFTP_HOST_FINGERPRINT"))
            .map(|raw| parse_fingerprint(&raw))
            .transpose()?;

        let cfg = Self {
            drive_credentials: args
                .drive_credentials
                .or_else(|| env("RELAY_DRIVE_CREDENTIALS").map(PathBuf::from))
                .unwrap_or_else(|| "keys/service-account.json".into()),
            page_size: pick(args.page_size, &env, "RELAY_PAGE_SIZE", 12)?,
            watermark,
            sftp_host: required(args.sftp_host, &env, "RELAY_SFTP_HOST", "--sftp-host")?,
            sftp_port: pick(args.sftp_port, &env, "RELAY_SFTP_PORT", 22)?,
            sftp_user: required(args.sftp_user, &env, "RELAY_SFTP_USER", "--sftp-user")?,
            sftp_key: args
                .sftp_key
                .or_else(|| env("RELAY_SFTP_KEY").map(PathBuf::from))
                .unwrap_or_else(|| "keys/id_rsa".into()),
            sftp_host_fingerprint,
            remote_base_dir: args
                .remote_base_dir
                .or_else(|| env("RELAY_REMOTE_BASE_DIR"))
                .unwrap_or_else(|| "Results".into()),
            remote_staging_dir: args
                .remote_staging_dir
                .or_else(|| env("RELAY_REMOTE_STAGING_DIR"))
                .unwrap_or_else(|| "Processed".into()),
            posted_path: args
                .posted_path
                .or_else(|| env("RELAY_POSTED_PATH").map(PathBuf::from))
                .unwrap_or_else(|| "posted".into()),
            failed_path: args
                .failed_path
                .or_else(|| env("RELAY_FAILED_PATH").map(PathBuf::from))
                .unwrap_or_else(|| "failed".into()),
            lock_path: args
                .lock_path
                .or_else(|| env("RELAY_LOCK_PATH").map(PathBuf::from))
                .unwrap_or_else(|| "sftp-relay.lock".into()),
            timeout: Duration::from_secs(pick(
                args.timeout_secs,
                &env,
                "RELAY_TIMEOUT_SECS",
                30,
            )?),
            transfer_timeout: Duration::from_secs(pick(
                args.transfer_timeout_secs,
                &env,
                "RELAY_TRANSFER_TIMEOUT_SECS",
                120,
            )?),
            failure_mode,
            encoding,
            alert_webhook: args.alert_webhook.or_else(|| env("RELAY_ALERT_WEBHOOK")),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            bail!("page size must be between 1 and {MAX_PAGE_SIZE}, got {}", self.page_size);
        }
        if self.timeout.is_zero() || self.transfer_timeout.is_zero() {
            bail!("timeouts must be at least one second");
        }
        for (label, dir) in [
            ("remote base dir", &self.remote_base_dir),
            ("remote staging dir", &self.remote_staging_dir),
        ] {
            if dir.trim().is_empty() || dir.contains('/') || dir == "." || dir == ".." {
                bail!("{label} `{dir}` must be a single directory name");
            }
        }
        if self.remote_base_dir == self.remote_staging_dir {
            bail!(
                "remote base and staging dirs must differ (both `{}`)",
                self.remote_base_dir
            );
        }
        if self.posted_path == self.failed_path {
            bail!("posted and failed records must be different files");
        }
        Ok(())
    }

    /// Check that the credential files exist before any network call.
    pub fn check_files(&self) -> Result<()> {
        for (label, path) in [
            ("drive credentials", &self.drive_credentials),
            ("sftp private key", &self.sftp_key),
        ] {
            if !path.is_file() {
                bail!("{label} file `{}` not found", path.display());
            }
        }
        Ok(())
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            page_size: self.page_size,
            encoding: self.encoding,
            failure_mode: self.failure_mode,
            download_timeout: self.timeout,
            transfer_timeout: self.transfer_timeout,
        }
    }
}

/// CLI value, else parsed env value, else `default`.
fn pick<T, F>(flag: Option<T>, env: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = flag {
        return Ok(value);
    }
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("parsing {key} value `{raw}`: {e}")),
        None => Ok(default),
    }
}

fn required<F>(flag: Option<String>, env: &F, key: &str, arg: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    flag.or_else(|| env(key))
        .ok_or_else(|| anyhow!("{arg} or {key} is required"))
}

/// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS` taken as UTC.
pub fn parse_watermark(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .with_context(|| format!("parsing watermark `{raw}`"))
}

/// Hex SHA-256 fingerprint; colons are ignored.
fn parse_fingerprint(raw: &str) -> Result<Vec<u8>> {
    let hex: String = raw.chars().filter(|c| *c != ':').collect();
    if hex.len() != 64 {
        bail!("host fingerprint must be 32 hex-encoded bytes, got `{raw}`");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("host fingerprint `{raw}` is not hex"))
        })
        .collect()
}
