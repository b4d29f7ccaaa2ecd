//! Interfaces to the cloud storage the job pulls from.

use crate::{errors::TransferResult, models::file_record::FileRecord};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Enumerates candidate files modified after a watermark.
#[async_trait]
pub trait SourceLister: Send + Sync {
    /// At most `page_size` files modified after `watermark`, in provider
    /// order. Only the first page is returned.
    async fn list_since(
        &self,
        watermark: DateTime<Utc>,
        page_size: usize,
    ) -> TransferResult<Vec<FileRecord>>;
}

/// Fetches the complete contents of a listed file.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, file: &FileRecord) -> TransferResult<Bytes>;
}
