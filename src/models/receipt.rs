//! Represents a completed write on the remote side.

use serde::Serialize;

/// What the transporter wrote, as observed locally.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Full remote path (`base/name`).
    pub remote_path: String,

    /// Number of payload bytes written.
    pub size: u64,

    /// MD5 of the payload, lowercase hex. Logged for operators comparing
    /// files by hand; the remote side is verified by size only.
    pub md5: String,
}

impl UploadReceipt {
    pub fn for_payload(remote_path: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            remote_path: remote_path.into(),
            size: payload.len() as u64,
            md5: format!("{:x}", md5::compute(payload)),
        }
    }
}
