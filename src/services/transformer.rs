//! CSV cleaning applied to every payload before delivery.
//!
//! Cells equal to the sentinel `-` become empty, then rows whose
//! `sample_barcode` is empty are dropped. Header, column order, surviving row
//! order and every other cell value are kept verbatim.

use crate::errors::{TransferError, TransferResult};
use bytes::Bytes;
use csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use std::{fmt, str::FromStr};

/// Column whose emptiness decides whether a row survives.
pub const KEY_COLUMN: &str = "sample_barcode";

/// Placeholder meaning "no value" in source data.
pub const SENTINEL: &str = "-";

const UTF8_BOM: char = '\u{feff}';

/// Text encoding of incoming payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
}

impl Encoding {
    pub fn label(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
        }
    }

    fn decode(self, raw: &[u8]) -> TransferResult<&str> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(raw)
                .map(|text| text.strip_prefix(UTF8_BOM).unwrap_or(text))
                .map_err(|err| TransferError::Encoding {
                    encoding: self.label(),
                    offset: err.valid_up_to(),
                }),
        }
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            other => Err(format!("unsupported encoding `{other}`")),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanStats {
    pub rows_in: usize,
    pub rows_kept: usize,
}

/// Cleaned payload plus row counts for logging.
#[derive(Clone, Debug)]
pub struct Cleaned {
    pub payload: Bytes,
    pub stats: CleanStats,
}

/// Clean a raw CSV payload, returning only the bytes.
pub fn clean(raw: &[u8], encoding: Encoding) -> TransferResult<Bytes> {
    clean_with_stats(raw, encoding).map(|cleaned| cleaned.payload)
}

/// Clean a raw CSV payload.
///
/// Fails with `Encoding` on undecodable bytes and `Schema` when the key
/// column is missing or a row does not match the header. A payload whose
/// rows are all dropped yields the header alone.
pub fn clean_with_stats(raw: &[u8], encoding: Encoding) -> TransferResult<Cleaned> {
    let text = encoding.decode(raw)?;

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers().map_err(schema_error)?.clone();
    let key_index = headers
        .iter()
        .position(|column| column == KEY_COLUMN)
        .ok_or_else(|| TransferError::Schema(format!("missing required column `{KEY_COLUMN}`")))?;

    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(raw.len()));
    writer.write_record(&headers).map_err(schema_error)?;

    let mut stats = CleanStats {
        rows_in: 0,
        rows_kept: 0,
    };
    for row in reader.records() {
        let row = row.map_err(schema_error)?;
        stats.rows_in += 1;

        let row: StringRecord = row
            .iter()
            .map(|cell| if cell == SENTINEL { "" } else { cell })
            .collect();
        if row.get(key_index).is_none_or(str::is_empty) {
            continue;
        }

        writer.write_record(&row).map_err(schema_error)?;
        stats.rows_kept += 1;
    }

    let payload = writer
        .into_inner()
        .map_err(|err| TransferError::Schema(err.to_string()))?;

    Ok(Cleaned {
        payload: Bytes::from(payload),
        stats,
    })
}

fn schema_error(err: csv::Error) -> TransferError {
    TransferError::Schema(err.to_string())
}
