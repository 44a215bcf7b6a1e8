//! WORM export: an off-database, append-only copy of sealed history.
//!
//! Each export covers one (stream, range) and lands in a deterministic
//! file path, written to a temp file and atomically renamed into place —
//! re-exporting the same range overwrites the same file with identical
//! content. Records are JSON lines: the full event plus the seal marker
//! covering it at export time. The primary store stays the source of
//! truth; the export is the tamper-evident side copy.

use athanor_core::{AuditEvent, Result, SealMarker, StreamKey};
use athanor_sqlite::store;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One line of an export file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WormRecord {
    pub event: AuditEvent,
    /// The seal marker the range was exported under, if any.
    pub seal: Option<SealMarker>,
}

#[derive(Clone)]
pub struct WormExporter {
    base_dir: PathBuf,
}

impl WormExporter {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Deterministic target path for a (stream, range) export.
    pub fn export_path(
        &self,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PathBuf {
        self.base_dir
            .join(sanitize(&stream.project_id))
            .join(sanitize(&stream.environment_id))
            .join(format!("{}_{}.jsonl", stamp(&start), stamp(&end)))
    }

    /// Stream the range in chain order into the export file.
    ///
    /// Returns the number of exported events and the final path.
    pub fn export(
        &self,
        conn: &Connection,
        stream: &StreamKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        seal: Option<&SealMarker>,
    ) -> Result<(u64, PathBuf)> {
        let final_path = self.export_path(stream, start, end);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = final_path.with_extension("jsonl.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);

        let count = store::for_each_in_range(conn, stream, start, end, |event| {
            let record = WormRecord {
                event,
                seal: seal.cloned(),
            };
            serde_json::to_writer(&mut writer, &record)
                .map_err(|e| athanor_core::AthanorError::Serialization(e.to_string()))?;
            writer.write_all(b"\n")?;
            Ok(())
        })?;

        let file = writer
            .into_inner()
            .map_err(|e| athanor_core::AthanorError::Storage(e.to_string()))?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        tracing::info!(
            stream = %stream,
            path = %final_path.display(),
            events = count,
            "range exported to WORM storage"
        );
        Ok((count, final_path))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn stamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S%3fZ").to_string()
}
