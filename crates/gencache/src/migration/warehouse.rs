//! Export destinations
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::db::schema::ExportRow;
use crate::error::{StoreError, StoreResult, Tier};

/// One batch handed to a warehouse
#[derive(Debug, Clone)]
pub struct ExportBatch {
    pub ledger_id: i64,
    pub sequence: u32,
    pub rows: Vec<ExportRow>,
}

/// External store receiving exported rows. Returns one content id per row,
/// in row order. A batch is either accepted whole or not at all.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn write_batch(&self, batch: &ExportBatch) -> StoreResult<Vec<String>>;
}

/// Writes each batch as a newline-delimited JSON file under `dir`.
pub struct JsonLinesWarehouse {
    dir: PathBuf,
}

impl JsonLinesWarehouse {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn io_error(what: &str, e: std::io::Error) -> StoreError {
        StoreError::unavailable(Tier::Warehouse, format!("{}: {}", what, e))
    }
}

#[async_trait]
impl Warehouse for JsonLinesWarehouse {
    async fn write_batch(&self, batch: &ExportBatch) -> StoreResult<Vec<String>> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error("create warehouse dir", e))?;

        let stem = format!("export-{}-{:05}", batch.ledger_id, batch.sequence);
        let mut body = String::new();
        let mut content_ids = Vec::with_capacity(batch.rows.len());
        for (line, row) in batch.rows.iter().enumerate() {
            let json = serde_json::to_string(row)
                .map_err(|e| StoreError::corrupt(Tier::Warehouse, format!("encode row: {}", e)))?;
            body.push_str(&json);
            body.push('\n');
            content_ids.push(format!("{}:{}", stem, line));
        }

        // Write then rename so a reader never sees half a batch.
        let partial = self.dir.join(format!("{}.jsonl.part", stem));
        let target = self.dir.join(format!("{}.jsonl", stem));
        fs::write(&partial, body.as_bytes())
            .await
            .map_err(|e| Self::io_error("write batch", e))?;
        fs::rename(&partial, &target)
            .await
            .map_err(|e| Self::io_error("publish batch", e))?;

        debug!("Wrote {} rows to {}", content_ids.len(), target.display());
        Ok(content_ids)
    }
}
