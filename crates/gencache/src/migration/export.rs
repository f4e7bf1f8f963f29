//! Batched export of durable rows into the warehouse
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::db::schema::*;
use crate::error::{CacheError, CacheResult, StoreError, StoreErrorKind, StoreResult, Tier};
use crate::metrics;
use crate::migration::manager::MigrationManager;
use crate::migration::warehouse::ExportBatch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub ledger_id: i64,
    pub conversations_exported: i64,
    pub prompts_exported: i64,
    pub batches: u32,
    /// Rows of the batch in flight when the export stopped.
    pub records_failed: i64,
}

impl ExportReport {
    pub fn records_exported(&self) -> i64 {
        self.conversations_exported + self.prompts_exported
    }
}

impl MigrationManager {
    /// Copy every conversation, then every prompt entry, created before
    /// `cutoff` and not yet synced into the warehouse.
    ///
    /// Progress is checkpointed on the ledger after each batch. After a
    /// failure a rerun picks up where the last committed batch stopped.
    pub async fn export_to_warehouse(&self, cutoff: DateTime<Utc>) -> CacheResult<ExportReport> {
        let now = Utc::now();
        let entry = self
            .durable_call(
                "append_ledger",
                self.durable.append_ledger(LedgerDraft {
                    migration_type: MigrationType::WarehouseExport,
                    source: format!("durable:before:{}", cutoff.to_rfc3339()),
                    destination: "warehouse".to_string(),
                    now,
                }),
            )
            .await?;

        let mut report = ExportReport { ledger_id: entry.id, ..ExportReport::default() };
        let outcome = self.run_export(&mut report, cutoff).await;

        match outcome {
            Ok(()) => {
                let records_migrated = report.records_exported();
                self.durable_call(
                    "complete_ledger",
                    self.durable.transition_ledger(
                        entry.id,
                        LedgerTransition::Complete { records_migrated },
                        Utc::now(),
                    ),
                )
                .await
                .map_err(|source| CacheError::ExportFailed { ledger_id: entry.id, source })?;

                metrics::inc_migration(MigrationType::WarehouseExport.as_str(), MigrationStatus::Completed.as_str());
                info!(
                    "Warehouse export {} finished: {} conversations, {} prompts in {} batches",
                    entry.id, report.conversations_exported, report.prompts_exported, report.batches
                );
                Ok(report)
            }
            Err(source) => {
                let change = LedgerTransition::Fail {
                    records_migrated: report.records_exported(),
                    records_failed: report.records_failed,
                    error: source.to_string(),
                };
                if let Err(e) = self
                    .durable_call("fail_ledger", self.durable.transition_ledger(entry.id, change, Utc::now()))
                    .await
                {
                    error!("Could not mark export {} as failed: {}", entry.id, e);
                }
                metrics::inc_migration(MigrationType::WarehouseExport.as_str(), MigrationStatus::Failed.as_str());
                error!("Warehouse export {} failed after {} records: {}", entry.id, report.records_exported(), source);
                Err(CacheError::ExportFailed { ledger_id: entry.id, source })
            }
        }
    }

    async fn run_export(&self, report: &mut ExportReport, cutoff: DateTime<Utc>) -> StoreResult<()> {
        self.durable_call(
            "start_ledger",
            self.durable.transition_ledger(report.ledger_id, LedgerTransition::Start, Utc::now()),
        )
        .await?;

        let batch_size = self.settings.export_batch_size.max(1);
        loop {
            let conversations = self
                .durable_call("unsynced_conversations", self.durable.unsynced_conversations(cutoff, batch_size))
                .await?;
            let rows: Vec<ExportRow> = if !conversations.is_empty() {
                conversations.into_iter().map(ExportRow::Conversation).collect()
            } else {
                self.durable_call("unsynced_prompts", self.durable.unsynced_prompts(cutoff, batch_size))
                    .await?
                    .into_iter()
                    .map(ExportRow::Prompt)
                    .collect()
            };
            if rows.is_empty() {
                return Ok(());
            }
            self.export_batch(report, rows).await?;
        }
    }

    async fn export_batch(&self, report: &mut ExportReport, rows: Vec<ExportRow>) -> StoreResult<()> {
        let batch = ExportBatch { ledger_id: report.ledger_id, sequence: report.batches, rows };
        report.records_failed = batch.rows.len() as i64;
        let content_ids = self.warehouse.write_batch(&batch).await?;
        if content_ids.len() != batch.rows.len() {
            return Err(StoreError::new(
                Tier::Warehouse,
                StoreErrorKind::Corrupt,
                format!("warehouse returned {} ids for {} rows", content_ids.len(), batch.rows.len()),
            ));
        }

        let mut links = Vec::with_capacity(batch.rows.len());
        let (mut conversations, mut prompts) = (0, 0);
        for (row, content_id) in batch.rows.iter().zip(content_ids) {
            let (cache_type, cache_id) = row.link_key();
            match cache_type {
                CacheType::Conversation => conversations += 1,
                CacheType::Prompt => prompts += 1,
            }
            links.push(SyncedLink { cache_type, cache_id, content_id });
        }
        let checkpoint = links.last().map(|l| format!("{}:{}", l.cache_type, l.cache_id));

        self.durable_call("mark_synced", self.durable.mark_synced(links, Utc::now()))
            .await?;
        report.conversations_exported += conversations;
        report.prompts_exported += prompts;
        report.records_failed = 0;
        report.batches += 1;

        self.durable_call(
            "progress_ledger",
            self.durable.transition_ledger(
                report.ledger_id,
                LedgerTransition::Progress { records_migrated: report.records_exported(), checkpoint },
                Utc::now(),
            ),
        )
        .await?;
        Ok(())
    }
}
