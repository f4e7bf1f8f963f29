//! Guest to authenticated ownership transfer
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::AdvisoryTier;
use crate::config::CacheConfig;
use crate::db::schema::*;
use crate::error::{CacheError, CacheResult, StoreError, StoreResult, Tier};
use crate::metrics;
use crate::migration::warehouse::Warehouse;
use crate::store::{bounded, keys, DurableStore, KeyValueStore};

/// Where a guest identity stands, as seen by this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GuestState {
    Guest,
    Migrating,
    Authenticated,
    Failed,
}

/// A guest session has just signed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationEvent {
    pub guest_id: String,
    pub authenticated_id: String,
}

impl AuthenticationEvent {
    pub fn new(guest_id: impl Into<String>, authenticated_id: impl Into<String>) -> Self {
        Self { guest_id: guest_id.into(), authenticated_id: authenticated_id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub ledger_id: i64,
    pub guest_id: String,
    pub authenticated_id: String,
    /// Conversations reassigned plus the one built from the working set.
    pub records_migrated: i64,
    pub messages_backfilled: i64,
    pub imported_conversation: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub hot_timeout: Duration,
    pub durable_timeout: Duration,
    pub conversation_retention: chrono::Duration,
    pub export_batch_size: usize,
}

impl From<&CacheConfig> for MigrationSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            hot_timeout: config.hot_timeout,
            durable_timeout: config.durable_timeout,
            conversation_retention: config.conversation_retention,
            export_batch_size: config.export_batch_size,
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

pub struct MigrationManager {
    pub(crate) durable: Arc<dyn DurableStore>,
    pub(crate) warehouse: Arc<dyn Warehouse>,
    pub(crate) settings: MigrationSettings,
    hot: AdvisoryTier,
    states: Arc<DashMap<String, GuestState>>,
}

impl MigrationManager {
    pub fn new(
        hot: Arc<dyn KeyValueStore>,
        durable: Arc<dyn DurableStore>,
        warehouse: Arc<dyn Warehouse>,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            hot: AdvisoryTier::new(hot, settings.hot_timeout),
            durable,
            warehouse,
            settings,
            states: Arc::new(DashMap::new()),
        }
    }

    pub(crate) async fn durable_call<T, F>(&self, op: &str, call: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = StoreResult<T>>,
    {
        bounded(Tier::Durable, op, self.settings.durable_timeout, call).await
    }

    /// Process-local view; identities never seen here are `Guest`.
    pub fn state_of(&self, guest_id: &str) -> GuestState {
        self.states.get(guest_id).map(|s| *s).unwrap_or(GuestState::Guest)
    }

    /// Transfer everything the guest owns to the authenticated identity.
    ///
    /// Refuses while the guest's latest migration is `failed`; use
    /// [`MigrationManager::retry_failed`] for that case.
    pub async fn on_authenticated(&self, event: AuthenticationEvent) -> CacheResult<MigrationReport> {
        validate(&event)?;
        let source = keys::guest_ledger_source(&event.guest_id);
        let latest = self
            .durable_call(
                "latest_ledger_entry",
                self.durable.latest_ledger_entry(MigrationType::GuestToAuthenticated, &source),
            )
            .await?;

        if let Some(entry) = latest {
            if entry.status == MigrationStatus::Failed {
                warn!(
                    "Guest {} has failed migration {}; waiting for operator retry",
                    event.guest_id, entry.id
                );
                self.states.insert(event.guest_id.clone(), GuestState::Failed);
                return Err(CacheError::AwaitingOperatorRetry { guest_id: event.guest_id, ledger_id: entry.id });
            }
        }

        self.migrate(event).await
    }

    /// Operator-initiated rerun of a failed migration.
    pub async fn retry_failed(&self, event: AuthenticationEvent) -> CacheResult<MigrationReport> {
        validate(&event)?;
        info!("Operator retry of migration for guest {}", event.guest_id);
        self.migrate(event).await
    }

    /// Latest ledger entries, newest first.
    pub async fn ledger(&self, limit: usize) -> CacheResult<Vec<MigrationLedgerEntry>> {
        Ok(self.durable_call("list_ledger", self.durable.list_ledger(limit)).await?)
    }

    async fn guest_turns(&self, guest_id: &str) -> Vec<GuestTurn> {
        self.hot
            .read_list(&keys::guest(guest_id))
            .await
            .into_iter()
            .filter_map(|bytes| match serde_json::from_slice::<GuestTurn>(&bytes) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    warn!("Skipping undecodable turn in working set of {}: {}", guest_id, e);
                    None
                }
            })
            .collect()
    }

    fn settlement(&self) -> Settlement {
        Settlement {
            durable: Arc::clone(&self.durable),
            hot: self.hot.clone(),
            states: Arc::clone(&self.states),
            timeout: self.settings.durable_timeout,
        }
    }

    /// The reassignment runs detached so its ledger entry always records
    /// what the transaction actually did. A caller that stops waiting at the
    /// deadline gets a retry-later error while the entry stays `in_progress`.
    async fn migrate(&self, event: AuthenticationEvent) -> CacheResult<MigrationReport> {
        let now = Utc::now();
        let entry = self
            .durable_call(
                "append_ledger",
                self.durable.append_ledger(LedgerDraft {
                    migration_type: MigrationType::GuestToAuthenticated,
                    source: keys::guest_ledger_source(&event.guest_id),
                    destination: format!("user:{}", event.authenticated_id),
                    now,
                }),
            )
            .await?;
        self.states.insert(event.guest_id.clone(), GuestState::Migrating);

        let settlement = self.settlement();
        if let Err(e) = self
            .durable_call("start_ledger", self.durable.transition_ledger(entry.id, LedgerTransition::Start, now))
            .await
        {
            return Err(settlement.fail(entry.id, event, e).await);
        }

        let request = ReassignRequest {
            guest_id: event.guest_id.clone(),
            authenticated_id: event.authenticated_id.clone(),
            pending_turns: self.guest_turns(&event.guest_id).await,
            now,
            expires_at: now + self.settings.conversation_retention,
        };
        let guest_id = event.guest_id.clone();
        let ledger_id = entry.id;
        let mut task = tokio::spawn(async move {
            match settlement.durable.reassign_guest(request).await {
                Ok(outcome) => settlement.complete(ledger_id, event, outcome).await,
                Err(e) => Err(settlement.fail(ledger_id, event, e).await),
            }
        });

        match tokio::time::timeout(self.settings.durable_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!("Reassignment task for guest {} ended abnormally: {}", guest_id, e);
                Err(CacheError::Durable(StoreError::unavailable(Tier::Durable, e)))
            }
            Err(_) => {
                warn!(
                    "Reassignment of guest {} is still running past its deadline; ledger {} settles when it finishes",
                    guest_id, ledger_id
                );
                Err(CacheError::Durable(StoreError::timeout(Tier::Durable, "reassign_guest")))
            }
        }
    }
}

/// Everything needed to close out a migration once its transaction ends
#[derive(Clone)]
struct Settlement {
    durable: Arc<dyn DurableStore>,
    hot: AdvisoryTier,
    states: Arc<DashMap<String, GuestState>>,
    timeout: Duration,
}

impl Settlement {
    async fn durable_call<T, F>(&self, op: &str, call: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = StoreResult<T>>,
    {
        bounded(Tier::Durable, op, self.timeout, call).await
    }

    async fn complete(
        &self,
        ledger_id: i64,
        event: AuthenticationEvent,
        outcome: ReassignOutcome,
    ) -> CacheResult<MigrationReport> {
        let records_migrated =
            outcome.conversations_reassigned + i64::from(outcome.imported_conversation.is_some());

        // Hot copies still name the guest as owner.
        for conversation_id in &outcome.reassigned_ids {
            self.hot.delete(&keys::conversation(conversation_id)).await;
        }

        if let Err(e) = self
            .durable_call(
                "complete_ledger",
                self.durable
                    .transition_ledger(ledger_id, LedgerTransition::Complete { records_migrated }, Utc::now()),
            )
            .await
        {
            // The data moved; only the audit row is behind.
            error!("Migration {} committed but its ledger entry could not be completed: {}", ledger_id, e);
            self.states.insert(event.guest_id.clone(), GuestState::Failed);
            return Err(CacheError::MigrationFailed { guest_id: event.guest_id, ledger_id, source: e });
        }

        self.states.insert(event.guest_id.clone(), GuestState::Authenticated);
        self.hot.delete(&keys::guest(&event.guest_id)).await;
        metrics::inc_migration(MigrationType::GuestToAuthenticated.as_str(), MigrationStatus::Completed.as_str());
        info!(
            "Migrated guest {} to {}: {} records (ledger {})",
            event.guest_id, event.authenticated_id, records_migrated, ledger_id
        );

        Ok(MigrationReport {
            ledger_id,
            guest_id: event.guest_id,
            authenticated_id: event.authenticated_id,
            records_migrated,
            messages_backfilled: outcome.messages_backfilled,
            imported_conversation: outcome.imported_conversation,
        })
    }

    async fn fail(&self, ledger_id: i64, event: AuthenticationEvent, cause: StoreError) -> CacheError {
        let records_failed = self
            .durable_call("count_guest", self.durable.count_guest_conversations(&event.guest_id))
            .await
            .unwrap_or_else(|e| {
                warn!("Could not count pending rows of guest {}: {}", event.guest_id, e);
                0
            });

        let change = LedgerTransition::Fail {
            records_migrated: 0,
            records_failed,
            error: cause.to_string(),
        };
        if let Err(e) = self
            .durable_call("fail_ledger", self.durable.transition_ledger(ledger_id, change, Utc::now()))
            .await
        {
            error!("Could not mark migration {} as failed: {}", ledger_id, e);
        }

        self.states.insert(event.guest_id.clone(), GuestState::Failed);
        metrics::inc_migration(MigrationType::GuestToAuthenticated.as_str(), MigrationStatus::Failed.as_str());
        error!("Migration of guest {} failed (ledger {}): {}", event.guest_id, ledger_id, cause);

        CacheError::MigrationFailed { guest_id: event.guest_id, ledger_id, source: cause }
    }
}

fn validate(event: &AuthenticationEvent) -> CacheResult<()> {
    if event.guest_id.trim().is_empty() || event.authenticated_id.trim().is_empty() {
        return Err(CacheError::InvalidInput("guest and authenticated ids must be non-empty".into()));
    }
    if event.guest_id == event.authenticated_id {
        return Err(CacheError::InvalidInput("guest and authenticated ids must differ".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDurableStore;
    use crate::migration::warehouse::JsonLinesWarehouse;
    use crate::store::MokaKeyValueStore;

    fn manager() -> MigrationManager {
        MigrationManager::new(
            Arc::new(MokaKeyValueStore::new(100)),
            Arc::new(SqliteDurableStore::in_memory().unwrap()),
            Arc::new(JsonLinesWarehouse::new(std::env::temp_dir().join("gencache-unused"))),
            MigrationSettings::default(),
        )
    }

    #[tokio::test]
    async fn unknown_guest_migrates_as_a_no_op() {
        let manager = manager();
        assert_eq!(manager.state_of("g"), GuestState::Guest);
        let report = manager.on_authenticated(AuthenticationEvent::new("g", "u")).await.unwrap();
        assert_eq!(report.records_migrated, 0);
        assert_eq!(manager.state_of("g"), GuestState::Authenticated);

        let ledger = manager.ledger(10).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, MigrationStatus::Completed);
        assert_eq!(ledger[0].source, "guest:g");
    }

    #[tokio::test]
    async fn malformed_events_are_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.on_authenticated(AuthenticationEvent::new("", "u")).await,
            Err(CacheError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.retry_failed(AuthenticationEvent::new("same", "same")).await,
            Err(CacheError::InvalidInput(_))
        ));
        assert!(manager.ledger(10).await.unwrap().is_empty());
    }
}
