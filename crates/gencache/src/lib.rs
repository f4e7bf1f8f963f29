// gencache: tiered request/response cache with guest session migration

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod migration;
pub mod store;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use cache::{CacheConversationRequest, CacheCoordinator, CachedPrompt, CoordinatorSettings, ServedFrom, ServedPrompt};
pub use config::CacheConfig;
pub use db::SqliteDurableStore;
pub use error::{CacheError, CacheResult, StoreError, StoreErrorKind, StoreResult, Tier};
pub use migration::{AuthenticationEvent, GuestState, JsonLinesWarehouse, MigrationManager, MigrationSettings, Warehouse};
pub use store::{DurableStore, KeyValueStore, MokaKeyValueStore};
