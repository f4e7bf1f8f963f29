//! Ownership transfer and warehouse export, both tracked in the migration ledger
pub mod export;
pub mod manager;
pub mod warehouse;

pub use export::ExportReport;
pub use manager::{AuthenticationEvent, GuestState, MigrationManager, MigrationReport, MigrationSettings};
pub use warehouse::{ExportBatch, JsonLinesWarehouse, Warehouse};
