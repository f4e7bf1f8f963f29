//! Versioned schema migrations for the durable tier

use rusqlite::{Connection, Result, OptionalExtension};
use tracing::{info, warn, error};

use crate::db::schema::DatabaseStats;

/// Applies the bundled SQL migrations in version order
pub struct SchemaMigrator<'a> {
    conn: &'a mut Connection,
}

impl<'a> SchemaMigrator<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Bring the schema up to the latest version
    pub fn initialize_database(&mut self) -> Result<i32> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.current_version()?;
        info!("Current cache schema version: {}", current_version);

        self.apply_migrations()?;
        self.current_version()
    }

    /// Versions are checked one by one, so a gap below the newest recorded
    /// version is still filled.
    fn apply_migrations(&mut self) -> Result<()> {
        for (version, migration_sql) in migrations() {
            if self.has_migration_applied(version)? {
                continue;
            }
            info!("Applying schema migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply schema migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;
        }
        Ok(())
    }

    pub fn current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|found| found.is_some())
    }
}

fn migrations() -> [(i32, &'static str); 3] {
    [
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_prompt_cache.sql")),
        (3, include_str!("migrations/003_migration_ledger.sql")),
    ]
}

/// Row counts for the operator `stats` view. Read-only.
pub fn get_database_stats(conn: &Connection) -> Result<DatabaseStats> {
    fn count(conn: &Connection, sql: &str) -> Result<i64> {
        conn.query_row(sql, [], |row| row.get(0)).or_else(|e| {
            warn!("Stats query failed ({}): {}", sql, e);
            Ok(0)
        })
    }

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(DatabaseStats {
        total_conversations: count(conn, "SELECT COUNT(*) FROM conversations")?,
        guest_conversations: count(conn, "SELECT COUNT(*) FROM conversations WHERE ownership = 'guest'")?,
        total_messages: count(conn, "SELECT COUNT(*) FROM messages")?,
        total_prompts: count(conn, "SELECT COUNT(*) FROM prompt_cache")?,
        total_embeddings: count(conn, "SELECT COUNT(*) FROM embeddings")?,
        total_ledger_entries: count(conn, "SELECT COUNT(*) FROM migration_ledger")?,
        database_size_bytes,
    })
}
