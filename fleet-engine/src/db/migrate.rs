use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  address TEXT NOT NULL,
  port INTEGER NOT NULL DEFAULT 22,
  ssh_user TEXT NOT NULL DEFAULT 'root',
  credential_ref TEXT NOT NULL,
  manifest_version INTEGER NOT NULL DEFAULT 0,
  api_mode TEXT NOT NULL DEFAULT 'managed' CHECK(api_mode IN ('managed','self_supplied')),
  last_known_token TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS host_flags (
  host_id TEXT NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
  flag TEXT NOT NULL,
  set_at TEXT NOT NULL,
  PRIMARY KEY (host_id, flag)
);

CREATE INDEX IF NOT EXISTS idx_hosts_manifest_version ON hosts(manifest_version);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    let columns: Vec<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(hosts)")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
        rows.filter_map(|r| r.ok()).collect()
    };
    let has_column = |column: &str| columns.iter().any(|c| c == column);

    // Databases created before per-host environment values existed
    if !has_column("environment") {
        conn.execute_batch("ALTER TABLE hosts ADD COLUMN environment TEXT NOT NULL DEFAULT '{}'")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
