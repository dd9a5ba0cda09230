use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a host's managed service authenticates to the model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    /// Requests route through the platform proxy with a platform-issued token.
    Managed,
    /// The owner supplied their own provider key; the platform never saw it.
    SelfSupplied,
}

impl ApiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMode::Managed => "managed",
            ApiMode::SelfSupplied => "self_supplied",
        }
    }
}

impl fmt::Display for ApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(ApiMode::Managed),
            "self_supplied" => Ok(ApiMode::SelfSupplied),
            other => anyhow::bail!("unknown api mode: {other}"),
        }
    }
}

/// A fleet member. Identity fields are owned by provisioning; the engine
/// only ever advances `manifest_version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: i64,
    pub ssh_user: String,
    pub credential_ref: String,
    pub manifest_version: i64,
    pub api_mode: ApiMode,
    pub last_known_token: Option<String>,
    /// Values for the manifest's required environment variables.
    pub environment: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewHost {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: i64,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub credential_ref: String,
    #[serde(default = "default_api_mode")]
    pub api_mode: ApiMode,
    pub last_known_token: Option<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_port() -> i64 { 22 }
fn default_ssh_user() -> String { "root".into() }
fn default_api_mode() -> ApiMode { ApiMode::Managed }

fn conversion_error(
    row: &Row,
    column: &str,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, err.into())
}

fn row_to_host(row: &Row) -> rusqlite::Result<HostRecord> {
    let api_mode: String = row.get("api_mode")?;
    let environment: String = row.get("environment")?;
    Ok(HostRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        address: row.get("address")?,
        port: row.get("port")?,
        ssh_user: row.get("ssh_user")?,
        credential_ref: row.get("credential_ref")?,
        manifest_version: row.get("manifest_version")?,
        api_mode: api_mode
            .parse()
            .map_err(|e: anyhow::Error| conversion_error(row, "api_mode", e))?,
        last_known_token: row.get("last_known_token")?,
        environment: serde_json::from_str(&environment)
            .map_err(|e| conversion_error(row, "environment", e))?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<HostRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM hosts ORDER BY id")?;
    let rows = stmt.query_map([], |row| row_to_host(row))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<HostRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM hosts WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], |row| row_to_host(row))?;
    Ok(rows.next().transpose()?)
}

/// Hosts that still need `target` applied, in stable id order.
pub fn find_below_version(conn: &Connection, target: i64) -> anyhow::Result<Vec<HostRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM hosts WHERE manifest_version < ? ORDER BY id")?;
    let rows = stmt.query_map(params![target], |row| row_to_host(row))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn create(conn: &Connection, data: &NewHost) -> anyhow::Result<HostRecord> {
    let now = chrono::Utc::now().to_rfc3339();
    let environment = serde_json::to_string(&data.environment)?;
    conn.execute(
        "INSERT INTO hosts (id, name, address, port, ssh_user, credential_ref, api_mode,
                            last_known_token, environment, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            data.id,
            data.name,
            data.address,
            data.port,
            data.ssh_user,
            data.credential_ref,
            data.api_mode.as_str(),
            data.last_known_token,
            environment,
            now,
            now
        ],
    )?;
    find_by_id(conn, &data.id)?
        .ok_or_else(|| anyhow::anyhow!("Failed to retrieve created host"))
}

/// Move a host's manifest version forward. Never moves it backward; returns
/// whether a row changed.
pub fn advance_version(conn: &Connection, id: &str, version: i64) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "UPDATE hosts SET manifest_version = ?2, updated_at = datetime('now')
         WHERE id = ?1 AND manifest_version < ?2",
        params![id, version],
    )?;
    Ok(changes > 0)
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM hosts WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connection::create_pool, migrate::migrate};

    fn new_host(id: &str) -> NewHost {
        NewHost {
            id: id.into(),
            name: format!("{id}.fleet"),
            address: "10.0.0.5".into(),
            port: 22,
            ssh_user: "agent".into(),
            credential_ref: format!("key-{id}"),
            api_mode: ApiMode::Managed,
            last_known_token: Some("tok-1".into()),
            environment: [("AGENT_TOKEN".to_string(), "tok-1".to_string())].into_iter().collect(),
        }
    }

    #[test]
    fn test_create_and_find() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = create_pool(&dir.path().join("fleet.db"))?;
        migrate(&pool)?;
        let conn = pool.get()?;

        let created = create(&conn, &new_host("h1"))?;
        assert_eq!(created.manifest_version, 0);
        assert_eq!(created.api_mode, ApiMode::Managed);
        assert_eq!(created.environment.get("AGENT_TOKEN").map(String::as_str), Some("tok-1"));

        assert!(find_by_id(&conn, "h1")?.is_some());
        assert!(find_by_id(&conn, "missing")?.is_none());
        Ok(())
    }

    #[test]
    fn test_advance_version_only_moves_forward() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = create_pool(&dir.path().join("fleet.db"))?;
        migrate(&pool)?;
        let conn = pool.get()?;
        create(&conn, &new_host("h1"))?;

        assert!(advance_version(&conn, "h1", 3)?);
        assert!(!advance_version(&conn, "h1", 2)?);
        assert!(!advance_version(&conn, "h1", 3)?);
        assert_eq!(find_by_id(&conn, "h1")?.unwrap().manifest_version, 3);
        Ok(())
    }

    #[test]
    fn test_find_below_version() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = create_pool(&dir.path().join("fleet.db"))?;
        migrate(&pool)?;
        let conn = pool.get()?;
        for id in ["c", "a", "b"] {
            create(&conn, &new_host(id))?;
        }
        advance_version(&conn, "b", 5)?;

        let pending: Vec<String> = find_below_version(&conn, 5)?.into_iter().map(|h| h.id).collect();
        assert_eq!(pending, vec!["a", "c"]);
        Ok(())
    }

    #[test]
    fn test_corrupt_environment_is_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = create_pool(&dir.path().join("fleet.db"))?;
        migrate(&pool)?;
        let conn = pool.get()?;
        create(&conn, &new_host("h1"))?;
        conn.execute("UPDATE hosts SET environment = '{not json' WHERE id = 'h1'", [])?;

        let err = find_by_id(&conn, "h1").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::FromSqlConversionFailure(..))
        ));
        Ok(())
    }

    #[test]
    fn test_migrate_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = create_pool(&dir.path().join("fleet.db"))?;
        migrate(&pool)?;
        migrate(&pool)?;
        Ok(())
    }
}
