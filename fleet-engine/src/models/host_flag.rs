//! Persisted per-host flags, used to rate-limit operator alerts across
//! process restarts.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub fn get(conn: &Connection, host_id: &str, flag: &str) -> anyhow::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT set_at FROM host_flags WHERE host_id = ?1 AND flag = ?2",
            params![host_id, flag],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc)))
}

pub fn set(conn: &Connection, host_id: &str, flag: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO host_flags (host_id, flag, set_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(host_id, flag) DO UPDATE SET set_at = excluded.set_at",
        params![host_id, flag, at.to_rfc3339()],
    )?;
    Ok(())
}

/// Record `flag` for `host_id` unless it was already recorded on the same
/// UTC day. Returns true when the caller should act (first time today).
pub fn mark_once_per_day(
    conn: &Connection,
    host_id: &str,
    flag: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    if let Some(previous) = get(conn, host_id, flag)? {
        if previous.date_naive() == now.date_naive() {
            return Ok(false);
        }
    }
    set(conn, host_id, flag, now)?;
    Ok(true)
}

pub fn clear(conn: &Connection, host_id: &str, flag: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM host_flags WHERE host_id = ?1 AND flag = ?2",
        params![host_id, flag],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connection::create_pool, migrate::migrate};
    use crate::models::host::{self, ApiMode, NewHost};
    use chrono::TimeZone;

    #[test]
    fn test_mark_once_per_day() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = create_pool(&dir.path().join("fleet.db"))?;
        migrate(&pool)?;
        let conn = pool.get()?;
        host::create(&conn, &NewHost {
            id: "h1".into(),
            name: "h1".into(),
            address: "10.0.0.1".into(),
            port: 22,
            ssh_user: "root".into(),
            credential_ref: "k".into(),
            api_mode: ApiMode::Managed,
            last_known_token: None,
            environment: Default::default(),
        })?;

        let morning = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2026, 3, 2, 0, 5, 0).unwrap();

        assert!(mark_once_per_day(&conn, "h1", "degraded", morning)?);
        assert!(!mark_once_per_day(&conn, "h1", "degraded", evening)?);
        assert!(mark_once_per_day(&conn, "h1", "degraded", next_day)?);

        clear(&conn, "h1", "degraded")?;
        assert!(get(&conn, "h1", "degraded")?.is_none());
        Ok(())
    }
}
