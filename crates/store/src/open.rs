use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use uuid::Uuid;

use crate::dialect::Dialect;
use crate::models::MachineId;
use crate::schema::MIG_0001_INIT;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unsupported store driver for DSN {0:?}: only the embedded sqlite engine is linked")]
    UnsupportedDriver(String),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

#[derive(Debug, Default)]
pub(crate) struct Cache {
    pub host_id: Option<MachineId>,
}

/// Handle over the inventory database, shared by every probe module of a
/// scan. Writes go through one connection; the host-id cache has exactly two
/// writers (get_or_create_host and the fingerprint claim).
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    dialect: Dialect,
    agent: Uuid,
    pub(crate) cache: Mutex<Cache>,
}

impl Store {
    /// Opens (or creates) the store at `dsn` for the given agent UUID.
    pub fn open(dsn: &str, agent: Uuid) -> Result<Self, StoreError> {
        let dialect = Dialect::detect(dsn);
        if dialect == Dialect::Postgres {
            return Err(StoreError::UnsupportedDriver(dsn.to_string()));
        }
        let conn = if dsn == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(dsn)?
        };
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            dialect,
            agent,
            cache: Mutex::new(Cache::default()),
        })
    }

    /// In-memory store, used by tests and by `--store :memory:` dry runs.
    pub fn open_in_memory(agent: Uuid) -> Result<Self, StoreError> {
        Store::open(":memory:", agent)
    }

    pub fn agent(&self) -> Uuid {
        self.agent
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cached_host_id(&self) -> Option<MachineId> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .host_id
    }

    pub(crate) fn cache_host_id(&self, id: MachineId) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .host_id = Some(id);
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000i64)?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    // naive: if the machines table doesn't exist, apply 0001
    let exists: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name='machines'",
        [],
        |r| r.get(0),
    )?;
    if exists == 0 {
        conn.execute_batch(MIG_0001_INIT)?;
    }
    Ok(())
}

/// RFC 3339 timestamp used for created_at/updated_at columns.
pub(crate) fn now() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_applies_schema() {
        let store = Store::open_in_memory(Uuid::new_v4()).unwrap();
        let conn = store.conn();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name IN \
                 ('machines','network_interfaces','subnetworks','application_endpoints','flows')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn postgres_dsn_is_rejected() {
        let err = Store::open("postgres://db/situation", Uuid::nil()).unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedDriver(_)));
    }

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }
}
