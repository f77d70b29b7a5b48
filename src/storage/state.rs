//! State storage: a durable string key-value store backed by `SQLite`.
//!
//! No transaction spans several keys. Readers must cope with any subset
//! of keys being present, which `load_heartbeat` does by falling back to
//! defaults per key.

use std::{path::Path, time::Duration};

use jiff::Timestamp;
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use crate::model::HeartbeatState;

use super::Result;

/// Well-known state keys.
pub mod keys {
    pub const LAST_HEARTBEAT_AT: &str = "last_heartbeat_at";
    pub const WATCHDOG_SCHEDULED_AT: &str = "watchdog_scheduled_at";
    pub const BACKOFF_COUNT: &str = "backoff_count";
    pub const SERVICE_REQUESTED: &str = "service_requested";
}

/// Durable get/set of string values.
pub trait StateStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// `SQLite`-backed state store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens the database at `path`, creating the schema if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        // `cellwatch stop` may write while the agent holds the database.
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS state (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )?;
        Ok(Self { conn })
    }
}

impl StateStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM state WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO state (key, value, updated_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![key, value, Timestamp::now().to_string()],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM state WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Loads the heartbeat state, treating unreadable keys as absent.
pub fn load_heartbeat(store: &dyn StateStore) -> HeartbeatState {
    HeartbeatState {
        last_heartbeat_at: read_parsed(store, keys::LAST_HEARTBEAT_AT),
        watchdog_scheduled_at: read_parsed(store, keys::WATCHDOG_SCHEDULED_AT),
        backoff_count: read_parsed(store, keys::BACKOFF_COUNT).unwrap_or(0),
    }
}

/// Writes every heartbeat key. `None` fields are removed.
pub fn save_heartbeat(store: &dyn StateStore, state: &HeartbeatState) -> Result<()> {
    write_optional(store, keys::LAST_HEARTBEAT_AT, state.last_heartbeat_at)?;
    write_optional(store, keys::WATCHDOG_SCHEDULED_AT, state.watchdog_scheduled_at)?;
    store.set(keys::BACKOFF_COUNT, &state.backoff_count.to_string())
}

/// Removes every heartbeat key.
pub fn clear_heartbeat(store: &dyn StateStore) -> Result<()> {
    store.remove(keys::LAST_HEARTBEAT_AT)?;
    store.remove(keys::WATCHDOG_SCHEDULED_AT)?;
    store.remove(keys::BACKOFF_COUNT)
}

/// Whether the user asked for the agent to run.
pub fn is_service_requested(store: &dyn StateStore) -> bool {
    read_parsed(store, keys::SERVICE_REQUESTED).unwrap_or(false)
}

/// Whether a running agent should shut down.
///
/// Only a readable flag that is not `true` counts; a failed read keeps the
/// agent running.
pub fn is_stop_requested(store: &dyn StateStore) -> bool {
    match store.get(keys::SERVICE_REQUESTED) {
        Ok(value) => value.as_deref() != Some("true"),
        Err(e) => {
            warn!(error = %e, "Failed to read run request; assuming still requested");
            false
        }
    }
}

pub fn set_service_requested(store: &dyn StateStore, requested: bool) -> Result<()> {
    store.set(keys::SERVICE_REQUESTED, &requested.to_string())
}

fn read_parsed<T>(store: &dyn StateStore, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = match store.get(key) {
        Ok(raw) => raw?,
        Err(e) => {
            warn!(key, error = %e, "Failed to read persisted state; treating as absent");
            return None;
        }
    };
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Corrupt persisted state; treating as absent");
            None
        }
    }
}

fn write_optional(store: &dyn StateStore, key: &str, value: Option<Timestamp>) -> Result<()> {
    match value {
        Some(ts) => store.set(key, &ts.to_string()),
        None => store.remove(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(second: i64) -> Timestamp {
        Timestamp::from_second(second).unwrap()
    }

    #[test]
    fn empty_store_loads_default_state() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(load_heartbeat(&store), HeartbeatState::default());
    }

    #[test]
    fn save_and_load_heartbeat() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = HeartbeatState {
            last_heartbeat_at: Some(ts(1_700_000_000)),
            watchdog_scheduled_at: Some(ts(1_700_000_300)),
            backoff_count: 2,
        };

        save_heartbeat(&store, &state).unwrap();

        assert_eq!(load_heartbeat(&store), state);
    }

    #[test]
    fn saving_none_removes_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .set(keys::WATCHDOG_SCHEDULED_AT, &ts(5).to_string())
            .unwrap();

        save_heartbeat(&store, &HeartbeatState::default()).unwrap();

        assert_eq!(store.get(keys::WATCHDOG_SCHEDULED_AT).unwrap(), None);
    }

    #[test]
    fn partial_and_corrupt_keys_fall_back_per_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .set(keys::LAST_HEARTBEAT_AT, &ts(1_700_000_000).to_string())
            .unwrap();
        store.set(keys::BACKOFF_COUNT, "not-a-number").unwrap();

        let state = load_heartbeat(&store);

        assert_eq!(state.last_heartbeat_at, Some(ts(1_700_000_000)));
        assert_eq!(state.watchdog_scheduled_at, None);
        assert_eq!(state.backoff_count, 0);
    }

    #[test]
    fn clear_heartbeat_removes_everything_but_the_run_flag() {
        let store = SqliteStore::open_in_memory().unwrap();
        set_service_requested(&store, true).unwrap();
        save_heartbeat(
            &store,
            &HeartbeatState {
                last_heartbeat_at: Some(ts(10)),
                watchdog_scheduled_at: Some(ts(20)),
                backoff_count: 4,
            },
        )
        .unwrap();

        clear_heartbeat(&store).unwrap();

        assert_eq!(load_heartbeat(&store), HeartbeatState::default());
        assert!(is_service_requested(&store));
    }

    #[test]
    fn service_requested_defaults_to_false() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!is_service_requested(&store));

        set_service_requested(&store, true).unwrap();
        assert!(is_service_requested(&store));
    }

    #[test]
    fn stop_requested_once_flag_is_cleared() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(is_stop_requested(&store));

        set_service_requested(&store, true).unwrap();
        assert!(!is_stop_requested(&store));

        set_service_requested(&store, false).unwrap();
        assert!(is_stop_requested(&store));
    }
}
