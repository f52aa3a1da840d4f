// Persistent key-value store backing the credential vault
// SQLite for real use, in-memory for tests; both emit best-effort change events

use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::error::Result;

/// Namespaced storage keys. Ciphertext, expiry and digest form one logical
/// credential; the refresh marker lives beside them.
pub const KEY_ACCESS_TOKEN: &str = "credlock.access_token";
pub const KEY_TOKEN_EXPIRY: &str = "credlock.token_expiry";
pub const KEY_TOKEN_DIGEST: &str = "credlock.token_digest";
pub const KEY_REFRESH_MARKER: &str = "credlock.refresh_token_ref";

/// All keys owned by this subsystem, in purge order
pub const ALL_KEYS: [&str; 4] = [
    KEY_ACCESS_TOKEN,
    KEY_TOKEN_EXPIRY,
    KEY_TOKEN_DIGEST,
    KEY_REFRESH_MARKER,
];

/// A change observed on the store.
///
/// Delivered best-effort: receivers may lag and miss events. This is a
/// freshness hint only; the authoritative state is always a fresh read.
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub key: String,
}

/// Key-value store collaborator for the credential vault
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Subscribe to change events. Deletes of absent keys emit nothing.
    fn watch(&self) -> broadcast::Receiver<StoreChange>;
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// SQLite-backed store: a single `kv` table keyed by namespaced entry name
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::AuthError::Storage(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn notify(&self, key: &str) {
        // Nobody listening is fine
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
        });
    }
}

impl TokenStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let conn = self.conn.lock().expect("store mutex poisoned");
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
        }
        self.notify(key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let deleted = {
            let conn = self.conn.lock().expect("store mutex poisoned");
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?
        };
        if deleted > 0 {
            self.notify(key);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// In-memory store with the same change-event semantics
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().expect("store mutex poisoned");
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut entries = self.entries.lock().expect("store mutex poisoned");
            entries.insert(key.to_string(), value.to_string());
        }
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let removed = {
            let mut entries = self.entries.lock().expect("store mutex poisoned");
            entries.remove(key).is_some()
        };
        if removed {
            let _ = self.changes.send(StoreChange {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<Box<dyn TokenStore>> {
        vec![
            Box::new(MemoryStore::new()),
            Box::new(SqliteStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_get_set_remove_roundtrip() {
        for store in stores() {
            assert_eq!(store.get(KEY_ACCESS_TOKEN).unwrap(), None);

            store.set(KEY_ACCESS_TOKEN, "value-1").unwrap();
            assert_eq!(
                store.get(KEY_ACCESS_TOKEN).unwrap(),
                Some("value-1".to_string())
            );

            store.set(KEY_ACCESS_TOKEN, "value-2").unwrap();
            assert_eq!(
                store.get(KEY_ACCESS_TOKEN).unwrap(),
                Some("value-2".to_string())
            );

            store.remove(KEY_ACCESS_TOKEN).unwrap();
            assert_eq!(store.get(KEY_ACCESS_TOKEN).unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_change_events_on_writes() {
        for store in stores() {
            let mut rx = store.watch();

            store.set(KEY_TOKEN_EXPIRY, "12345").unwrap();
            let change = rx.recv().await.unwrap();
            assert_eq!(change.key, KEY_TOKEN_EXPIRY);

            store.remove(KEY_TOKEN_EXPIRY).unwrap();
            let change = rx.recv().await.unwrap();
            assert_eq!(change.key, KEY_TOKEN_EXPIRY);
        }
    }

    #[tokio::test]
    async fn test_no_event_for_absent_delete() {
        for store in stores() {
            let mut rx = store.watch();

            store.remove(KEY_TOKEN_DIGEST).unwrap();
            assert!(matches!(
                rx.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ));
        }
    }
}
