//! Durable credential record store.
//!
//! Provides the [`RecordBackend`] trait and several implementations:
//! - [`FileRecordBackend`] - One JSON document mapping account id to bundle
//! - [`SqliteRecordBackend`] - One row per account in a SQLite table
//! - [`MemoryRecordBackend`] - In-memory storage for testing
//!
//! Backends only move bytes. [`CredentialStore`] sits in front of them,
//! serializes every mutation behind a single lock and turns unreadable
//! storage into "no credentials" so callers never crash on a bad medium.
//! Every backend publishes a full bundle atomically (rename, transaction,
//! or map swap under a lock), so reads do not take the writer lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, instrument, warn};

use super::CredentialError;
use super::bundle::CredentialBundle;

/// Every record on file, keyed by account id.
pub type RecordSet = BTreeMap<String, CredentialBundle>;

// =============================================================================
// RecordBackend trait
// =============================================================================

/// Storage medium for credential records.
///
/// Implementations must be thread-safe and must never expose a partially
/// written bundle to a concurrent reader.
pub trait RecordBackend: Send + Sync {
    /// Load every record on file.
    fn read_all(&self) -> Result<RecordSet, CredentialError>;

    /// Load the record for one account, if any.
    fn read(&self, account_id: &str) -> Result<Option<CredentialBundle>, CredentialError> {
        Ok(self.read_all()?.remove(account_id))
    }

    /// Insert or replace the record for one account.
    fn write(&self, account_id: &str, bundle: &CredentialBundle) -> Result<(), CredentialError>;

    /// Name of this backend, for logs.
    fn name(&self) -> &str;
}

// =============================================================================
// CredentialStore
// =============================================================================

/// The single owner of persisted credential bundles.
///
/// Callers only ever receive copies. Writers are serialized by one
/// store-wide lock; refreshes happen at most once per token lifetime, so
/// contention on it is negligible. The lock is never held across network I/O.
pub struct CredentialStore {
    backend: Box<dyn RecordBackend>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(backend: impl RecordBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            write_lock: Mutex::new(()),
        }
    }

    /// Store backed by memory only.
    pub fn in_memory() -> Self {
        Self::new(MemoryRecordBackend::new())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Current bundle for `account_id`. Unreadable storage reads as absent.
    pub fn get(&self, account_id: &str) -> Option<CredentialBundle> {
        match self.backend.read(account_id) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(account_id, error = %e, "Credential store unreadable, treating as empty");
                None
            }
        }
    }

    /// Every bundle on record. Unreadable storage reads as empty.
    pub fn list(&self) -> RecordSet {
        match self.backend.read_all() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Credential store unreadable, treating as empty");
                RecordSet::new()
            }
        }
    }

    /// Some account currently on record.
    ///
    /// With several accounts connected this is simply the lexicographically
    /// smallest id; there is no notion of an "active" account.
    pub fn default_account(&self) -> Option<String> {
        self.list().into_keys().next()
    }

    /// Insert or replace the bundle for `account_id`.
    pub fn put(&self, account_id: &str, bundle: &CredentialBundle) -> Result<(), CredentialError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.backend.write(account_id, bundle)?;
        debug!(account_id, backend = self.backend.name(), "Credential bundle stored");
        Ok(())
    }

    /// Read-modify-write of one record under the writer lock.
    ///
    /// `f` receives the latest stored bundle (not a copy read earlier) and
    /// returns the bundle to store, or `None` to leave the record untouched.
    pub fn update<F>(&self, account_id: &str, f: F) -> Result<Option<CredentialBundle>, CredentialError>
    where
        F: FnOnce(Option<CredentialBundle>) -> Option<CredentialBundle>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.backend.read(account_id).unwrap_or_else(|e| {
            warn!(account_id, error = %e, "Credential store unreadable during update");
            None
        });
        match f(current) {
            Some(next) => {
                self.backend.write(account_id, &next)?;
                debug!(account_id, backend = self.backend.name(), "Credential bundle updated");
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

// =============================================================================
// FileRecordBackend
// =============================================================================

/// File permissions for the record file (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// File-based record storage.
///
/// All accounts live in one pretty-printed JSON object:
/// `{ "<account_id>": { "access_token": ..., ... }, ... }`.
///
/// # Security
/// - File permissions are set to 0600 (owner read/write only) on Unix
/// - Writes go to a temp file that is renamed over the live file
#[derive(Debug, Clone)]
pub struct FileRecordBackend {
    path: PathBuf,
}

impl FileRecordBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn ensure_parent(&self) -> Result<(), CredentialError> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    CredentialError::Storage(format!(
                        "Failed to create directory '{}': {}",
                        dir.display(),
                        e
                    ))
                })
            }
            _ => Ok(()),
        }
    }

    fn write_all(&self, records: &RecordSet) -> Result<(), CredentialError> {
        self.ensure_parent()?;
        let content = serde_json::to_string_pretty(records)
            .map_err(|e| CredentialError::Storage(format!("Failed to serialize records: {}", e)))?;

        let temp_path = self.path.with_extension("tmp");
        write_private(&temp_path, content.as_bytes())?;

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(CredentialError::Storage(format!(
                "Failed to rename '{}' to '{}': {}",
                temp_path.display(),
                self.path.display(),
                e
            )));
        }
        Ok(())
    }

    /// Move an unparseable record file out of the way so the next write
    /// does not destroy it.
    fn quarantine(&self) {
        let aside = self.path.with_extension("corrupt");
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => warn!(path = %aside.display(), "Moved unreadable credential file aside"),
            Err(e) => warn!(error = %e, "Failed to move unreadable credential file aside"),
        }
    }
}

fn write_private(path: &Path, content: &[u8]) -> Result<(), CredentialError> {
    let map_err = |e: std::io::Error| {
        CredentialError::Storage(format!("Failed to write temp file '{}': {}", path.display(), e))
    };

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(path)
            .map_err(map_err)?;
        file.write_all(content).map_err(map_err)?;
        file.sync_all().map_err(map_err)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, content).map_err(map_err)?;
    }

    Ok(())
}

impl RecordBackend for FileRecordBackend {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    fn read_all(&self) -> Result<RecordSet, CredentialError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecordSet::new()),
            Err(e) => {
                return Err(CredentialError::Storage(format!(
                    "Failed to read credential file '{}': {}",
                    self.path.display(),
                    e
                )));
            }
        };

        if content.trim().is_empty() {
            return Ok(RecordSet::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            CredentialError::Corrupt(format!(
                "Failed to parse credential file '{}': {}",
                self.path.display(),
                e
            ))
        })
    }

    #[instrument(skip(self, bundle), fields(path = %self.path.display()))]
    fn write(&self, account_id: &str, bundle: &CredentialBundle) -> Result<(), CredentialError> {
        let mut records = match self.read_all() {
            Ok(records) => records,
            Err(CredentialError::Corrupt(msg)) => {
                warn!(error = %msg, "Credential file corrupt, starting a fresh record set");
                self.quarantine();
                RecordSet::new()
            }
            Err(e) => return Err(e),
        };
        records.insert(account_id.to_string(), bundle.clone());
        self.write_all(&records)
    }

    fn name(&self) -> &str {
        "file"
    }
}

// =============================================================================
// SqliteRecordBackend
// =============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    account_id                  TEXT PRIMARY KEY,
    access_token                TEXT NOT NULL,
    refresh_token               TEXT,
    access_token_expiration     INTEGER,
    refresh_token_expiration    INTEGER,
    updated_at                  TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed record storage, one row per account.
#[derive(Clone)]
pub struct SqliteRecordBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordBackend {
    /// Open or create the database at the given path with WAL mode.
    pub fn open(path: &Path) -> Result<Self, CredentialError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, CredentialError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CredentialError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, CredentialError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn).map_err(CredentialError::from)
    }
}

fn row_to_bundle(row: &rusqlite::Row<'_>) -> Result<CredentialBundle, rusqlite::Error> {
    Ok(CredentialBundle {
        access_token: row.get("access_token")?,
        refresh_token: row.get("refresh_token")?,
        access_expiry: row.get("access_token_expiration")?,
        refresh_expiry: row.get("refresh_token_expiration")?,
    })
}

impl RecordBackend for SqliteRecordBackend {
    #[instrument(skip(self))]
    fn read_all(&self) -> Result<RecordSet, CredentialError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT account_id, access_token, refresh_token, access_token_expiration, \
                 refresh_token_expiration FROM credentials",
            )?;
            let records = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>("account_id")?, row_to_bundle(row)?))
                })?
                .collect::<Result<RecordSet, _>>()?;
            Ok(records)
        })
    }

    #[instrument(skip(self))]
    fn read(&self, account_id: &str) -> Result<Option<CredentialBundle>, CredentialError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT access_token, refresh_token, access_token_expiration, \
                 refresh_token_expiration FROM credentials WHERE account_id = ?1",
                params![account_id],
                row_to_bundle,
            )
            .optional()
        })
    }

    #[instrument(skip(self, bundle))]
    fn write(&self, account_id: &str, bundle: &CredentialBundle) -> Result<(), CredentialError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credentials (account_id, access_token, refresh_token, \
                 access_token_expiration, refresh_token_expiration, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now')) \
                 ON CONFLICT(account_id) DO UPDATE SET \
                 access_token = excluded.access_token, \
                 refresh_token = excluded.refresh_token, \
                 access_token_expiration = excluded.access_token_expiration, \
                 refresh_token_expiration = excluded.refresh_token_expiration, \
                 updated_at = excluded.updated_at",
                params![
                    account_id,
                    bundle.access_token,
                    bundle.refresh_token,
                    bundle.access_expiry,
                    bundle.refresh_expiry,
                ],
            )?;
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

// =============================================================================
// MemoryRecordBackend
// =============================================================================

/// In-memory record storage.
///
/// Clones share the same map, which makes it handy for tests that need to
/// inspect what the code under test stored.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordBackend {
    inner: Arc<RwLock<RecordSet>>,
}

impl MemoryRecordBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend holding one record.
    pub fn with_record(account_id: impl Into<String>, bundle: CredentialBundle) -> Self {
        let backend = Self::new();
        backend
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id.into(), bundle);
        backend
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordBackend for MemoryRecordBackend {
    fn read_all(&self) -> Result<RecordSet, CredentialError> {
        Ok(self.inner.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn read(&self, account_id: &str) -> Result<Option<CredentialBundle>, CredentialError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(account_id).cloned())
    }

    fn write(&self, account_id: &str, bundle: &CredentialBundle) -> Result<(), CredentialError> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(account_id.to_string(), bundle.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(access: &str) -> CredentialBundle {
        CredentialBundle::new(access, Some(format!("{access}-refresh"))).with_access_expiry(Some(2_000_000_000))
    }

    // =========================================================================
    // CredentialStore
    // =========================================================================

    #[test]
    fn test_store_empty() {
        let store = CredentialStore::in_memory();
        assert!(store.get("m1").is_none());
        assert!(store.list().is_empty());
        assert!(store.default_account().is_none());
    }

    #[test]
    fn test_store_put_get_list() {
        let store = CredentialStore::in_memory();
        store.put("m2", &bundle("b")).unwrap();
        store.put("m1", &bundle("a")).unwrap();
        assert_eq!(store.get("m1").unwrap().access_token, "a");
        assert_eq!(store.list().len(), 2);
        assert_eq!(store.default_account().as_deref(), Some("m1"));
    }

    #[test]
    fn test_store_put_replaces() {
        let store = CredentialStore::in_memory();
        store.put("m1", &bundle("a")).unwrap();
        store.put("m1", &bundle("b")).unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get("m1").unwrap().access_token, "b");
    }

    #[test]
    fn test_store_update_sees_latest() {
        let store = CredentialStore::in_memory();
        store.put("m1", &bundle("a")).unwrap();
        let updated = store
            .update("m1", |current| {
                let mut b = current?;
                b.access_token.push('2');
                Some(b)
            })
            .unwrap();
        assert_eq!(updated.unwrap().access_token, "a2");
        assert_eq!(store.get("m1").unwrap().access_token, "a2");
    }

    #[test]
    fn test_store_update_none_leaves_record() {
        let store = CredentialStore::in_memory();
        assert!(store.update("m1", |_| None).unwrap().is_none());
        assert!(store.get("m1").is_none());
    }

    #[test]
    fn test_store_concurrent_updates_not_lost() {
        let store = Arc::new(CredentialStore::in_memory());
        store.put("m1", &CredentialBundle::new("", None)).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update("m1", |b| {
                            let mut b = b?;
                            b.access_token.push('x');
                            Some(b)
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("m1").unwrap().access_token.len(), 16);
    }

    // =========================================================================
    // FileRecordBackend
    // =========================================================================

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(FileRecordBackend::new(dir.path().join("tokens.json")));

        assert!(store.get("m1").is_none());
        store.put("m1", &bundle("a")).unwrap();
        store.put("m2", &bundle("b")).unwrap();

        let reopened = CredentialStore::new(FileRecordBackend::new(dir.path().join("tokens.json")));
        assert_eq!(reopened.get("m1").unwrap(), bundle("a"));
        assert_eq!(reopened.list().len(), 2);
    }

    #[test]
    fn test_file_layout_is_keyed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = CredentialStore::new(FileRecordBackend::new(&path));
        store
            .put("m1", &CredentialBundle::new("a", Some("r".into())))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["m1"]["access_token"], "a");
        assert_eq!(raw["m1"]["refresh_token"], "r");
        assert!(raw["m1"].get("access_token_expiration").is_none());
    }

    #[test]
    fn test_file_corrupt_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = CredentialStore::new(FileRecordBackend::new(&path));
        assert!(store.get("m1").is_none());
        assert!(store.list().is_empty());
        assert!(store.default_account().is_none());

        // A later write starts over and keeps the broken file aside.
        store.put("m1", &bundle("a")).unwrap();
        assert_eq!(store.get("m1").unwrap().access_token, "a");
        assert!(path.with_extension("corrupt").exists());
    }

    #[test]
    fn test_file_empty_content_is_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "   \n").unwrap();
        let backend = FileRecordBackend::new(&path);
        assert!(backend.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("tokens.json");
        let store = CredentialStore::new(FileRecordBackend::new(&path));
        store.put("m1", &bundle("a")).unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = CredentialStore::new(FileRecordBackend::new(&path));
        store.put("m1", &bundle("a")).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "File permissions should be 0600");
    }

    // =========================================================================
    // SqliteRecordBackend
    // =========================================================================

    #[test]
    fn test_sqlite_upsert_and_read() {
        let backend = SqliteRecordBackend::open_in_memory().unwrap();
        assert!(backend.read("m1").unwrap().is_none());

        backend.write("m1", &bundle("a")).unwrap();
        backend.write("m1", &bundle("b")).unwrap();
        backend
            .write("m2", &CredentialBundle::new("c", None))
            .unwrap();

        assert_eq!(backend.read("m1").unwrap().unwrap(), bundle("b"));
        let all = backend.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["m2"].refresh_token, None);
        assert_eq!(all["m2"].access_expiry, None);
    }

    #[test]
    fn test_sqlite_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.db");
        SqliteRecordBackend::open(&path)
            .unwrap()
            .write("m1", &bundle("a"))
            .unwrap();

        let reopened = SqliteRecordBackend::open(&path).unwrap();
        assert_eq!(reopened.read("m1").unwrap().unwrap(), bundle("a"));
        assert_eq!(reopened.name(), "sqlite");
    }

    // =========================================================================
    // MemoryRecordBackend
    // =========================================================================

    #[test]
    fn test_memory_clone_shares_state() {
        let backend = MemoryRecordBackend::new();
        let store = CredentialStore::new(backend.clone());
        store.put("m1", &bundle("a")).unwrap();
        assert_eq!(backend.len(), 1);
        assert!(!backend.is_empty());
    }

    #[test]
    fn test_memory_with_record() {
        let backend = MemoryRecordBackend::with_record("m1", bundle("a"));
        assert_eq!(backend.read("m1").unwrap().unwrap().access_token, "a");
        assert_eq!(backend.name(), "memory");
    }
}
