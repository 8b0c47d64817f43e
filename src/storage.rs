//! Presence DLP - Record Store
//!
//! Keyed records for users, roles, protected applications, protected files
//! and their permission mappings. Biometric templates and file keys are
//! stored only as wrapped secrets.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::WrappedSecret;
use crate::error::{DlpError, DlpResult};
use crate::secure_fs;
use crate::vault::{encrypted_path_for, CryptoVault};
use crate::vision::FeatureVector;

/// Roles seeded into an empty database
pub const DEFAULT_ROLES: &[&str] = &["Administrator", "Manager", "Employee"];

/// Protected application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: i64,
    /// Executable file name, e.g. `excel.exe`
    pub exe: String,
    pub name: String,
    pub is_active: bool,
}

/// Enrolled user with the wrapped template blob
#[derive(Debug, Clone)]
pub struct EncodingRecord {
    pub id: i64,
    pub name: String,
    pub role: String,
    pub wrapped_template: Vec<u8>,
}

/// Enrolled user without biometric data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub role: String,
}

/// Protected document
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub original_name: String,
    pub enc_path: PathBuf,
    pub wrapped_file_key: WrappedSecret,
}

/// Operations the security core consumes from the record store
pub trait Storage: Send + Sync {
    /// Active protected applications
    fn apps(&self) -> DlpResult<Vec<AppRecord>>;

    /// Every enrolled template (still wrapped)
    fn all_encodings(&self) -> DlpResult<Vec<EncodingRecord>>;

    /// Protected document by id
    fn file_by_id(&self, id: i64) -> DlpResult<FileRecord>;

    /// Save new content for a document, rotating its file key
    fn update_file_content(&self, id: i64, content: &[u8]) -> DlpResult<bool>;
}

/// SQLite-backed record store
pub struct SqliteStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Vault used to wrap templates and rotate file keys
    vault: Arc<CryptoVault>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path, vault: Arc<CryptoVault>) -> DlpResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?, vault)
    }

    /// In-memory database
    pub fn open_in_memory(vault: Arc<CryptoVault>) -> DlpResult<Self> {
        Self::init(Connection::open_in_memory()?, vault)
    }

    fn init(conn: Connection, vault: Arc<CryptoVault>) -> DlpResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS roles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                role TEXT NOT NULL,
                enc_encoding BLOB NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS apps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                exe_name TEXT NOT NULL UNIQUE,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_name TEXT NOT NULL,
                enc_path TEXT NOT NULL UNIQUE,
                enc_key BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS file_permissions (
                file_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (file_id, role),
                FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS app_permissions (
                app_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (app_id, role),
                FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
            );
            "#,
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            vault,
        };
        store.seed_roles()?;
        Ok(store)
    }

    fn seed_roles(&self) -> DlpResult<()> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM roles", [], |row| row.get(0))?;
        if count == 0 {
            for role in DEFAULT_ROLES {
                conn.execute("INSERT INTO roles (name) VALUES (?1)", params![role])?;
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ROLES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn roles(&self) -> DlpResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT name FROM roles ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    /// Add a role; `false` if it already exists
    pub fn add_role(&self, name: &str) -> DlpResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO roles (name) VALUES (?1)",
            params![name],
        )?;
        Ok(changed == 1)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // USERS
    // ═══════════════════════════════════════════════════════════════════════

    /// Enroll a user; the template is serialized and wrapped before storage
    pub fn add_user(&self, name: &str, role: &str, template: &FeatureVector) -> DlpResult<i64> {
        let encoded = bincode::serialize(template)?;
        let wrapped = self.vault.encrypt(&encoded)?;
        self.add_wrapped_user(name, role, &wrapped.to_bytes())
    }

    /// Enroll a user whose template blob is already wrapped
    pub fn add_wrapped_user(&self, name: &str, role: &str, wrapped_template: &[u8]) -> DlpResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (name, role, enc_encoding, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, role, wrapped_template, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn users(&self) -> DlpResult<Vec<UserRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, role FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                role: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_user(&self, id: i64) -> DlpResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // APPLICATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Protect an application by executable; `false` if already protected
    pub fn add_app(&self, name: &str, exe_path: &str, allowed_roles: &[String]) -> DlpResult<bool> {
        let exe_name = Path::new(exe_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(exe_path)
            .to_string();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO apps (name, exe_name) VALUES (?1, ?2)",
            params![name, exe_name],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        let app_id = tx.last_insert_rowid();
        for role in allowed_roles {
            tx.execute(
                "INSERT OR IGNORE INTO app_permissions (app_id, role) VALUES (?1, ?2)",
                params![app_id, role],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    /// Every protected application, active or not
    pub fn all_apps(&self) -> DlpResult<Vec<AppRecord>> {
        self.query_apps("SELECT id, exe_name, name, is_active FROM apps ORDER BY id")
    }

    pub fn set_app_active(&self, id: i64, active: bool) -> DlpResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE apps SET is_active = ?1 WHERE id = ?2",
            params![active as i64, id],
        )?;
        Ok(())
    }

    pub fn app_permissions(&self, id: i64) -> DlpResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT role FROM app_permissions WHERE app_id = ?1")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn delete_app(&self, id: i64) -> DlpResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM app_permissions WHERE app_id = ?1", params![id])?;
        conn.execute("DELETE FROM apps WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn query_apps(&self, sql: &str) -> DlpResult<Vec<AppRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(AppRecord {
                id: row.get(0)?,
                exe: row.get(1)?,
                name: row.get(2)?,
                is_active: row.get::<_, i64>(3)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FILES
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt a document in place and register it.
    ///
    /// The plaintext original is wiped only once the record is committed; a
    /// failed registration removes the new `.enc` file and leaves the
    /// original untouched.
    pub fn import_file(&self, path: &Path, allowed_roles: &[String]) -> DlpResult<i64> {
        let original_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let target = encrypted_path_for(path);
        if self.file_by_path(&target)?.is_some() {
            return Err(DlpError::FileExists(target.display().to_string()));
        }

        let (enc_path, wrapped_key) = self.vault.seal_file(path)?;
        let id = match self.add_file(&original_name, &enc_path, &wrapped_key, allowed_roles) {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&enc_path) {
                    warn!("Could not remove {}: {}", enc_path.display(), cleanup);
                }
                return Err(e);
            }
        };

        secure_fs::wipe_and_delete(path)?;
        info!("Protected document #{} ({})", id, original_name);
        Ok(id)
    }

    /// Register an already-encrypted document
    pub fn add_file(
        &self,
        original_name: &str,
        enc_path: &Path,
        wrapped_file_key: &WrappedSecret,
        allowed_roles: &[String],
    ) -> DlpResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO files (original_name, enc_path, enc_key) VALUES (?1, ?2, ?3)",
            params![
                original_name,
                enc_path.to_string_lossy(),
                wrapped_file_key.to_bytes()
            ],
        )?;
        let file_id = tx.last_insert_rowid();

        for role in allowed_roles {
            tx.execute(
                "INSERT OR IGNORE INTO file_permissions (file_id, role) VALUES (?1, ?2)",
                params![file_id, role],
            )?;
        }
        tx.commit()?;
        Ok(file_id)
    }

    pub fn files(&self) -> DlpResult<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, original_name, enc_path, enc_key FROM files ORDER BY id")?;
        let rows = stmt.query_map([], raw_file_row)?;

        let mut files = Vec::new();
        for row in rows {
            files.push(file_record(row?)?);
        }
        Ok(files)
    }

    /// Look a document up by the location of its `.enc` file
    pub fn file_by_path(&self, path: &Path) -> DlpResult<Option<FileRecord>> {
        let wanted = normalize(path);
        Ok(self
            .files()?
            .into_iter()
            .find(|f| normalize(&f.enc_path) == wanted))
    }

    pub fn file_permissions(&self, id: i64) -> DlpResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT role FROM file_permissions WHERE file_id = ?1")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    /// Delete a document: the `.enc` file and its wrapped key go with it
    pub fn delete_file_record(&self, id: i64) -> DlpResult<()> {
        let record = self.file_by_id(id)?;
        if record.enc_path.exists() {
            if let Err(e) = std::fs::remove_file(&record.enc_path) {
                warn!("Could not remove {}: {}", record.enc_path.display(), e);
            }
        }

        let conn = self.conn.lock();
        conn.execute("DELETE FROM file_permissions WHERE file_id = ?1", params![id])?;
        conn.execute("DELETE FROM files WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl Storage for SqliteStore {
    fn apps(&self) -> DlpResult<Vec<AppRecord>> {
        self.query_apps("SELECT id, exe_name, name, is_active FROM apps WHERE is_active = 1 ORDER BY id")
    }

    fn all_encodings(&self) -> DlpResult<Vec<EncodingRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name, role, enc_encoding FROM users ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(EncodingRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                role: row.get(2)?,
                wrapped_template: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn file_by_id(&self, id: i64) -> DlpResult<FileRecord> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id, original_name, enc_path, enc_key FROM files WHERE id = ?1",
                params![id],
                raw_file_row,
            )
            .optional()?
        };

        match raw {
            Some(raw) => file_record(raw),
            None => Err(DlpError::RecordNotFound(format!("file #{}", id))),
        }
    }

    fn update_file_content(&self, id: i64, content: &[u8]) -> DlpResult<bool> {
        let record = match self.file_by_id(id) {
            Ok(record) => record,
            Err(DlpError::RecordNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let new_key = self.vault.rewrite_file_content(&record.enc_path, content)?;

        let conn = self.conn.lock();
        conn.execute(
            "UPDATE files SET enc_key = ?1 WHERE id = ?2",
            params![new_key.to_bytes(), id],
        )?;
        Ok(true)
    }
}

type RawFileRow = (i64, String, String, Vec<u8>);

fn raw_file_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFileRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn file_record((id, original_name, enc_path, enc_key): RawFileRow) -> DlpResult<FileRecord> {
    Ok(FileRecord {
        id,
        original_name,
        enc_path: PathBuf::from(enc_path),
        wrapped_file_key: WrappedSecret::from_bytes(&enc_key)?,
    })
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;
    use tempfile::tempdir;

    fn store() -> (SqliteStore, Arc<CryptoVault>) {
        let vault = Arc::new(CryptoVault::with_master_key(SecretKey::generate()));
        (SqliteStore::open_in_memory(Arc::clone(&vault)).unwrap(), vault)
    }

    #[test]
    fn test_default_roles_seeded_once() {
        let dir = tempdir().unwrap();
        let vault = Arc::new(CryptoVault::with_master_key(SecretKey::generate()));
        let db = dir.path().join("dlp.db");

        SqliteStore::open(&db, Arc::clone(&vault)).unwrap();
        let store = SqliteStore::open(&db, vault).unwrap();
        assert_eq!(store.roles().unwrap(), DEFAULT_ROLES);
        assert!(store.add_role("Auditor").unwrap());
        assert!(!store.add_role("Auditor").unwrap());
    }

    #[test]
    fn test_templates_are_wrapped() {
        let (store, vault) = store();
        let template = FeatureVector::new(vec![0.25; 128]);
        store.add_user("Alice", "Employee", &template).unwrap();

        let records = store.all_encodings().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Alice");

        let plain = vault.decrypt_bytes(&records[0].wrapped_template).unwrap();
        let decoded: FeatureVector = bincode::deserialize(&plain).unwrap();
        assert_eq!(decoded, template);

        store.delete_user(records[0].id).unwrap();
        assert!(store.users().unwrap().is_empty());
    }

    #[test]
    fn test_apps_active_filter_and_duplicates() {
        let (store, _) = store();
        assert!(store.add_app("Excel", "C:\\Office\\excel.exe", &["Manager".into()]).unwrap());
        assert!(store.add_app("Notepad", "/usr/bin/gedit", &[]).unwrap());
        assert!(!store.add_app("Excel again", "excel.exe", &[]).unwrap());

        let all = store.all_apps().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].exe, "gedit");
        assert_eq!(store.app_permissions(all[0].id).unwrap(), vec!["Manager"]);

        store.set_app_active(all[1].id, false).unwrap();
        let active = store.apps().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "Excel");

        store.delete_app(all[0].id).unwrap();
        assert!(store.apps().unwrap().is_empty());
    }

    #[test]
    fn test_file_lifecycle() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("contract.txt");
        std::fs::write(&original, b"draft").unwrap();

        let (store, vault) = store();
        let id = store.import_file(&original, &["Manager".into()]).unwrap();
        assert!(!original.exists());

        let record = store.file_by_id(id).unwrap();
        assert_eq!(record.original_name, "contract.txt");
        assert_eq!(store.file_permissions(id).unwrap(), vec!["Manager"]);
        assert_eq!(
            store.file_by_path(&record.enc_path).unwrap().map(|f| f.id),
            Some(id)
        );

        assert!(store.update_file_content(id, b"final").unwrap());
        let rotated = store.file_by_id(id).unwrap();
        assert_ne!(rotated.wrapped_file_key, record.wrapped_file_key);
        assert_eq!(
            vault
                .decrypt_file_content(&rotated.enc_path, &rotated.wrapped_file_key)
                .unwrap(),
            b"final"
        );

        store.delete_file_record(id).unwrap();
        assert!(!rotated.enc_path.exists());
        assert!(matches!(store.file_by_id(id), Err(DlpError::RecordNotFound(_))));
        assert!(!store.update_file_content(id, b"x").unwrap());
    }

    #[test]
    fn test_reimport_same_name_keeps_both_documents() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("report.txt");
        std::fs::write(&original, b"first").unwrap();

        let (store, vault) = store();
        let id = store.import_file(&original, &[]).unwrap();

        std::fs::write(&original, b"second").unwrap();
        assert!(matches!(
            store.import_file(&original, &[]),
            Err(DlpError::FileExists(_))
        ));

        assert_eq!(std::fs::read(&original).unwrap(), b"second");
        assert_eq!(store.files().unwrap().len(), 1);
        let record = store.file_by_id(id).unwrap();
        assert_eq!(
            vault
                .decrypt_file_content(&record.enc_path, &record.wrapped_file_key)
                .unwrap(),
            b"first"
        );
    }

    #[test]
    fn test_failed_registration_keeps_original() {
        let dir = tempdir().unwrap();
        let (store, _) = store();

        // an unregistered .enc from elsewhere occupies the target name
        let original = dir.path().join("notes.txt");
        std::fs::write(&original, b"plain").unwrap();
        std::fs::write(dir.path().join("notes.txt.enc"), b"foreign").unwrap();

        assert!(matches!(
            store.import_file(&original, &[]),
            Err(DlpError::FileExists(_))
        ));
        assert_eq!(std::fs::read(&original).unwrap(), b"plain");
        assert_eq!(std::fs::read(dir.path().join("notes.txt.enc")).unwrap(), b"foreign");
        assert!(store.files().unwrap().is_empty());
    }
}
