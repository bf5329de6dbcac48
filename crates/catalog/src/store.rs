//! SQLite-backed catalog store.
//!
//! Three data tables plus a schema-version table. Multi-statement updates
//! run inside a transaction held by the single writer; readers see either
//! the pre- or post-commit state, never a partial write.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use axon_core::{Result, ServiceError};

use crate::{Catalog, ModelRow, ResourceRow};

const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES: &str = "
BEGIN;
CREATE TABLE IF NOT EXISTS tblMLDBInfo (
    name TEXT PRIMARY KEY NOT NULL,
    version INTEGER DEFAULT 1);
CREATE TABLE IF NOT EXISTS tblPipeline (
    key TEXT PRIMARY KEY NOT NULL,
    description TEXT,
    CHECK (length(description) > 0));
CREATE TABLE IF NOT EXISTS tblModel (
    key TEXT NOT NULL,
    version INTEGER DEFAULT 1,
    active TEXT DEFAULT 'F',
    valid TEXT DEFAULT 'F',
    path TEXT,
    description TEXT,
    app_info TEXT,
    PRIMARY KEY (key, version),
    CHECK (length(path) > 0),
    CHECK (active IN ('T', 'F')),
    CHECK (valid IN ('T', 'F')));
CREATE TABLE IF NOT EXISTS tblResource (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    path TEXT,
    description TEXT,
    app_info TEXT,
    CHECK (length(path) > 0));
COMMIT;
";

/// Owner of the catalog database connection.
pub struct CatalogStore {
    conn: Mutex<Connection>,
}

impl CatalogStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<CatalogStore> {
        if let Some(dir) = path.as_ref().parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path.as_ref()).map_err(open_error)?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and self-contained deployments.
    pub fn open_in_memory() -> Result<CatalogStore> {
        let conn = Connection::open_in_memory().map_err(open_error)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<CatalogStore> {
        conn.execute_batch(CREATE_TABLES).map_err(db_error)?;
        for table in ["tblPipeline", "tblModel", "tblResource"] {
            conn.execute(
                "INSERT OR IGNORE INTO tblMLDBInfo (name, version) VALUES (?1, ?2)",
                params![table, SCHEMA_VERSION],
            )
            .map_err(db_error)?;
        }
        Ok(CatalogStore {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded for a table, if the table is known.
    pub fn table_version(&self, table: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT version FROM tblMLDBInfo WHERE name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)
    }

    fn set_pipeline_sync(&self, name: &str, description: &str) -> Result<()> {
        require_non_empty(name, "pipeline name")?;
        require_non_empty(description, "pipeline description")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO tblPipeline (key, description) VALUES (?1, ?2)",
            params![name, description],
        )
        .map_err(db_error)?;
        Ok(())
    }

    fn pipeline_sync(&self, name: &str) -> Result<String> {
        require_non_empty(name, "pipeline name")?;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT description FROM tblPipeline WHERE key = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_error)?
        .ok_or_else(|| not_found("pipeline", name))
    }

    fn delete_pipeline_sync(&self, name: &str) -> Result<()> {
        require_non_empty(name, "pipeline name")?;
        let conn = self.conn.lock();
        conn.execute("DELETE FROM tblPipeline WHERE key = ?1", params![name])
            .map_err(db_error)?;
        Ok(())
    }

    fn register_model_sync(
        &self,
        name: &str,
        path: &Path,
        activate: bool,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<u32> {
        require_non_empty(name, "model name")?;
        validate_model_path(path)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_error)?;
        let version: u32 = tx
            .query_row(
                "SELECT IFNULL(MAX(version), 0) + 1 FROM tblModel WHERE key = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        if activate {
            tx.execute(
                "UPDATE tblModel SET active = 'F' WHERE key = ?1",
                params![name],
            )
            .map_err(db_error)?;
        }
        tx.execute(
            "INSERT INTO tblModel (key, version, active, valid, path, description, app_info) \
             VALUES (?1, ?2, ?3, 'T', ?4, ?5, ?6)",
            params![
                name,
                version,
                if activate { "T" } else { "F" },
                path.to_string_lossy(),
                description,
                app_info,
            ],
        )
        .map_err(db_error)?;
        tx.commit().map_err(db_error)?;
        Ok(version)
    }

    fn update_model_description_sync(
        &self,
        name: &str,
        version: u32,
        description: &str,
    ) -> Result<()> {
        require_non_empty(name, "model name")?;
        require_version(version)?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE tblModel SET description = ?3 WHERE key = ?1 AND version = ?2",
                params![name, version, description],
            )
            .map_err(db_error)?;
        if changed == 0 {
            return Err(not_found("model", name));
        }
        Ok(())
    }

    fn activate_model_sync(&self, name: &str, version: u32) -> Result<()> {
        require_non_empty(name, "model name")?;
        require_version(version)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_error)?;
        tx.execute(
            "UPDATE tblModel SET active = 'F' WHERE key = ?1",
            params![name],
        )
        .map_err(db_error)?;
        let changed = tx
            .execute(
                "UPDATE tblModel SET active = 'T', valid = 'T' WHERE key = ?1 AND version = ?2",
                params![name, version],
            )
            .map_err(db_error)?;
        if changed == 0 {
            // Dropping the transaction rolls the deactivation back.
            return Err(not_found("model", name));
        }
        tx.commit().map_err(db_error)?;
        Ok(())
    }

    fn model_sync(&self, name: &str, version: u32) -> Result<ModelRow> {
        require_non_empty(name, "model name")?;
        require_version(version)?;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key, version, active, valid, path, description, app_info \
             FROM tblModel WHERE key = ?1 AND version = ?2",
            params![name, version],
            row_to_model,
        )
        .optional()
        .map_err(db_error)?
        .ok_or_else(|| not_found("model", name))
    }

    fn model_activated_sync(&self, name: &str) -> Result<ModelRow> {
        require_non_empty(name, "model name")?;
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key, version, active, valid, path, description, app_info \
             FROM tblModel WHERE key = ?1 AND active = 'T' AND valid = 'T'",
            params![name],
            row_to_model,
        )
        .optional()
        .map_err(db_error)?
        .ok_or_else(|| not_found("activated model", name))
    }

    fn model_all_sync(&self, name: &str) -> Result<Vec<ModelRow>> {
        require_non_empty(name, "model name")?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key, version, active, valid, path, description, app_info \
                 FROM tblModel WHERE key = ?1 ORDER BY version",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![name], row_to_model)
            .map_err(db_error)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_error)?;
        if rows.is_empty() {
            return Err(not_found("model", name));
        }
        Ok(rows)
    }

    fn delete_model_sync(&self, name: &str, version: u32) -> Result<()> {
        require_non_empty(name, "model name")?;
        let conn = self.conn.lock();
        let changed = if version == 0 {
            conn.execute("DELETE FROM tblModel WHERE key = ?1", params![name])
        } else {
            conn.execute(
                "DELETE FROM tblModel WHERE key = ?1 AND version = ?2",
                params![name, version],
            )
        }
        .map_err(db_error)?;
        if changed == 0 {
            return Err(not_found("model", name));
        }
        Ok(())
    }

    fn add_resource_sync(
        &self,
        name: &str,
        path: &str,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<()> {
        require_non_empty(name, "resource name")?;
        require_non_empty(path, "resource path")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tblResource (key, path, description, app_info) VALUES (?1, ?2, ?3, ?4)",
            params![name, path, description, app_info],
        )
        .map_err(db_error)?;
        Ok(())
    }

    fn resource_sync(&self, name: &str) -> Result<Vec<ResourceRow>> {
        require_non_empty(name, "resource name")?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT key, path, description, app_info FROM tblResource \
                 WHERE key = ?1 ORDER BY id",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok(ResourceRow {
                    key: row.get(0)?,
                    path: row.get(1)?,
                    description: row.get(2)?,
                    app_info: row.get(3)?,
                })
            })
            .map_err(db_error)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_error)?;
        if rows.is_empty() {
            return Err(not_found("resource", name));
        }
        Ok(rows)
    }

    fn delete_resource_sync(&self, name: &str) -> Result<()> {
        require_non_empty(name, "resource name")?;
        let conn = self.conn.lock();
        let changed = conn
            .execute("DELETE FROM tblResource WHERE key = ?1", params![name])
            .map_err(db_error)?;
        if changed == 0 {
            return Err(not_found("resource", name));
        }
        Ok(())
    }
}

fn row_to_model(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelRow> {
    let active: String = row.get(2)?;
    let valid: String = row.get(3)?;
    Ok(ModelRow {
        key: row.get(0)?,
        version: row.get(1)?,
        active: active == "T",
        valid: valid == "T",
        path: row.get(4)?,
        description: row.get(5)?,
        app_info: row.get(6)?,
    })
}

fn require_non_empty(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ServiceError::invalid(format!("{what} must not be empty")));
    }
    Ok(())
}

fn require_version(version: u32) -> Result<()> {
    if version == 0 {
        return Err(ServiceError::invalid("model version must be >= 1"));
    }
    Ok(())
}

/// Model paths are references only, but a registration must point at a real
/// regular file to be usable later.
fn validate_model_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(ServiceError::invalid(format!(
            "model path '{}' must be absolute",
            path.display()
        )));
    }
    let meta = std::fs::symlink_metadata(path).map_err(|_| {
        ServiceError::invalid(format!("model path '{}' does not exist", path.display()))
    })?;
    if meta.file_type().is_symlink() {
        return Err(ServiceError::invalid(format!(
            "model path '{}' must not be a symlink",
            path.display()
        )));
    }
    if !meta.is_file() {
        return Err(ServiceError::invalid(format!(
            "model path '{}' is not a regular file",
            path.display()
        )));
    }
    Ok(())
}

fn not_found(what: &str, name: &str) -> ServiceError {
    ServiceError::invalid(format!("{what} '{name}' is not registered"))
}

fn open_error(err: rusqlite::Error) -> ServiceError {
    warn!("failed to open catalog database: {err}");
    ServiceError::Io(err.to_string())
}

fn db_error(err: rusqlite::Error) -> ServiceError {
    match err {
        // Uniqueness and CHECK violations surface as invalid parameters to
        // match the IPC boundary.
        rusqlite::Error::SqliteFailure(e, ref msg)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ServiceError::invalid(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        other => ServiceError::Io(other.to_string()),
    }
}

#[async_trait]
impl Catalog for CatalogStore {
    async fn set_pipeline(&self, name: &str, description: &str) -> Result<()> {
        self.set_pipeline_sync(name, description)
    }

    async fn pipeline(&self, name: &str) -> Result<String> {
        self.pipeline_sync(name)
    }

    async fn delete_pipeline(&self, name: &str) -> Result<()> {
        self.delete_pipeline_sync(name)
    }

    async fn register_model(
        &self,
        name: &str,
        path: &Path,
        activate: bool,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<u32> {
        self.register_model_sync(name, path, activate, description, app_info)
    }

    async fn update_model_description(
        &self,
        name: &str,
        version: u32,
        description: &str,
    ) -> Result<()> {
        self.update_model_description_sync(name, version, description)
    }

    async fn activate_model(&self, name: &str, version: u32) -> Result<()> {
        self.activate_model_sync(name, version)
    }

    async fn model(&self, name: &str, version: u32) -> Result<ModelRow> {
        self.model_sync(name, version)
    }

    async fn model_activated(&self, name: &str) -> Result<ModelRow> {
        self.model_activated_sync(name)
    }

    async fn model_all(&self, name: &str) -> Result<Vec<ModelRow>> {
        self.model_all_sync(name)
    }

    async fn delete_model(&self, name: &str, version: u32) -> Result<()> {
        self.delete_model_sync(name, version)
    }

    async fn add_resource(
        &self,
        name: &str,
        path: &str,
        description: Option<&str>,
        app_info: Option<&str>,
    ) -> Result<()> {
        self.add_resource_sync(name, path, description, app_info)
    }

    async fn resource(&self, name: &str) -> Result<Vec<ResourceRow>> {
        self.resource_sync(name)
    }

    async fn delete_resource(&self, name: &str) -> Result<()> {
        self.delete_resource_sync(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn model_file(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"weights").unwrap();
        path
    }

    #[test]
    fn pipeline_round_trip() {
        let store = CatalogStore::open_in_memory().unwrap();
        store.set_pipeline_sync("p1", "fakesrc ! fakesink").unwrap();
        assert_eq!(store.pipeline_sync("p1").unwrap(), "fakesrc ! fakesink");

        store.delete_pipeline_sync("p1").unwrap();
        assert!(matches!(
            store.pipeline_sync("p1"),
            Err(ServiceError::InvalidParameter(_))
        ));
        // Deleting again stays idempotent.
        store.delete_pipeline_sync("p1").unwrap();
    }

    #[test]
    fn empty_pipeline_fields_are_rejected() {
        let store = CatalogStore::open_in_memory().unwrap();
        assert!(store.set_pipeline_sync("", "desc").is_err());
        assert!(store.set_pipeline_sync("p", "").is_err());
    }

    #[test]
    fn register_versions_and_activation() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open_in_memory().unwrap();
        let a = model_file(&dir, "a.bin");
        let b = model_file(&dir, "b.bin");

        let v1 = store
            .register_model_sync("m", &a, true, Some("first"), None)
            .unwrap();
        let v2 = store
            .register_model_sync("m", &b, true, None, Some("{\"app\":1}"))
            .unwrap();
        assert_eq!((v1, v2), (1, 2));

        let active = store.model_activated_sync("m").unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.path, b.to_string_lossy());

        let v1_row = store.model_sync("m", 1).unwrap();
        assert!(!v1_row.active);
        assert_eq!(v1_row.description.as_deref(), Some("first"));
    }

    #[test]
    fn activate_switches_the_single_active_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open_in_memory().unwrap();
        let a = model_file(&dir, "a.bin");
        store.register_model_sync("m", &a, true, None, None).unwrap();
        store.register_model_sync("m", &a, false, None, None).unwrap();

        store.activate_model_sync("m", 2).unwrap();
        let rows = store.model_all_sync("m").unwrap();
        let active: Vec<u32> = rows.iter().filter(|r| r.active).map(|r| r.version).collect();
        assert_eq!(active, [2]);

        assert!(store.activate_model_sync("m", 9).is_err());
        // The failed activation must not have cleared version 2.
        assert_eq!(store.model_activated_sync("m").unwrap().version, 2);
    }

    #[test]
    fn model_path_must_be_absolute_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open_in_memory().unwrap();

        assert!(store
            .register_model_sync("m", Path::new("relative.bin"), false, None, None)
            .is_err());
        assert!(store
            .register_model_sync("m", &dir.path().join("missing.bin"), false, None, None)
            .is_err());
        assert!(store
            .register_model_sync("m", dir.path(), false, None, None)
            .is_err());
    }

    #[test]
    fn delete_model_version_zero_removes_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open_in_memory().unwrap();
        let a = model_file(&dir, "a.bin");
        store.register_model_sync("m", &a, false, None, None).unwrap();
        store.register_model_sync("m", &a, false, None, None).unwrap();

        store.delete_model_sync("m", 0).unwrap();
        assert!(store.model_all_sync("m").is_err());
        assert!(store.delete_model_sync("m", 0).is_err());
    }

    #[test]
    fn update_description() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open_in_memory().unwrap();
        let a = model_file(&dir, "a.bin");
        store.register_model_sync("m", &a, false, None, None).unwrap();

        store
            .update_model_description_sync("m", 1, "better")
            .unwrap();
        assert_eq!(
            store.model_sync("m", 1).unwrap().description.as_deref(),
            Some("better")
        );
        assert!(store.update_model_description_sync("m", 2, "x").is_err());
    }

    #[test]
    fn resources_share_a_key() {
        let store = CatalogStore::open_in_memory().unwrap();
        store
            .add_resource_sync("imgs", "/data/a.png", None, None)
            .unwrap();
        store
            .add_resource_sync("imgs", "/data/b.png", Some("second"), None)
            .unwrap();

        let rows = store.resource_sync("imgs").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].description.as_deref(), Some("second"));

        store.delete_resource_sync("imgs").unwrap();
        assert!(store.resource_sync("imgs").is_err());
    }

    #[test]
    fn schema_version_rows_exist() {
        let store = CatalogStore::open_in_memory().unwrap();
        assert_eq!(store.table_version("tblModel").unwrap(), Some(1));
        assert_eq!(store.table_version("tblNope").unwrap(), None);
    }
}
