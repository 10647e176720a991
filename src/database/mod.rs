//! Machine record persistence.
//!
//! SQLite-backed storage for the `machines` table. The database is the only
//! persisted state in the daemon; the runtime registry and IPAM table are
//! in-memory and the bridge/NAT state lives in the host kernel.

mod machines;

pub use machines::MachineStore;

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::machine::{Machine, MachineFilter, MachineStatus, NetworkAttachment};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Machine not found: {0}")]
    NotFound(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

impl From<DatabaseError> for crate::error::DaemonError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(id) => {
                crate::error::DaemonError::NotFound(format!("Machine not found: {}", id))
            }
            other => crate::error::DaemonError::Internal(other.to_string()),
        }
    }
}

/// Main database wrapper.
pub struct Database {
    conn: Mutex<Connection>,
    store: MachineStore,
}

impl Database {
    /// Open or create the database.
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::init_tables(&conn)?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
            store: MachineStore::new(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            store: MachineStore::new(),
        })
    }

    fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS machines (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                runtime_type TEXT NOT NULL,
                vcpu_count INTEGER NOT NULL,
                mem_size_mib INTEGER NOT NULL,
                kernel_image_path TEXT NOT NULL DEFAULT '',
                rootfs_path TEXT NOT NULL DEFAULT '',
                network TEXT,
                exposed_ports TEXT NOT NULL DEFAULT '[]',
                image TEXT NOT NULL DEFAULT '',
                container_id TEXT,
                socket_path TEXT,
                pid INTEGER,
                config_json TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_machines_status
                ON machines(status);

            CREATE INDEX IF NOT EXISTS idx_machines_runtime
                ON machines(runtime_type);
            "#,
        )?;

        Ok(())
    }

    pub async fn insert_machine(&self, machine: &Machine) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.insert(&conn, machine)
    }

    pub async fn get_machine(&self, id: &str) -> DatabaseResult<Option<Machine>> {
        let conn = self.conn.lock().await;
        self.store.get(&conn, id)
    }

    pub async fn list_machines(&self, filter: &MachineFilter) -> DatabaseResult<Vec<Machine>> {
        let conn = self.conn.lock().await;
        self.store.list(&conn, filter)
    }

    /// Update status and error message, bumping `updated_at`.
    pub async fn update_status(
        &self,
        id: &str,
        status: MachineStatus,
        error_message: Option<&str>,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.update_status(&conn, id, status, error_message)
    }

    pub async fn set_pid(&self, id: &str, pid: Option<i64>) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.set_pid(&conn, id, pid)
    }

    pub async fn set_container_id(&self, id: &str, container_id: Option<&str>) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.set_container_id(&conn, id, container_id)
    }

    pub async fn set_network(
        &self,
        id: &str,
        network: Option<&NetworkAttachment>,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        self.store.set_network(&conn, id, network)
    }

    /// Delete the record. Returns whether a row was removed.
    pub async fn delete_machine(&self, id: &str) -> DatabaseResult<bool> {
        let conn = self.conn.lock().await;
        self.store.delete(&conn, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{generate_machine_id, RuntimeType};
    use chrono::Utc;

    fn sample_machine() -> Machine {
        Machine {
            id: generate_machine_id(),
            name: "test-machine".into(),
            status: MachineStatus::Pending,
            runtime_type: RuntimeType::Docker,
            vcpu_count: 1,
            mem_size_mib: 64,
            kernel_image_path: String::new(),
            rootfs_path: String::new(),
            network: None,
            exposed_ports: vec![8080],
            image: "alpine:3.19".into(),
            container_id: None,
            socket_path: None,
            pid: None,
            config_json: serde_json::json!({"image": "alpine:3.19"}),
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_get_delete() {
        let db = Database::open_in_memory().unwrap();
        let machine = sample_machine();

        db.insert_machine(&machine).await.unwrap();

        let loaded = db.get_machine(&machine.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, machine.id);
        assert_eq!(loaded.status, MachineStatus::Pending);
        assert_eq!(loaded.exposed_ports, vec![8080]);
        assert_eq!(loaded.image, "alpine:3.19");

        assert!(db.delete_machine(&machine.id).await.unwrap());
        assert!(db.get_machine(&machine.id).await.unwrap().is_none());
        assert!(!db.delete_machine(&machine.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_update_and_filter() {
        let db = Database::open_in_memory().unwrap();

        let mut a = sample_machine();
        a.id = "aaaaaaaaaaaa".into();
        let mut b = sample_machine();
        b.id = "bbbbbbbbbbbb".into();
        b.runtime_type = RuntimeType::Firecracker;

        db.insert_machine(&a).await.unwrap();
        db.insert_machine(&b).await.unwrap();

        db.update_status(&a.id, MachineStatus::Running, None)
            .await
            .unwrap();

        let running = db
            .list_machines(&MachineFilter {
                status: Some(MachineStatus::Running),
                runtime_type: None,
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let firecracker = db
            .list_machines(&MachineFilter {
                status: None,
                runtime_type: Some(RuntimeType::Firecracker),
            })
            .await
            .unwrap();
        assert_eq!(firecracker.len(), 1);
        assert_eq!(firecracker[0].id, b.id);
    }

    #[tokio::test]
    async fn test_failed_status_carries_message() {
        let db = Database::open_in_memory().unwrap();
        let machine = sample_machine();
        db.insert_machine(&machine).await.unwrap();

        db.update_status(&machine.id, MachineStatus::Failed, Some("spawn failed"))
            .await
            .unwrap();

        let loaded = db.get_machine(&machine.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MachineStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("spawn failed"));

        // A later non-failed transition clears the message
        db.update_status(&machine.id, MachineStatus::Stopped, None)
            .await
            .unwrap();
        let loaded = db.get_machine(&machine.id).await.unwrap().unwrap();
        assert!(loaded.error_message.is_none());
    }
}
