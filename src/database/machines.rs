//! Machine table access.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{DatabaseError, DatabaseResult};
use crate::machine::{Machine, MachineFilter, MachineStatus, NetworkAttachment, RuntimeType};

/// Store for the `machines` table.
pub struct MachineStore;

impl MachineStore {
    pub fn new() -> Self {
        Self
    }

    pub fn insert(&self, conn: &Connection, machine: &Machine) -> DatabaseResult<()> {
        conn.execute(
            r#"
            INSERT INTO machines
                (id, name, status, runtime_type, vcpu_count, mem_size_mib,
                 kernel_image_path, rootfs_path, network, exposed_ports, image,
                 container_id, socket_path, pid, config_json, error_message,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                machine.id,
                machine.name,
                machine.status.as_str(),
                machine.runtime_type.as_str(),
                machine.vcpu_count,
                machine.mem_size_mib as i64,
                machine.kernel_image_path,
                machine.rootfs_path,
                machine
                    .network
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&machine.exposed_ports)?,
                machine.image,
                machine.container_id,
                machine.socket_path,
                machine.pid,
                serde_json::to_string(&machine.config_json)?,
                machine.error_message,
                machine.created_at.to_rfc3339(),
                machine.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, id: &str) -> DatabaseResult<Option<Machine>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, status, runtime_type, vcpu_count, mem_size_mib,
                   kernel_image_path, rootfs_path, network, exposed_ports, image,
                   container_id, socket_path, pid, config_json, error_message,
                   created_at, updated_at
            FROM machines
            WHERE id = ?1
            "#,
        )?;

        let result = stmt.query_row([id], row_to_machine);

        match result {
            Ok(machine) => Ok(Some(machine)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DatabaseError::from(e)),
        }
    }

    pub fn list(&self, conn: &Connection, filter: &MachineFilter) -> DatabaseResult<Vec<Machine>> {
        let mut sql = String::from(
            r#"
            SELECT id, name, status, runtime_type, vcpu_count, mem_size_mib,
                   kernel_image_path, rootfs_path, network, exposed_ports, image,
                   container_id, socket_path, pid, config_json, error_message,
                   created_at, updated_at
            FROM machines
            "#,
        );

        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(runtime_type) = filter.runtime_type {
            values.push(runtime_type.as_str().to_string());
            clauses.push(format!("runtime_type = ?{}", values.len()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let machines = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), row_to_machine)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(machines)
    }

    pub fn update_status(
        &self,
        conn: &Connection,
        id: &str,
        status: MachineStatus,
        error_message: Option<&str>,
    ) -> DatabaseResult<()> {
        let affected = conn.execute(
            r#"
            UPDATE machines
            SET status = ?2, error_message = ?3, updated_at = ?4
            WHERE id = ?1
            "#,
            params![id, status.as_str(), error_message, Utc::now().to_rfc3339()],
        )?;

        if affected == 0 {
            return Err(DatabaseError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn set_pid(&self, conn: &Connection, id: &str, pid: Option<i64>) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE machines SET pid = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, pid, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_container_id(
        &self,
        conn: &Connection,
        id: &str,
        container_id: Option<&str>,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE machines SET container_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, container_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_network(
        &self,
        conn: &Connection,
        id: &str,
        network: Option<&NetworkAttachment>,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE machines SET network = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id,
                network.map(serde_json::to_string).transpose()?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, conn: &Connection, id: &str) -> DatabaseResult<bool> {
        let affected = conn.execute("DELETE FROM machines WHERE id = ?1", [id])?;
        Ok(affected > 0)
    }
}

impl Default for MachineStore {
    fn default() -> Self {
        Self::new()
    }
}

fn row_to_machine(row: &Row<'_>) -> rusqlite::Result<Machine> {
    let status_str: String = row.get(2)?;
    let runtime_str: String = row.get(3)?;
    let network_json: Option<String> = row.get(8)?;
    let ports_json: String = row.get(9)?;
    let config_json: String = row.get(14)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;

    Ok(Machine {
        id: row.get(0)?,
        name: row.get(1)?,
        status: MachineStatus::parse(&status_str).unwrap_or(MachineStatus::Failed),
        runtime_type: RuntimeType::parse(&runtime_str).unwrap_or(RuntimeType::Docker),
        vcpu_count: row.get(4)?,
        mem_size_mib: row.get::<_, i64>(5)? as u64,
        kernel_image_path: row.get(6)?,
        rootfs_path: row.get(7)?,
        network: network_json
            .as_deref()
            .and_then(|s| serde_json::from_str::<NetworkAttachment>(s).ok()),
        exposed_ports: serde_json::from_str(&ports_json).unwrap_or_default(),
        image: row.get(10)?,
        container_id: row.get(11)?,
        socket_path: row.get(12)?,
        pid: row.get(13)?,
        config_json: serde_json::from_str(&config_json)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        error_message: row.get(15)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
