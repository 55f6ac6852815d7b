use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{types::Type, Connection};
use tracing::{debug, instrument};

use srvmgr_core::time::{self, format_ts, parse_ts};
use srvmgr_core::DeviceId;

use crate::device::{Device, DeviceUpdate, NewDevice, ValidDevice};
use crate::error::{Result, WolError};
use crate::mac::MacAddress;

const DEVICE_COLUMNS: &str =
    "id, name, hostname, ip_address, mac_address, description, created_at, updated_at";

/// SQLite-backed device registry.
pub struct DeviceStore {
    db: Mutex<Connection>,
}

impl DeviceStore {
    /// Wrap a connection that has been through `db::init_db`.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub fn create(&self, input: &NewDevice) -> Result<Device> {
        let valid = input.validate()?;
        let now = time::now();
        let device = Device {
            id: DeviceId::new(),
            name: valid.name,
            hostname: valid.hostname,
            ip_address: valid.ip_address,
            mac_address: valid.mac_address,
            description: valid.description,
            created_at: now,
            updated_at: now,
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO devices
             (id, name, hostname, ip_address, mac_address, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            rusqlite::params![
                device.id.as_str(),
                device.name,
                device.hostname,
                device.ip_address,
                device.mac_address.to_string(),
                device.description,
                format_ts(&now),
            ],
        )?;
        debug!(device_id = %device.id, mac = %device.mac_address, "device created");
        Ok(device)
    }

    pub fn get(&self, id: &DeviceId) -> Result<Option<Device>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
            rusqlite::params![id.as_str()],
            row_to_device,
        ) {
            Ok(d) => Ok(Some(d)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(WolError::Database(e)),
        }
    }

    /// Like `get`, but a missing device is an error.
    pub fn require(&self, id: &DeviceId) -> Result<Device> {
        self.get(id)?
            .ok_or_else(|| WolError::DeviceNotFound { id: id.to_string() })
    }

    /// All devices ordered by name.
    pub fn list(&self) -> Result<Vec<Device>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY name COLLATE NOCASE, created_at"
        ))?;
        let devices = stmt
            .query_map([], row_to_device)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    #[instrument(skip(self, update), fields(device_id = %id))]
    pub fn update(&self, id: &DeviceId, update: &DeviceUpdate) -> Result<Device> {
        let current = self.require(id)?;
        let ValidDevice {
            name,
            hostname,
            ip_address,
            mac_address,
            description,
        } = update.apply(&current)?;
        let now = time::now();

        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE devices
             SET name = ?2, hostname = ?3, ip_address = ?4, mac_address = ?5,
                 description = ?6, updated_at = ?7
             WHERE id = ?1",
            rusqlite::params![
                id.as_str(),
                name,
                hostname,
                ip_address,
                mac_address.to_string(),
                description,
                format_ts(&now),
            ],
        )?;
        if changed == 0 {
            return Err(WolError::DeviceNotFound { id: id.to_string() });
        }

        Ok(Device {
            name,
            hostname,
            ip_address,
            mac_address,
            description,
            updated_at: now,
            ..current
        })
    }

    /// Returns `false` when no such device existed.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn delete(&self, id: &DeviceId) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute("DELETE FROM devices WHERE id = ?1", rusqlite::params![id.as_str()])?;
        Ok(n > 0)
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let mac: String = row.get(4)?;
    let mac_address = MacAddress::parse(&mac)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Device {
        id: DeviceId(row.get(0)?),
        name: row.get(1)?,
        hostname: row.get(2)?,
        ip_address: row.get(3)?,
        mac_address,
        description: row.get(5)?,
        created_at: ts_column(row, 6)?,
        updated_at: ts_column(row, 7)?,
    })
}

fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<chrono::DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn store() -> DeviceStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        DeviceStore::new(conn)
    }

    fn nas() -> NewDevice {
        NewDevice {
            name: "nas".into(),
            hostname: Some("nas.local".into()),
            ip_address: Some("192.168.1.20".into()),
            mac_address: "aa:bb:cc:dd:ee:ff".into(),
            description: None,
        }
    }

    #[test]
    fn create_then_get_roundtrips() {
        let store = store();
        let created = store.create(&nas()).unwrap();
        let loaded = store.get(&created.id).unwrap().expect("device");
        assert_eq!(loaded.mac_address.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(loaded.hostname.as_deref(), Some("nas.local"));
        assert_eq!(loaded.created_at, created.created_at);
    }

    #[test]
    fn invalid_input_is_not_persisted() {
        let store = store();
        let bad = NewDevice {
            mac_address: "zz".into(),
            ..nas()
        };
        assert!(store.create(&bad).is_err());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn update_merges_and_clears_fields() {
        let store = store();
        let created = store.create(&nas()).unwrap();
        let updated = store
            .update(
                &created.id,
                &DeviceUpdate {
                    hostname: Some(String::new()),
                    mac_address: Some("11-22-33-44-55-66".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.hostname, None);
        assert_eq!(updated.ip_address.as_deref(), Some("192.168.1.20"));
        assert_eq!(updated.mac_address.to_string(), "11:22:33:44:55:66");

        let loaded = store.require(&created.id).unwrap();
        assert_eq!(loaded.display_address(), "192.168.1.20");
    }

    #[test]
    fn delete_and_missing_lookups() {
        let store = store();
        let created = store.create(&nas()).unwrap();
        assert!(store.delete(&created.id).unwrap());
        assert!(!store.delete(&created.id).unwrap());
        assert!(store.get(&created.id).unwrap().is_none());
        assert!(matches!(
            store.require(&created.id),
            Err(WolError::DeviceNotFound { .. })
        ));
    }
}
