use rusqlite::Connection;

use crate::error::Result;

/// Create the devices table. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS devices (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            hostname    TEXT,
            ip_address  TEXT,
            mac_address TEXT NOT NULL,
            description TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_devices_name ON devices(name);",
    )?;
    Ok(())
}
