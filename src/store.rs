//! SQLite persistence for normalized readings
//!
//! Addresses and Meters are append-only reference tables; Readings are
//! deduplicated by the `(MeterID, ReadingDate)` unique key, which is what
//! makes re-running the pipeline over the same batch safe.

use crate::config::NETWORK_TIMEOUT;
use crate::error::Result;
use crate::parser::MeterReading;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

pub struct MeterStore {
    conn: Connection,
}

impl MeterStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(NETWORK_TIMEOUT)?;
        // WAL keeps an interrupted run from corrupting the store.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn)?;
        Ok(MeterStore { conn })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(MeterStore { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS Addresses (
                AddressID   INTEGER PRIMARY KEY,
                AddressText TEXT UNIQUE NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS Meters (
                MeterID   INTEGER PRIMARY KEY,
                MeterName TEXT UNIQUE NOT NULL,
                AddressID INTEGER NOT NULL REFERENCES Addresses(AddressID)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS Readings (
                ReadingID    INTEGER PRIMARY KEY,
                MeterID      INTEGER NOT NULL REFERENCES Meters(MeterID),
                ReadingValue REAL NOT NULL,
                ReadingDate  TEXT NOT NULL,
                UNIQUE(MeterID, ReadingDate)
            )",
            [],
        )?;

        Ok(())
    }

    /// Persist a batch of readings inside a single transaction.
    ///
    /// Per record: insert the address if new, insert the meter if new,
    /// resolve the meter id and queue the reading. All reading inserts are
    /// then applied as one batched pass in the same transaction, so a crash
    /// mid-batch commits either all structural rows or none. Returns the
    /// number of Reading rows actually inserted (duplicates are ignored).
    pub fn upsert(&mut self, readings: &[MeterReading]) -> Result<usize> {
        let tx = self.conn.transaction()?;

        let mut queued: Vec<(i64, f64, &str)> = Vec::with_capacity(readings.len());
        for r in readings {
            tx.execute(
                "INSERT OR IGNORE INTO Addresses (AddressText) VALUES (?1)",
                params![r.address_name],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO Meters (MeterName, AddressID)
                 SELECT ?1, AddressID FROM Addresses WHERE AddressText = ?2",
                params![r.meter_name, r.address_name],
            )?;
            let meter_id: i64 = tx.query_row(
                "SELECT MeterID FROM Meters WHERE MeterName = ?1",
                params![r.meter_name],
                |row| row.get(0),
            )?;
            queued.push((meter_id, r.meter_value, r.meter_date.as_str()));
        }

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO Readings (MeterID, ReadingValue, ReadingDate)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (meter_id, value, date) in &queued {
                inserted += stmt.execute(params![meter_id, value, date])?;
            }
        }

        tx.commit()?;
        info!(inserted, batch = readings.len(), "readings persisted");
        Ok(inserted)
    }

    pub fn reading_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM Readings", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn meter_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM Meters", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn address_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM Addresses", [], |row| row.get(0))?;
        Ok(count)
    }
}
