//! SQLite storage engine.
//!
//! One table, `SPACES`, keyed by space id. `LAST_CHANGE` holds the epoch
//! seconds of the last state transition and is indexed for the expiry sweep.
//! `OCCUPANT_PLATE` is `UNIQUE`; free spaces store `NULL`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use park_core::{LicensePlate, SpaceId, SpaceRecord, SpaceState};

use super::{Database, StorageError, StorageResult};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS SPACES (
        PID INTEGER PRIMARY KEY,
        SECTION TEXT NOT NULL,
        STATE INTEGER NOT NULL DEFAULT 0,
        OCCUPANT_PLATE TEXT UNIQUE,
        LAST_CHANGE INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS IDX_SPACES_LAST_CHANGE
        ON SPACES(LAST_CHANGE);
"#;

const SELECT_COLUMNS: &str = "SELECT PID, SECTION, STATE, OCCUPANT_PLATE, LAST_CHANGE FROM SPACES";

/// A `SPACES` row before domain validation.
struct SpaceRow {
    pid: i64,
    section: String,
    state: i64,
    occupant: Option<String>,
    last_change: i64,
}

impl SpaceRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            pid: row.get(0)?,
            section: row.get(1)?,
            state: row.get(2)?,
            occupant: row.get(3)?,
            last_change: row.get(4)?,
        })
    }
}

impl TryFrom<SpaceRow> for SpaceRecord {
    type Error = StorageError;

    fn try_from(row: SpaceRow) -> Result<Self, Self::Error> {
        let space_id = SpaceId::new(row.pid);

        let state = SpaceState::try_from(row.state).map_err(|e| StorageError::Corrupt {
            space_id,
            reason: e.to_string(),
        })?;

        let last_change =
            DateTime::<Utc>::from_timestamp(row.last_change, 0).ok_or_else(|| {
                StorageError::Corrupt {
                    space_id,
                    reason: format!("LAST_CHANGE out of range: {}", row.last_change),
                }
            })?;

        Ok(SpaceRecord {
            space_id,
            state,
            section: row.section,
            occupant: row.occupant.map(LicensePlate::from),
            last_change,
        })
    }
}

/// Space records in a SQLite database.
///
/// The connection sits behind a `Mutex`; every operation is one statement
/// or one transaction under the lock.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    /// Opens (or creates) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Setup {
                path: path.display().to_string(),
                error: e.to_string(),
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self::from_connection(conn)?;
        info!(path = %path.display(), "SQLite database opened");
        Ok(db)
    }

    /// Creates a private in-memory database.
    pub fn in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn query_one(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> StorageResult<Option<SpaceRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE {filter}");
        conn.query_row(&sql, params, SpaceRow::from_row)
            .optional()?
            .map(SpaceRecord::try_from)
            .transpose()
    }

    fn query_many(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StorageResult<Vec<SpaceRecord>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, SpaceRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(SpaceRecord::try_from(row?)?);
        }
        Ok(records)
    }
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

impl Database for SqliteDatabase {
    fn insert_space(&self, space_id: SpaceId, section: &str) -> StorageResult<()> {
        let inserted = self.lock().execute(
            "INSERT OR IGNORE INTO SPACES (PID, SECTION, STATE, LAST_CHANGE)
             VALUES (?1, ?2, 0, ?3)",
            params![space_id.get(), section, now_secs()],
        )?;

        if inserted == 1 {
            debug!(space_id = %space_id, section, "Space registered");
        }
        Ok(())
    }

    fn fetch_all_space_states(&self) -> StorageResult<Vec<SpaceRecord>> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY PID");
        Self::query_many(&self.lock(), &sql, [])
    }

    fn get_state_for_space(&self, space_id: SpaceId) -> StorageResult<Option<SpaceRecord>> {
        Self::query_one(&self.lock(), "PID = ?1", params![space_id.get()])
    }

    fn get_expired_reserve_states(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<SpaceRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE STATE = ?1 AND LAST_CHANGE < ?2 ORDER BY LAST_CHANGE");
        Self::query_many(
            &self.lock(),
            &sql,
            params![SpaceState::Reserved.as_i64(), cutoff.timestamp()],
        )
    }

    fn update_space_state(
        &self,
        space_id: SpaceId,
        state: SpaceState,
        plate: Option<&LicensePlate>,
    ) -> StorageResult<Option<SpaceRecord>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let Some(previous) = Self::query_one(&tx, "PID = ?1", params![space_id.get()])? else {
            return Ok(None);
        };

        let updated = tx.execute(
            "UPDATE SPACES SET STATE = ?2, OCCUPANT_PLATE = ?3, LAST_CHANGE = ?4
             WHERE PID = ?1",
            params![space_id.get(), state.as_i64(), plate.map(LicensePlate::as_str), now_secs()],
        );

        if let Err(e) = updated {
            return Err(match (plate, e.sqlite_error_code()) {
                (Some(plate), Some(rusqlite::ErrorCode::ConstraintViolation)) => {
                    StorageError::PlateInUse(plate.clone())
                }
                _ => e.into(),
            });
        }

        tx.commit()?;

        debug!(
            space_id = %space_id,
            from = %previous.state,
            to = %state,
            "Space state updated"
        );

        Ok(Some(previous))
    }

    fn update_space_plate(&self, space_id: SpaceId, plate: &LicensePlate) -> StorageResult<bool> {
        let changed = self.lock().execute(
            "UPDATE SPACES SET OCCUPANT_PLATE = ?2
             WHERE PID = ?1
               AND STATE = ?3
               AND NOT EXISTS (
                   SELECT 1 FROM SPACES WHERE OCCUPANT_PLATE = ?2 AND PID <> ?1 AND STATE <> 0
               )",
            params![space_id.get(), plate.as_str(), SpaceState::Occupied.as_i64()],
        )?;
        Ok(changed == 1)
    }

    fn get_reservation_for_license_plate(
        &self,
        plate: &LicensePlate,
    ) -> StorageResult<Option<SpaceRecord>> {
        Self::query_one(
            &self.lock(),
            "OCCUPANT_PLATE = ?1 AND STATE = ?2",
            params![plate.as_str(), SpaceState::Reserved.as_i64()],
        )
    }

    fn get_space_occupied_by_license_plate(
        &self,
        plate: &LicensePlate,
    ) -> StorageResult<Option<SpaceRecord>> {
        Self::query_one(
            &self.lock(),
            "OCCUPANT_PLATE = ?1 AND STATE = ?2",
            params![plate.as_str(), SpaceState::Occupied.as_i64()],
        )
    }

    fn attempt_to_reserve_spot(&self, space_id: SpaceId, plate: &LicensePlate) -> StorageResult<bool> {
        let changed = self.lock().execute(
            "UPDATE SPACES SET STATE = 1, OCCUPANT_PLATE = ?2, LAST_CHANGE = ?3
             WHERE PID = ?1
               AND STATE = 0
               AND NOT EXISTS (
                   SELECT 1 FROM SPACES WHERE OCCUPANT_PLATE = ?2 AND STATE <> 0
               )",
            params![space_id.get(), plate.as_str(), now_secs()],
        )?;
        Ok(changed == 1)
    }

    fn cancel_reservations_for(&self, plate: &LicensePlate) -> StorageResult<bool> {
        let changed = self.lock().execute(
            "UPDATE SPACES SET STATE = 0, OCCUPANT_PLATE = NULL, LAST_CHANGE = ?2
             WHERE STATE = 1 AND OCCUPANT_PLATE = ?1",
            params![plate.as_str(), now_secs()],
        )?;
        Ok(changed > 0)
    }

    fn cancel_reservation_for_spot(&self, space_id: SpaceId) -> StorageResult<bool> {
        let changed = self.lock().execute(
            "UPDATE SPACES SET STATE = 0, OCCUPANT_PLATE = NULL, LAST_CHANGE = ?2
             WHERE PID = ?1 AND STATE = 1",
            params![space_id.get(), now_secs()],
        )?;
        Ok(changed == 1)
    }
}
