//! Read-only location tables.
//!
//! The postal-code database is built and refreshed outside this crate (CSV import plus
//! coordinate enrichment). Volley only reads it. Two lookups are needed:
//!
//! - postal code → place name and coordinates
//! - phone area-code prefix → a representative postal code
//!
//! [`SqliteLocationTable`] reads the shipped `zipcodes.db`; [`MemoryLocationTable`] is a
//! small in-process table used by tests and as the empty fallback when no database is
//! installed.

use log::{debug, warn};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::GeoPoint;

/// Errors raised by a location table backend.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("location database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("location database lock poisoned")]
    Poisoned,
}

/// One row of the postal-code table.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationEntry {
    pub code: String,
    pub place: String,
    pub position: GeoPoint,
}

/// Read-only key lookups used by the distance resolver.
pub trait LocationTable: Send + Sync {
    /// Look up a postal code. Rows without coordinates count as misses.
    fn postal_code(&self, code: &str) -> Result<Option<LocationEntry>, LookupError>;

    /// Map a phone area-code prefix to a representative postal code.
    fn phone_prefix(&self, prefix: &str) -> Result<Option<String>, LookupError>;
}

/// SQLite-backed table reading the `zipcodes` schema:
/// `zipcodes(zipcode TEXT, city TEXT, prefix TEXT, latitude REAL, longitude REAL)`.
pub struct SqliteLocationTable {
    conn: Mutex<Connection>,
}

impl SqliteLocationTable {
    /// Open the database read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LookupError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // Fail early on a file that is not the expected schema
        conn.prepare("SELECT zipcode, city, prefix, latitude, longitude FROM zipcodes LIMIT 1")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of postal codes in the table (used for the startup banner).
    pub fn len(&self) -> Result<usize, LookupError> {
        let conn = self.conn.lock().map_err(|_| LookupError::Poisoned)?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM zipcodes", [], |row| row.get(0))?;
        Ok(n.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool, LookupError> {
        Ok(self.len()? == 0)
    }
}

impl LocationTable for SqliteLocationTable {
    fn postal_code(&self, code: &str) -> Result<Option<LocationEntry>, LookupError> {
        let conn = self.conn.lock().map_err(|_| LookupError::Poisoned)?;
        let mut stmt = conn.prepare_cached(
            "SELECT city, latitude, longitude FROM zipcodes WHERE zipcode = ?1",
        )?;
        let row = stmt
            .query_row([code], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            })
            .optional()?;
        match row {
            Some((place, Some(lat), Some(lon))) => Ok(Some(LocationEntry {
                code: code.to_string(),
                place,
                position: GeoPoint::new(lat, lon),
            })),
            Some((place, _, _)) => {
                debug!("Postal code {} ({}) has no coordinates", code, place);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn phone_prefix(&self, prefix: &str) -> Result<Option<String>, LookupError> {
        let conn = self.conn.lock().map_err(|_| LookupError::Poisoned)?;
        let mut stmt =
            conn.prepare_cached("SELECT zipcode FROM zipcodes WHERE prefix = ?1 LIMIT 1")?;
        Ok(stmt
            .query_row([prefix], |row| row.get::<_, String>(0))
            .optional()?)
    }
}

/// In-memory table.
#[derive(Debug, Default, Clone)]
pub struct MemoryLocationTable {
    postal: HashMap<String, LocationEntry>,
    prefixes: HashMap<String, String>,
}

impl MemoryLocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_postal(mut self, code: &str, place: &str, lat: f64, lon: f64) -> Self {
        self.postal.insert(
            code.to_string(),
            LocationEntry {
                code: code.to_string(),
                place: place.to_string(),
                position: GeoPoint::new(lat, lon),
            },
        );
        self
    }

    /// Register a phone prefix. The first code registered for a prefix wins,
    /// matching the `LIMIT 1` lookup on the database.
    pub fn with_prefix(mut self, prefix: &str, code: &str) -> Self {
        self.prefixes
            .entry(prefix.to_string())
            .or_insert_with(|| code.to_string());
        self
    }

    pub fn len(&self) -> usize {
        self.postal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postal.is_empty()
    }
}

impl LocationTable for MemoryLocationTable {
    fn postal_code(&self, code: &str) -> Result<Option<LocationEntry>, LookupError> {
        Ok(self.postal.get(code).cloned())
    }

    fn phone_prefix(&self, prefix: &str) -> Result<Option<String>, LookupError> {
        Ok(self.prefixes.get(prefix).cloned())
    }
}

/// Open the configured database, falling back to an empty table so the bot still
/// answers plain pings when lookups are unavailable.
pub fn open_or_empty<P: AsRef<Path>>(path: P) -> Arc<dyn LocationTable> {
    let path = path.as_ref();
    if !path.exists() {
        warn!("Location database not found: {}", path.display());
        warn!("Zipcode/prefix lookups will be disabled");
        return Arc::new(MemoryLocationTable::new());
    }
    match SqliteLocationTable::open(path) {
        Ok(table) => {
            match table.len() {
                Ok(n) => log::info!("Location database ready: {} ({} postal codes)", path.display(), n),
                Err(e) => warn!("Location database {} opened but unreadable: {}", path.display(), e),
            }
            Arc::new(table)
        }
        Err(e) => {
            warn!("Failed to open location database {}: {}", path.display(), e);
            Arc::new(MemoryLocationTable::new())
        }
    }
}
