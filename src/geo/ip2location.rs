//! Adapter from the `ip2location` crate's `.BIN` database reader to the narrow
//! [`CountryDatabase`] trait this proxy consumes. This is the one concrete
//! database format shipped out of the box; the proxy core never depends on it
//! directly.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;

use ip2location::{DB, Record};

use super::{CountryDatabase, GeoError};

/// Wraps a single opened IP2Location `.BIN` file.
pub struct Ip2LocationDatabase {
    // The reader performs buffered file seeks internally and isn't `Sync` on
    // its own; lookups are infrequent relative to the data-plane hot path, so a
    // mutex is a fine price for shared access across tasks.
    db: Mutex<DB>,
}

impl Ip2LocationDatabase {
    /// Opens the database at `path`. Failing to open it is treated as a
    /// configuration error by the caller (startup is fatal on this path).
    pub fn open(path: impl AsRef<Path>) -> Result<Ip2LocationDatabase, GeoError> {
        let path = path.as_ref();
        let db = DB::from_file(path)
            .map_err(|e| GeoError::new(format!("ip2location: {}: {e}", path.display())))?;
        Ok(Ip2LocationDatabase { db: Mutex::new(db) })
    }
}

impl CountryDatabase for Ip2LocationDatabase {
    fn country_short(&self, ip: IpAddr) -> Result<String, GeoError> {
        let mut db = self.db.lock().expect("ip2location database lock poisoned");
        let record = db
            .ip_lookup(ip)
            .map_err(|e| GeoError::new(format!("ip2location lookup: {e}")))?;

        let code = match record {
            Record::LocationDb(r) => r.country.map(|c| c.short_name),
            Record::ProxyDb(r) => r.country.map(|c| c.short_name),
        };

        Ok(code.unwrap_or_default())
    }
}
