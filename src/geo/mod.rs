//! IP-to-country resolution.
//!
//! `GeoLookup` is a thin fold over zero or more [`CountryDatabase`] handles; the
//! on-disk format of any given database is an external concern, narrowed to a
//! single `country_short` operation. The shipped adapter, [`Ip2LocationDatabase`],
//! reads IP2Location `.BIN` files, matching the database family the proxy this
//! crate models was built against.

mod ip2location;

use std::net::IpAddr;

use thiserror::Error;

pub use self::ip2location::Ip2LocationDatabase;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct GeoError(pub String);

impl GeoError {
    pub fn new(msg: impl Into<String>) -> GeoError {
        GeoError(msg.into())
    }
}

/// A single IP-to-country backing database. Implementations are free to hold
/// any on-disk or in-memory representation; only the lookup operation is public.
pub trait CountryDatabase: Send + Sync {
    /// Returns the ISO-3166 alpha-2 country code for `ip`, or an empty string if
    /// the database has no entry for it.
    fn country_short(&self, ip: IpAddr) -> Result<String, GeoError>;
}

/// Chains zero or more [`CountryDatabase`] handles. Each registered database is
/// consulted in registration order; the last one to produce a successful,
/// non-error result wins, matching the fold order of the proxy this crate models.
pub struct GeoLookup {
    databases: Vec<Box<dyn CountryDatabase>>,
}

impl GeoLookup {
    pub fn new(databases: Vec<Box<dyn CountryDatabase>>) -> GeoLookup {
        GeoLookup { databases }
    }

    /// Resolves `ip` against every attached database. If every attached database
    /// errors, the error is surfaced; otherwise the last successful lookup wins.
    /// With no databases attached (or no successes and no errors), resolves to
    /// the empty string.
    pub fn country(&self, ip: IpAddr) -> Result<String, GeoError> {
        let mut country = None;
        let mut last_err = None;

        for db in &self.databases {
            match db.country_short(ip) {
                Ok(code) => country = Some(code),
                Err(e) => last_err = Some(e),
            }
        }

        match country {
            Some(code) => Ok(code),
            None => match last_err {
                Some(e) => Err(e),
                None => Ok(String::new()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<&'static str, &'static str>);
    impl CountryDatabase for Fixed {
        fn country_short(&self, _ip: IpAddr) -> Result<String, GeoError> {
            self.0.map(str::to_string).map_err(GeoError::new)
        }
    }

    fn ip() -> IpAddr {
        "203.0.113.1".parse().unwrap()
    }

    #[test]
    fn empty_chain_resolves_to_empty_string() {
        let geo = GeoLookup::new(vec![]);
        assert_eq!(geo.country(ip()).unwrap(), "");
    }

    #[test]
    fn last_successful_database_wins() {
        let geo = GeoLookup::new(vec![
            Box::new(Fixed(Ok("fr"))),
            Box::new(Fixed(Ok("de"))),
        ]);
        assert_eq!(geo.country(ip()).unwrap(), "de");
    }

    #[test]
    fn every_database_erroring_surfaces_the_error() {
        let geo = GeoLookup::new(vec![Box::new(Fixed(Err("db offline")))]);
        assert!(geo.country(ip()).is_err());
    }
}
