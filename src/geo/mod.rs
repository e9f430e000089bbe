//! Distance resolution.
//!
//! A request can locate its sender three ways, tried one per query type and never
//! combined:
//!
//! 1. GPS: a direct message whose sender advertises a position.
//! 2. Postal code: five digits looked up in the location table.
//! 3. Phone prefix: an area code mapped to a representative postal code, then (2).
//!
//! Distances are great-circle (haversine) kilometres from the bot's home position.
//! Any miss yields [`ResolveMethod::None`]; the reply then simply has no `dist:` field.

pub mod table;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use table::{LocationEntry, LocationTable, LookupError, MemoryLocationTable, SqliteLocationTable};

/// Mean Earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Radios report (0, 0) when they have no position fix.
    pub fn is_unset(&self) -> bool {
        self.lat == 0.0 && self.lon == 0.0
    }

    /// Build from the fixed-point microdegree integers used on the wire.
    pub fn from_micro_degrees(lat: i32, lon: i32) -> Self {
        Self::new(lat as f64 / 1e6, lon as f64 / 1e6)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}, {:.6}", self.lat, self.lon)
    }
}

/// Great-circle distance in kilometres, or `None` when either side has no fix.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> Option<f64> {
    if a.is_unset() || b.is_unset() {
        return None;
    }
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    Some(EARTH_RADIUS_KM * c)
}

/// Round to one decimal place, the precision used in replies.
pub fn round_km(km: f64) -> f64 {
    (km * 10.0).round() / 10.0
}

/// How a [`DistanceResult`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveMethod {
    Gps,
    Zipcode,
    PhonePrefix,
    None,
}

/// Outcome of one resolution. Transient: built and consumed within one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceResult {
    pub place: Option<String>,
    pub distance_km: Option<f64>,
    pub method: ResolveMethod,
}

impl DistanceResult {
    pub fn unresolved() -> Self {
        Self {
            place: None,
            distance_km: None,
            method: ResolveMethod::None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.method != ResolveMethod::None
    }
}

/// Raw location input extracted from a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DistanceQuery<'a> {
    Gps(GeoPoint),
    Zipcode(&'a str),
    PhonePrefix(&'a str),
}

/// Resolves request locations against the bot's home position.
#[derive(Clone)]
pub struct DistanceResolver {
    home: Option<GeoPoint>,
    table: Arc<dyn LocationTable>,
}

impl DistanceResolver {
    pub fn new(home: Option<GeoPoint>, table: Arc<dyn LocationTable>) -> Self {
        Self {
            home: home.filter(|h| !h.is_unset()),
            table,
        }
    }

    pub fn home(&self) -> Option<GeoPoint> {
        self.home
    }

    /// Replace the home position (e.g. with the radio's advertised location).
    pub fn set_home(&mut self, home: GeoPoint) {
        if home.is_unset() {
            debug!("Ignoring unset home position");
            return;
        }
        self.home = Some(home);
    }

    pub fn resolve(&self, query: DistanceQuery<'_>) -> DistanceResult {
        match query {
            DistanceQuery::Gps(origin) => match self.distance_to(origin) {
                Some(km) => DistanceResult {
                    place: None,
                    distance_km: Some(km),
                    method: ResolveMethod::Gps,
                },
                None => DistanceResult::unresolved(),
            },
            DistanceQuery::Zipcode(code) => self.resolve_postal(code, ResolveMethod::Zipcode),
            DistanceQuery::PhonePrefix(prefix) => match self.table.phone_prefix(prefix) {
                Ok(Some(code)) => {
                    debug!("Prefix {} -> postal code {}", prefix, code);
                    self.resolve_postal(&code, ResolveMethod::PhonePrefix)
                }
                Ok(None) => {
                    debug!("No postal code found for prefix {}", prefix);
                    DistanceResult::unresolved()
                }
                Err(e) => {
                    warn!("Prefix lookup for {} failed: {}", prefix, e);
                    DistanceResult::unresolved()
                }
            },
        }
    }

    fn resolve_postal(&self, code: &str, method: ResolveMethod) -> DistanceResult {
        let entry = match self.table.postal_code(code) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("No coordinates found for postal code {}", code);
                return DistanceResult::unresolved();
            }
            Err(e) => {
                warn!("Postal code lookup for {} failed: {}", code, e);
                return DistanceResult::unresolved();
            }
        };
        match self.distance_to(entry.position) {
            Some(km) => DistanceResult {
                place: Some(entry.place),
                distance_km: Some(km),
                method,
            },
            None => DistanceResult::unresolved(),
        }
    }

    fn distance_to(&self, point: GeoPoint) -> Option<f64> {
        haversine_km(self.home?, point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAMBURG: GeoPoint = GeoPoint::new(53.5511, 9.9937);
    const BERLIN: GeoPoint = GeoPoint::new(52.5200, 13.4050);

    #[test]
    fn same_point_is_zero() {
        assert_eq!(haversine_km(HAMBURG, HAMBURG), Some(0.0));
    }

    #[test]
    fn hamburg_berlin_is_about_255_km() {
        let km = haversine_km(HAMBURG, BERLIN).unwrap();
        assert!((km - 255.0).abs() < 3.0, "got {km}");
        // symmetric
        let back = haversine_km(BERLIN, HAMBURG).unwrap();
        assert!((km - back).abs() < 1e-9);
    }

    #[test]
    fn null_island_means_no_fix() {
        assert!(haversine_km(GeoPoint::new(0.0, 0.0), BERLIN).is_none());
        assert!(haversine_km(BERLIN, GeoPoint::new(0.0, 0.0)).is_none());
    }

    #[test]
    fn micro_degrees_convert() {
        let p = GeoPoint::from_micro_degrees(53_551_100, 9_993_700);
        assert!((p.lat - 53.5511).abs() < 1e-9);
        assert!((p.lon - 9.9937).abs() < 1e-9);
    }

    #[test]
    fn rounding_to_one_decimal() {
        assert_eq!(round_km(12.345), 12.3);
        assert_eq!(round_km(0.05), 0.1);
    }

    #[test]
    fn resolver_without_home_is_unresolved() {
        let table = Arc::new(MemoryLocationTable::new().with_postal("22765", "Hamburg", 53.55, 9.93));
        let resolver = DistanceResolver::new(None, table);
        let res = resolver.resolve(DistanceQuery::Zipcode("22765"));
        assert_eq!(res.method, ResolveMethod::None);
        assert!(res.distance_km.is_none());
    }
}
