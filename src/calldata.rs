//! Types related to callsign records.

use std::fmt;

/// Which data source produced a record.
///
/// The cache persistence rule ("never cache ULS data") and the response
/// header both branch on this tag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallOrigin {
    /// No source has claimed the record yet.
    None,
    /// The local FCC ULS database.
    Uls,
    /// The QRZ XML API.
    Qrz,
    /// The local cache.
    Cache,
}

impl CallOrigin {
    /// The wire-protocol name of this origin.
    pub fn as_str(self) -> &'static str {
        match self {
            CallOrigin::None => "NONE",
            CallOrigin::Uls => "ULS",
            CallOrigin::Qrz => "QRZ",
            CallOrigin::Cache => "CACHE",
        }
    }
}

impl Default for CallOrigin {
    fn default() -> Self {
        CallOrigin::None
    }
}

impl fmt::Display for CallOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

/// A WGS-84 point, plus the number of decimal digits carried through the
/// `/GRID` command when printing it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
    /// Decimal digits to print (1..=5).
    pub precision: u8,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Coordinates {
        Coordinates {
            latitude,
            longitude,
            precision: 4,
        }
    }
}

/// A resolved callsign record.
///
/// Empty string fields mean "absent" and are skipped by the formatter. This
/// mirrors the cache schema, where every column is always present.
#[derive(Clone, Debug, Default)]
pub struct CallData {
    /// The canonical callsign, uppercase.
    pub callsign: String,
    /// The exact text the client asked for.
    pub query_callsign: String,
    pub origin: CallOrigin,
    /// True iff this record was returned from the cache.
    pub cached: bool,

    // Identity.
    pub first_name: String,
    pub last_name: String,
    pub aliases: String,
    pub alias_count: i64,

    // Postal.
    pub address1: String,
    pub address_attn: String,
    pub address2: String,
    pub state: String,
    pub zip: String,
    pub county: String,
    pub country: String,
    pub country_code: i64,
    pub fips: String,

    // Geodesy.
    pub grid: String,
    pub latitude: f64,
    pub longitude: f64,

    // License.
    pub opclass: String,
    pub codes: String,
    /// Epoch seconds, 0 when unknown.
    pub license_effective: i64,
    /// Epoch seconds, 0 when unknown.
    pub license_expiry: i64,
    pub dxcc: i64,

    // Contact and provenance.
    pub email: String,
    pub qrz_views: i64,

    // Cache bookkeeping, epoch seconds.
    pub cache_fetched: i64,
    pub cache_expiry: i64,
}

impl CallData {
    /// Does the record carry a usable lat/lon?
    pub fn has_position(&self) -> bool {
        self.latitude != 0.0 && self.longitude != 0.0
    }
}

#[test]
fn origin_wire_names() {
    assert_eq!(CallOrigin::None.as_str(), "NONE");
    assert_eq!(CallOrigin::Uls.as_str(), "ULS");
    assert_eq!(CallOrigin::Qrz.as_str(), "QRZ");
    assert_eq!(CallOrigin::Cache.as_str(), "CACHE");
    assert_eq!(CallOrigin::default(), CallOrigin::None);
}
