//! Maidenhead locator conversions and great-circle math on a spherical
//! Earth.

use crate::calldata::Coordinates;

/// Earth's radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Longitude cell width, in degrees, at each locator level. Latitude cells
/// are half as wide.
const LON_WIDTHS: [f64; 5] = [20.0, 2.0, 1.0 / 12.0, 1.0 / 120.0, 1.0 / 2880.0];

/// Pairs emitted by [`latlon_to_maidenhead`].
const DEFAULT_LOCATOR_PAIRS: usize = 3;

fn lat_width(level: usize) -> f64 {
    LON_WIDTHS[level] / 2.0
}

/// The largest valid cell index at `level`: `A-R` for the field, digits for
/// even levels, `A-X` for the letter subdivisions.
fn max_index(level: usize) -> u32 {
    match level {
        0 => 17,
        1 | 3 => 9,
        _ => 23,
    }
}

/// Decode a 4-10 character Maidenhead locator into WGS-84 coordinates.
///
/// Returns the center of the finest cell the locator specifies, so shorter
/// locators land in the middle of their field/square/subsquare. Returns
/// `None` for odd lengths, lengths outside 4-10, or characters outside the
/// letter/digit bands.
pub fn maidenhead_to_latlon(locator: &str) -> Option<Coordinates> {
    let bytes = locator.as_bytes();
    let len = bytes.len();
    if len < 4 || len > 10 || len % 2 != 0 {
        return None;
    }

    let mut lon = 0.0;
    let mut lat = 0.0;
    for (level, pair) in bytes.chunks(2).enumerate() {
        let decode = |byte: u8| -> Option<u32> {
            let value = if level % 2 == 0 {
                let upper = byte.to_ascii_uppercase();
                if !upper.is_ascii_uppercase() {
                    return None;
                }
                u32::from(upper - b'A')
            } else {
                if !byte.is_ascii_digit() {
                    return None;
                }
                u32::from(byte - b'0')
            };
            if value > max_index(level) {
                return None;
            }
            Some(value)
        };
        lon += f64::from(decode(pair[0])?) * LON_WIDTHS[level];
        lat += f64::from(decode(pair[1])?) * lat_width(level);
    }

    // Move from the SW corner to the center of the finest cell given.
    let finest = len / 2 - 1;
    lon += LON_WIDTHS[finest] / 2.0;
    lat += lat_width(finest) / 2.0;

    Some(Coordinates {
        latitude: lat - 90.0,
        longitude: lon - 180.0,
        precision: match len {
            4 => 3,
            6 => 4,
            _ => 5,
        },
    })
}

/// Encode WGS-84 coordinates as a 6-character Maidenhead locator.
pub fn latlon_to_maidenhead(coords: &Coordinates) -> String {
    let mut lon = coords.longitude + 180.0;
    let mut lat = coords.latitude + 90.0;
    let mut out = String::with_capacity(DEFAULT_LOCATOR_PAIRS * 2);

    for level in 0..DEFAULT_LOCATOR_PAIRS {
        // Clamp so the poles and the antimeridian stay inside the bands.
        let lon_idx = ((lon / LON_WIDTHS[level]) as u32).min(max_index(level));
        let lat_idx = ((lat / lat_width(level)) as u32).min(max_index(level));
        let base = if level % 2 == 0 { b'A' } else { b'0' };
        out.push(char::from(base + lon_idx as u8));
        out.push(char::from(base + lat_idx as u8));
        lon -= f64::from(lon_idx) * LON_WIDTHS[level];
        lat -= f64::from(lat_idx) * lat_width(level);
    }
    out
}

/// Great-circle initial bearing from point 1 to point 2, in degrees
/// normalized to `[0, 360)`.
pub fn bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lon = (lon2 - lon1).to_radians();
    let y = d_lon.sin() * lat2.to_radians().cos();
    let x = lat1.to_radians().cos() * lat2.to_radians().sin()
        - lat1.to_radians().sin() * lat2.to_radians().cos() * d_lon.cos();
    let mut degrees = y.atan2(x).to_degrees();
    if degrees < 0.0 {
        degrees += 360.0;
    }
    if degrees >= 360.0 {
        degrees -= 360.0;
    }
    degrees
}

/// Haversine distance between two points, in kilometers.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_subsquare() {
        // W1AW's neighborhood. A 6-character locator decodes to the center
        // of its subsquare.
        let c = maidenhead_to_latlon("FN31PR").unwrap();
        assert!((c.latitude - 41.729167).abs() < 1e-4, "lat {}", c.latitude);
        assert!((c.longitude + 72.708333).abs() < 1e-4, "lon {}", c.longitude);
        assert_eq!(c.precision, 4);
    }

    #[test]
    fn decode_is_case_insensitive() {
        let upper = maidenhead_to_latlon("FN31PR").unwrap();
        let lower = maidenhead_to_latlon("fn31pr").unwrap();
        assert_eq!(upper.latitude, lower.latitude);
        assert_eq!(upper.longitude, lower.longitude);
    }

    #[test]
    fn decode_short_and_long_locators() {
        let four = maidenhead_to_latlon("FN31").unwrap();
        assert_eq!(four.precision, 3);
        assert!((four.latitude - 41.5).abs() < 1e-9);
        assert!((four.longitude + 73.0).abs() < 1e-9);

        let ten = maidenhead_to_latlon("FN31PR00AA").unwrap();
        assert_eq!(ten.precision, 5);
        assert!((ten.latitude - 41.708333).abs() < 1e-3);
    }

    #[test]
    fn decode_rejects_bad_locators() {
        assert!(maidenhead_to_latlon("FN3").is_none());
        assert!(maidenhead_to_latlon("FN31P").is_none());
        assert!(maidenhead_to_latlon("FN31PR55AAXX").is_none());
        assert!(maidenhead_to_latlon("F131").is_none());
        assert!(maidenhead_to_latlon("FNAA").is_none());
        assert!(maidenhead_to_latlon("ZZ11").is_none());
    }

    #[test]
    fn encode_known_point() {
        let grid = latlon_to_maidenhead(&Coordinates::new(41.7292, -72.7081));
        assert_eq!(grid, "FN31PR");
    }

    #[test]
    fn encode_clamps_extremes() {
        let north = latlon_to_maidenhead(&Coordinates::new(90.0, 180.0));
        assert_eq!(north.len(), 6);
        assert!(north.is_ascii());
        let south = latlon_to_maidenhead(&Coordinates::new(-90.0, -180.0));
        assert_eq!(south, "AA00AA");
    }

    #[test]
    fn round_trip_stays_within_subsquare() {
        // Decoding an encoded point returns the subsquare center, so the
        // error is bounded by half a subsquare.
        let mut lat = -85.0;
        while lat < 90.0 {
            let mut lon = -175.0;
            while lon < 180.0 {
                let grid = latlon_to_maidenhead(&Coordinates::new(lat, lon));
                let back = maidenhead_to_latlon(&grid).unwrap();
                assert!(
                    (back.latitude - lat).abs() <= 0.042,
                    "lat {} -> {} via {}",
                    lat,
                    back.latitude,
                    grid
                );
                assert!(
                    (back.longitude - lon).abs() <= 0.083,
                    "lon {} -> {} via {}",
                    lon,
                    back.longitude,
                    grid
                );
                lon += 17.0;
            }
            lat += 13.0;
        }
    }

    #[test]
    fn distance_to_self_is_zero() {
        assert!(distance_km(41.7, -72.7, 41.7, -72.7) < 1e-6);
        assert!(distance_km(0.0, 0.0, 0.0, 0.0) < 1e-6);
    }

    #[test]
    fn distance_along_equator() {
        // One degree of longitude at the equator.
        let d = distance_km(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111.195).abs() < 0.01, "got {}", d);
    }

    #[test]
    fn bearing_cardinal_directions() {
        assert!((bearing(0.0, 0.0, 10.0, 0.0) - 0.0).abs() < 1e-6);
        assert!((bearing(0.0, 0.0, 0.0, 10.0) - 90.0).abs() < 1e-6);
        assert!((bearing(10.0, 0.0, 0.0, 0.0) - 180.0).abs() < 1e-6);
        assert!((bearing(0.0, 0.0, 0.0, -10.0) - 270.0).abs() < 1e-6);
    }

    #[test]
    fn bearing_is_normalized() {
        let mut lat = -80.0;
        while lat <= 80.0 {
            let b = bearing(40.0, -75.0, lat, 120.0);
            assert!((0.0..360.0).contains(&b), "bearing {}", b);
            lat += 16.0;
        }
    }
}
