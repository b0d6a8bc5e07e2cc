//! Renders resolved records in the line-oriented wire format.

use anyhow::Error;
use chrono::{Local, TimeZone};
use tracing::debug;

use crate::calldata::CallData;
use crate::config::SiteLocation;
use crate::errors::FatalError;
use crate::geo;
use crate::Result;

/// Kilometers to statute miles.
const KM_TO_MILES: f64 = 0.6214;

/// The miss line: `404 NOT FOUND <cs> <ONLINE|OFFLINE> <now>`.
pub fn not_found_line(callsign: &str, offline: bool, now: i64) -> String {
    let online = if offline { "OFFLINE" } else { "ONLINE" };
    format!("404 NOT FOUND {} {} {}\n", callsign, online, now)
}

/// Render a resolved record, terminated by `+EOR` and a blank line.
pub fn render_record(record: &CallData, site: &SiteLocation, now: i64) -> Result<String> {
    let mut out = String::with_capacity(512);

    // The literal ONLINE here is part of the wire contract; it does not
    // reflect the current offline flag.
    out.push_str(&format!(
        "200 OK {} ONLINE {} {}\n",
        record.callsign,
        now,
        record.origin.as_str()
    ));
    out.push_str(&format!("Callsign: {}\n", record.callsign));
    out.push_str(&format!(
        "Cached: {}\n",
        if record.cached { "true" } else { "false" }
    ));

    if record.cached {
        out.push_str(&format!(
            "Cache-Fetched: {}\n",
            local_datetime(record.cache_fetched)?
        ));
        out.push_str(&format!(
            "Cache-Expiry: {}\n",
            local_datetime(record.cache_expiry)?
        ));
    }

    if !record.first_name.is_empty() {
        out.push_str(&format!(
            "Name: {} {}\n",
            record.first_name, record.last_name
        ));
    }

    let opclass = class_name(record);
    if !opclass.is_empty() {
        out.push_str(&format!("Class: {}\n", opclass));
    }

    if !record.grid.is_empty() {
        out.push_str(&format!("Grid: {}\n", record.grid));
    }
    if record.has_position() {
        out.push_str(&format!(
            "WGS-84: {:.3}, {:.3}\n",
            record.latitude, record.longitude
        ));
    }

    if let Some(line) = heading_line(record, site) {
        out.push_str(&line);
    }

    if record.alias_count > 0 && !record.aliases.is_empty() {
        out.push_str(&format!(
            "Aliases: {}: {}\n",
            record.alias_count, record.aliases
        ));
    }
    if record.dxcc != 0 {
        out.push_str(&format!("DXCC: {}\n", record.dxcc));
    }
    if !record.email.is_empty() {
        out.push_str(&format!("Email: {}\n", record.email));
    }
    if !record.address1.is_empty() {
        out.push_str(&format!("Address1: {}\n", record.address1));
    }
    if !record.address_attn.is_empty() {
        out.push_str(&format!("Attn: {}\n", record.address_attn));
    }
    if !record.address2.is_empty() {
        out.push_str(&format!("Address2: {}\n", record.address2));
    }
    if !record.state.is_empty() {
        out.push_str(&format!("State: {}\n", record.state));
    }
    if !record.zip.is_empty() {
        out.push_str(&format!("Zip: {}\n", record.zip));
    }
    if !record.county.is_empty() {
        out.push_str(&format!("County: {}\n", record.county));
    }
    if !record.fips.is_empty() {
        out.push_str(&format!("FIPS: {}\n", record.fips));
    }

    out.push_str(&license_line("License Effective", record.license_effective));
    out.push_str(&license_line("License Expires", record.license_expiry));

    if !record.country.is_empty() {
        out.push_str(&format!(
            "Country: {} ({})\n",
            record.country, record.country_code
        ));
    }

    // End of record marker. Advisory; parsers must not rely on it.
    out.push_str("+EOR\n\n");
    Ok(out)
}

/// `Heading: <mi> mi / <km> km at <deg> degrees` from the operator's home
/// location to the record's position, or `None` when either end of the
/// path is unusable.
fn heading_line(record: &CallData, site: &SiteLocation) -> Option<String> {
    if site.grid.is_none() {
        return None;
    }
    let my = site.coords.as_ref()?;

    let (lat, lon) = if record.has_position() {
        (record.latitude, record.longitude)
    } else if !record.grid.is_empty() {
        let coords = geo::maidenhead_to_latlon(&record.grid)?;
        debug!(
            "call grid: {} => lat/lon: {:.4}, {:.4}",
            record.grid, coords.latitude, coords.longitude
        );
        (coords.latitude, coords.longitude)
    } else {
        return None;
    };

    let distance = geo::distance_km(my.latitude, my.longitude, lat, lon);
    let bearing = geo::bearing(my.latitude, my.longitude, lat, lon);
    if distance > 0.0 && bearing > 0.0 {
        Some(format!(
            "Heading: {:.1} mi / {:.1} km at {:.0} degrees\n",
            distance * KM_TO_MILES,
            distance,
            bearing
        ))
    } else {
        None
    }
}

/// Expand US license class letters into names; pass everything else
/// through.
fn class_name(record: &CallData) -> &str {
    if record.opclass.is_empty() {
        return "";
    }
    if record.country == "United States" {
        match record.opclass.as_bytes()[0] {
            b'N' => "Novice",
            b'A' => "Advanced",
            b'T' => "Technician",
            b'G' => "General",
            b'E' => "Extra",
            _ => "",
        }
    } else {
        &record.opclass
    }
}

/// `YYYY/MM/DD HH:MM:SS` in local time. Failure here is the fatal
/// time-formatting case (exit 254).
fn local_datetime(epoch: i64) -> Result<String> {
    Local
        .timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.format("%Y/%m/%d %H:%M:%S").to_string())
        .ok_or_else(|| Error::new(FatalError::TimeFormat(epoch)))
}

/// A license-date line: `YYYY/MM/DD` when the epoch is set, `UNKNOWN`
/// otherwise. Conversion failures just drop the line.
fn license_line(label: &str, epoch: i64) -> String {
    if epoch > 0 {
        match Local.timestamp_opt(epoch, 0).single() {
            Some(dt) => format!("{}: {}\n", label, dt.format("%Y/%m/%d")),
            None => {
                debug!("failed converting {} epoch {} to local time", label, epoch);
                String::new()
            }
        }
    } else {
        format!("{}: UNKNOWN\n", label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calldata::{CallOrigin, Coordinates};

    const NOW: i64 = 1_700_000_000;

    fn sample_record() -> CallData {
        CallData {
            callsign: "W1AW".to_owned(),
            query_callsign: "W1AW".to_owned(),
            origin: CallOrigin::Qrz,
            first_name: "Hiram".to_owned(),
            last_name: "Maxim".to_owned(),
            aliases: "AX1AW,W1INF".to_owned(),
            alias_count: 2,
            address1: "225 Main St".to_owned(),
            address2: "Newington".to_owned(),
            state: "CT".to_owned(),
            zip: "06111".to_owned(),
            county: "Hartford".to_owned(),
            fips: "09003".to_owned(),
            country: "United States".to_owned(),
            country_code: 271,
            grid: "FN31PR".to_owned(),
            latitude: 41.7148,
            longitude: -72.7272,
            opclass: "E".to_owned(),
            dxcc: 291,
            email: "w1aw@example.org".to_owned(),
            license_effective: 1_600_000_000,
            license_expiry: 1_900_000_000,
            ..CallData::default()
        }
    }

    fn home() -> SiteLocation {
        SiteLocation {
            grid: Some("EM48".to_owned()),
            coords: Some(Coordinates::new(38.5, -90.0)),
        }
    }

    #[test]
    fn header_uses_the_online_literal_and_origin() {
        let out = render_record(&sample_record(), &home(), NOW).unwrap();
        assert!(out.starts_with(&format!("200 OK W1AW ONLINE {} QRZ\n", NOW)));
        assert!(out.contains("Callsign: W1AW\n"));
        assert!(out.contains("Cached: false\n"));
        assert!(out.ends_with("+EOR\n\n"));
    }

    #[test]
    fn full_record_renders_every_populated_field() {
        let out = render_record(&sample_record(), &home(), NOW).unwrap();
        assert!(out.contains("Name: Hiram Maxim\n"));
        assert!(out.contains("Class: Extra\n"));
        assert!(out.contains("Grid: FN31PR\n"));
        assert!(out.contains("WGS-84: 41.715, -72.727\n"));
        assert!(out.contains("Heading: "));
        assert!(out.contains(" mi / "));
        assert!(out.contains("Aliases: 2: AX1AW,W1INF\n"));
        assert!(out.contains("DXCC: 291\n"));
        assert!(out.contains("Email: w1aw@example.org\n"));
        assert!(out.contains("Address1: 225 Main St\n"));
        assert!(out.contains("State: CT\n"));
        assert!(out.contains("Zip: 06111\n"));
        assert!(out.contains("County: Hartford\n"));
        assert!(out.contains("FIPS: 09003\n"));
        assert!(out.contains("License Effective: 20"));
        assert!(out.contains("License Expires: 20"));
        assert!(out.contains("Country: United States (271)\n"));
    }

    #[test]
    fn empty_fields_are_absent() {
        let record = CallData {
            callsign: "XX1XX".to_owned(),
            origin: CallOrigin::Uls,
            ..CallData::default()
        };
        let out = render_record(&record, &home(), NOW).unwrap();
        assert!(!out.contains("Name:"));
        assert!(!out.contains("Class:"));
        assert!(!out.contains("Grid:"));
        assert!(!out.contains("WGS-84:"));
        assert!(!out.contains("Heading:"));
        assert!(!out.contains("Aliases:"));
        assert!(!out.contains("Email:"));
        assert!(!out.contains("Country:"));
        assert!(out.contains("License Effective: UNKNOWN\n"));
        assert!(out.contains("License Expires: UNKNOWN\n"));
    }

    #[test]
    fn cached_records_show_cache_timestamps() {
        let mut record = sample_record();
        record.origin = CallOrigin::Cache;
        record.cached = true;
        record.cache_fetched = NOW - 60;
        record.cache_expiry = NOW + 3600;
        let out = render_record(&record, &home(), NOW).unwrap();
        assert!(out.contains("200 OK W1AW ONLINE"));
        assert!(out.contains(" CACHE\n"));
        assert!(out.contains("Cached: true\n"));
        assert!(out.contains("Cache-Fetched: "));
        assert!(out.contains("Cache-Expiry: "));
    }

    #[test]
    fn non_us_class_passes_through() {
        let mut record = sample_record();
        record.country = "Canada".to_owned();
        record.opclass = "Basic".to_owned();
        let out = render_record(&record, &home(), NOW).unwrap();
        assert!(out.contains("Class: Basic\n"));
    }

    #[test]
    fn heading_falls_back_to_the_grid() {
        let mut record = sample_record();
        record.latitude = 0.0;
        record.longitude = 0.0;
        let out = render_record(&record, &home(), NOW).unwrap();
        assert!(out.contains("Heading: "));
        assert!(!out.contains("WGS-84:"));
    }

    #[test]
    fn heading_needs_a_configured_home_grid() {
        let out = render_record(&sample_record(), &SiteLocation::default(), NOW).unwrap();
        assert!(!out.contains("Heading:"));
    }

    #[test]
    fn not_found_reflects_the_offline_flag() {
        assert_eq!(
            not_found_line("W1AW", true, NOW),
            format!("404 NOT FOUND W1AW OFFLINE {}\n", NOW)
        );
        assert_eq!(
            not_found_line("W1AW", false, NOW),
            format!("404 NOT FOUND W1AW ONLINE {}\n", NOW)
        );
    }
}
