//! Configuration loading.
//!
//! The configuration file is a JSON tree. Components look values up by
//! slash-separated paths like `callsign-lookup/use-cache`, so the file can
//! be shared with the other tools in the suite without every component
//! knowing the whole schema.

use anyhow::{format_err, Context};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{error, warn};

use crate::calldata::Coordinates;
use crate::geo;
use crate::Result;

/// Minimum cache lifetime, in seconds. To disable caching, the user sets
/// `use-cache` to false instead of a tiny TTL.
pub const MIN_CACHE_EXPIRY: i64 = 3600;

/// Default cache lifetime: three days.
pub const DEFAULT_CACHE_EXPIRY: i64 = 86400 * 3;

/// Minimum delay between attempts to bring the remote session online.
pub const MIN_RETRY_DELAY: i64 = 30;

/// Default remote-session retry delay, in seconds.
pub const DEFAULT_RETRY_DELAY: i64 = 3600;

/// A parsed configuration tree with typed path lookups.
pub struct ConfigTree {
    root: Value,
}

impl ConfigTree {
    /// Load a configuration tree from a JSON file.
    pub fn from_path(path: &Path) -> Result<ConfigTree> {
        let file = File::open(path)
            .with_context(|| format!("could not open config file {}", path.display()))?;
        let root: Value = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        if !root.is_object() {
            return Err(format_err!(
                "config file {} must contain a JSON object",
                path.display()
            ));
        }
        Ok(ConfigTree { root })
    }

    /// Build a tree directly from a JSON value.
    #[cfg(test)]
    pub fn from_value(root: Value) -> ConfigTree {
        ConfigTree { root }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for part in path.split('/') {
            node = node.get(part)?;
        }
        Some(node)
    }

    /// A string value at `path`, or `None` when absent or not a string.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path).and_then(Value::as_str)
    }

    /// An integer value at `path`. Accepts JSON numbers and numeric strings.
    pub fn get_int(&self, path: &str) -> Option<i64> {
        match self.lookup(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// A boolean at `path`. Accepts JSON booleans and the usual textual
    /// spellings; anything else is `default`.
    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        match self.lookup(path) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => str_to_bool(s, default),
            _ => default,
        }
    }

    /// A duration at `path`, in seconds. Accepts bare numbers and strings
    /// like `"90m"` or `"3d"`.
    pub fn get_duration_secs(&self, path: &str) -> Option<i64> {
        match self.lookup(path)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => timestr_to_seconds(s).ok(),
            _ => None,
        }
    }
}

/// Parse the usual textual boolean spellings, falling back to `default`.
pub fn str_to_bool(s: &str, default: bool) -> bool {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => true,
        "false" | "no" | "off" | "0" => false,
        _ => default,
    }
}

/// Parse a duration string like `"300"`, `"45m"`, `"12h"`, `"3d"`, `"1w"`
/// or a concatenation (`"1d12h"`) into seconds.
pub fn timestr_to_seconds(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(format_err!("empty duration string"));
    }
    let mut total: i64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            let value: i64 = digits
                .parse()
                .map_err(|_| format_err!("expected a number before {:?} in {:?}", c, s))?;
            digits.clear();
            let unit = match c.to_ascii_lowercase() {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86400,
                'w' => 86400 * 7,
                _ => return Err(format_err!("unknown duration unit {:?} in {:?}", c, s)),
            };
            total += value * unit;
        }
    }
    if !digits.is_empty() {
        // A bare trailing number counts as seconds.
        total += digits
            .parse::<i64>()
            .map_err(|_| format_err!("could not parse duration {:?}", s))?;
    }
    Ok(total)
}

/// The options consumed from the `callsign-lookup/` section, read once at
/// startup and clamped into their valid ranges.
#[derive(Clone, Debug)]
pub struct Settings {
    pub use_uls: bool,
    pub use_qrz: bool,
    pub use_cache: bool,
    pub use_gnis: bool,
    pub cache_db: Option<String>,
    pub uls_db: Option<String>,
    /// Default cache TTL, seconds.
    pub cache_expiry: i64,
    pub keep_stale_if_offline: bool,
    /// Exit after answering this many requests; 0 disables.
    pub max_requests: i64,
    /// Seconds between remote-session retries.
    pub retry_delay: i64,
}

impl Settings {
    pub fn from_tree(tree: &ConfigTree) -> Settings {
        let mut cache_expiry = tree
            .get_duration_secs("callsign-lookup/cache-expiry")
            .unwrap_or(DEFAULT_CACHE_EXPIRY);
        if cache_expiry < MIN_CACHE_EXPIRY {
            warn!(
                "callsign-lookup/cache-expiry {} is too low, defaulting to 1 hour. \
                 If you wish to disable caching, set callsign-lookup/use-cache to false instead.",
                cache_expiry
            );
            cache_expiry = MIN_CACHE_EXPIRY;
        }

        let mut retry_delay = tree
            .get_duration_secs("callsign-lookup/retry-delay")
            .unwrap_or(DEFAULT_RETRY_DELAY);
        if retry_delay < MIN_RETRY_DELAY {
            warn!(
                "callsign-lookup/retry-delay {} is too low, using {} seconds",
                retry_delay, MIN_RETRY_DELAY
            );
            retry_delay = MIN_RETRY_DELAY;
        }

        // A negative bound disables the respawn feature.
        let max_requests = tree
            .get_int("callsign-lookup/respawn-after-requests")
            .unwrap_or(0)
            .max(0);

        Settings {
            use_uls: tree.get_bool("callsign-lookup/use-uls", false),
            use_qrz: tree.get_bool("callsign-lookup/use-qrz", false),
            use_cache: tree.get_bool("callsign-lookup/use-cache", true),
            use_gnis: tree.get_bool("callsign-lookup/use-gnis", false),
            cache_db: tree.get_str("callsign-lookup/cache-db").map(str::to_owned),
            uls_db: tree.get_str("callsign-lookup/uls-db").map(str::to_owned),
            cache_expiry,
            keep_stale_if_offline: tree
                .get_bool("callsign-lookup/cache-keep-stale-if-offline", true),
            max_requests,
            retry_delay,
        }
    }
}

/// The operator's own location, used for distance and bearing lines.
#[derive(Clone, Debug, Default)]
pub struct SiteLocation {
    /// The configured `site/gridsquare`, if any.
    pub grid: Option<String>,
    /// Resolved coordinates: `site/coordinates` when present, otherwise
    /// derived from the gridsquare.
    pub coords: Option<Coordinates>,
}

impl SiteLocation {
    pub fn from_tree(tree: &ConfigTree) -> SiteLocation {
        let grid = tree
            .get_str("site/gridsquare")
            .map(|g| g.to_ascii_uppercase());

        let coords = if let Some(text) = tree.get_str("site/coordinates") {
            match parse_coordinate_pair(text) {
                Some(c) => Some(c),
                None => {
                    error!("site/coordinates is invalid (expected \"lat, lon\"): {:?}", text);
                    grid.as_deref().and_then(geo::maidenhead_to_latlon)
                }
            }
        } else {
            grid.as_deref().and_then(geo::maidenhead_to_latlon)
        };

        if let Some(c) = &coords {
            tracing::debug!(
                "configured mygrid: {}, lat: {}, lon: {}",
                grid.as_deref().unwrap_or("(none)"),
                c.latitude,
                c.longitude
            );
        }
        SiteLocation { grid, coords }
    }
}

/// Parse `"lat, lon"` into coordinates.
pub fn parse_coordinate_pair(text: &str) -> Option<Coordinates> {
    let (lat, lon) = text.split_once(',')?;
    let lat: f64 = lat.trim().parse().ok()?;
    let lon: f64 = lon.trim().parse().ok()?;
    Some(Coordinates::new(lat, lon))
}
