//! SQLite-backed caching layer for callsign records.
//!
//! The cache is a single `cache` table keyed by uppercase callsign. One
//! pooled connection matches the single-writer event-loop model, and sqlx's
//! per-connection statement cache keeps the insert/select/expire statements
//! prepared across calls.

use anyhow::Context;
use metrics::{counter, describe_counter};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::calldata::{CallData, CallOrigin};
use crate::Result;

/// Created on first run. `cache_id` is a synthetic row id; the callsign is
/// the real key.
const CACHE_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS cache (
    cache_id INTEGER PRIMARY KEY AUTOINCREMENT,
    callsign TEXT NOT NULL UNIQUE,
    dxcc INTEGER,
    aliases TEXT,
    first_name TEXT,
    last_name TEXT,
    addr1 TEXT,
    addr2 TEXT,
    state TEXT,
    zip TEXT,
    grid TEXT,
    country TEXT,
    latitude REAL,
    longitude REAL,
    county TEXT,
    class TEXT,
    codes TEXT,
    email TEXT,
    u_views INTEGER,
    effective INTEGER,
    expires INTEGER,
    cache_expires INTEGER,
    cache_fetched INTEGER
)";

// OR REPLACE: an online lookup of a callsign with a stale row must be able
// to overwrite it.
const CACHE_INSERT: &str = "\
INSERT OR REPLACE INTO cache
    (callsign, dxcc, aliases, first_name, last_name, addr1, addr2,
     state, zip, grid, country, latitude, longitude, county, class,
     codes, email, u_views, effective, expires, cache_expires, cache_fetched)
VALUES
    (UPPER(?), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const CACHE_SELECT: &str = "SELECT * FROM cache WHERE callsign = UPPER(?)";

const CACHE_EXPIRE: &str = "DELETE FROM cache WHERE cache_expires <= ?";

/// The persistent callsign-record cache.
pub struct CallsignCache {
    pool: SqlitePool,
    /// Seconds a fresh record stays valid.
    default_expiry: i64,
    /// Return stale rows instead of deleting them while offline.
    keep_stale_if_offline: bool,
}

impl CallsignCache {
    /// Open (and on first run, create) the cache database at `path`.
    pub async fn open(
        path: &str,
        default_expiry: i64,
        keep_stale_if_offline: bool,
    ) -> Result<CallsignCache> {
        describe_counter!(
            "callsign.cache_hits.total",
            "Lookups answered from the cache"
        );
        describe_counter!(
            "callsign.cache_misses.total",
            "Lookups not answered from the cache"
        );

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("could not open cache database {:?}", path))?;
        sqlx::query(CACHE_SCHEMA)
            .execute(&pool)
            .await
            .context("could not create cache table")?;
        info!("calldata cache database opened");

        Ok(CallsignCache {
            pool,
            default_expiry,
            keep_stale_if_offline,
        })
    }

    /// Persist `record`, stamping its cache bookkeeping fields first.
    ///
    /// ULS records are not cached, because the ULS database is already
    /// local and queryable; that case still counts as success. Statement
    /// failures are logged and reported as `false`, never fatal.
    pub async fn save(&self, record: &mut CallData, now: i64) -> bool {
        if record.origin == CallOrigin::Uls {
            return true;
        }

        record.cache_fetched = now;
        record.cache_expiry = now + self.default_expiry;

        let result = sqlx::query(CACHE_INSERT)
            .bind(&record.callsign)
            .bind(record.dxcc)
            .bind(&record.aliases)
            .bind(&record.first_name)
            .bind(&record.last_name)
            .bind(&record.address1)
            .bind(&record.address2)
            .bind(&record.state)
            .bind(&record.zip)
            .bind(&record.grid)
            .bind(&record.country)
            .bind(record.latitude)
            .bind(record.longitude)
            .bind(&record.county)
            .bind(&record.opclass)
            .bind(&record.codes)
            .bind(&record.email)
            .bind(record.qrz_views)
            .bind(record.license_effective)
            .bind(record.license_expiry)
            .bind(record.cache_expiry)
            .bind(record.cache_fetched)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => true,
            Err(err) => {
                warn!("inserting {} into cache failed: {}", record.callsign, err);
                false
            }
        }
    }

    /// Look up `callsign`, applying the staleness policy.
    ///
    /// A hit is stamped `origin = CACHE`, `cached = true`. A stale row is
    /// returned only while offline with keep-stale enabled; offline without
    /// it triggers an expiry sweep. An expired row found while online is a
    /// plain miss, since the fresh lookup will overwrite it. Statement
    /// failures degrade to a miss.
    pub async fn find(&self, callsign: &str, offline: bool, now: i64) -> Option<CallData> {
        let row = match sqlx::query(CACHE_SELECT)
            .bind(callsign)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                counter!("callsign.cache_misses.total", 1);
                return None;
            }
            Err(err) => {
                warn!("cache select for {} failed: {}", callsign, err);
                counter!("callsign.cache_misses.total", 1);
                return None;
            }
        };

        let mut record = match calldata_from_row(&row) {
            Ok(record) => record,
            Err(err) => {
                warn!("could not decode cache row for {}: {:#}", callsign, err);
                counter!("callsign.cache_misses.total", 1);
                return None;
            }
        };
        record.origin = CallOrigin::Cache;
        record.cached = true;
        record.query_callsign = callsign.to_owned();

        if record.cache_expiry <= now {
            if !offline {
                // Online: force a fresh lookup, which will replace the row.
                counter!("callsign.cache_misses.total", 1);
                return None;
            }
            if !self.keep_stale_if_offline {
                warn!(
                    "cache expiry: record for {} is {} seconds old ({} expiry), forcing cache deletion",
                    record.callsign,
                    now - record.cache_fetched,
                    record.cache_expiry - record.cache_fetched
                );
                self.expire(now).await;
                counter!("callsign.cache_misses.total", 1);
                return None;
            }
            warn!(
                "returning stale result for {} ({} past expiry)",
                record.callsign,
                now - record.cache_expiry
            );
        }

        counter!("callsign.cache_hits.total", 1);
        Some(record)
    }

    /// Delete every row whose expiry has passed.
    pub async fn expire(&self, now: i64) {
        match sqlx::query(CACHE_EXPIRE).bind(now).execute(&self.pool).await {
            Ok(done) => debug!("cache expiry done: {} changes!", done.rows_affected()),
            Err(err) => warn!("cache expiry failed: {}", err),
        }
    }

    #[cfg(test)]
    pub async fn row_count(&self) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM cache")
            .fetch_one(&self.pool)
            .await
            .map(|row| row.get("n"))
            .unwrap_or(-1)
    }
}

fn calldata_from_row(row: &SqliteRow) -> Result<CallData> {
    fn text(row: &SqliteRow, column: &str) -> Result<String> {
        Ok(row
            .try_get::<Option<String>, _>(column)?
            .unwrap_or_default())
    }
    fn integer(row: &SqliteRow, column: &str) -> Result<i64> {
        Ok(row.try_get::<Option<i64>, _>(column)?.unwrap_or_default())
    }
    fn real(row: &SqliteRow, column: &str) -> Result<f64> {
        Ok(row.try_get::<Option<f64>, _>(column)?.unwrap_or_default())
    }

    let aliases = text(row, "aliases")?;
    let alias_count = if aliases.is_empty() {
        0
    } else {
        aliases.split(',').count() as i64
    };

    Ok(CallData {
        callsign: text(row, "callsign")?,
        aliases,
        alias_count,
        first_name: text(row, "first_name")?,
        last_name: text(row, "last_name")?,
        address1: text(row, "addr1")?,
        address2: text(row, "addr2")?,
        state: text(row, "state")?,
        zip: text(row, "zip")?,
        grid: text(row, "grid")?,
        country: text(row, "country")?,
        latitude: real(row, "latitude")?,
        longitude: real(row, "longitude")?,
        county: text(row, "county")?,
        opclass: text(row, "class")?,
        codes: text(row, "codes")?,
        email: text(row, "email")?,
        qrz_views: integer(row, "u_views")?,
        dxcc: integer(row, "dxcc")?,
        license_effective: integer(row, "effective")?,
        license_expiry: integer(row, "expires")?,
        cache_expiry: integer(row, "cache_expires")?,
        cache_fetched: integer(row, "cache_fetched")?,
        ..CallData::default()
    })
}
