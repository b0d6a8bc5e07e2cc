//! Lookups against a locally converted FCC ULS database.
//!
//! The ULS import tooling flattens the weekly FCC dump into a single `uls`
//! table keyed by uppercase callsign, with license dates already converted
//! to epoch seconds. We only ever read from it.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::calldata::{CallData, CallOrigin};
use crate::sources::CallsignSource;
use crate::Result;

const ULS_SELECT: &str = "\
SELECT callsign, first_name, last_name, addr1, addr2, state, zip, county,
       fips, class, codes, effective, expires
FROM uls WHERE callsign = UPPER(?)";

/// A read-only handle on the regulator database.
pub struct UlsDatabase {
    pool: SqlitePool,
}

impl UlsDatabase {
    /// Open the ULS database at `path`.
    pub async fn open(path: &str) -> Result<UlsDatabase> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("could not open ULS database {:?}", path))?;
        Ok(UlsDatabase { pool })
    }

    #[cfg(test)]
    pub fn from_pool(pool: SqlitePool) -> UlsDatabase {
        UlsDatabase { pool }
    }
}

#[async_trait]
impl CallsignSource for UlsDatabase {
    fn tag(&self) -> &str {
        "uls"
    }

    #[instrument(name = "UlsDatabase::lookup", level = "debug", skip(self))]
    async fn lookup(&self, callsign: &str) -> Result<Option<CallData>> {
        let row = sqlx::query(ULS_SELECT)
            .bind(callsign)
            .fetch_optional(&self.pool)
            .await
            .context("ULS select failed")?;
        match row {
            Some(row) => Ok(Some(calldata_from_uls(&row, callsign)?)),
            None => Ok(None),
        }
    }
}

fn calldata_from_uls(row: &SqliteRow, query: &str) -> Result<CallData> {
    fn text(row: &SqliteRow, column: &str) -> Result<String> {
        Ok(row
            .try_get::<Option<String>, _>(column)?
            .unwrap_or_default())
    }
    fn integer(row: &SqliteRow, column: &str) -> Result<i64> {
        Ok(row.try_get::<Option<i64>, _>(column)?.unwrap_or_default())
    }

    Ok(CallData {
        callsign: text(row, "callsign")?,
        query_callsign: query.to_owned(),
        origin: CallOrigin::Uls,
        first_name: text(row, "first_name")?,
        last_name: text(row, "last_name")?,
        address1: text(row, "addr1")?,
        address2: text(row, "addr2")?,
        state: text(row, "state")?,
        zip: text(row, "zip")?,
        county: text(row, "county")?,
        fips: text(row, "fips")?,
        opclass: text(row, "class")?,
        codes: text(row, "codes")?,
        license_effective: integer(row, "effective")?,
        license_expiry: integer(row, "expires")?,
        // Everything in ULS is a US license.
        country: "United States".to_owned(),
        dxcc: 291,
        ..CallData::default()
    })
}
