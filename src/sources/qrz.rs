//! Interface to the QRZ XML API.
//!
//! QRZ hands out a session key in exchange for account credentials; lookups
//! quote the key back as a query parameter. A key can expire server-side,
//! in which case we drop it and the resolver's retry schedule establishes a
//! fresh one.

use std::env;
use std::str;

use anyhow::{format_err, Context};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::StreamExt;
use hyper::{Body, Request};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::calldata::{CallData, CallOrigin};
use crate::sources::{CallsignSource, SessionExpired, SharedHttpClient};
use crate::Result;

const QRZ_ENDPOINT: &str = "https://xmldata.qrz.com/xml/current/";

const USER_AGENT: &str = concat!("callsign-lookup/", env!("CARGO_PKG_VERSION"));

/// Credentials for authenticating with QRZ.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Create new QRZ credentials from environment variables.
    pub fn from_env() -> Result<Credentials> {
        let username = env::var("QRZ_USERNAME").context("could not read QRZ_USERNAME")?;
        let password = env::var("QRZ_PASSWORD").context("could not read QRZ_PASSWORD")?;
        Ok(Credentials { username, password })
    }
}

/// The top-level document wrapped around every QRZ response.
#[derive(Debug, Deserialize)]
struct QrzDatabase {
    #[serde(rename = "Session")]
    session: Option<QrzSession>,
    #[serde(rename = "Callsign")]
    callsign: Option<QrzCallsign>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QrzSession {
    #[serde(rename = "Key")]
    key: Option<String>,
    #[serde(rename = "Error")]
    error: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// Fields returned for a callsign lookup. Everything except the callsign
/// itself is optional; QRZ omits elements it has no data for.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QrzCallsign {
    call: String,
    aliases: Option<String>,
    fname: Option<String>,
    name: Option<String>,
    attn: Option<String>,
    addr1: Option<String>,
    addr2: Option<String>,
    state: Option<String>,
    zip: Option<String>,
    county: Option<String>,
    country: Option<String>,
    ccode: Option<i64>,
    fips: Option<String>,
    grid: Option<String>,
    lat: Option<f64>,
    lon: Option<f64>,
    class: Option<String>,
    codes: Option<String>,
    email: Option<String>,
    u_views: Option<i64>,
    efdate: Option<String>,
    expdate: Option<String>,
    dxcc: Option<i64>,
}

/// A client for the QRZ XML API, holding the current session key.
pub struct QrzClient {
    credentials: Credentials,
    client: SharedHttpClient,
    session_key: Mutex<Option<String>>,
}

impl QrzClient {
    pub fn new(credentials: Credentials, client: SharedHttpClient) -> QrzClient {
        QrzClient {
            credentials,
            client,
            session_key: Mutex::new(None),
        }
    }

    /// Fetch and deserialize one QRZ document.
    async fn fetch(&self, url: Url) -> Result<QrzDatabase> {
        let req = Request::builder()
            .method("GET")
            .uri(url.as_str())
            .header("User-Agent", USER_AGENT)
            .body(Body::empty())?;
        let res = self.client.request(req).await?;
        let status = res.status();
        let mut body = res.into_body();
        let mut body_data = vec![];
        while let Some(chunk_result) = body.next().await {
            let chunk = chunk_result?;
            body_data.extend(&chunk[..]);
        }

        if !status.is_success() {
            return Err(format_err!(
                "QRZ request failed: {}\n{}",
                status,
                String::from_utf8_lossy(&body_data),
            ));
        }
        let text = str::from_utf8(&body_data).context("QRZ response was not UTF-8")?;
        quick_xml::de::from_str(text).context("could not parse QRZ XML response")
    }
}

#[async_trait]
impl CallsignSource for QrzClient {
    fn tag(&self) -> &str {
        "qrz"
    }

    fn requires_session(&self) -> bool {
        true
    }

    #[instrument(name = "QrzClient::start_session", level = "debug", skip_all)]
    async fn start_session(&self) -> Result<bool> {
        let mut url = Url::parse(QRZ_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("username", &self.credentials.username)
            .append_pair("password", &self.credentials.password)
            .append_pair("agent", USER_AGENT)
            .finish();

        let doc = self.fetch(url).await?;
        let session = doc.session.unwrap_or_default();
        if let Some(error) = &session.error {
            warn!("QRZ session error: {}", error);
            *self.session_key.lock().await = None;
            return Ok(false);
        }
        match session.key {
            Some(key) => {
                if let Some(message) = &session.message {
                    debug!("QRZ session message: {}", message);
                }
                *self.session_key.lock().await = Some(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[instrument(name = "QrzClient::lookup", level = "debug", skip(self))]
    async fn lookup(&self, callsign: &str) -> Result<Option<CallData>> {
        let key = self.session_key.lock().await.clone().ok_or(SessionExpired)?;

        let mut url = Url::parse(QRZ_ENDPOINT)?;
        url.query_pairs_mut()
            .append_pair("s", &key)
            .append_pair("callsign", callsign)
            .finish();

        let doc = self.fetch(url).await?;
        if let Some(session) = &doc.session {
            if let Some(error) = &session.error {
                let lowered = error.to_ascii_lowercase();
                if lowered.contains("not found") {
                    return Ok(None);
                }
                if lowered.contains("session timeout") || lowered.contains("invalid session key") {
                    warn!("QRZ session died: {}", error);
                    *self.session_key.lock().await = None;
                    return Err(SessionExpired.into());
                }
                return Err(format_err!("QRZ lookup failed: {}", error));
            }
        }
        Ok(doc.callsign.map(|info| calldata_from_qrz(info, callsign)))
    }
}

fn calldata_from_qrz(info: QrzCallsign, query: &str) -> CallData {
    let aliases = info.aliases.unwrap_or_default();
    let alias_count = if aliases.is_empty() {
        0
    } else {
        aliases.split(',').count() as i64
    };
    CallData {
        callsign: info.call.to_ascii_uppercase(),
        query_callsign: query.to_owned(),
        origin: CallOrigin::Qrz,
        first_name: info.fname.unwrap_or_default(),
        last_name: info.name.unwrap_or_default(),
        aliases,
        alias_count,
        address1: info.addr1.unwrap_or_default(),
        address_attn: info.attn.unwrap_or_default(),
        address2: info.addr2.unwrap_or_default(),
        state: info.state.unwrap_or_default(),
        zip: info.zip.unwrap_or_default(),
        county: info.county.unwrap_or_default(),
        country: info.country.unwrap_or_default(),
        country_code: info.ccode.unwrap_or_default(),
        fips: info.fips.unwrap_or_default(),
        grid: info.grid.map(|g| g.to_ascii_uppercase()).unwrap_or_default(),
        latitude: info.lat.unwrap_or_default(),
        longitude: info.lon.unwrap_or_default(),
        opclass: info.class.unwrap_or_default(),
        codes: info.codes.unwrap_or_default(),
        license_effective: info.efdate.as_deref().and_then(date_to_epoch).unwrap_or(0),
        license_expiry: info.expdate.as_deref().and_then(date_to_epoch).unwrap_or(0),
        dxcc: info.dxcc.unwrap_or_default(),
        email: info.email.unwrap_or_default(),
        qrz_views: info.u_views.unwrap_or_default(),
        cached: false,
        cache_fetched: 0,
        cache_expiry: 0,
    }
}

/// QRZ license dates are `YYYY-MM-DD`; convert to epoch seconds at UTC
/// midnight.
fn date_to_epoch(s: &str) -> Option<i64> {
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<QRZDatabase version="1.34">
  <Session>
    <Key>2331uf894c4bd29f3923f3bacf02c532d7bd9</Key>
    <Count>123</Count>
    <SubExp>Wed Jan 1 12:34:03 2031</SubExp>
    <GMTime>Sun Aug 16 03:51:47 2026</GMTime>
  </Session>
</QRZDatabase>"#;

    const LOOKUP_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<QRZDatabase version="1.34">
  <Callsign>
    <call>W1AW</call>
    <aliases>AX1AW,W1INF</aliases>
    <dxcc>291</dxcc>
    <fname>ARRL HQ</fname>
    <name>Operators Club</name>
    <addr1>225 Main St</addr1>
    <addr2>Newington</addr2>
    <state>CT</state>
    <zip>06111</zip>
    <country>United States</country>
    <ccode>271</ccode>
    <lat>41.714775</lat>
    <lon>-72.727260</lon>
    <grid>FN31pr</grid>
    <county>Hartford</county>
    <fips>09003</fips>
    <class>C</class>
    <email>w1aw@example.org</email>
    <u_views>115336</u_views>
    <efdate>2020-12-08</efdate>
    <expdate>2031-02-26</expdate>
  </Callsign>
  <Session>
    <Key>2331uf894c4bd29f3923f3bacf02c532d7bd9</Key>
  </Session>
</QRZDatabase>"#;

    const ERROR_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<QRZDatabase version="1.34">
  <Session>
    <Error>Not found: XX9XXX</Error>
  </Session>
</QRZDatabase>"#;

    #[test]
    fn parses_session_document() {
        let doc: QrzDatabase = quick_xml::de::from_str(SESSION_XML).unwrap();
        let session = doc.session.unwrap();
        assert_eq!(
            session.key.as_deref(),
            Some("2331uf894c4bd29f3923f3bacf02c532d7bd9")
        );
        assert!(session.error.is_none());
        assert!(doc.callsign.is_none());
    }

    #[test]
    fn parses_callsign_document() {
        let doc: QrzDatabase = quick_xml::de::from_str(LOOKUP_XML).unwrap();
        let record = calldata_from_qrz(doc.callsign.unwrap(), "w1aw");
        assert_eq!(record.callsign, "W1AW");
        assert_eq!(record.query_callsign, "w1aw");
        assert_eq!(record.origin, CallOrigin::Qrz);
        assert_eq!(record.first_name, "ARRL HQ");
        assert_eq!(record.alias_count, 2);
        assert_eq!(record.grid, "FN31PR");
        assert_eq!(record.country_code, 271);
        assert_eq!(record.dxcc, 291);
        assert!((record.latitude - 41.714775).abs() < 1e-9);
        assert_eq!(record.license_effective, 1607385600);
        assert!(record.license_expiry > record.license_effective);
        assert!(!record.cached);
    }

    #[test]
    fn parses_error_document() {
        let doc: QrzDatabase = quick_xml::de::from_str(ERROR_XML).unwrap();
        let session = doc.session.unwrap();
        assert_eq!(session.error.as_deref(), Some("Not found: XX9XXX"));
        assert!(doc.callsign.is_none());
    }

    #[test]
    fn license_date_conversion() {
        assert_eq!(date_to_epoch("1970-01-01"), Some(0));
        assert_eq!(date_to_epoch("2020-12-08"), Some(1607385600));
        assert_eq!(date_to_epoch("not-a-date"), None);
    }
}
