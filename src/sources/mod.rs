//! Callsign data sources.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::{client::HttpConnector, Client};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};

use crate::calldata::CallData;
use crate::Result;

pub mod qrz;
pub mod uls;

/// A `hyper` client shared between sources.
pub type SharedHttpClient = Arc<Client<HttpsConnector<HttpConnector>>>;

pub fn shared_http_client() -> SharedHttpClient {
    // Create a shared `hyper::Client` with a connection pool, so that we can
    // use keep-alive.
    Arc::new(
        Client::builder().build(
            HttpsConnectorBuilder::new()
                .with_native_roots()
                .https_only()
                .enable_http1()
                .build(),
        ),
    )
}

/// Returned from [`CallsignSource::lookup`] when the source's session has
/// died server-side. The resolver treats this as a drop back to offline,
/// so its retry schedule establishes a fresh session.
#[derive(Debug, thiserror::Error)]
#[error("session expired")]
pub struct SessionExpired;

/// Abstract lookup interface shared by every tier behind the cache.
///
/// The resolver walks an ordered list of these, so a new source slots into
/// the pipeline without changing it.
#[async_trait]
pub trait CallsignSource: Send + Sync + 'static {
    /// A short name for this source, used in logs. Typically something
    /// like `qrz` or `uls`.
    fn tag(&self) -> &str;

    /// Whether lookups require an authenticated session first.
    fn requires_session(&self) -> bool {
        false
    }

    /// Establish a session. Sources that do not need one report success.
    async fn start_session(&self) -> Result<bool> {
        Ok(true)
    }

    /// Look up a callsign. `None` means the source has no record for it.
    async fn lookup(&self, callsign: &str) -> Result<Option<CallData>>;
}
