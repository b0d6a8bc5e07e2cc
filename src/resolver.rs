//! Tiered callsign resolution: cache first, then each configured source in
//! priority order.

use std::sync::Arc;

use metrics::{counter, describe_counter};
use tracing::{debug, error, info, warn};

use crate::cache::CallsignCache;
use crate::calldata::CallData;
use crate::sources::{CallsignSource, SessionExpired};

/// Resolves callsigns across the cache and an ordered list of sources,
/// tracking the online/offline state of session-based sources.
pub struct Resolver {
    cache: Option<CallsignCache>,
    sources: Vec<Arc<dyn CallsignSource>>,

    /// True until a session-based source logs in.
    offline: bool,
    session_active: bool,
    /// When we last tried to go online; 0 means never.
    online_last_retry: i64,
    retry_delay: i64,

    requests_answered: i64,
    /// Exit after answering this many requests; 0 disables.
    max_requests: i64,
    exit_requested: bool,
}

impl Resolver {
    pub fn new(
        cache: Option<CallsignCache>,
        sources: Vec<Arc<dyn CallsignSource>>,
        retry_delay: i64,
        max_requests: i64,
    ) -> Resolver {
        describe_counter!(
            "callsign.lookups.total",
            "Callsign lookups answered, by origin"
        );

        Resolver {
            cache,
            sources,
            offline: true,
            session_active: false,
            online_last_retry: 0,
            retry_delay,
            max_requests,
            requests_answered: 0,
            exit_requested: false,
        }
    }

    pub fn offline(&self) -> bool {
        self.offline
    }

    /// Set once the `max_requests` bound trips; the loop exits after the
    /// current response is written.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn cache(&self) -> Option<&CallsignCache> {
        self.cache.as_ref()
    }

    /// While offline, try to log session-based sources in, rate limited by
    /// the retry delay. Runs on every lookup, whether or not the cache
    /// already answered it.
    async fn retry_sessions(&mut self, now: i64) {
        if !self.offline {
            return;
        }
        let candidates: Vec<_> = self
            .sources
            .iter()
            .filter(|s| s.requires_session())
            .cloned()
            .collect();
        for source in candidates {
            if self.session_active {
                continue;
            }
            if self.online_last_retry != 0 && self.online_last_retry + self.retry_delay > now {
                continue;
            }
            self.online_last_retry = now;
            match source.start_session().await {
                Ok(true) => {
                    info!("{} session established, clearing offline mode", source.tag());
                    self.session_active = true;
                    self.offline = false;
                }
                Ok(false) => {
                    error!(
                        "Failed logging into {}, setting offline mode!",
                        source.tag()
                    );
                }
                Err(err) => {
                    error!(
                        "Failed logging into {}: {:#}, setting offline mode!",
                        source.tag(),
                        err
                    );
                }
            }
        }
    }

    /// Resolve `callsign`. `use_cache = false` skips the cache read (the
    /// `/CALL ... NOCACHE` form) but a fresh result is still persisted.
    pub async fn lookup(&mut self, callsign: &str, now: i64, use_cache: bool) -> Option<CallData> {
        let mut from_cache = false;
        let mut record: Option<CallData> = None;

        if use_cache {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.find(callsign, self.offline, now).await {
                    debug!("got cached calldata for {}", callsign);
                    from_cache = true;
                    record = Some(hit);
                }
            }
        }

        self.retry_sessions(now).await;

        for source in &self.sources {
            if record.is_some() {
                break;
            }
            if source.requires_session() && (self.offline || !self.session_active) {
                continue;
            }
            match source.lookup(callsign).await {
                Ok(Some(data)) => {
                    debug!("got {} calldata for {}", source.tag(), callsign);
                    record = Some(data);
                }
                Ok(None) => {}
                Err(err) if err.downcast_ref::<SessionExpired>().is_some() => {
                    // The session died mid-life; go back offline so the
                    // retry schedule logs in again.
                    error!(
                        "{} session expired, setting offline mode until the next retry",
                        source.tag()
                    );
                    self.session_active = false;
                    self.offline = true;
                }
                Err(err) => {
                    warn!("{} lookup for {} failed: {:#}", source.tag(), callsign, err);
                }
            }
        }

        let mut record = match record {
            Some(record) => record,
            None => {
                warn!("no matches found for callsign {}", callsign);
                return None;
            }
        };
        record.query_callsign = callsign.to_owned();

        // Only save it in the cache if it did not come from there already.
        if !from_cache {
            if let Some(cache) = &self.cache {
                debug!("adding new item ({}) to cache", callsign);
                cache.save(&mut record, now).await;
            }
        }

        counter!("callsign.lookups.total", 1, "origin" => record.origin.as_str());
        self.requests_answered += 1;
        if self.max_requests > 0 && self.requests_answered >= self.max_requests {
            error!(
                "answered {} of {} allowed requests, exiting",
                self.requests_answered, self.max_requests
            );
            self.exit_requested = true;
        }
        Some(record)
    }
}
