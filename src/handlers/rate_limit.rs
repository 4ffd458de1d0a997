//! Rate limiting per client key.
//!
//! Most clients that hammer the server do so because they dislike the
//! answer; the effective cure is silence, so an over-limit client gets a
//! `CannotRespond` instead of an error reply. The token buckets live in a
//! map shared by all workers and touched only under a short lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::bundle::TransactionBundle;
use crate::config::RateLimitKey;
use crate::handlers::static_assign::identifier_keys;
use crate::handlers::{Handler, HandlerError, HandlerResult};

/// Token buckets keyed by client identity, shared across workers.
pub struct RateLimitCounters {
    rate: f64,
    per: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    allowance: f64,
    last_check: Instant,
}

impl RateLimitCounters {
    pub fn new(rate: u32, per: u32, burst: Option<u32>) -> Self {
        Self {
            rate: rate as f64,
            per: per as f64,
            burst: burst.unwrap_or(rate) as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Check-and-decrement: whether a request under `key` is allowed now.
    pub fn check_request(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            allowance: self.burst,
            last_check: now,
        });

        let elapsed = now.duration_since(bucket.last_check).as_secs_f64();
        bucket.last_check = now;
        bucket.allowance = (bucket.allowance + elapsed * self.rate / self.per).min(self.burst);

        if bucket.allowance < 1.0 {
            false
        } else {
            bucket.allowance -= 1.0;
            true
        }
    }
}

pub struct RateLimitHandler {
    key: RateLimitKey,
    counters: std::sync::Arc<RateLimitCounters>,
}

impl RateLimitHandler {
    pub fn new(key: RateLimitKey, counters: std::sync::Arc<RateLimitCounters>) -> Self {
        Self { key, counters }
    }

    /// The identity to rate-limit on, falling back to the client DUID when
    /// the configured relay-side identifier is absent.
    fn key_for(&self, bundle: &TransactionBundle) -> Option<String> {
        let duid_key = bundle
            .request
            .as_ref()
            .and_then(|request| request.client_id())
            .map(|duid| format!("duid:{}", duid.hex()));

        let wanted_prefix = match self.key {
            RateLimitKey::Duid => return duid_key,
            RateLimitKey::InterfaceId => "interface-id:",
            RateLimitKey::RemoteId => "remote-id:",
            RateLimitKey::SubscriberId => "subscriber-id:",
            RateLimitKey::LinklayerId => "linklayer-id:",
        };

        identifier_keys(bundle)
            .into_iter()
            .find(|key| key.starts_with(wanted_prefix))
            .or(duid_key)
    }
}

impl Handler for RateLimitHandler {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn pre(&mut self, bundle: &mut TransactionBundle) -> HandlerResult {
        let Some(key) = self.key_for(bundle) else {
            return Ok(());
        };

        if !self.counters.check_request(&key) {
            return Err(HandlerError::CannotRespond(format!(
                "client {} has exceeded its rate limit",
                key
            )));
        }

        Ok(())
    }
}

/// How many rate-limit sections a config document contains, in document
/// order; the shared counter states are allocated from this.
pub fn rate_limit_configs(config: &crate::config::Config) -> Vec<(u32, u32, Option<u32>)> {
    config
        .all_handlers()
        .iter()
        .filter_map(|handler| match handler {
            crate::config::HandlerConfig::RateLimit {
                rate, per, burst, ..
            } => Some((*rate, *per, *burst)),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn burst_then_refill() {
        let counters = RateLimitCounters::new(5, 30, Some(2));

        assert!(counters.check_request("duid:aa"));
        assert!(counters.check_request("duid:aa"));
        // burst exhausted
        assert!(!counters.check_request("duid:aa"));
        // other clients are unaffected
        assert!(counters.check_request("duid:bb"));
    }
}
