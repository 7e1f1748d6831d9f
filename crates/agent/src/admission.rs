use std::sync::Arc;
use std::time::Duration;

use helmsman_core::config::AdmissionConfig;
use helmsman_core::errors::{RateLimitError, RateLimitType};
use helmsman_core::fingerprint::{dedup_key, user_limit_key};
use helmsman_core::store::AtomicStore;
use tracing::{info, warn};

/// Decides whether an inbound message is processed at all.
///
/// Store failures never block a user: every check fails open and logs.
pub struct AdmissionController {
    store: Arc<dyn AtomicStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn AtomicStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    /// Duplicate check, then limit check, then record.
    pub async fn admit(
        &self,
        user_id: &str,
        channel_id: &str,
        thread_id: &str,
        text: &str,
    ) -> Result<(), RateLimitError> {
        self.check_duplicate(user_id, channel_id, thread_id, text).await?;
        self.check_limit(user_id).await?;
        self.record(user_id).await;
        Ok(())
    }

    pub async fn check_duplicate(
        &self,
        user_id: &str,
        channel_id: &str,
        thread_id: &str,
        text: &str,
    ) -> Result<(), RateLimitError> {
        let key = dedup_key(user_id, channel_id, thread_id, text);
        let ttl = Duration::from_secs(self.config.dedup_ttl_secs);

        match self.store.set_if_absent(&key, "1", ttl).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                info!(
                    event_name = "admission.duplicate_dropped",
                    user_id,
                    channel_id,
                    thread_id,
                    "duplicate message dropped"
                );
                Err(RateLimitError::new(RateLimitType::Duplicate, self.config.dedup_ttl_secs))
            }
            Err(error) => {
                warn!(
                    event_name = "admission.store_unavailable",
                    check = "duplicate",
                    user_id,
                    error = %error,
                    "admission store failed; admitting message"
                );
                Ok(())
            }
        }
    }

    /// Reads the counter without touching it.
    pub async fn check_limit(&self, user_id: &str) -> Result<(), RateLimitError> {
        let key = user_limit_key(user_id);
        let count = match self.store.get(&key).await {
            Ok(Some(raw)) => raw.trim().parse::<i64>().unwrap_or(0),
            Ok(None) => 0,
            Err(error) => {
                warn!(
                    event_name = "admission.store_unavailable",
                    check = "user_limit",
                    user_id,
                    error = %error,
                    "admission store failed; admitting message"
                );
                return Ok(());
            }
        };

        if count < i64::from(self.config.user_max_requests) {
            return Ok(());
        }

        let retry_after_secs = match self.store.ttl(&key).await {
            Ok(Some(remaining)) => ceil_secs(remaining),
            _ => self.config.user_window_secs,
        };
        info!(
            event_name = "admission.user_throttled",
            user_id,
            count,
            max_requests = self.config.user_max_requests,
            retry_after_secs,
            "user exceeded request window"
        );
        Err(RateLimitError::new(RateLimitType::User, retry_after_secs))
    }

    /// Counts one admitted request. The window starts at the first request.
    pub async fn record(&self, user_id: &str) {
        let key = user_limit_key(user_id);
        let count = match self.store.incr(&key).await {
            Ok(count) => count,
            Err(error) => {
                warn!(
                    event_name = "admission.store_unavailable",
                    check = "record",
                    user_id,
                    error = %error,
                    "failed to count request"
                );
                return;
            }
        };

        if count == 1 {
            let window = Duration::from_secs(self.config.user_window_secs);
            if let Err(error) = self.store.expire(&key, window).await {
                warn!(
                    event_name = "admission.store_unavailable",
                    check = "expire",
                    user_id,
                    error = %error,
                    "failed to start request window"
                );
            }
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    let secs = if duration.subsec_nanos() > 0 { secs + 1 } else { secs };
    secs.max(1)
}
