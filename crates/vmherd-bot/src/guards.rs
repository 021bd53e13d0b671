//! Admission checks that run before a command handler. Evaluated as an
//! ordered list; the first deny short-circuits dispatch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use vmherd_storage::VmStore;

use crate::config::LimitsConfig;

/// Result of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
}

/// Sliding one-minute command budget per user, computed from the usage
/// ledger on every check. Owners and excluded commands bypass the count;
/// a ledger read failure fails open.
pub struct RateLimiter {
    store: Arc<VmStore>,
    max_per_minute: u64,
    excluded: HashSet<String>,
}

impl RateLimiter {
    pub fn new(store: Arc<VmStore>, limits: &LimitsConfig) -> Self {
        Self {
            store,
            max_per_minute: limits.max_commands_per_minute,
            excluded: limits
                .rate_limit_excluded_commands
                .iter()
                .cloned()
                .collect(),
        }
    }

    pub async fn admit(&self, user_id: &str, command_name: &str, is_owner: bool) -> Admission {
        if is_owner {
            return Admission::Allowed;
        }
        if self.excluded.contains(command_name) {
            return Admission::Allowed;
        }
        let since = Utc::now() - Duration::seconds(60);
        match self.store.count_usage_since(user_id, since).await {
            Ok(count) if count >= self.max_per_minute => {
                tracing::info!(
                    user = user_id,
                    command = command_name,
                    count,
                    "Rate limited"
                );
                Admission::Denied
            }
            Ok(_) => Admission::Allowed,
            Err(e) => {
                // Fail open on storage errors.
                tracing::warn!(user = user_id, error = %e, "Rate limit check failed, allowing");
                Admission::Allowed
            }
        }
    }
}
