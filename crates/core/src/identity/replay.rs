use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::domain::identity::AgentId;

const PRUNE_THRESHOLD: usize = 4096;

/// Remembers accepted nonces until the credential carrying them expires.
#[derive(Debug, Default)]
pub(super) struct ReplayGuard {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl ReplayGuard {
    /// Returns false when the nonce was already accepted for this agent.
    pub(super) fn register(
        &self,
        agent_id: &AgentId,
        nonce: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };
        if seen.len() >= PRUNE_THRESHOLD {
            seen.retain(|_, expiry| *expiry >= now);
        }

        let key = format!("{agent_id}:{nonce}");
        match seen.get(&key) {
            Some(expiry) if *expiry >= now => false,
            _ => {
                seen.insert(key, expires_at);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::ReplayGuard;
    use crate::domain::identity::AgentId;

    #[test]
    fn nonces_are_scoped_per_agent() {
        let guard = ReplayGuard::default();
        let now = Utc::now();
        let expiry = now + Duration::minutes(5);

        assert!(guard.register(&AgentId("a".to_owned()), "n", expiry, now));
        assert!(!guard.register(&AgentId("a".to_owned()), "n", expiry, now));
        assert!(guard.register(&AgentId("b".to_owned()), "n", expiry, now));
    }
}
