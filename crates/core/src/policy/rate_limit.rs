use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::identity::AgentId;
use crate::errors::AdmissionError;

#[derive(Debug, Default)]
struct RateLimitEntry {
    requests: Vec<Instant>,
}

impl RateLimitEntry {
    /// Drops requests outside the window and records this one.
    fn record_request(&mut self, now: Instant, window: Duration) -> usize {
        self.requests.retain(|&at| now.saturating_duration_since(at) < window);
        self.requests.push(now);
        self.requests.len()
    }

    fn retry_after(&self, now: Instant, window: Duration) -> Duration {
        self.requests
            .first()
            .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or(window)
    }
}

/// Sliding-window admission limiter, keyed per agent.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    entries: Mutex<HashMap<AgentId, RateLimitEntry>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self { window, entries: Mutex::new(HashMap::new()) }
    }

    /// Admits the request when the agent is under `limit` requests in the
    /// current window. A limit of zero disables the check. Returns the
    /// remaining allowance.
    pub async fn check(&self, agent_id: &AgentId, limit: u32) -> Result<u32, AdmissionError> {
        if limit == 0 {
            return Ok(u32::MAX);
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(agent_id.clone()).or_default();
        let count = entry.record_request(now, self.window);
        let limit_usize = usize::try_from(limit).unwrap_or(usize::MAX);

        if count > limit_usize {
            entry.requests.pop();
            let retry_after_secs = entry.retry_after(now, self.window).as_secs().max(1);
            warn!(
                event_name = "admission.rate_limited",
                agent_id = %agent_id,
                request_count = count,
                limit,
                "rate limit exceeded"
            );
            return Err(AdmissionError::RateLimited { retry_after_secs });
        }

        let remaining = u32::try_from(limit_usize - count).unwrap_or(0);
        debug!(agent_id = %agent_id, remaining, "request admitted");
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RateLimiter;
    use crate::domain::identity::AgentId;
    use crate::errors::AdmissionError;

    #[tokio::test]
    async fn requests_beyond_the_limit_are_refused() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let agent = AgentId("agent-1".to_owned());

        assert_eq!(limiter.check(&agent, 2).await, Ok(1));
        assert_eq!(limiter.check(&agent, 2).await, Ok(0));
        assert!(matches!(
            limiter.check(&agent, 2).await,
            Err(AdmissionError::RateLimited { retry_after_secs }) if retry_after_secs >= 1
        ));
        assert_eq!(limiter.check(&AgentId("agent-2".to_owned()), 2).await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_forward() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let agent = AgentId("agent-1".to_owned());

        assert!(limiter.check(&agent, 1).await.is_ok());
        assert!(limiter.check(&agent, 1).await.is_err());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.check(&agent, 1).await.is_ok());
    }

    #[tokio::test]
    async fn zero_limit_is_unlimited() {
        let limiter = RateLimiter::default();
        let agent = AgentId("agent-1".to_owned());
        for _ in 0..100 {
            assert!(limiter.check(&agent, 0).await.is_ok());
        }
    }
}
