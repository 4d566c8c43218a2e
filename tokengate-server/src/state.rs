//! State shared by every request handler

use tokengate::{Decision, RateLimiter};
use tokio_util::sync::CancellationToken;
use crate::{
    backend::Backend,
    driver::LoadDriver,
    events::DecisionBus,
    settings::ServerSettings,
    stats::StatsRegistry,
};

/// Rate limiter together with everything that observes its decisions.
#[derive(Debug)]
pub struct AppState {
    limiter: RateLimiter<Backend>,
    stats: StatsRegistry,
    bus: DecisionBus,
    driver: LoadDriver,
    shutdown: CancellationToken,
    settings: ServerSettings,
}

impl AppState {
    /// Creates the state over `backend`.
    pub fn new(backend: Backend, settings: ServerSettings, shutdown: CancellationToken) -> Self {
        Self {
            limiter: RateLimiter::new(backend),
            stats: StatsRegistry::new(),
            bus: DecisionBus::new(settings.event_capacity),
            driver: LoadDriver::new(shutdown.clone()),
            shutdown,
            settings,
        }
    }

    /// Checks a request of `client_id`, then counts and publishes the decision.
    pub async fn check(&self, client_id: &str) -> tokengate::Result<Decision> {
        let decision = self.limiter.check(client_id).await?;
        self.stats.record(client_id, decision.allowed);
        self.bus.publish(client_id, decision);
        Ok(decision)
    }

    /// The rate limiter.
    #[inline(always)]
    pub fn limiter(&self) -> &RateLimiter<Backend> {
        &self.limiter
    }

    /// Request counters.
    #[inline(always)]
    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    /// Decision feed.
    #[inline(always)]
    pub fn bus(&self) -> &DecisionBus {
        &self.bus
    }

    /// Synthetic load driver.
    #[inline(always)]
    pub fn driver(&self) -> &LoadDriver {
        &self.driver
    }

    /// Cancelled when the server shuts down.
    #[inline(always)]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Settings the server was started with.
    #[inline(always)]
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokengate::{BucketPolicy, LocalBucketStore};

    #[tokio::test]
    async fn check_records_and_publishes() {
        let backend = Backend::Local(LocalBucketStore::new(BucketPolicy { capacity: 1, refill_rate: 1 }).unwrap());
        let state = AppState::new(backend, ServerSettings::default(), CancellationToken::new());
        let mut events = state.bus().subscribe();

        assert!(state.check("c1").await.unwrap().allowed);
        assert!(!state.check("c1").await.unwrap().allowed);

        assert_eq!(state.stats().counts("c1"), Some((2, 1)));
        assert!(events.recv().await.unwrap().decision.allowed);
        assert!(!events.recv().await.unwrap().decision.allowed);
    }
}
