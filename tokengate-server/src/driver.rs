//! Synthetic load generation

use std::{
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration
};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Client checked by the driver when a start request names none.
pub const DEFAULT_DRIVER_CLIENT: &str = "test-client";

/// Upper bound of requests per tick.
pub const MAX_TPS: u32 = 10_000;

const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// State of the load driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverStatus {
    /// Whether synthetic requests are being issued
    pub running: bool,

    /// Client the requests are issued for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Requests issued per tick
    pub tps: u32,
}

#[derive(Debug)]
struct Running {
    client_id: String,
    tps: u32,
    token: CancellationToken,
}

/// Issues a fixed number of requests for one client on every tick, until stopped.
///
/// Each request of a tick runs as its own task, so one slow check never
/// delays the others or the next tick. At most one run is active; starting
/// a new one replaces the previous.
#[derive(Debug)]
pub struct LoadDriver {
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
    tick: Duration,
}

impl LoadDriver {
    /// Creates an idle driver.
    ///
    /// Any run stops once `shutdown` is cancelled.
    #[inline]
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            running: Mutex::new(None),
            shutdown,
            tick: DEFAULT_TICK,
        }
    }

    /// Sets the tick period.
    ///
    /// Default: `1s`
    #[inline]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Starts issuing `tps` calls of `job` per tick for `client_id`.
    ///
    /// # Errors
    ///
    /// Returns [`tokengate::Error::InvalidConfiguration`] unless `1 <= tps <= MAX_TPS`.
    pub fn start<F, Fut>(&self, client_id: &str, tps: u32, job: F) -> tokengate::Result<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if tps == 0 {
            return Err(tokengate::Error::InvalidConfiguration("tps must be positive"));
        }
        if tps > MAX_TPS {
            return Err(tokengate::Error::InvalidConfiguration("tps exceeds the allowed maximum"));
        }

        let token = self.shutdown.child_token();
        let previous = self.lock().replace(Running {
            client_id: client_id.to_owned(),
            tps,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        let period = self.tick;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for _ in 0..tps {
                            tokio::spawn(job());
                        }
                    }
                }
            }
        });

        tracing::info!(client_id, tps, "load driver started");
        Ok(())
    }

    /// Stops the active run.
    ///
    /// Returns `false` if the driver was idle.
    pub fn stop(&self) -> bool {
        match self.lock().take() {
            Some(running) => {
                running.token.cancel();
                tracing::info!(client_id = %running.client_id, "load driver stopped");
                true
            }
            None => false,
        }
    }

    /// Current state of the driver.
    pub fn status(&self) -> DriverStatus {
        match self.lock().as_ref() {
            Some(running) if !running.token.is_cancelled() => DriverStatus {
                running: true,
                client_id: Some(running.client_id.clone()),
                tps: running.tps,
            },
            _ => DriverStatus { running: false, client_id: None, tps: 0 },
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LoadDriver {
    fn drop(&mut self) {
        if let Some(running) = self.lock().take() {
            running.token.cancel();
        }
    }
}
