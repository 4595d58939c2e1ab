use super::RateLimiter;
use crate::store::CacheError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::debug;

const RPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct RpsWindow {
    started: Instant,
    count: u64,
}

/// In-process [`RateLimiter`] for single-replica deployments.
#[derive(Debug, Default)]
pub struct LocalRateLimiter {
    offline_until: DashMap<String, Instant>,
    rps: DashMap<String, RpsWindow>,
    ws_conns: DashMap<String, u64>,
}

impl LocalRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops elapsed request windows and expired quarantines once per second until shutdown.
    pub fn start_reset_task(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RPS_WINDOW);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = limiter.reset_expired();
                        if removed > 0 {
                            debug!(removed, "reset local rate limiter windows");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("local rate limiter reset task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Returns the number of entries removed.
    #[must_use]
    pub fn reset_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.rps.len() + self.offline_until.len();

        self.rps.retain(|_, window| now.duration_since(window.started) < RPS_WINDOW);
        self.offline_until.retain(|_, until| *until > now);

        before - (self.rps.len() + self.offline_until.len())
    }

    #[must_use]
    pub fn ws_conns(&self, name: &str) -> u64 {
        self.ws_conns.get(name).map_or(0, |count| *count)
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn is_backend_online(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.offline_until.get(name).is_none_or(|until| *until <= Instant::now()))
    }

    async fn set_backend_offline(&self, name: &str, duration: Duration) -> Result<(), CacheError> {
        self.offline_until.insert(name.to_string(), Instant::now() + duration);
        Ok(())
    }

    async fn inc_backend_rps(&self, name: &str) -> Result<u64, CacheError> {
        let now = Instant::now();
        let mut window = self
            .rps
            .entry(name.to_string())
            .or_insert(RpsWindow { started: now, count: 0 });

        if now.duration_since(window.started) >= RPS_WINDOW {
            *window = RpsWindow { started: now, count: 0 };
        }
        window.count += 1;
        Ok(window.count)
    }

    async fn inc_backend_ws_conns(&self, name: &str, max: u64) -> Result<bool, CacheError> {
        let mut count = self.ws_conns.entry(name.to_string()).or_insert(0);
        if max > 0 && *count >= max {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn dec_backend_ws_conns(&self, name: &str) -> Result<(), CacheError> {
        if let Some(mut count) = self.ws_conns.get_mut(name) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn flush_backend_ws_conns(&self, names: &[String]) -> Result<(), CacheError> {
        for name in names {
            self.ws_conns.remove(name);
        }
        Ok(())
    }
}
