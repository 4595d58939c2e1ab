//! Runtime lifecycle: background tasks and graceful shutdown.

use super::{builder::ProxydRuntimeBuilder, ProxydComponents};
use crate::{cache::LvcPoller, config::AppConfig, proxy::ProxyEngine};
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Upper bound on waiting for a background task after the shutdown signal.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the components and their background tasks.
///
/// Background tasks (the rate limiter's reset or refresh task and the optional LVC poller)
/// listen on a broadcast channel and stop when [`ProxydRuntime::shutdown`] is called.
pub struct ProxydRuntime {
    components: ProxydComponents,
    shutdown_tx: broadcast::Sender<()>,
    config: AppConfig,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ProxydRuntime {
    #[must_use]
    pub fn builder() -> ProxydRuntimeBuilder {
        ProxydRuntimeBuilder::new()
    }

    pub(super) fn new(
        components: ProxydComponents,
        shutdown_tx: broadcast::Sender<()>,
        config: AppConfig,
        lvc_poller: Option<Arc<LvcPoller>>,
    ) -> Self {
        let mut tasks = Vec::new();

        tasks.push(("rate_limiter", components.limiter().start_background_task(shutdown_tx.subscribe())));
        debug!("rate limiter task started");

        if let Some(poller) = lvc_poller {
            tasks.push(("lvc_poller", poller.start(shutdown_tx.subscribe())));
            debug!("lvc poller task started");
        }

        Self { components, shutdown_tx, config, tasks }
    }

    #[must_use]
    pub fn components(&self) -> &ProxydComponents {
        &self.components
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn proxy_engine(&self) -> &Arc<ProxyEngine> {
        self.components.proxy_engine()
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stops the background tasks, then removes this replica's WebSocket connection counts
    /// from the shared store.
    pub async fn shutdown(self) {
        info!("initiating proxyd runtime shutdown");
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!(error = %e, "failed to send shutdown signal (no receivers)");
        }

        for (name, task) in self.tasks {
            match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(task = name, "background task completed"),
                Ok(Err(e)) if e.is_cancelled() => debug!(task = name, "background task cancelled"),
                Ok(Err(e)) => error!(task = name, error = %e, "background task failed"),
                Err(_) => warn!(task = name, "background task did not stop in time"),
            }
        }

        let names: Vec<String> =
            self.components.backends().iter().map(|backend| backend.name().to_string()).collect();
        if let Err(e) = self.components.limiter().as_rate_limiter().flush_backend_ws_conns(&names).await {
            error!(error = %e, "failed to flush backend websocket connection counts");
        }

        info!("proxyd runtime shutdown complete");
    }
}

const _: () = {
    const fn assert_send<T: Send>() {}
    const fn assert_sync<T: Sync>() {}
    let _ = assert_send::<ProxydRuntime>;
    let _ = assert_sync::<ProxydRuntime>;
};
