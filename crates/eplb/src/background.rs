//! Background rebalancer
//!
//! One tokio task polls the balancer's load window every `poll_interval` and
//! rebalances at most once per `rebalance_interval`, when some layer's
//! max/min average load exceeds `load_threshold`. The result is parked as a
//! pending mapping for the serving side to pick up. Failures and panics in a
//! cycle are logged and the loop carries on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shardload_core::BalancerConfig;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balancer::ExpertLoadBalancer;
use crate::error::{EplbError, Result};
use crate::mapping::ExpertMapping;

struct Inner {
    balancer: Arc<ExpertLoadBalancer>,
    poll_interval: Duration,
    rebalance_interval: Duration,
    load_threshold: f64,
    pending: Mutex<Option<Arc<ExpertMapping>>>,
    last_attempt: Mutex<Option<Instant>>,
}

impl Inner {
    fn cooling_down(&self) -> bool {
        self.last_attempt
            .lock()
            .map_or(false, |at| at.elapsed() < self.rebalance_interval)
    }

    /// Threshold check and rebalance; runs on the blocking pool
    fn check_blocking(&self) -> Result<bool> {
        let imbalance = self.balancer.imbalance();
        let worst = imbalance.iter().copied().fold(1.0f64, f64::max);
        if worst <= self.load_threshold {
            tracing::trace!(worst, threshold = self.load_threshold, "Load within threshold");
            return Ok(false);
        }

        *self.last_attempt.lock() = Some(Instant::now());
        tracing::debug!(worst, threshold = self.load_threshold, "Load imbalance detected, rebalancing");
        let mapping = self.balancer.rebalance(None)?;
        *self.pending.lock() = Some(mapping);
        Ok(true)
    }

    async fn tick(self: &Arc<Self>) -> Result<bool> {
        if self.cooling_down() {
            return Ok(false);
        }
        let inner = self.clone();
        tokio::task::spawn_blocking(move || inner.check_blocking())
            .await
            .map_err(|e| EplbError::Task(format!("rebalance cycle aborted: {}", e)))?
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!(
            poll_ms = self.poll_interval.as_millis() as u64,
            interval_secs = self.rebalance_interval.as_secs(),
            threshold = self.load_threshold,
            "Background rebalancer started"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "Background rebalance failed");
            }
        }
        tracing::info!("Background rebalancer stopped");
    }
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic rebalancing off the serving path
pub struct BackgroundRebalancer {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

impl BackgroundRebalancer {
    pub fn new(balancer: Arc<ExpertLoadBalancer>, config: &BalancerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                balancer,
                poll_interval: config.poll_interval(),
                rebalance_interval: config.rebalance_interval(),
                load_threshold: config.load_threshold,
                pending: Mutex::new(None),
                last_attempt: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn balancer(&self) -> &Arc<ExpertLoadBalancer> {
        &self.inner.balancer
    }

    /// Spawn the loop on the current tokio runtime. No-op while running.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current()
            .map_err(|e| EplbError::Task(format!("no tokio runtime: {}", e)))?;

        let mut worker = self.worker.lock();
        if worker.as_ref().map_or(false, |w| !w.handle.is_finished()) {
            return Ok(());
        }

        let token = CancellationToken::new();
        let handle = handle.spawn(self.inner.clone().run(token.clone()));
        *worker = Some(Worker { token, handle });
        Ok(())
    }

    /// Cancel the loop and wait for it to exit. No-op when stopped.
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                tracing::warn!(error = %e, "Background rebalancer exited abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |w| !w.handle.is_finished())
    }

    /// Run one cycle now; `Ok(true)` when a new mapping was parked
    pub async fn check_and_rebalance(&self) -> Result<bool> {
        self.inner.tick().await
    }

    /// Take the parked mapping, leaving none behind
    pub fn get_pending_mapping(&self) -> Option<Arc<ExpertMapping>> {
        self.inner.pending.lock().take()
    }
}

impl Drop for BackgroundRebalancer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.token.cancel();
        }
    }
}
