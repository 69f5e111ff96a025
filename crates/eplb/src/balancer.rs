//! Expert load balancer
//!
//! Owns the active [`ExpertMapping`] and the load window feeding it.
//! [`ExpertLoadBalancer::rebalance`] is the only way the mapping changes: it
//! builds a complete replacement and swaps it in with a single pointer
//! store, so readers holding the previous `Arc` keep a consistent view.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use shardload_core::{BalancerConfig, Capabilities};

use crate::error::{EplbError, Result};
use crate::mapping::ExpertMapping;
use crate::metrics::{imbalance_ratio, EplbMetrics};
use crate::policy::{policy_from_config, RebalancePolicy};

pub struct ExpertLoadBalancer {
    num_layers: usize,
    num_logical: usize,
    num_physical: usize,
    policy: Arc<dyn RebalancePolicy>,
    metrics: EplbMetrics,
    mapping: RwLock<Option<Arc<ExpertMapping>>>,
}

impl ExpertLoadBalancer {
    pub fn new(
        num_layers: usize,
        num_logical: usize,
        num_physical: usize,
        window_size: usize,
        policy: Arc<dyn RebalancePolicy>,
    ) -> Result<Self> {
        if num_layers == 0 || num_logical == 0 {
            return Err(EplbError::InvalidInput(
                "num_layers and num_logical must be positive".to_string(),
            ));
        }
        if num_physical < num_logical {
            return Err(EplbError::InvalidInput(format!(
                "num_physical ({}) must be >= num_logical ({})",
                num_physical, num_logical
            )));
        }
        if window_size == 0 {
            return Err(EplbError::InvalidInput("window_size must be positive".to_string()));
        }

        tracing::debug!(
            num_layers,
            num_logical,
            num_physical,
            window_size,
            policy = policy.name(),
            "Created expert load balancer"
        );
        Ok(Self {
            num_layers,
            num_logical,
            num_physical,
            policy,
            metrics: EplbMetrics::new(window_size, num_layers, num_physical),
            mapping: RwLock::new(None),
        })
    }

    /// Window size and policy taken from `config`
    pub fn from_config(
        num_layers: usize,
        num_logical: usize,
        num_physical: usize,
        config: &BalancerConfig,
        caps: Capabilities,
    ) -> Result<Self> {
        Self::new(
            num_layers,
            num_logical,
            num_physical,
            config.window_size,
            policy_from_config(config, caps),
        )
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn num_logical(&self) -> usize {
        self.num_logical
    }

    pub fn num_physical(&self) -> usize {
        self.num_physical
    }

    pub fn policy(&self) -> &dyn RebalancePolicy {
        self.policy.as_ref()
    }

    pub fn metrics(&self) -> &EplbMetrics {
        &self.metrics
    }

    /// Record one pass of per-physical loads for `layer`
    pub fn record_load(&self, layer: usize, loads: &[f64]) -> Result<()> {
        self.metrics.record(layer, loads)
    }

    pub fn advance_window(&self) {
        self.metrics.advance();
    }

    /// Mean load per layer and physical slot over the window
    pub fn average_load(&self) -> Vec<Vec<f64>> {
        self.metrics.average()
    }

    /// The active mapping, `None` before the first rebalance
    pub fn current_mapping(&self) -> Option<Arc<ExpertMapping>> {
        self.mapping.read().clone()
    }

    /// Per-logical loads from the window, folded through the active mapping
    ///
    /// Without a mapping, physical slot `p < num_logical` is taken to serve
    /// logical expert `p` and the remaining slots are ignored.
    pub fn logical_load(&self) -> Vec<Vec<f64>> {
        let average = self.average_load();
        let mapping = self.current_mapping();

        average
            .iter()
            .enumerate()
            .map(|(layer, row)| {
                let mut logical = vec![0.0; self.num_logical];
                for (phy, load) in row.iter().enumerate() {
                    let owner = match &mapping {
                        Some(m) => m.logical_of(layer, phy),
                        None => (phy < self.num_logical).then_some(phy),
                    };
                    if let Some(log) = owner {
                        logical[log] += load;
                    }
                }
                logical
            })
            .collect()
    }

    /// Compute and install a new mapping
    ///
    /// `weight` is `[num_layers][num_logical]`; `None` derives it from the
    /// load window.
    pub fn rebalance(&self, weight: Option<Vec<Vec<f64>>>) -> Result<Arc<ExpertMapping>> {
        let started = Instant::now();
        let weight = match weight {
            Some(w) => {
                if w.len() != self.num_layers || w.iter().any(|row| row.len() != self.num_logical) {
                    return Err(EplbError::InvalidInput(format!(
                        "weight must be {} x {}",
                        self.num_layers, self.num_logical
                    )));
                }
                w
            }
            None => self.logical_load(),
        };

        let mapping = self.policy.rebalance(&weight, self.num_physical)?;
        if mapping.num_layers() != self.num_layers
            || mapping.num_logical() != self.num_logical
            || mapping.num_physical() != self.num_physical
            || !mapping.is_fully_used()
        {
            return Err(EplbError::InvalidMapping(format!(
                "policy {} produced a {}x{} mapping, expected {}x{} with every slot used",
                self.policy.name(),
                mapping.num_layers(),
                mapping.num_physical(),
                self.num_layers,
                self.num_physical
            )));
        }
        mapping.validate()?;

        let mapping = Arc::new(mapping);
        *self.mapping.write() = Some(mapping.clone());
        self.metrics.snapshot(mapping.clone());

        tracing::info!(
            policy = self.policy.name(),
            layers = self.num_layers,
            num_physical = self.num_physical,
            rebalances = self.metrics.rebalance_count(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Installed expert mapping"
        );
        Ok(mapping)
    }

    /// Install a mapping computed elsewhere, e.g. loaded from disk
    pub fn install(&self, mapping: ExpertMapping) -> Result<Arc<ExpertMapping>> {
        if mapping.num_layers() != self.num_layers
            || mapping.num_logical() != self.num_logical
            || mapping.num_physical() != self.num_physical
        {
            return Err(EplbError::InvalidMapping("mapping dimensions do not match balancer".to_string()));
        }
        mapping.validate()?;
        let mapping = Arc::new(mapping);
        *self.mapping.write() = Some(mapping.clone());
        self.metrics.snapshot(mapping.clone());
        Ok(mapping)
    }

    /// Per-layer max/min ratio of nonzero average loads
    pub fn imbalance(&self) -> Vec<f64> {
        self.average_load().iter().map(|row| imbalance_ratio(row)).collect()
    }

    /// Whether any layer's imbalance exceeds `threshold`
    pub fn needs_rebalance(&self, threshold: f64) -> bool {
        self.imbalance().iter().any(|&ratio| ratio > threshold)
    }

    pub fn rebalance_count(&self) -> u64 {
        self.metrics.rebalance_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::DefaultPolicy;

    fn balancer(layers: usize, logical: usize, physical: usize) -> ExpertLoadBalancer {
        ExpertLoadBalancer::new(layers, logical, physical, 2, Arc::new(DefaultPolicy::default())).unwrap()
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        let policy: Arc<dyn RebalancePolicy> = Arc::new(DefaultPolicy::default());
        assert!(ExpertLoadBalancer::new(0, 4, 4, 1, policy.clone()).is_err());
        assert!(ExpertLoadBalancer::new(1, 4, 3, 1, policy.clone()).is_err());
        assert!(ExpertLoadBalancer::new(1, 4, 4, 0, policy).is_err());
    }

    #[test]
    fn test_first_rebalance_assumes_identity() {
        let b = balancer(1, 4, 6);
        assert!(b.current_mapping().is_none());
        b.record_load(0, &[10.0, 1.0, 1.0, 1.0, 0.0, 0.0]).unwrap();

        let m = b.rebalance(None).unwrap();
        assert_eq!(m.replica_count()[0], vec![3, 1, 1, 1]);
        assert_eq!(b.rebalance_count(), 1);
        assert!(Arc::ptr_eq(&b.current_mapping().unwrap(), &m));
    }

    #[test]
    fn test_logical_load_folds_replicas() {
        let b = balancer(1, 2, 3);
        b.install(ExpertMapping::from_phy_to_log(vec![vec![Some(0), Some(1), Some(0)]], 2).unwrap())
            .unwrap();
        b.record_load(0, &[2.0, 4.0, 6.0]).unwrap();
        b.advance_window();
        b.record_load(0, &[2.0, 4.0, 6.0]).unwrap();

        assert_eq!(b.logical_load(), vec![vec![8.0, 4.0]]);
    }

    #[test]
    fn test_explicit_weight_shape_checked() {
        let b = balancer(2, 2, 2);
        assert!(b.rebalance(Some(vec![vec![1.0, 1.0]])).is_err());
        assert!(b.rebalance(Some(vec![vec![1.0, 1.0]; 2])).is_ok());
    }

    #[test]
    fn test_rebalance_is_idempotent() {
        let b = balancer(2, 4, 7);
        let weight = vec![vec![5.0, 2.0, 2.0, 9.0], vec![1.0, 1.0, 1.0, 1.0]];
        let first = b.rebalance(Some(weight.clone())).unwrap();
        let second = b.rebalance(Some(weight)).unwrap();
        assert_eq!(*first, *second);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_imbalance_and_threshold() {
        let b = balancer(2, 4, 4);
        b.record_load(0, &[10.0, 10.0, 10.0, 1.0]).unwrap();
        b.record_load(1, &[5.0; 4]).unwrap();
        assert_eq!(b.imbalance(), vec![10.0, 1.0]);
        assert!(b.needs_rebalance(2.0));
        assert!(!b.needs_rebalance(10.0));
    }

    #[test]
    fn test_install_checks_dimensions() {
        let b = balancer(1, 2, 2);
        assert!(b.install(ExpertMapping::identity(2, 2)).is_err());
        assert!(b.install(ExpertMapping::identity(1, 2)).is_ok());
    }
}
