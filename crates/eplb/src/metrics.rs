//! Sliding-window expert load metrics

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{EplbError, Result};
use crate::mapping::ExpertMapping;

/// Circular window of per-pass loads, indexed `[slot][layer][physical]`
#[derive(Debug, Clone)]
pub struct LoadWindow {
    slots: Vec<Vec<Vec<f64>>>,
    current_pass: Vec<Vec<f64>>,
    active: usize,
}

impl LoadWindow {
    pub fn new(window_size: usize, num_layers: usize, num_physical: usize) -> Self {
        let pass = vec![vec![0.0; num_physical]; num_layers];
        Self {
            slots: vec![pass.clone(); window_size.max(1)],
            current_pass: pass,
            active: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.slots.len()
    }

    pub fn active_slot(&self) -> usize {
        self.active
    }

    /// Overwrite one layer of the current pass and the active slot
    pub fn record(&mut self, layer: usize, loads: &[f64]) -> Result<()> {
        let num_layers = self.current_pass.len();
        let row = self
            .current_pass
            .get_mut(layer)
            .ok_or(EplbError::LayerOutOfRange { layer, num_layers })?;
        if loads.len() != row.len() {
            return Err(EplbError::InvalidInput(format!(
                "layer {}: {} loads for {} physical experts",
                layer,
                loads.len(),
                row.len()
            )));
        }
        if loads.iter().any(|l| !l.is_finite() || *l < 0.0) {
            return Err(EplbError::InvalidInput(format!(
                "layer {}: loads must be finite and non-negative",
                layer
            )));
        }

        row.copy_from_slice(loads);
        self.slots[self.active][layer].copy_from_slice(loads);
        Ok(())
    }

    /// Rotate to the next slot, clearing the current pass
    pub fn advance(&mut self) {
        self.active = (self.active + 1) % self.slots.len();
        for row in &mut self.current_pass {
            row.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    pub fn current_pass(&self) -> &[Vec<f64>] {
        &self.current_pass
    }

    /// Per-layer, per-physical mean across every slot
    pub fn average(&self) -> Vec<Vec<f64>> {
        let n = self.slots.len() as f64;
        let mut avg = vec![vec![0.0; self.current_pass.first().map_or(0, Vec::len)]; self.current_pass.len()];
        for slot in &self.slots {
            for (acc_row, row) in avg.iter_mut().zip(slot) {
                for (acc, v) in acc_row.iter_mut().zip(row) {
                    *acc += v;
                }
            }
        }
        for row in &mut avg {
            row.iter_mut().for_each(|v| *v /= n);
        }
        avg
    }
}

/// Load window plus a snapshot of the last installed mapping
#[derive(Debug)]
pub struct EplbMetrics {
    window: Mutex<LoadWindow>,
    mapping: RwLock<Option<Arc<ExpertMapping>>>,
    rebalances: AtomicU64,
}

impl EplbMetrics {
    pub fn new(window_size: usize, num_layers: usize, num_physical: usize) -> Self {
        Self {
            window: Mutex::new(LoadWindow::new(window_size, num_layers, num_physical)),
            mapping: RwLock::new(None),
            rebalances: AtomicU64::new(0),
        }
    }

    pub fn record(&self, layer: usize, loads: &[f64]) -> Result<()> {
        self.window.lock().record(layer, loads)
    }

    pub fn advance(&self) {
        self.window.lock().advance();
    }

    pub fn average(&self) -> Vec<Vec<f64>> {
        self.window.lock().average()
    }

    pub fn window(&self) -> LoadWindow {
        self.window.lock().clone()
    }

    pub(crate) fn snapshot(&self, mapping: Arc<ExpertMapping>) {
        *self.mapping.write() = Some(mapping);
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_mapping(&self) -> Option<Arc<ExpertMapping>> {
        self.mapping.read().clone()
    }

    pub fn rebalance_count(&self) -> u64 {
        self.rebalances.load(Ordering::Relaxed)
    }
}

/// max/min over the nonzero entries of a row, 1.0 for an all-zero row
pub fn imbalance_ratio(row: &[f64]) -> f64 {
    let mut nonzero = row.iter().copied().filter(|v| *v > 0.0);
    let Some(first) = nonzero.next() else {
        return 1.0;
    };
    let (min, max) = nonzero.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
    max / min
}
