//! Logical-to-physical expert mapping
//!
//! A mapping is produced whole by a rebalance and never edited afterwards.
//! For every layer:
//!
//! - `phy_to_log[layer][p]` is the logical expert served by physical slot
//!   `p`, or `None` for an unused slot
//! - `log_to_phy[layer][l]` lists the physical replicas of logical expert
//!   `l` in ascending slot order, so replica 0 is the lowest slot
//! - `replica_count[layer][l]` is the length of that list

use std::fs::File;
use std::io::BufReader;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use shardload_core::{write_atomic, Capabilities};

use crate::error::{EplbError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpertMapping {
    num_logical: usize,
    phy_to_log: Vec<Vec<Option<usize>>>,
    log_to_phy: Vec<Vec<Vec<usize>>>,
    replica_count: Vec<Vec<usize>>,
}

impl ExpertMapping {
    /// Physical slot `i` serves logical expert `i` in every layer
    pub fn identity(num_layers: usize, num_experts: usize) -> Self {
        let row: Vec<Option<usize>> = (0..num_experts).map(Some).collect();
        Self::build(vec![row; num_layers], num_experts)
    }

    /// Derive the reverse index and replica counts from slot owners
    pub fn from_phy_to_log(phy_to_log: Vec<Vec<Option<usize>>>, num_logical: usize) -> Result<Self> {
        for (layer, row) in phy_to_log.iter().enumerate() {
            if let Some(bad) = row.iter().flatten().find(|&&l| l >= num_logical) {
                return Err(EplbError::InvalidMapping(format!(
                    "layer {}: logical expert {} out of range ({} logical experts)",
                    layer, bad, num_logical
                )));
            }
        }
        let mapping = Self::build(phy_to_log, num_logical);
        mapping.validate()?;
        Ok(mapping)
    }

    fn build(phy_to_log: Vec<Vec<Option<usize>>>, num_logical: usize) -> Self {
        let mut log_to_phy = Vec::with_capacity(phy_to_log.len());
        let mut replica_count = Vec::with_capacity(phy_to_log.len());

        for row in &phy_to_log {
            let mut replicas = vec![Vec::new(); num_logical];
            for (phy, owner) in row.iter().enumerate() {
                if let Some(log) = *owner {
                    if log < num_logical {
                        replicas[log].push(phy);
                    }
                }
            }
            replica_count.push(replicas.iter().map(Vec::len).collect());
            log_to_phy.push(replicas);
        }

        Self {
            num_logical,
            phy_to_log,
            log_to_phy,
            replica_count,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.phy_to_log.len()
    }

    pub fn num_logical(&self) -> usize {
        self.num_logical
    }

    pub fn num_physical(&self) -> usize {
        self.phy_to_log.first().map_or(0, Vec::len)
    }

    pub fn phy_to_log(&self) -> &[Vec<Option<usize>>] {
        &self.phy_to_log
    }

    pub fn log_to_phy(&self) -> &[Vec<Vec<usize>>] {
        &self.log_to_phy
    }

    pub fn replica_count(&self) -> &[Vec<usize>] {
        &self.replica_count
    }

    /// Logical owner of a physical slot
    pub fn logical_of(&self, layer: usize, phy: usize) -> Option<usize> {
        self.phy_to_log.get(layer)?.get(phy).copied().flatten()
    }

    /// Physical replicas of a logical expert, lowest slot first
    pub fn replicas(&self, layer: usize, log: usize) -> &[usize] {
        self.log_to_phy
            .get(layer)
            .and_then(|row| row.get(log))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Check every structural invariant
    pub fn validate(&self) -> Result<()> {
        let layers = self.phy_to_log.len();
        if self.log_to_phy.len() != layers || self.replica_count.len() != layers {
            return Err(EplbError::InvalidMapping("layer counts disagree".to_string()));
        }
        let num_physical = self.num_physical();

        for layer in 0..layers {
            let owners = &self.phy_to_log[layer];
            let replicas = &self.log_to_phy[layer];
            let counts = &self.replica_count[layer];

            if owners.len() != num_physical {
                return Err(invalid(layer, format!("{} slots, expected {}", owners.len(), num_physical)));
            }
            if replicas.len() != self.num_logical || counts.len() != self.num_logical {
                return Err(invalid(layer, "logical expert count disagrees".to_string()));
            }

            for (phy, owner) in owners.iter().enumerate() {
                if let Some(log) = *owner {
                    if log >= self.num_logical || !replicas[log].contains(&phy) {
                        return Err(invalid(layer, format!("slot {} not listed under expert {}", phy, log)));
                    }
                }
            }
            for (log, slots) in replicas.iter().enumerate() {
                if slots.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(invalid(layer, format!("replicas of expert {} not ascending", log)));
                }
                if slots.iter().any(|&p| owners.get(p).copied().flatten() != Some(log)) {
                    return Err(invalid(layer, format!("expert {} lists a slot it does not own", log)));
                }
                if counts[log] != slots.len() {
                    return Err(invalid(layer, format!("replica count of expert {} is stale", log)));
                }
            }

            let used = owners.iter().filter(|o| o.is_some()).count();
            let total: usize = counts.iter().sum();
            if total != used {
                return Err(invalid(layer, format!("{} replicas for {} used slots", total, used)));
            }
        }
        Ok(())
    }

    /// Whether every physical slot serves some logical expert
    pub fn is_fully_used(&self) -> bool {
        self.phy_to_log.iter().all(|row| row.iter().all(Option::is_some))
    }

    /// Content hash of the slot assignment
    pub fn fingerprint(&self, caps: &Capabilities) -> u64 {
        let mut bytes = Vec::with_capacity(8 * (2 + self.num_layers() * self.num_physical()));
        bytes.extend_from_slice(&(self.num_logical as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.num_physical() as u64).to_le_bytes());
        for owner in self.phy_to_log.iter().flatten() {
            let value = owner.map_or(u64::MAX, |l| l as u64);
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        caps.hash_bytes(&bytes)
    }

    /// Persist as JSON, replacing `path` atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_atomic(path, |w| -> Result<()> {
            serde_json::to_writer_pretty(&mut *w, self)?;
            w.write_all(b"\n")?;
            Ok(())
        })?;
        tracing::debug!(path = %path.display(), layers = self.num_layers(), "Saved expert mapping");
        Ok(())
    }

    /// Read and validate a mapping written by [`Self::save`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mapping: Self = serde_json::from_reader(BufReader::new(file))?;
        mapping.validate()?;
        Ok(mapping)
    }
}

fn invalid(layer: usize, msg: String) -> EplbError {
    EplbError::InvalidMapping(format!("layer {}: {}", layer, msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let m = ExpertMapping::identity(2, 4);
        m.validate().unwrap();
        assert_eq!(m.num_physical(), 4);
        assert_eq!(m.replicas(1, 3), &[3]);
        assert_eq!(m.replica_count()[0], vec![1, 1, 1, 1]);
        assert!(m.is_fully_used());
    }

    #[test]
    fn test_replicas_listed_in_slot_order() {
        let m = ExpertMapping::from_phy_to_log(
            vec![vec![Some(1), Some(0), Some(1), None, Some(1)]],
            2,
        )
        .unwrap();
        assert_eq!(m.replicas(0, 1), &[0, 2, 4]);
        assert_eq!(m.replica_count()[0], vec![1, 3]);
        assert_eq!(m.logical_of(0, 3), None);
        assert_eq!(m.logical_of(0, 4), Some(1));
        assert!(!m.is_fully_used());
    }

    #[test]
    fn test_out_of_range_owner_rejected() {
        assert!(ExpertMapping::from_phy_to_log(vec![vec![Some(0), Some(5)]], 2).is_err());
    }

    #[test]
    fn test_tampered_mapping_fails_validation() {
        let mut m = ExpertMapping::identity(1, 3);
        m.replica_count[0][1] = 2;
        assert!(m.validate().is_err());

        let mut m = ExpertMapping::identity(1, 3);
        m.log_to_phy[0][0].push(2);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_assignment() {
        let caps = Capabilities::reference();
        let a = ExpertMapping::identity(1, 4);
        let b = ExpertMapping::from_phy_to_log(vec![vec![Some(1), Some(0), Some(2), Some(3)]], 4).unwrap();
        assert_eq!(a.fingerprint(&caps), ExpertMapping::identity(1, 4).fingerprint(&caps));
        assert_ne!(a.fingerprint(&caps), b.fingerprint(&caps));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        let m = ExpertMapping::from_phy_to_log(vec![vec![Some(0), Some(0), Some(1)]; 2], 2).unwrap();

        m.save(&path).unwrap();
        assert_eq!(ExpertMapping::load(&path).unwrap(), m);
    }

    #[test]
    fn test_load_rejects_inconsistent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(
            &path,
            r#"{"num_logical":2,"phy_to_log":[[0,1]],"log_to_phy":[[[1],[0]]],"replica_count":[[1,1]]}"#,
        )
        .unwrap();
        assert!(matches!(
            ExpertMapping::load(&path),
            Err(EplbError::InvalidMapping(_))
        ));
    }
}
