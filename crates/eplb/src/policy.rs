//! Rebalancing policies
//!
//! Both policies are built from two greedy primitives:
//!
//! - [`balanced_packing`] splits `n` weighted items into packs of exactly
//!   `n / num_packs` items, heaviest item first into the lightest pack
//! - [`replicate_experts`] hands out redundant slots one at a time to the
//!   logical expert with the highest per-replica load
//!
//! Ties always resolve to the lowest index so results are deterministic.
//! Native kernels from [`Capabilities`] are tried first; their output is
//! only used when it is well-formed.

use std::sync::Arc;

use shardload_core::{BalancerConfig, Capabilities, Packing, PolicyKind, Replication};

use crate::error::{EplbError, Result};
use crate::mapping::ExpertMapping;

/// Turns per-logical loads into a complete mapping
pub trait RebalancePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `weight` is `[layers][logical]`; the result has `num_physical` slots
    /// per layer, every one of them used
    fn rebalance(&self, weight: &[Vec<f64>], num_physical: usize) -> Result<ExpertMapping>;
}

/// Rows must be equal-length, non-empty, finite and non-negative
fn check_weight(weight: &[Vec<f64>]) -> Result<usize> {
    let width = weight
        .first()
        .map(Vec::len)
        .ok_or_else(|| EplbError::InvalidInput("weight has no layers".to_string()))?;
    if width == 0 {
        return Err(EplbError::InvalidInput("weight has no columns".to_string()));
    }
    for (layer, row) in weight.iter().enumerate() {
        if row.len() != width {
            return Err(EplbError::InvalidInput(format!(
                "layer {}: {} columns, expected {}",
                layer,
                row.len(),
                width
            )));
        }
        if row.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(EplbError::InvalidInput(format!(
                "layer {}: weights must be finite and non-negative",
                layer
            )));
        }
    }
    Ok(width)
}

fn check_slots(num_logical: usize, num_physical: usize) -> Result<()> {
    if num_physical < num_logical {
        return Err(EplbError::InvalidInput(format!(
            "{} physical slots cannot hold {} logical experts",
            num_physical, num_logical
        )));
    }
    Ok(())
}

/// Assign each group to a pack so every pack holds `groups / num_packs`
/// groups and the heaviest pack is as light as the greedy order allows
pub fn balanced_packing(weight: &[Vec<f64>], num_packs: usize) -> Result<Packing> {
    let groups = check_weight(weight)?;
    if num_packs == 0 || groups % num_packs != 0 {
        return Err(EplbError::InvalidInput(format!(
            "{} groups cannot be split evenly into {} packs",
            groups, num_packs
        )));
    }
    let per_pack = groups / num_packs;

    if per_pack == 1 {
        return Ok(Packing {
            pack_index: vec![(0..groups).collect(); weight.len()],
            rank_in_pack: vec![vec![0; groups]; weight.len()],
        });
    }

    let mut pack_index = Vec::with_capacity(weight.len());
    let mut rank_in_pack = Vec::with_capacity(weight.len());
    for row in weight {
        let mut order: Vec<usize> = (0..groups).collect();
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));

        let mut pack_weight = vec![0.0f64; num_packs];
        let mut pack_items = vec![0usize; num_packs];
        let mut packs = vec![0usize; groups];
        let mut ranks = vec![0usize; groups];

        for group in order {
            let mut best: Option<usize> = None;
            for pack in (0..num_packs).filter(|&p| pack_items[p] < per_pack) {
                if best.map_or(true, |b| pack_weight[pack] < pack_weight[b]) {
                    best = Some(pack);
                }
            }
            // Capacity sums to `groups`, so a pack is always free
            let Some(pack) = best else { break };
            packs[group] = pack;
            ranks[group] = pack_items[pack];
            pack_weight[pack] += row[group];
            pack_items[pack] += 1;
        }
        pack_index.push(packs);
        rank_in_pack.push(ranks);
    }

    Ok(Packing {
        pack_index,
        rank_in_pack,
    })
}

/// Place `num_physical - num_logical` redundant replicas
///
/// Slot `i < num_logical` serves logical expert `i`; each extra slot goes to
/// the expert whose load per replica is currently highest.
pub fn replicate_experts(weight: &[Vec<f64>], num_physical: usize) -> Result<Replication> {
    let num_logical = check_weight(weight)?;
    check_slots(num_logical, num_physical)?;

    let mut phy_to_log = Vec::with_capacity(weight.len());
    let mut replica_rank = Vec::with_capacity(weight.len());
    let mut replica_count = Vec::with_capacity(weight.len());
    for row in weight {
        let mut owners: Vec<usize> = (0..num_logical).collect();
        let mut ranks = vec![0usize; num_logical];
        let mut counts = vec![1usize; num_logical];

        for _ in num_logical..num_physical {
            let mut best = 0;
            for log in 1..num_logical {
                if row[log] / counts[log] as f64 > row[best] / counts[best] as f64 {
                    best = log;
                }
            }
            owners.push(best);
            ranks.push(counts[best]);
            counts[best] += 1;
        }
        phy_to_log.push(owners);
        replica_rank.push(ranks);
        replica_count.push(counts);
    }

    Ok(Replication {
        phy_to_log,
        replica_rank,
        replica_count,
    })
}

fn packing_with(caps: &Capabilities, weight: &[Vec<f64>], num_packs: usize) -> Result<Packing> {
    let reference = balanced_packing(weight, num_packs)?;
    match caps.try_native("balanced_packing", |k| k.balanced_packing(weight, num_packs)) {
        Some(native) if packing_is_valid(&native, weight, num_packs) => Ok(native),
        Some(_) => {
            tracing::warn!(num_packs, "Native balanced_packing returned malformed output, using reference");
            Ok(reference)
        }
        None => Ok(reference),
    }
}

/// Every pack is filled exactly once per rank
fn packing_is_valid(p: &Packing, weight: &[Vec<f64>], num_packs: usize) -> bool {
    p.pack_index.len() == weight.len()
        && p.rank_in_pack.len() == weight.len()
        && weight.iter().enumerate().all(|(layer, row)| {
            let per_pack = row.len() / num_packs;
            let (packs, ranks) = (&p.pack_index[layer], &p.rank_in_pack[layer]);
            if packs.len() != row.len() || ranks.len() != row.len() {
                return false;
            }
            let mut seen = vec![false; row.len()];
            packs.iter().zip(ranks).all(|(&pack, &rank)| {
                if pack >= num_packs || rank >= per_pack {
                    return false;
                }
                !std::mem::replace(&mut seen[pack * per_pack + rank], true)
            })
        })
}

fn replicate_with(caps: &Capabilities, weight: &[Vec<f64>], num_physical: usize) -> Result<Replication> {
    let num_logical = check_weight(weight)?;
    check_slots(num_logical, num_physical)?;
    match caps.try_native("replicate_experts", |k| k.replicate_experts(weight, num_physical)) {
        Some(native) if replication_is_valid(&native, weight.len(), num_logical, num_physical) => Ok(native),
        Some(_) => {
            tracing::warn!(num_physical, "Native replicate_experts returned malformed output, using reference");
            replicate_experts(weight, num_physical)
        }
        None => replicate_experts(weight, num_physical),
    }
}

/// Counts agree with owners and every logical expert keeps a replica
fn replication_is_valid(r: &Replication, layers: usize, num_logical: usize, num_physical: usize) -> bool {
    r.phy_to_log.len() == layers
        && r.replica_count.len() == layers
        && r.phy_to_log.iter().zip(&r.replica_count).all(|(owners, counts)| {
            if owners.len() != num_physical || counts.len() != num_logical {
                return false;
            }
            let mut tally = vec![0usize; num_logical];
            for &log in owners {
                match tally.get_mut(log) {
                    Some(t) => *t += 1,
                    None => return false,
                }
            }
            tally == *counts && tally.iter().all(|&t| t > 0)
        })
}

/// Global greedy replication with no placement constraints
#[derive(Debug, Clone, Default)]
pub struct DefaultPolicy {
    caps: Capabilities,
}

impl DefaultPolicy {
    pub fn new(caps: Capabilities) -> Self {
        Self { caps }
    }
}

impl RebalancePolicy for DefaultPolicy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn rebalance(&self, weight: &[Vec<f64>], num_physical: usize) -> Result<ExpertMapping> {
        let num_logical = check_weight(weight)?;
        let replication = replicate_with(&self.caps, weight, num_physical)?;
        let phy_to_log = replication
            .phy_to_log
            .into_iter()
            .map(|row| row.into_iter().map(Some).collect())
            .collect();
        ExpertMapping::from_phy_to_log(phy_to_log, num_logical)
    }
}

/// Hierarchical placement keeping each logical expert's replicas on one node
///
/// Expert groups are packed onto nodes, experts are replicated inside each
/// node, and each node's replicas are packed onto its GPUs. Topologies that
/// do not divide evenly use [`DefaultPolicy`].
#[derive(Debug, Clone)]
pub struct LocalityAwarePolicy {
    num_groups: usize,
    num_nodes: usize,
    num_gpus: usize,
    caps: Capabilities,
}

impl LocalityAwarePolicy {
    pub fn new(num_groups: usize, num_nodes: usize, num_gpus: usize, caps: Capabilities) -> Self {
        Self {
            num_groups,
            num_nodes,
            num_gpus,
            caps,
        }
    }

    /// Whether the hierarchical construction applies to this shape
    pub fn is_hierarchical(&self, num_logical: usize, num_physical: usize) -> bool {
        let (g, n, m) = (self.num_groups, self.num_nodes, self.num_gpus);
        n > 1
            && g > 0
            && m > 0
            && num_logical % g == 0
            && g % n == 0
            && m % n == 0
            && num_physical % m == 0
            && num_physical >= num_logical
    }

    fn hierarchical(&self, weight: &[Vec<f64>], num_logical: usize, num_physical: usize) -> Result<ExpertMapping> {
        let nodes = self.num_nodes;
        let group_size = num_logical / self.num_groups;
        let groups_per_node = self.num_groups / nodes;
        let log_per_node = num_logical / nodes;
        let phy_per_node = num_physical / nodes;
        let gpus_per_node = self.num_gpus / nodes;
        let phy_per_gpu = num_physical / self.num_gpus;

        // Groups onto nodes
        let group_weight: Vec<Vec<f64>> = weight
            .iter()
            .map(|row| row.chunks(group_size).map(|c| c.iter().sum()).collect())
            .collect();
        let groups = packing_with(&self.caps, &group_weight, nodes)?;

        // Node-major order: mlog = node-local position of a logical expert
        let mut mlog_to_log = vec![vec![0usize; num_logical]; weight.len()];
        for (layer, map) in mlog_to_log.iter_mut().enumerate() {
            for log in 0..num_logical {
                let group = log / group_size;
                let slot = groups.pack_index[layer][group] * groups_per_node + groups.rank_in_pack[layer][group];
                map[slot * group_size + log % group_size] = log;
            }
        }

        // Replicate within each node: one row per (layer, node)
        let node_weight: Vec<Vec<f64>> = mlog_to_log
            .iter()
            .zip(weight)
            .flat_map(|(map, row)| map.chunks(log_per_node).map(move |chunk| chunk.iter().map(|&l| row[l]).collect::<Vec<f64>>()))
            .collect();
        let replicas = replicate_with(&self.caps, &node_weight, phy_per_node)?;

        // Node replicas onto GPUs, weighted by load per replica
        let phy_weight: Vec<Vec<f64>> = node_weight
            .iter()
            .enumerate()
            .map(|(i, row)| {
                replicas.phy_to_log[i]
                    .iter()
                    .map(|&m| row[m] / replicas.replica_count[i][m] as f64)
                    .collect()
            })
            .collect();
        let gpus = packing_with(&self.caps, &phy_weight, gpus_per_node)?;

        let mut phy_to_log = vec![vec![None; num_physical]; weight.len()];
        for (layer, owners) in phy_to_log.iter_mut().enumerate() {
            for node in 0..nodes {
                let row = layer * nodes + node;
                for phy in 0..phy_per_node {
                    let local = gpus.pack_index[row][phy] * phy_per_gpu + gpus.rank_in_pack[row][phy];
                    let mlog = node * log_per_node + replicas.phy_to_log[row][phy];
                    owners[node * phy_per_node + local] = Some(mlog_to_log[layer][mlog]);
                }
            }
        }
        ExpertMapping::from_phy_to_log(phy_to_log, num_logical)
    }
}

impl RebalancePolicy for LocalityAwarePolicy {
    fn name(&self) -> &'static str {
        "locality-aware"
    }

    fn rebalance(&self, weight: &[Vec<f64>], num_physical: usize) -> Result<ExpertMapping> {
        let num_logical = check_weight(weight)?;
        if !self.is_hierarchical(num_logical, num_physical) {
            tracing::debug!(
                num_logical,
                num_physical,
                groups = self.num_groups,
                nodes = self.num_nodes,
                gpus = self.num_gpus,
                "Topology does not divide evenly, using global placement"
            );
            return DefaultPolicy::new(self.caps.clone()).rebalance(weight, num_physical);
        }
        self.hierarchical(weight, num_logical, num_physical)
    }
}

/// Policy selected by `config.policy`
pub fn policy_from_config(config: &BalancerConfig, caps: Capabilities) -> Arc<dyn RebalancePolicy> {
    match config.policy {
        PolicyKind::Default => Arc::new(DefaultPolicy::new(caps)),
        PolicyKind::LocalityAware => Arc::new(LocalityAwarePolicy::new(
            config.num_groups,
            config.num_nodes,
            config.num_gpus,
            caps,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicate_hot_expert() {
        let r = replicate_experts(&[vec![10.0, 1.0, 1.0, 1.0]], 6).unwrap();
        assert_eq!(r.replica_count[0], vec![3, 1, 1, 1]);
        assert_eq!(r.phy_to_log[0], vec![0, 1, 2, 3, 0, 0]);
        assert_eq!(r.replica_rank[0], vec![0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_replicate_ties_go_to_lowest_index() {
        let r = replicate_experts(&[vec![2.0, 2.0, 2.0]], 5).unwrap();
        assert_eq!(r.phy_to_log[0], vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_replicate_rejects_too_few_slots() {
        assert!(replicate_experts(&[vec![1.0; 4]], 3).is_err());
        assert!(replicate_experts(&[], 3).is_err());
    }

    #[test]
    fn test_packing_identity_when_one_per_pack() {
        let p = balanced_packing(&[vec![5.0, 1.0, 3.0]], 3).unwrap();
        assert_eq!(p.pack_index[0], vec![0, 1, 2]);
        assert_eq!(p.rank_in_pack[0], vec![0, 0, 0]);
    }

    #[test]
    fn test_packing_balances_greedily() {
        // Order 8, 7, 4, 3: 8->p0, 7->p1, 4->p1 (7 < 8), 3->p0
        let p = balanced_packing(&[vec![3.0, 8.0, 4.0, 7.0]], 2).unwrap();
        assert_eq!(p.pack_index[0], vec![0, 0, 1, 1]);
        assert_eq!(p.rank_in_pack[0], vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_packing_rejects_uneven_split() {
        assert!(balanced_packing(&[vec![1.0; 5]], 2).is_err());
        assert!(balanced_packing(&[vec![1.0; 4]], 0).is_err());
    }

    #[test]
    fn test_default_policy_builds_full_mapping() {
        let m = DefaultPolicy::default()
            .rebalance(&[vec![10.0, 1.0, 1.0, 1.0]], 6)
            .unwrap();
        assert!(m.is_fully_used());
        assert_eq!(m.replicas(0, 0), &[0, 4, 5]);
    }

    #[test]
    fn test_locality_fallback_single_node() {
        let weight = vec![vec![4.0, 3.0, 2.0, 1.0]];
        let local = LocalityAwarePolicy::new(2, 1, 2, Capabilities::reference());
        assert!(!local.is_hierarchical(4, 6));
        assert_eq!(
            local.rebalance(&weight, 6).unwrap(),
            DefaultPolicy::default().rebalance(&weight, 6).unwrap()
        );
    }

    #[test]
    fn test_locality_keeps_replicas_on_one_node() {
        let weight = vec![vec![9.0, 1.0, 1.0, 1.0, 6.0, 1.0, 1.0, 1.0]];
        let policy = LocalityAwarePolicy::new(4, 2, 4, Capabilities::reference());
        assert!(policy.is_hierarchical(8, 12));

        let m = policy.rebalance(&weight, 12).unwrap();
        assert!(m.is_fully_used());
        for log in 0..8 {
            let nodes: Vec<usize> = m.replicas(0, log).iter().map(|p| p / 6).collect();
            assert!(nodes.windows(2).all(|w| w[0] == w[1]), "expert {} spans nodes", log);
        }
        let total: usize = m.replica_count()[0].iter().sum();
        assert_eq!(total, 12);
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = BalancerConfig::default();
        assert_eq!(policy_from_config(&config, Capabilities::reference()).name(), "default");
        config.policy = PolicyKind::LocalityAware;
        assert_eq!(
            policy_from_config(&config, Capabilities::reference()).name(),
            "locality-aware"
        );
    }
}
