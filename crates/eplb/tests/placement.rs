//! Placement invariants over randomized loads
//!
//! Loads are drawn from a seeded ChaCha stream so failures reproduce.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use shardload_core::Capabilities;
use shardload_eplb::{
    balanced_packing, replicate_experts, DefaultPolicy, ExpertLoadBalancer, ExpertMapping,
    LocalityAwarePolicy, RebalancePolicy,
};

fn random_weight(rng: &mut ChaCha8Rng, layers: usize, experts: usize) -> Vec<Vec<f64>> {
    (0..layers)
        .map(|_| (0..experts).map(|_| rng.gen_range(0.0..100.0)).collect())
        .collect()
}

fn assert_complete(m: &ExpertMapping, num_physical: usize) {
    m.validate().unwrap();
    for layer in 0..m.num_layers() {
        let total: usize = m.replica_count()[layer].iter().sum();
        assert_eq!(total, num_physical);
        assert!(m.replica_count()[layer].iter().all(|&c| c >= 1));
        for phy in 0..num_physical {
            let log = m.logical_of(layer, phy).unwrap();
            assert!(m.replicas(layer, log).contains(&phy));
        }
    }
}

#[test]
fn test_hot_expert_gets_extra_replicas() {
    let r = replicate_experts(&[vec![10.0, 1.0, 1.0, 1.0]], 6).unwrap();
    assert_eq!(r.replica_count[0], vec![3, 1, 1, 1]);
}

#[test]
fn test_default_policy_invariants() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let policy = DefaultPolicy::default();
    for _ in 0..50 {
        let experts = rng.gen_range(1..16);
        let physical = experts + rng.gen_range(0..16);
        let weight = random_weight(&mut rng, 3, experts);

        let m = policy.rebalance(&weight, physical).unwrap();
        assert_complete(&m, physical);
        assert_eq!(m, policy.rebalance(&weight, physical).unwrap());
    }
}

#[test]
fn test_packing_fills_every_pack_evenly() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    for _ in 0..50 {
        let packs = rng.gen_range(1..6);
        let groups = packs * rng.gen_range(1..5);
        let weight = random_weight(&mut rng, 2, groups);

        let p = balanced_packing(&weight, packs).unwrap();
        for layer in 0..2 {
            let mut slots: Vec<(usize, usize)> = p.pack_index[layer]
                .iter()
                .copied()
                .zip(p.rank_in_pack[layer].iter().copied())
                .collect();
            slots.sort();
            slots.dedup();
            assert_eq!(slots.len(), groups);
            for pack in 0..packs {
                let members = p.pack_index[layer].iter().filter(|&&x| x == pack).count();
                assert_eq!(members, groups / packs);
            }
        }
    }
}

#[test]
fn test_packing_identity_when_groups_equal_packs() {
    let p = balanced_packing(&[vec![1.0, 9.0, 3.0, 7.0]], 4).unwrap();
    assert_eq!(p.pack_index[0], vec![0, 1, 2, 3]);
    assert_eq!(p.rank_in_pack[0], vec![0; 4]);
}

#[test]
fn test_locality_policy_colocates_replicas() {
    let mut rng = ChaCha8Rng::seed_from_u64(23);
    // 16 experts in 4 groups, 2 nodes with 4 GPUs each, 24 slots
    let policy = LocalityAwarePolicy::new(4, 2, 8, Capabilities::reference());
    for _ in 0..20 {
        let weight = random_weight(&mut rng, 2, 16);
        let m = policy.rebalance(&weight, 24).unwrap();
        assert_complete(&m, 24);

        for layer in 0..2 {
            for log in 0..16 {
                let node = m.replicas(layer, log)[0] / 12;
                assert!(m.replicas(layer, log).iter().all(|p| p / 12 == node));
            }
            // Whole groups stay together on a node
            for group in 0..4 {
                let nodes: Vec<usize> = (group * 4..group * 4 + 4)
                    .map(|log| m.replicas(layer, log)[0] / 12)
                    .collect();
                assert!(nodes.iter().all(|&n| n == nodes[0]));
            }
        }
    }
}

#[test]
fn test_locality_policy_falls_back_on_uneven_topology() {
    let weight = vec![vec![3.0, 1.0, 4.0, 1.0, 5.0, 9.0]];
    let fallback = DefaultPolicy::default().rebalance(&weight, 9).unwrap();

    // 9 slots over 2 GPUs does not divide
    let uneven = LocalityAwarePolicy::new(2, 2, 2, Capabilities::reference());
    assert_eq!(uneven.rebalance(&weight, 9).unwrap(), fallback);

    // 6 experts in 4 groups does not divide
    let groups = LocalityAwarePolicy::new(4, 2, 2, Capabilities::reference());
    assert_eq!(groups.rebalance(&weight, 9).unwrap(), fallback);
}

#[test]
fn test_balancer_mapping_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapping.json");

    let balancer =
        ExpertLoadBalancer::new(2, 4, 6, 3, Arc::new(DefaultPolicy::default())).unwrap();
    balancer.record_load(0, &[8.0, 1.0, 1.0, 1.0, 0.0, 0.0]).unwrap();
    balancer.record_load(1, &[1.0, 1.0, 1.0, 8.0, 0.0, 0.0]).unwrap();
    let mapping = balancer.rebalance(None).unwrap();
    mapping.save(&path).unwrap();

    let restored = ExpertMapping::load(&path).unwrap();
    assert_eq!(restored, *mapping);
    let caps = Capabilities::reference();
    assert_eq!(restored.fingerprint(&caps), mapping.fingerprint(&caps));

    let other = ExpertLoadBalancer::new(2, 4, 6, 3, Arc::new(DefaultPolicy::default())).unwrap();
    other.install(restored).unwrap();
    assert_eq!(other.current_mapping().unwrap().replicas(1, 3), &[3, 4, 5]);
}
