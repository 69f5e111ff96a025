//! Background rebalancer lifecycle
//!
//! 1. A skewed window triggers a rebalance, a flat one does not
//! 2. The running loop parks a mapping without being asked
//! 3. start/stop are idempotent and stop interrupts a long poll
//! 4. A panicking policy is contained and the loop keeps running

use std::sync::Arc;
use std::time::Duration;

use shardload_core::BalancerConfig;
use shardload_eplb::{
    BackgroundRebalancer, DefaultPolicy, EplbError, ExpertLoadBalancer, ExpertMapping,
    RebalancePolicy,
};

fn config(poll_ms: u64) -> BalancerConfig {
    BalancerConfig {
        window_size: 1,
        rebalance_interval_secs: 0,
        poll_interval_ms: poll_ms,
        load_threshold: 2.0,
        ..BalancerConfig::default()
    }
}

fn balancer_with(loads: &[f64], policy: Arc<dyn RebalancePolicy>) -> Arc<ExpertLoadBalancer> {
    let balancer = ExpertLoadBalancer::new(1, loads.len(), loads.len(), 1, policy).unwrap();
    balancer.record_load(0, loads).unwrap();
    Arc::new(balancer)
}

fn balancer(loads: &[f64]) -> Arc<ExpertLoadBalancer> {
    balancer_with(loads, Arc::new(DefaultPolicy::default()))
}

async fn wait_for_pending(bg: &BackgroundRebalancer) -> Option<Arc<ExpertMapping>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(m) = bg.get_pending_mapping() {
                return m;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .ok()
}

struct PanickingPolicy;

impl RebalancePolicy for PanickingPolicy {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn rebalance(&self, _weight: &[Vec<f64>], _num_physical: usize) -> shardload_eplb::Result<ExpertMapping> {
        panic!("policy exploded");
    }
}

#[tokio::test]
async fn test_threshold_decides_trigger() {
    let skewed = BackgroundRebalancer::new(balancer(&[10.0, 10.0, 10.0, 1.0]), &config(1000));
    assert!(skewed.check_and_rebalance().await.unwrap());
    assert!(skewed.get_pending_mapping().is_some());

    let flat = BackgroundRebalancer::new(balancer(&[5.0, 5.0, 5.0, 5.0]), &config(1000));
    assert!(!flat.check_and_rebalance().await.unwrap());
    assert!(flat.get_pending_mapping().is_none());
    assert_eq!(flat.balancer().rebalance_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_parks_mapping() {
    let bg = BackgroundRebalancer::new(balancer(&[10.0, 10.0, 10.0, 1.0]), &config(10));
    bg.start().unwrap();

    let mapping = wait_for_pending(&bg).await.expect("no mapping within timeout");
    assert_eq!(mapping.num_physical(), 4);
    assert!(bg.balancer().current_mapping().is_some());

    bg.stop().await;
    assert!(!bg.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_stop_idempotent_and_prompt() {
    // A minute-long poll must not delay shutdown
    let bg = BackgroundRebalancer::new(balancer(&[1.0, 1.0]), &config(60_000));

    bg.start().unwrap();
    bg.start().unwrap();
    assert!(bg.is_running());

    tokio::time::timeout(Duration::from_secs(2), bg.stop())
        .await
        .expect("stop did not interrupt the poll wait");
    assert!(!bg.is_running());
    bg.stop().await;

    bg.start().unwrap();
    assert!(bg.is_running());
    bg.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_policy_is_contained() {
    let bg = BackgroundRebalancer::new(
        balancer_with(&[10.0, 1.0], Arc::new(PanickingPolicy)),
        &config(10),
    );

    assert!(matches!(
        bg.check_and_rebalance().await,
        Err(EplbError::Task(_))
    ));

    bg.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bg.is_running());
    assert!(bg.get_pending_mapping().is_none());
    bg.stop().await;
}
