//! Shardload EPLB
//!
//! Expert-parallel load balancing for Mixture-of-Experts serving. Logical
//! experts are replicated across a fixed number of physical slots; the
//! mapping between the two follows observed load.
//!
//! # Contents
//!
//! - [`ExpertMapping`]: immutable per-layer slot assignment, persisted as JSON
//! - [`EplbMetrics`]: sliding window of per-slot loads
//! - [`RebalancePolicy`]: [`DefaultPolicy`] and the node-aware
//!   [`LocalityAwarePolicy`], over [`balanced_packing`] and
//!   [`replicate_experts`]
//! - [`ExpertLoadBalancer`]: owns the active mapping and swaps it on rebalance
//! - [`BackgroundRebalancer`]: tokio task that rebalances when load skews
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use shardload_eplb::{DefaultPolicy, ExpertLoadBalancer};
//!
//! let balancer = ExpertLoadBalancer::new(1, 4, 6, 4, Arc::new(DefaultPolicy::default())).unwrap();
//! balancer.record_load(0, &[10.0, 1.0, 1.0, 1.0, 0.0, 0.0]).unwrap();
//! let mapping = balancer.rebalance(None).unwrap();
//! assert_eq!(mapping.replica_count()[0], vec![3, 1, 1, 1]);
//! ```

mod background;
mod balancer;
mod error;
mod mapping;
mod metrics;
mod policy;

pub use background::BackgroundRebalancer;
pub use balancer::ExpertLoadBalancer;
pub use error::{EplbError, Result};
pub use mapping::ExpertMapping;
pub use metrics::{imbalance_ratio, EplbMetrics, LoadWindow};
pub use policy::{
    balanced_packing, policy_from_config, replicate_experts, DefaultPolicy, LocalityAwarePolicy,
    RebalancePolicy,
};
