/*
 * Scheduler
 *
 * Per-worker ready queues, the idle-worker load manager, and the cluster
 * layer that ties workers into a stealing ring with round-robin placement
 * and a staging queue for fibres not pinned to any worker yet.
 */

pub(crate) mod queues;
pub(crate) mod ready_queue;
pub(crate) mod load;
pub mod worker;
pub mod cluster;

pub use cluster::Cluster;
