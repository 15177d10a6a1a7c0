//! API-side coordination
//!
//! Consistent-hash dispatch, master election, and the manager that ties
//! registry membership, peer propagation and agent pushes together.

pub mod agent_client;
pub mod dispatcher;
pub mod hash_ring;
pub mod leader;
pub mod manager;

pub use agent_client::{AgentClientConfig, AgentRpc, HttpAgentClient};
pub use dispatcher::Dispatcher;
pub use hash_ring::{fnv1a64, HashRing, RingConfig};
pub use leader::{ElectionConfig, LeaderElection, ReplicaRole};
pub use manager::{CoordinationManager, ManagerConfig, PushReport, ReconcileReport};
