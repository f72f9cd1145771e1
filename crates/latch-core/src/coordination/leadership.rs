use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::NodeId;
use crate::error::Result;

/// Invoked on the leader, debounced, after group membership changes.
#[async_trait]
pub trait MembershipListener: Send + Sync {
    async fn on_membership_change(&self);
}

#[async_trait]
impl<F> MembershipListener for F
where
    F: Fn() + Send + Sync,
{
    async fn on_membership_change(&self) {
        self()
    }
}

/// Group membership and single-leader election.
#[async_trait]
pub trait LeadershipManager: Send + Sync {
    /// This node's id within the group.
    fn node_id(&self) -> NodeId;

    /// Join the group, and the election when `can_be_leader`.
    async fn start(&self, can_be_leader: bool) -> Result<()>;

    fn is_this_instance_leader(&self) -> bool;

    fn on_group_membership_change(&self, listener: Arc<dyn MembershipListener>);

    async fn get_group_members(&self) -> Result<Vec<NodeId>>;

    /// Return once some node holds leadership. Fails with `NoLeader` after
    /// `timeout`; returns at once on nodes that cannot lead.
    async fn wait_for_leader_to_be_elected(&self, timeout: Duration) -> Result<()>;

    async fn shutdown(&self);
}
