use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use latch_core::cluster::NodeId;
use latch_core::coordination::{LeadershipManager, MembershipListener};
use latch_core::error::Result;

/// Leadership for a process that is the whole cluster. Always leader;
/// membership never changes, so the listener is never invoked.
pub struct SingleInstanceLeadershipManager {
    node_id: NodeId,
}

impl SingleInstanceLeadershipManager {
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

#[async_trait]
impl LeadershipManager for SingleInstanceLeadershipManager {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn start(&self, _can_be_leader: bool) -> Result<()> {
        tracing::info!(node_id = %self.node_id, "Running as single instance leader");
        Ok(())
    }

    fn is_this_instance_leader(&self) -> bool {
        true
    }

    fn on_group_membership_change(&self, _listener: Arc<dyn MembershipListener>) {}

    async fn get_group_members(&self) -> Result<Vec<NodeId>> {
        Ok(vec![self.node_id])
    }

    async fn wait_for_leader_to_be_elected(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_instance_is_always_leader() {
        let node = NodeId::new(0).unwrap();
        let m = SingleInstanceLeadershipManager::new(node);
        m.start(false).await.unwrap();
        assert!(m.is_this_instance_leader());
        assert_eq!(m.get_group_members().await.unwrap(), vec![node]);
        m.wait_for_leader_to_be_elected(Duration::ZERO).await.unwrap();
        m.shutdown().await;
    }
}
