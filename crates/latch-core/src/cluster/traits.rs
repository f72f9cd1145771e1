use super::node::NodeId;

/// Snapshot of the group as seen by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    /// Key namespace of the cluster.
    pub namespace: String,
    /// This node's id.
    pub node_id: NodeId,
    /// Registered live members, ascending.
    pub members: Vec<NodeId>,
    /// Current leader, if one holds office.
    pub leader: Option<NodeId>,
}

impl ClusterInfo {
    pub fn is_leader(&self) -> bool {
        self.leader == Some(self.node_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}
