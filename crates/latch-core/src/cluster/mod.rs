mod node;
mod state;
mod traits;

pub use node::{MemberInfo, NodeId};
pub use state::LeadershipState;
pub use traits::ClusterInfo;
