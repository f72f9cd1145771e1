mod debounce;
mod leadership;
mod single;

pub use debounce::Debouncer;
pub use leadership::{
    allocate_node_id, current_leader, StoreLeadershipManager, LEADER_KEY, MEMBERS_KEY, NEXT_ID_KEY,
};
pub use single::SingleInstanceLeadershipManager;
