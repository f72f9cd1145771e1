/// Leadership state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LeadershipState {
    #[default]
    Follower,
    Leader,
}

impl LeadershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follower => "follower",
            Self::Leader => "leader",
        }
    }

    pub fn from_is_leader(is_leader: bool) -> Self {
        if is_leader {
            Self::Leader
        } else {
            Self::Follower
        }
    }
}

impl std::fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
