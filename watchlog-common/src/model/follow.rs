use crate::model::{Id, user::UserMarker};
use serde::{Deserialize, Serialize};

/// `follower` follows `followee`. Edges are directed; the reverse edge is a separate row.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Deserialize, Serialize,
)]
pub struct FollowEdge {
    pub follower: Id<UserMarker>,
    pub followee: Id<UserMarker>,
}

/// How the viewer and another profile are connected.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Deserialize, Serialize,
)]
pub struct Relationship {
    /// The viewer follows the profile.
    pub is_following: bool,
    /// The profile follows the viewer.
    pub is_follower: bool,
}

#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Deserialize, Serialize,
)]
pub struct FollowCounts {
    pub followers: u32,
    pub following: u32,
}

impl Relationship {
    /// Both directions exist, which the app shows as friends.
    #[must_use]
    pub fn is_mutual(self) -> bool {
        self.is_following && self.is_follower
    }
}
