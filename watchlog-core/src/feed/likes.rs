use crate::feed::pagination::FeedPage;
use watchlog_common::model::{Id, post::PostMarker};

/// What an optimistic like flip changed, kept so it can be undone exactly.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct LikeToggle {
    pub post_id: Id<PostMarker>,
    pub was_liked: bool,
    pub previous_count: u32,
}

impl LikeToggle {
    /// The state the store should end up in once the toggle settles.
    #[must_use]
    pub fn liked(self) -> bool {
        !self.was_liked
    }
}

/// Flips the viewer's like on a loaded post. `None` if the post is not loaded.
pub fn apply_optimistic(feed: &mut FeedPage, post_id: Id<PostMarker>) -> Option<LikeToggle> {
    let post = feed.post_mut(post_id)?;
    let toggle = LikeToggle {
        post_id,
        was_liked: post.is_liked,
        previous_count: post.likes_count,
    };
    post.set_liked(toggle.liked());

    Some(toggle)
}

/// Restores the fields a failed toggle changed. Returns whether the post was still loaded.
pub fn rollback(feed: &mut FeedPage, toggle: LikeToggle) -> bool {
    let Some(post) = feed.post_mut(toggle.post_id) else {
        return false;
    };
    post.is_liked = toggle.was_liked;
    post.likes_count = toggle.previous_count;

    true
}
