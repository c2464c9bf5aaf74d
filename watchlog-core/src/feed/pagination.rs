use std::collections::HashSet;
use watchlog_common::model::{
    Id,
    post::{Post, PostMarker},
};

/// Posts loaded from the store and how many of them are revealed.
///
/// Loading and revealing move independently: [`FeedPage::reveal_more`] never
/// touches the network, and merging a fetched page never changes
/// `visible_count`.
#[derive(Clone, PartialEq, Debug)]
pub struct FeedPage {
    posts: Vec<Post>,
    visible_count: usize,
    has_more: bool,
}

impl FeedPage {
    #[must_use]
    pub fn new(initial_visible_count: usize) -> Self {
        Self {
            posts: Vec::new(),
            visible_count: initial_visible_count,
            has_more: true,
        }
    }

    #[must_use]
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    #[must_use]
    pub fn visible_count(&self) -> usize {
        self.visible_count
    }

    /// Advisory: `false` stops further server fetches, `true` promises nothing.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// The revealed prefix of the loaded posts.
    #[must_use]
    pub fn visible_posts(&self) -> &[Post] {
        &self.posts[..self.visible_count.min(self.posts.len())]
    }

    /// Reveals `step` more loaded posts, stopping at the loaded length.
    pub fn reveal_more(&mut self, step: usize) {
        let cap = self.posts.len().max(self.visible_count);
        self.visible_count = self.visible_count.saturating_add(step).min(cap);
    }

    /// Whether everything loaded is visible and the store may have more.
    #[must_use]
    pub fn needs_server_fetch(&self) -> bool {
        self.has_more && self.visible_count >= self.posts.len()
    }

    /// Folds a fetched page in. Offset zero replaces the loaded posts; any other
    /// offset appends, skipping ids that are already loaded.
    pub fn merge(&mut self, offset: usize, posts: Vec<Post>, has_more: bool) {
        if offset == 0 {
            self.posts = posts;
        } else {
            let mut seen: HashSet<Id<PostMarker>> = self.posts.iter().map(|post| post.id).collect();
            self.posts
                .extend(posts.into_iter().filter(|post| seen.insert(post.id)));
        }
        self.has_more = has_more;
    }

    pub fn post_mut(&mut self, post_id: Id<PostMarker>) -> Option<&mut Post> {
        self.posts.iter_mut().find(|post| post.id == post_id)
    }

    /// Puts a freshly created post on top and reveals it.
    pub fn prepend(&mut self, post: Post) {
        self.posts.retain(|loaded| loaded.id != post.id);
        self.posts.insert(0, post);
        self.visible_count = self.visible_count.saturating_add(1);
    }

    pub fn remove(&mut self, post_id: Id<PostMarker>) -> Option<Post> {
        let position = self.posts.iter().position(|post| post.id == post_id)?;
        Some(self.posts.remove(position))
    }

    /// Back to the state of a fresh session.
    pub fn reset(&mut self, initial_visible_count: usize) {
        *self = Self::new(initial_visible_count);
    }
}
