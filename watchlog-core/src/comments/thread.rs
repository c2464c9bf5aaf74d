use crate::comments::tree::CommentTree;
use watchlog_common::model::{
    Id,
    comment::{Comment, CommentMarker},
    post::PostMarker,
};

/// Which comment, if any, the thread viewer is focused on.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash)]
pub enum ThreadView {
    #[default]
    Closed,
    Open {
        post_id: Id<PostMarker>,
        focused: Id<CommentMarker>,
    },
}

/// What the thread viewer renders: the focused comment between its ancestors and
/// its direct replies.
#[derive(Clone, PartialEq, Debug)]
pub struct ThreadSnapshot {
    pub post_id: Id<PostMarker>,
    pub focused: Comment,
    pub ancestors: Vec<Comment>,
    pub replies: Vec<Comment>,
}

impl ThreadView {
    /// Focuses `comment_id` if the tree has it. Opening on another comment while
    /// already open is how the viewer navigates.
    #[must_use]
    pub fn open(
        post_id: Id<PostMarker>,
        comment_id: Id<CommentMarker>,
        tree: &CommentTree,
    ) -> Option<Self> {
        tree.contains(comment_id).then_some(ThreadView::Open {
            post_id,
            focused: comment_id,
        })
    }

    #[must_use]
    pub fn focused(self) -> Option<Id<CommentMarker>> {
        match self {
            ThreadView::Closed => None,
            ThreadView::Open { focused, .. } => Some(focused),
        }
    }

    #[must_use]
    pub fn post_id(self) -> Option<Id<PostMarker>> {
        match self {
            ThreadView::Closed => None,
            ThreadView::Open { post_id, .. } => Some(post_id),
        }
    }

    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, ThreadView::Open { .. })
    }

    /// Re-checks the focus against a freshly built tree for the same post, closing
    /// the view if the focused comment is gone.
    #[must_use]
    pub fn reconcile(self, tree: &CommentTree) -> Self {
        match self {
            ThreadView::Open { focused, .. } if !tree.contains(focused) => ThreadView::Closed,
            view => view,
        }
    }

    #[must_use]
    pub fn snapshot(self, tree: &CommentTree) -> Option<ThreadSnapshot> {
        let ThreadView::Open { post_id, focused } = self else {
            return None;
        };
        let node = tree.get(focused)?;

        Some(ThreadSnapshot {
            post_id,
            focused: node.comment().clone(),
            ancestors: tree.ancestor_chain(focused).into_iter().cloned().collect(),
            replies: node
                .replies()
                .map(|reply| reply.comment().clone())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::comments::{thread::ThreadView, tree::CommentTree};
    use time::macros::datetime;
    use watchlog_common::model::{
        Id,
        comment::Comment,
        user::{User, UserHandle},
    };

    fn comment(id: i64, parent: Option<i64>) -> Comment {
        Comment {
            id: Id::new(id),
            post_id: Id::new(3),
            author: User {
                id: Id::new(1),
                handle: UserHandle::new("gamer".to_owned()).unwrap(),
                avatar_url: None,
            },
            content: format!("#{id}"),
            image_url: None,
            parent_comment_id: parent.map(Id::new),
            created_at: datetime!(2025-06-01 20:00 UTC),
        }
    }

    fn tree() -> CommentTree {
        CommentTree::build(vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, Some(2)),
            comment(4, Some(2)),
        ])
    }

    #[test]
    fn snapshot_shows_ancestors_and_direct_replies() {
        let tree = tree();
        let view = ThreadView::open(Id::new(3), Id::new(2), &tree).unwrap();
        let snapshot = view.snapshot(&tree).unwrap();

        assert_eq!(snapshot.focused.id, Id::new(2));
        assert_eq!(snapshot.ancestors, [comment(1, None)]);
        assert_eq!(snapshot.replies, [comment(3, Some(2)), comment(4, Some(2))]);
    }

    #[test]
    fn cannot_open_unknown_comment() {
        assert_eq!(ThreadView::open(Id::new(3), Id::new(50), &tree()), None);
        assert_eq!(ThreadView::Closed.snapshot(&tree()), None);
    }

    #[test]
    fn reconcile_closes_when_focus_disappears() {
        let view = ThreadView::open(Id::new(3), Id::new(4), &tree()).unwrap();
        assert_eq!(view.reconcile(&tree()), view);

        let without_focus = CommentTree::build(vec![comment(1, None), comment(2, Some(1))]);
        assert_eq!(view.reconcile(&without_focus), ThreadView::Closed);
        assert!(!ThreadView::Closed.reconcile(&without_focus).is_open());
    }
}
