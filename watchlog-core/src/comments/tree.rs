use std::collections::{HashMap, HashSet};
use watchlog_common::model::{
    Id,
    comment::{Comment, CommentMarker},
};

/// The comments of one post, linked into a tree through `parent_comment_id`.
///
/// Every comment is reachable by id. Only comments whose parent resolves appear
/// in [`CommentTree::roots`] or in a node's replies; a comment pointing at a parent
/// that is missing (or at itself) is an orphan and stays out of both.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct CommentTree {
    comments: Vec<Comment>,
    index: HashMap<Id<CommentMarker>, usize>,
    roots: Vec<usize>,
    replies: Vec<Vec<usize>>,
}

/// A borrowed view of one comment and its place in the tree.
#[derive(Copy, Clone, Debug)]
pub struct CommentNode<'a> {
    tree: &'a CommentTree,
    position: usize,
}

impl CommentTree {
    /// Builds the tree from a post's comments, oldest first.
    ///
    /// Sibling order follows input order. If an id shows up twice, the first row wins.
    #[must_use]
    pub fn build(rows: Vec<Comment>) -> Self {
        let mut comments = Vec::with_capacity(rows.len());
        let mut index = HashMap::with_capacity(rows.len());

        for comment in rows {
            if index.contains_key(&comment.id) {
                continue;
            }
            index.insert(comment.id, comments.len());
            comments.push(comment);
        }

        let mut roots = Vec::new();
        let mut replies = vec![Vec::new(); comments.len()];

        for (position, comment) in comments.iter().enumerate() {
            match comment.parent_comment_id {
                None => roots.push(position),
                Some(parent_id) if parent_id == comment.id => {}
                Some(parent_id) => {
                    if let Some(&parent) = index.get(&parent_id) {
                        replies[parent].push(position);
                    }
                }
            }
        }

        Self {
            comments,
            index,
            roots,
            replies,
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = CommentNode<'_>> {
        self.roots.iter().map(|&position| self.node(position))
    }

    #[must_use]
    pub fn get(&self, id: Id<CommentMarker>) -> Option<CommentNode<'_>> {
        self.index.get(&id).map(|&position| self.node(position))
    }

    #[must_use]
    pub fn contains(&self, id: Id<CommentMarker>) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of distinct comments, orphans included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.comments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    #[must_use]
    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    /// The ancestors of `id`, furthest first and ending with its immediate parent.
    ///
    /// The walk stops at a root, at a parent id that does not resolve, or at the first
    /// id it has already visited. Unknown ids have no ancestors.
    #[must_use]
    pub fn ancestor_chain(&self, id: Id<CommentMarker>) -> Vec<&Comment> {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut current = self
            .get(id)
            .and_then(|node| node.comment().parent_comment_id);

        while let Some(parent_id) = current {
            if !visited.insert(parent_id) {
                break;
            }
            let Some(parent) = self.get(parent_id) else {
                break;
            };
            chain.push(parent.comment());
            current = parent.comment().parent_comment_id;
        }

        chain.reverse();
        chain
    }

    /// Whether following parent links from `id` ends at a root comment.
    #[must_use]
    pub fn is_rooted(&self, id: Id<CommentMarker>) -> bool {
        let Some(node) = self.get(id) else {
            return false;
        };

        match self.ancestor_chain(id).first() {
            Some(top) => top.is_root(),
            None => node.comment().is_root(),
        }
    }

    fn node(&self, position: usize) -> CommentNode<'_> {
        CommentNode {
            tree: self,
            position,
        }
    }
}

impl<'a> CommentNode<'a> {
    #[must_use]
    pub fn comment(self) -> &'a Comment {
        &self.tree.comments[self.position]
    }

    #[must_use]
    pub fn id(self) -> Id<CommentMarker> {
        self.comment().id
    }

    /// Direct replies, oldest first.
    pub fn replies(self) -> impl Iterator<Item = CommentNode<'a>> {
        let tree = self.tree;
        tree.replies[self.position]
            .iter()
            .map(move |&position| tree.node(position))
    }

    #[must_use]
    pub fn reply_count(self) -> usize {
        self.tree.replies[self.position].len()
    }

    #[must_use]
    pub fn parent(self) -> Option<CommentNode<'a>> {
        self.comment()
            .parent_comment_id
            .filter(|&parent_id| parent_id != self.id())
            .and_then(|parent_id| self.tree.get(parent_id))
    }
}

#[cfg(test)]
mod tests {
    use crate::comments::tree::CommentTree;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use time::{Duration, macros::datetime};
    use watchlog_common::model::{
        Id,
        comment::Comment,
        user::{User, UserHandle},
    };

    fn comment(id: i64, parent: Option<i64>) -> Comment {
        Comment {
            id: Id::new(id),
            post_id: Id::new(1),
            author: User {
                id: Id::new(9),
                handle: UserHandle::new("reader".to_owned()).unwrap(),
                avatar_url: None,
            },
            content: format!("comment {id}"),
            image_url: None,
            parent_comment_id: parent.map(Id::new),
            created_at: datetime!(2025-04-01 09:00 UTC) + Duration::minutes(id),
        }
    }

    fn ids<'a>(nodes: impl Iterator<Item = crate::comments::tree::CommentNode<'a>>) -> Vec<i64> {
        nodes.map(|node| node.id().get()).collect()
    }

    #[test]
    fn builds_roots_and_replies_in_input_order() {
        let tree = CommentTree::build(vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, None),
            comment(4, Some(1)),
            comment(5, Some(2)),
        ]);

        assert_eq!(ids(tree.roots()), [1, 3]);
        assert_eq!(ids(tree.get(Id::new(1)).unwrap().replies()), [2, 4]);
        assert_eq!(ids(tree.get(Id::new(2)).unwrap().replies()), [5]);
        assert_eq!(tree.get(Id::new(5)).unwrap().reply_count(), 0);
        assert_eq!(
            tree.get(Id::new(5)).unwrap().parent().unwrap().id().get(),
            2
        );
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn rebuilding_is_idempotent() {
        let rows = vec![
            comment(1, None),
            comment(2, Some(1)),
            comment(3, Some(42)),
            comment(4, Some(2)),
        ];

        assert_eq!(CommentTree::build(rows.clone()), CommentTree::build(rows));
    }

    #[test]
    fn orphans_are_reachable_by_id_only() {
        let tree = CommentTree::build(vec![
            comment(7, Some(99)),
            comment(1, None),
            comment(2, Some(1)),
            comment(8, Some(7)),
            comment(9, Some(9)),
        ]);

        assert_eq!(ids(tree.roots()), [1]);
        let in_replies: Vec<i64> = tree
            .comments()
            .iter()
            .flat_map(|c| ids(tree.get(c.id).unwrap().replies()))
            .collect();
        assert!(!in_replies.contains(&7));
        assert!(!in_replies.contains(&9));

        assert!(tree.get(Id::new(7)).is_some());
        assert!(!tree.is_rooted(Id::new(7)));
        assert!(!tree.is_rooted(Id::new(8)));
        assert!(!tree.is_rooted(Id::new(9)));
        assert!(tree.is_rooted(Id::new(2)));
        assert_eq!(tree.ancestor_chain(Id::new(9)), Vec::<&Comment>::new());
    }

    #[test]
    fn ancestor_chain_has_one_entry_per_level() {
        let mut rows = vec![comment(1, None)];
        rows.extend((2..=6).map(|id| comment(id, Some(id - 1))));
        let tree = CommentTree::build(rows);

        let chain: Vec<i64> = tree
            .ancestor_chain(Id::new(6))
            .iter()
            .map(|c| c.id.get())
            .collect();
        assert_eq!(chain, [1, 2, 3, 4, 5]);
        assert!(tree.ancestor_chain(Id::new(1)).is_empty());
        assert!(tree.ancestor_chain(Id::new(404)).is_empty());
    }

    #[test]
    fn ancestor_walk_stops_on_cycles() {
        let tree = CommentTree::build(vec![
            comment(1, Some(2)),
            comment(2, Some(1)),
            comment(3, Some(2)),
        ]);

        let chain: Vec<i64> = tree
            .ancestor_chain(Id::new(3))
            .iter()
            .map(|c| c.id.get())
            .collect();
        assert_eq!(chain, [1, 2]);
        assert!(!tree.is_rooted(Id::new(3)));
    }

    #[test]
    fn replies_listed_before_their_parents_still_attach() {
        let tree = CommentTree::build(vec![
            comment(4, Some(3)),
            comment(3, Some(1)),
            comment(2, Some(1)),
            comment(1, None),
        ]);

        assert_eq!(ids(tree.roots()), [1]);
        assert_eq!(ids(tree.get(Id::new(1)).unwrap().replies()), [3, 2]);
        assert_eq!(ids(tree.get(Id::new(3)).unwrap().replies()), [4]);
        assert!(tree.is_rooted(Id::new(4)));
    }

    /// Ids count up from 1. A parent is absent, an earlier id, or an id that is never present.
    fn forest() -> impl Strategy<Value = Vec<Comment>> {
        prop::collection::vec(0..40_i64, 1..24).prop_map(|choices| {
            choices
                .into_iter()
                .zip(1..)
                .map(|(choice, id)| {
                    let parent = match choice {
                        0..5 => None,
                        35.. => Some(1000 + choice),
                        _ if id == 1 => None,
                        _ => Some(1 + choice % (id - 1)),
                    };
                    comment(id, parent)
                })
                .collect()
        })
    }

    fn shuffled_forest() -> impl Strategy<Value = (Vec<Comment>, Vec<Comment>)> {
        forest().prop_flat_map(|rows| (Just(rows.clone()), Just(rows).prop_shuffle()))
    }

    /// Ids whose parent chain ends at a top-level comment, given rows in id order.
    fn rooted_by_construction(rows: &[Comment]) -> BTreeSet<i64> {
        let mut rooted = BTreeSet::new();
        for comment in rows {
            let resolved = match comment.parent_comment_id {
                None => true,
                Some(parent) => rooted.contains(&parent.get()),
            };
            if resolved {
                rooted.insert(comment.id.get());
            }
        }
        rooted
    }

    type Shape = (BTreeSet<i64>, Vec<(i64, bool, BTreeSet<i64>)>);

    /// The tree with sibling order left out.
    fn shape(tree: &CommentTree) -> Shape {
        let roots = tree.roots().map(|node| node.id().get()).collect();
        let mut nodes: Vec<_> = tree
            .comments()
            .iter()
            .map(|comment| {
                let node = tree.get(comment.id).unwrap();
                let replies: BTreeSet<i64> = node.replies().map(|reply| reply.id().get()).collect();
                (comment.id.get(), tree.is_rooted(comment.id), replies)
            })
            .collect();
        nodes.sort_unstable_by_key(|(id, ..)| *id);
        (roots, nodes)
    }

    proptest! {
        #[test]
        fn row_order_does_not_change_the_tree((rows, shuffled) in shuffled_forest()) {
            prop_assert_eq!(
                shape(&CommentTree::build(rows)),
                shape(&CommentTree::build(shuffled))
            );
        }

        #[test]
        fn only_resolved_ancestries_hang_off_the_roots((rows, shuffled) in shuffled_forest()) {
            let expected = rooted_by_construction(&rows);
            let tree = CommentTree::build(shuffled);

            for comment in &rows {
                prop_assert!(tree.contains(comment.id));
                prop_assert_eq!(tree.is_rooted(comment.id), expected.contains(&comment.id.get()));
            }

            let mut reachable = BTreeSet::new();
            let mut pending: Vec<_> = tree.roots().collect();
            while let Some(node) = pending.pop() {
                reachable.insert(node.id().get());
                pending.extend(node.replies());
            }
            prop_assert_eq!(reachable, expected);
        }

        #[test]
        fn rebuilding_a_shuffled_tree_changes_nothing((_, shuffled) in shuffled_forest()) {
            let tree = CommentTree::build(shuffled);
            prop_assert_eq!(CommentTree::build(tree.comments().to_vec()), tree);
        }
    }

    #[test]
    fn duplicate_ids_keep_the_first_row() {
        let mut duplicate = comment(1, None);
        duplicate.content = "edited elsewhere".to_owned();
        let tree = CommentTree::build(vec![comment(1, None), duplicate]);

        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(Id::new(1)).unwrap().comment().content, "comment 1");
    }
}
