use crate::model::{EmptyTextError, Id, non_empty_text, post::PostMarker, user::User};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct CommentMarker;

/// A single comment row. `parent_comment_id` of `None` makes it a root comment.
///
/// Replies are not stored on the comment itself; they are derived when the flat
/// list for a post is assembled into a tree.
#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct Comment {
    pub id: Id<CommentMarker>,
    pub post_id: Id<PostMarker>,
    pub author: User,
    pub content: String,
    pub image_url: Option<String>,
    pub parent_comment_id: Option<Id<CommentMarker>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct CreateComment {
    pub post_id: Id<PostMarker>,
    pub text: CommentText,
    pub image_url: Option<String>,
    pub parent_comment_id: Option<Id<CommentMarker>>,
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommentText(String);

impl CommentText {
    pub fn new(text: &str) -> Result<Self, EmptyTextError> {
        non_empty_text(text, "Comment").map(Self)
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CommentText {
    type Error = EmptyTextError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CommentText> for String {
    fn from(value: CommentText) -> Self {
        value.0
    }
}

impl Comment {
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_comment_id.is_none()
    }
}
