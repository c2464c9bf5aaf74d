use crate::model::{
    EmptyTextError, Id,
    media::{MediaEntryMarker, MediaSummary},
    non_empty_text,
    user::User,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct PostMarker;

/// A feed item as seen by one viewer.
///
/// `is_liked` is relative to the viewer the post was fetched for and must not be
/// shared with another viewer's feed.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Post {
    pub id: Id<PostMarker>,
    pub author: User,
    pub content: String,
    pub image_url: Option<String>,
    pub media: Option<MediaSummary>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub likes_count: u32,
    pub comments_count: u32,
    pub is_liked: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize, Serialize)]
pub struct CreatePost {
    pub content: PostContent,
    pub image_url: Option<String>,
    pub media_entry_id: Option<Id<MediaEntryMarker>>,
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostContent(String);

impl PostContent {
    pub fn new(content: &str) -> Result<Self, EmptyTextError> {
        non_empty_text(content, "Post").map(Self)
    }

    #[must_use]
    pub fn get(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PostContent {
    type Error = EmptyTextError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<PostContent> for String {
    fn from(value: PostContent) -> Self {
        value.0
    }
}

impl Post {
    /// Sets the viewer's like state and moves `likes_count` with it.
    ///
    /// Setting the state it already has is a no-op.
    pub fn set_liked(&mut self, liked: bool) {
        if self.is_liked == liked {
            return;
        }

        self.is_liked = liked;
        self.likes_count = if liked {
            self.likes_count.saturating_add(1)
        } else {
            self.likes_count.saturating_sub(1)
        };
    }
}
