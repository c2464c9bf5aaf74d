//! Row shapes returned by the store, one per query, and their conversion into the model.

use serde::{Deserialize, Deserializer, de::Error as _};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use watchlog_common::model::{
    Id, ModelValidationError,
    comment::{Comment, CommentMarker},
    follow::FollowEdge,
    media::{MediaEntryMarker, MediaSummary},
    post::{Post, PostMarker},
    user::{User, UserHandle, UserMarker},
};

#[derive(Clone, Eq, PartialEq, Debug, Hash, Error)]
pub enum InvalidCountError {
    #[error("Count {0} is negative")]
    Negative(i64),
    #[error("Count {0} does not fit")]
    TooLarge(u64),
    #[error("Count {0:?} is not a whole number")]
    NotANumber(String),
}

/// A count column as it arrives from the store: aggregate counts can come back as
/// numeric strings or `numeric` floats depending on the column type.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(untagged)]
pub enum RawCount {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Text(String),
}

impl RawCount {
    pub fn parse(self) -> Result<u32, InvalidCountError> {
        match self {
            RawCount::Unsigned(count) => {
                u32::try_from(count).map_err(|_| InvalidCountError::TooLarge(count))
            }
            RawCount::Signed(count) => Err(InvalidCountError::Negative(count)),
            RawCount::Float(count) if count.fract().abs() < f64::EPSILON => {
                RawCount::Text(format!("{count:.0}")).parse()
            }
            RawCount::Float(count) => Err(InvalidCountError::NotANumber(count.to_string())),
            RawCount::Text(text) => match text.trim().parse::<i64>() {
                Ok(count) if count < 0 => Err(InvalidCountError::Negative(count)),
                Ok(count) => RawCount::Unsigned(count.cast_unsigned()).parse(),
                Err(_) => Err(InvalidCountError::NotANumber(text)),
            },
        }
    }
}

/// Deserializes a count column through [`RawCount::parse`]. `null` counts as zero.
fn count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawCount>::deserialize(deserializer)?
        .map_or(Ok(0), RawCount::parse)
        .map_err(D::Error::custom)
}

/// One row of the `get_feed` procedure: the post with its author, media entry and
/// counts already joined in.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct FeedRecord {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub media_entry_id: Option<i64>,
    pub image_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub username: String,
    pub avatar_url: Option<String>,
    pub media_title: Option<String>,
    pub media_type: Option<String>,
    pub media_rating: Option<f64>,
    pub media_cover_url: Option<String>,
    #[serde(default, deserialize_with = "count")]
    pub likes_count: u32,
    #[serde(default, deserialize_with = "count")]
    pub comments_count: u32,
    #[serde(default)]
    pub is_liked: bool,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
pub struct PostRecord {
    pub id: i64,
    pub user_id: i64,
    pub content: String,
    pub media_entry_id: Option<i64>,
    pub image_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
pub struct ProfileRecord {
    pub id: i64,
    pub username: String,
    pub avatar_url: Option<String>,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct MediaEntryRecord {
    pub id: i64,
    pub title: String,
    pub media_type: String,
    pub rating: Option<f64>,
    pub cover_url: Option<String>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
pub struct LikeRecord {
    pub post_id: i64,
    pub user_id: i64,
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
pub struct CommentRecord {
    pub id: i64,
    pub post_id: i64,
    pub user_id: i64,
    pub content: String,
    pub image_url: Option<String>,
    pub parent_comment_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
pub struct FollowRecord {
    pub follower_id: i64,
    pub following_id: i64,
}

/// Per-post aggregates computed for one viewer.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct PostStats {
    pub likes_count: u32,
    pub comments_count: u32,
    pub is_liked: bool,
}

impl TryFrom<FeedRecord> for Post {
    type Error = ModelValidationError;

    /// Fails only on the author. A media entry of unknown kind is dropped from the post.
    fn try_from(value: FeedRecord) -> Result<Self, Self::Error> {
        let author = User {
            id: value.user_id.into(),
            handle: UserHandle::new(value.username)?,
            avatar_url: value.avatar_url,
        };

        let media = match (value.media_entry_id, value.media_title, value.media_type) {
            (Some(id), Some(title), Some(kind)) => match kind.parse() {
                Ok(kind) => Some(MediaSummary {
                    id: id.into(),
                    title,
                    kind,
                    rating: value.media_rating,
                    cover_url: value.media_cover_url,
                }),
                Err(error) => {
                    warn!(%error, post_id = value.id, media_entry_id = id, "Dropping media entry");
                    None
                }
            },
            _ => None,
        };

        Ok(Self {
            id: value.id.into(),
            author,
            content: value.content,
            image_url: value.image_url,
            media,
            created_at: value.created_at,
            likes_count: value.likes_count,
            comments_count: value.comments_count,
            is_liked: value.is_liked,
        })
    }
}

impl TryFrom<ProfileRecord> for User {
    type Error = ModelValidationError;

    fn try_from(value: ProfileRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            handle: UserHandle::new(value.username)?,
            avatar_url: value.avatar_url,
        })
    }
}

impl TryFrom<MediaEntryRecord> for MediaSummary {
    type Error = ModelValidationError;

    fn try_from(value: MediaEntryRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            title: value.title,
            kind: value.media_type.parse()?,
            rating: value.rating,
            cover_url: value.cover_url,
        })
    }
}

impl From<FollowRecord> for FollowEdge {
    fn from(value: FollowRecord) -> Self {
        Self {
            follower: value.follower_id.into(),
            followee: value.following_id.into(),
        }
    }
}

impl PostRecord {
    #[must_use]
    pub fn id(&self) -> Id<PostMarker> {
        self.id.into()
    }

    #[must_use]
    pub fn author_id(&self) -> Id<UserMarker> {
        self.user_id.into()
    }

    #[must_use]
    pub fn media_entry_id(&self) -> Option<Id<MediaEntryMarker>> {
        self.media_entry_id.map(Id::new)
    }

    /// Assembles the normalized post once the joined pieces have been fetched separately.
    #[must_use]
    pub fn into_post(self, author: User, media: Option<MediaSummary>, stats: PostStats) -> Post {
        Post {
            id: self.id.into(),
            author,
            content: self.content,
            image_url: self.image_url,
            media,
            created_at: self.created_at,
            likes_count: stats.likes_count,
            comments_count: stats.comments_count,
            is_liked: stats.is_liked,
        }
    }
}

impl CommentRecord {
    #[must_use]
    pub fn author_id(&self) -> Id<UserMarker> {
        self.user_id.into()
    }

    #[must_use]
    pub fn into_comment(self, author: User) -> Comment {
        Comment {
            id: Id::<CommentMarker>::new(self.id),
            post_id: self.post_id.into(),
            author,
            content: self.content,
            image_url: self.image_url,
            parent_comment_id: self.parent_comment_id.map(Id::new),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::record::{FeedRecord, InvalidCountError, RawCount};
    use serde_json::json;
    use watchlog_common::model::{media::MediaKind, post::Post};

    fn feed_row(likes_count: serde_json::Value) -> serde_json::Value {
        json!({
            "id": 4,
            "user_id": 2,
            "content": "Rewatched the trilogy",
            "media_entry_id": 9,
            "image_url": null,
            "created_at": "2025-05-04T18:30:00+00:00",
            "username": "moviebuff",
            "avatar_url": "https://cdn.example/a.png",
            "media_title": "The Two Towers",
            "media_type": "movie",
            "media_rating": 4.5,
            "media_cover_url": null,
            "likes_count": likes_count,
            "comments_count": "3",
            "is_liked": true
        })
    }

    #[test]
    fn counts_accept_numbers_and_numeric_strings() {
        assert_eq!(RawCount::Unsigned(7).parse(), Ok(7));
        assert_eq!(RawCount::Text(" 12 ".to_owned()).parse(), Ok(12));
        assert_eq!(
            RawCount::Signed(-1).parse(),
            Err(InvalidCountError::Negative(-1))
        );
        assert_eq!(
            RawCount::Text("-4".to_owned()).parse(),
            Err(InvalidCountError::Negative(-4))
        );
        assert!(matches!(
            RawCount::Text("lots".to_owned()).parse(),
            Err(InvalidCountError::NotANumber(_))
        ));
    }

    #[test]
    fn whole_float_counts_are_accepted() {
        assert_eq!(RawCount::Float(2.0).parse(), Ok(2));
        assert_eq!(
            RawCount::Float(-1.0).parse(),
            Err(InvalidCountError::Negative(-1))
        );
        assert!(matches!(
            RawCount::Float(2.5).parse(),
            Err(InvalidCountError::NotANumber(_))
        ));
        assert!(matches!(
            RawCount::Float(f64::NAN).parse(),
            Err(InvalidCountError::NotANumber(_))
        ));

        let record: FeedRecord = serde_json::from_value(feed_row(json!(4.0))).unwrap();
        assert_eq!(record.likes_count, 4);
    }

    #[test]
    fn feed_row_maps_to_post() {
        let record: FeedRecord = serde_json::from_value(feed_row(json!("2"))).unwrap();
        let post = Post::try_from(record).unwrap();

        assert_eq!(post.id.get(), 4);
        assert_eq!(post.author.handle.get(), "moviebuff");
        assert_eq!(post.likes_count, 2);
        assert_eq!(post.comments_count, 3);
        assert!(post.is_liked);

        let media = post.media.unwrap();
        assert_eq!(media.kind, MediaKind::Movie);
        assert_eq!(media.title, "The Two Towers");
    }

    #[test]
    fn unknown_media_kind_keeps_the_post() {
        let mut row = feed_row(json!(1));
        row["media_type"] = json!("anime");
        let record: FeedRecord = serde_json::from_value(row).unwrap();
        let post = Post::try_from(record).unwrap();

        assert_eq!(post.id.get(), 4);
        assert!(post.media.is_none());
    }

    #[test]
    fn invalid_author_handle_rejects_the_row() {
        let mut row = feed_row(json!(1));
        row["username"] = json!("Jane Doe");
        let record: FeedRecord = serde_json::from_value(row).unwrap();

        assert!(Post::try_from(record).is_err());
    }

    #[test]
    fn null_count_is_zero_and_negative_count_is_rejected() {
        let record: FeedRecord = serde_json::from_value(feed_row(json!(null))).unwrap();
        assert_eq!(record.likes_count, 0);

        assert!(serde_json::from_value::<FeedRecord>(feed_row(json!(-3))).is_err());
    }
}
