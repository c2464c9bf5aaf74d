use crate::{
    query::{Direction, Filter, Range, Row, Select, procedures, tables},
    record::{
        CommentRecord, FeedRecord, FollowRecord, LikeRecord, MediaEntryRecord, PostRecord,
        PostStats, ProfileRecord,
    },
    store::{ChangeReceiver, StoreClient, StoreError},
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, warn};
use watchlog_common::model::{
    Id,
    comment::{Comment, CommentMarker, CommentText, CreateComment},
    follow::{FollowCounts, FollowEdge, Relationship},
    media::{MediaEntryMarker, MediaSummary},
    post::{CreatePost, Post, PostContent, PostMarker},
    user::{User, UserMarker},
};

pub type Result<T, E = DbError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("A row had an unexpected shape: {0}")]
    Record(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Profile {0} does not exist")]
    MissingProfile(Id<UserMarker>),
}

/// Which side of the follow table a subscription watches.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum FollowSide {
    /// Rows where the user is followed, which move their follower count.
    Followers,
    /// Rows where the user follows someone, which move their following count.
    Following,
}

/// Typed queries over a [`StoreClient`].
pub struct DbClient<S> {
    store: S,
}

fn decode<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(decode).collect()
}

fn object(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        _ => Row::new(),
    }
}

impl FollowSide {
    fn column(self) -> &'static str {
        match self {
            FollowSide::Followers => "following_id",
            FollowSide::Following => "follower_id",
        }
    }
}

impl<S: StoreClient> DbClient<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// One page of the viewer's feed through the `get_feed` procedure.
    ///
    /// Also returns how many rows the procedure handed back. Rows whose author fails
    /// validation are logged and left out, so there can be fewer posts than rows.
    pub async fn fetch_feed_procedure(
        &self,
        viewer: Id<UserMarker>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Post>, usize)> {
        let args = object(json!({
            "viewer_id": viewer.get(),
            "page_limit": limit,
            "page_offset": offset,
        }));
        let records: Vec<FeedRecord> =
            decode_all(self.store.call_procedure(procedures::GET_FEED, args).await?)?;
        let rows = records.len();

        let posts = records
            .into_iter()
            .filter_map(|record| {
                let post_id = record.id;
                Post::try_from(record)
                    .inspect_err(|error| warn!(%error, post_id, "Skipping invalid feed row"))
                    .ok()
            })
            .collect();

        Ok((posts, rows))
    }

    /// Ids of the users `viewer` follows, in store order, truncated to `cap`.
    pub async fn fetch_followee_ids(
        &self,
        viewer: Id<UserMarker>,
        cap: Option<usize>,
    ) -> Result<Vec<Id<UserMarker>>> {
        if cap == Some(0) {
            return Ok(Vec::new());
        }

        let query = Select::from_table(tables::FOLLOWS)
            .filter(Filter::eq("follower_id", viewer.get()))
            .range(cap.and_then(|cap| Range::page(0, cap)));
        let rows = self.store.select(&query).await?;

        Ok(decode_all::<FollowRecord>(rows)?
            .into_iter()
            .map(|record| FollowEdge::from(record).followee)
            .collect())
    }

    /// Posts by any of `authors`, newest first, rows `[offset, offset + limit - 1]`.
    pub async fn fetch_posts_by_authors(
        &self,
        authors: &[Id<UserMarker>],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PostRecord>> {
        let Some(range) = Range::page(offset, limit) else {
            return Ok(Vec::new());
        };

        let query = Select::from_table(tables::POSTS)
            .filter(Filter::any_of("user_id", authors.iter().map(|id| id.get())))
            .order_by("created_at", Direction::Descending)
            .order_by("id", Direction::Descending)
            .range(Some(range));

        decode_all(self.store.select(&query).await?)
    }

    pub async fn fetch_likes(&self, post_ids: &[Id<PostMarker>]) -> Result<Vec<LikeRecord>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Select::from_table(tables::POST_LIKES)
            .filter(Filter::any_of("post_id", post_ids.iter().map(|id| id.get())));

        decode_all(self.store.select(&query).await?)
    }

    /// Every comment on any of `post_ids`, in no particular order.
    pub async fn fetch_comment_records(
        &self,
        post_ids: &[Id<PostMarker>],
    ) -> Result<Vec<CommentRecord>> {
        if post_ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = Select::from_table(tables::COMMENTS)
            .filter(Filter::any_of("post_id", post_ids.iter().map(|id| id.get())));

        decode_all(self.store.select(&query).await?)
    }

    pub async fn fetch_profiles(
        &self,
        user_ids: impl IntoIterator<Item = Id<UserMarker>>,
    ) -> Result<HashMap<Id<UserMarker>, User>> {
        let user_ids: BTreeSet<i64> = user_ids.into_iter().map(Id::get).collect();
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let query = Select::from_table(tables::PROFILES).filter(Filter::any_of("id", user_ids));
        let records: Vec<ProfileRecord> = decode_all(self.store.select(&query).await?)?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let user_id = record.id;
                User::try_from(record)
                    .inspect_err(|error| warn!(%error, user_id, "Skipping invalid profile"))
                    .ok()
            })
            .map(|user| (user.id, user))
            .collect())
    }

    pub async fn fetch_media_summaries(
        &self,
        media_ids: impl IntoIterator<Item = Id<MediaEntryMarker>>,
    ) -> Result<HashMap<Id<MediaEntryMarker>, MediaSummary>> {
        let media_ids: BTreeSet<i64> = media_ids.into_iter().map(Id::get).collect();
        if media_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let query =
            Select::from_table(tables::MEDIA_ENTRIES).filter(Filter::any_of("id", media_ids));
        let records: Vec<MediaEntryRecord> = decode_all(self.store.select(&query).await?)?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let media_entry_id = record.id;
                MediaSummary::try_from(record)
                    .inspect_err(|error| {
                        warn!(%error, media_entry_id, "Skipping invalid media entry");
                    })
                    .ok()
            })
            .map(|media| (media.id, media))
            .collect())
    }

    async fn fetch_profile(&self, user_id: Id<UserMarker>) -> Result<User> {
        self.fetch_profiles([user_id])
            .await?
            .remove(&user_id)
            .ok_or(DbError::MissingProfile(user_id))
    }

    /// All comments on a post, oldest first, with their authors joined in.
    ///
    /// Comments whose author profile is missing are left out.
    pub async fn fetch_comments(&self, post_id: Id<PostMarker>) -> Result<Vec<Comment>> {
        let query = Select::from_table(tables::COMMENTS)
            .filter(Filter::eq("post_id", post_id.get()))
            .order_by("created_at", Direction::Ascending)
            .order_by("id", Direction::Ascending);
        let records: Vec<CommentRecord> = decode_all(self.store.select(&query).await?)?;

        let authors = self
            .fetch_profiles(records.iter().map(CommentRecord::author_id))
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let Some(author) = authors.get(&record.author_id()).cloned() else {
                    warn!(
                        comment_id = record.id,
                        user_id = record.user_id,
                        "Comment author has no profile"
                    );
                    return None;
                };
                Some(record.into_comment(author))
            })
            .collect())
    }

    /// The post a comment belongs to, or `None` if the comment does not exist.
    pub async fn fetch_comment_post_id(
        &self,
        comment_id: Id<CommentMarker>,
    ) -> Result<Option<Id<PostMarker>>> {
        let query = Select::from_table(tables::COMMENTS).filter(Filter::eq("id", comment_id.get()));
        let records: Vec<CommentRecord> = decode_all(self.store.select(&query).await?)?;

        Ok(records.first().map(|record| record.post_id.into()))
    }

    pub async fn insert_like(
        &self,
        post_id: Id<PostMarker>,
        user_id: Id<UserMarker>,
    ) -> Result<()> {
        let values = object(json!({ "post_id": post_id.get(), "user_id": user_id.get() }));
        self.store.insert(tables::POST_LIKES, values).await?;

        Ok(())
    }

    pub async fn delete_like(
        &self,
        post_id: Id<PostMarker>,
        user_id: Id<UserMarker>,
    ) -> Result<()> {
        let filters = [
            Filter::eq("post_id", post_id.get()),
            Filter::eq("user_id", user_id.get()),
        ];
        let deleted = self.store.delete(tables::POST_LIKES, &filters).await?;
        if deleted.is_empty() {
            debug!(%post_id, %user_id, "Unlike removed no row");
        }

        Ok(())
    }

    pub async fn create_comment(
        &self,
        author_id: Id<UserMarker>,
        comment: &CreateComment,
    ) -> Result<Comment> {
        let values = object(json!({
            "post_id": comment.post_id.get(),
            "user_id": author_id.get(),
            "content": comment.text.get(),
            "image_url": comment.image_url,
            "parent_comment_id": comment.parent_comment_id.map(Id::get),
        }));
        let row = self.store.insert(tables::COMMENTS, values).await?;
        let record: CommentRecord = decode(row)?;
        let author = self.fetch_profile(author_id).await?;

        Ok(record.into_comment(author))
    }

    /// Replaces a comment's text. Returns whether a comment was updated.
    pub async fn update_comment_text(
        &self,
        comment_id: Id<CommentMarker>,
        text: &CommentText,
    ) -> Result<bool> {
        let values = object(json!({ "content": text.get() }));
        let updated = self
            .store
            .update(
                tables::COMMENTS,
                &[Filter::eq("id", comment_id.get())],
                values,
            )
            .await?;

        Ok(!updated.is_empty())
    }

    /// Deletes a comment; the store removes its replies with it. Returns whether it existed.
    pub async fn delete_comment(&self, comment_id: Id<CommentMarker>) -> Result<bool> {
        let deleted = self
            .store
            .delete(tables::COMMENTS, &[Filter::eq("id", comment_id.get())])
            .await?;

        Ok(!deleted.is_empty())
    }

    pub async fn create_post(&self, author_id: Id<UserMarker>, post: &CreatePost) -> Result<Post> {
        let values = object(json!({
            "user_id": author_id.get(),
            "content": post.content.get(),
            "image_url": post.image_url,
            "media_entry_id": post.media_entry_id.map(Id::get),
        }));
        let row = self.store.insert(tables::POSTS, values).await?;
        let record: PostRecord = decode(row)?;

        let author = self.fetch_profile(author_id).await?;
        let mut media = self.fetch_media_summaries(record.media_entry_id()).await?;
        let media = record.media_entry_id().and_then(|id| media.remove(&id));

        Ok(record.into_post(author, media, PostStats::default()))
    }

    pub async fn update_post_content(
        &self,
        post_id: Id<PostMarker>,
        content: &PostContent,
    ) -> Result<bool> {
        let values = object(json!({ "content": content.get() }));
        let updated = self
            .store
            .update(tables::POSTS, &[Filter::eq("id", post_id.get())], values)
            .await?;

        Ok(!updated.is_empty())
    }

    pub async fn delete_post(&self, post_id: Id<PostMarker>) -> Result<bool> {
        let deleted = self
            .store
            .delete(tables::POSTS, &[Filter::eq("id", post_id.get())])
            .await?;

        Ok(!deleted.is_empty())
    }

    /// Checks the follow edge in both directions between `viewer` and `profile`.
    pub async fn fetch_relationship(
        &self,
        viewer: Id<UserMarker>,
        profile: Id<UserMarker>,
    ) -> Result<Relationship> {
        let edge = |follower: Id<UserMarker>, followee: Id<UserMarker>| {
            Select::from_table(tables::FOLLOWS)
                .filter(Filter::eq("follower_id", follower.get()))
                .filter(Filter::eq("following_id", followee.get()))
                .range(Range::page(0, 1))
        };
        let following_query = edge(viewer, profile);
        let follower_query = edge(profile, viewer);

        let (following, follower) = tokio::try_join!(
            self.store.select(&following_query),
            self.store.select(&follower_query),
        )?;

        Ok(Relationship {
            is_following: !following.is_empty(),
            is_follower: !follower.is_empty(),
        })
    }

    pub async fn fetch_follow_counts(&self, user_id: Id<UserMarker>) -> Result<FollowCounts> {
        let side = |side: FollowSide| {
            Select::from_table(tables::FOLLOWS).filter(Filter::eq(side.column(), user_id.get()))
        };
        let followers_query = side(FollowSide::Followers);
        let following_query = side(FollowSide::Following);

        let (followers, following) = tokio::try_join!(
            self.store.select(&followers_query),
            self.store.select(&following_query),
        )?;

        Ok(FollowCounts {
            followers: u32::try_from(followers.len()).unwrap_or(u32::MAX),
            following: u32::try_from(following.len()).unwrap_or(u32::MAX),
        })
    }

    pub async fn subscribe_follows(
        &self,
        user_id: Id<UserMarker>,
        side: FollowSide,
    ) -> Result<ChangeReceiver> {
        Ok(self
            .store
            .subscribe(tables::FOLLOWS, Filter::eq(side.column(), user_id.get()))
            .await?)
    }
}
