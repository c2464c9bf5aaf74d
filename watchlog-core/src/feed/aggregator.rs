//! Fetching feed pages, through the `get_feed` procedure when the store has it and
//! by joining and counting the raw tables when it does not.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use watchlog_common::model::{
    Id,
    post::{Post, PostMarker},
    user::UserMarker,
};
use watchlog_db::{
    client::{DbClient, Result},
    record::{PostRecord, PostStats},
    store::StoreClient,
};

/// Which path produced a page.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub enum FeedSource {
    Procedure,
    Fallback,
}

#[derive(Clone, PartialEq, Debug)]
pub struct FeedPageResult {
    pub posts: Vec<Post>,
    /// The page came back full, so another one probably exists.
    pub has_more: bool,
    pub source: FeedSource,
}

pub struct FeedAggregator<'a, S> {
    db: &'a DbClient<S>,
    followee_cap: Option<usize>,
}

impl<'a, S: StoreClient> FeedAggregator<'a, S> {
    #[must_use]
    pub fn new(db: &'a DbClient<S>, followee_cap: Option<usize>) -> Self {
        Self { db, followee_cap }
    }

    /// Posts by `viewer` and the users they follow, newest first, rows
    /// `[offset, offset + limit - 1]`.
    ///
    /// Errors only if both the procedure and the fallback fail. The result is not
    /// deduplicated against earlier pages.
    pub async fn fetch_page(
        &self,
        viewer: Id<UserMarker>,
        limit: usize,
        offset: usize,
    ) -> Result<FeedPageResult> {
        if limit == 0 {
            return Ok(FeedPageResult {
                posts: Vec::new(),
                has_more: false,
                source: FeedSource::Procedure,
            });
        }

        match self.db.fetch_feed_procedure(viewer, limit, offset).await {
            Ok((posts, rows)) => {
                debug!(%viewer, offset, rows, "Fetched feed page through procedure");
                return Ok(FeedPageResult {
                    has_more: rows == limit,
                    posts,
                    source: FeedSource::Procedure,
                });
            }
            Err(error) => {
                warn!(%error, %viewer, "Feed procedure failed, aggregating manually");
            }
        }

        let (posts, rows) = self.aggregate(viewer, limit, offset).await?;
        debug!(%viewer, offset, rows, "Fetched feed page through fallback");

        Ok(FeedPageResult {
            posts,
            has_more: rows == limit,
            source: FeedSource::Fallback,
        })
    }

    /// The fallback join. Also returns how many post rows the store handed back,
    /// which can exceed the number of posts if some authors have no profile.
    async fn aggregate(
        &self,
        viewer: Id<UserMarker>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<Post>, usize)> {
        let mut authors = self
            .db
            .fetch_followee_ids(viewer, self.followee_cap)
            .await?;
        authors.push(viewer);

        let records = self
            .db
            .fetch_posts_by_authors(&authors, limit, offset)
            .await?;
        let rows = records.len();
        if records.is_empty() {
            return Ok((Vec::new(), rows));
        }

        let post_ids: Vec<Id<PostMarker>> = records.iter().map(PostRecord::id).collect();
        let (likes, comments, profiles, media) = tokio::try_join!(
            self.db.fetch_likes(&post_ids),
            self.db.fetch_comment_records(&post_ids),
            self.db
                .fetch_profiles(records.iter().map(PostRecord::author_id)),
            self.db
                .fetch_media_summaries(records.iter().filter_map(PostRecord::media_entry_id)),
        )?;

        let mut stats: HashMap<Id<PostMarker>, PostStats> = HashMap::new();
        let mut liked_by_viewer = HashSet::new();
        for like in likes {
            let post_id = Id::new(like.post_id);
            let entry = stats.entry(post_id).or_default();
            entry.likes_count = entry.likes_count.saturating_add(1);
            if like.user_id == viewer.get() {
                liked_by_viewer.insert(post_id);
            }
        }
        for comment in comments {
            let entry = stats.entry(Id::new(comment.post_id)).or_default();
            entry.comments_count = entry.comments_count.saturating_add(1);
        }

        let posts = records
            .into_iter()
            .filter_map(|record| {
                let Some(author) = profiles.get(&record.author_id()).cloned() else {
                    warn!(
                        post_id = record.id,
                        user_id = record.user_id,
                        "Post author has no profile"
                    );
                    return None;
                };
                let media = record
                    .media_entry_id()
                    .and_then(|media_id| media.get(&media_id).cloned());
                let post_stats = PostStats {
                    is_liked: liked_by_viewer.contains(&record.id()),
                    ..stats.get(&record.id()).copied().unwrap_or_default()
                };

                Some(record.into_post(author, media, post_stats))
            })
            .collect();

        Ok((posts, rows))
    }
}

#[cfg(test)]
mod tests {
    use crate::feed::aggregator::{FeedAggregator, FeedSource};
    use serde_json::{Value, json};
    use watchlog_common::model::Id;
    use watchlog_db::{
        client::DbClient,
        memory::MemoryStore,
        query::{Row, tables},
    };

    fn store_with_posts(count: i64) -> MemoryStore {
        let store = MemoryStore::with_app_schema();
        for (id, username) in [(1, "viewer"), (2, "friend"), (3, "stranger")] {
            store
                .seed(
                    tables::PROFILES,
                    json!({ "id": id, "username": username, "avatar_url": null }),
                )
                .unwrap();
        }
        store
            .seed(
                tables::FOLLOWS,
                json!({ "follower_id": 1, "following_id": 2 }),
            )
            .unwrap();
        for id in 1..=count {
            store
                .seed(
                    tables::POSTS,
                    json!({
                        "id": id,
                        "user_id": if id % 2 == 0 { 1 } else { 2 },
                        "content": format!("post {id}"),
                        "media_entry_id": null,
                        "image_url": null,
                        "created_at": format!("2025-03-{id:02}T12:00:00Z"),
                    }),
                )
                .unwrap();
        }
        store
            .seed(
                tables::POSTS,
                json!({
                    "id": 100,
                    "user_id": 3,
                    "content": "not followed",
                    "media_entry_id": null,
                    "image_url": null,
                    "created_at": "2025-03-28T12:00:00Z",
                }),
            )
            .unwrap();
        store
    }

    fn feed_row(id: i64, username: &str) -> Row {
        let row: Value = json!({
            "id": id,
            "user_id": 2,
            "content": "from the procedure",
            "media_entry_id": null,
            "image_url": null,
            "created_at": "2025-07-01T00:00:00Z",
            "username": username,
            "avatar_url": null,
            "likes_count": "3",
            "comments_count": 1,
            "is_liked": false,
        });
        row.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn zero_limit_fetches_nothing() {
        let db = DbClient::new(MemoryStore::new());
        let page = FeedAggregator::new(&db, None)
            .fetch_page(Id::new(1), 0, 0)
            .await
            .unwrap();

        assert!(page.posts.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn fallback_pages_follow_full_page_heuristic() {
        let db = DbClient::new(store_with_posts(8));
        let aggregator = FeedAggregator::new(&db, Some(50));

        let first = aggregator.fetch_page(Id::new(1), 5, 0).await.unwrap();
        assert_eq!(first.source, FeedSource::Fallback);
        assert!(first.has_more);
        let ids: Vec<i64> = first.posts.iter().map(|p| p.id.get()).collect();
        assert_eq!(ids, [8, 7, 6, 5, 4]);

        let second = aggregator.fetch_page(Id::new(1), 5, 5).await.unwrap();
        assert!(!second.has_more);
        let ids: Vec<i64> = second.posts.iter().map(|p| p.id.get()).collect();
        assert_eq!(ids, [3, 2, 1]);
    }

    #[tokio::test]
    async fn followee_cap_limits_fallback_authors() {
        let db = DbClient::new(store_with_posts(4));
        let page = FeedAggregator::new(&db, Some(0))
            .fetch_page(Id::new(1), 10, 0)
            .await
            .unwrap();

        assert!(page.posts.iter().all(|post| post.author.id == Id::new(1)));
    }

    #[tokio::test]
    async fn procedure_rows_are_used_when_available() {
        let store = store_with_posts(0);
        store.register_procedure("get_feed", |_, _| Ok(vec![feed_row(40, "friend")]));
        let db = DbClient::new(store);

        let page = FeedAggregator::new(&db, Some(50))
            .fetch_page(Id::new(1), 2, 0)
            .await
            .unwrap();
        assert_eq!(page.source, FeedSource::Procedure);
        assert!(!page.has_more);
        assert_eq!(page.posts[0].likes_count, 3);
    }

    #[tokio::test]
    async fn invalid_procedure_row_is_skipped_without_ending_the_feed() {
        let store = store_with_posts(0);
        store.register_procedure(
            "get_feed",
            |_, _| Ok(vec![feed_row(41, "Jane Doe"), feed_row(40, "friend")]),
        );
        let db = DbClient::new(store);

        let page = FeedAggregator::new(&db, Some(50))
            .fetch_page(Id::new(1), 2, 0)
            .await
            .unwrap();
        assert_eq!(page.source, FeedSource::Procedure);
        assert!(page.has_more);
        let ids: Vec<i64> = page.posts.iter().map(|p| p.id.get()).collect();
        assert_eq!(ids, [40]);
    }
}
