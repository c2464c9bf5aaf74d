//! The per-user service the presentation layer talks to.
//!
//! A [`Session`] owns the loaded feed, a comment tree per post and the thread
//! viewer. Reads go store -> aggregator -> state; writes go to the store first
//! (or optimistically to state, for likes) and are folded back in afterwards.
//!
//! Every request remembers the generation it started under. Signing in or out
//! and [`Session::dispose`] bump the generation, so a response that arrives
//! afterwards is dropped with [`CoreError::Stale`] instead of overwriting newer
//! state.

use crate::{
    comments::{
        thread::{ThreadSnapshot, ThreadView},
        tree::CommentTree,
    },
    config::{FeedSettings, WatchlogEnv},
    error::{CoreError, Result},
    feed::{
        aggregator::{FeedAggregator, FeedPageResult},
        likes::{self, LikeToggle},
        pagination::FeedPage,
    },
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use watchlog_common::model::{
    Id,
    comment::{Comment, CommentMarker, CommentText, CreateComment},
    follow::{FollowCounts, Relationship},
    media::MediaEntryMarker,
    post::{CreatePost, Post, PostContent, PostMarker},
    user::UserMarker,
};
use watchlog_db::{
    client::{DbClient, DbError, FollowSide},
    pg::PgStore,
    store::StoreClient,
};

/// What changed after a session mutation.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SessionEvent {
    FeedChanged,
    CommentsChanged(Id<PostMarker>),
    ThreadChanged,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// How a like toggle settled.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum LikeOutcome {
    /// The store accepted the change; `liked` is the new state.
    Applied { liked: bool },
    /// The store rejected the change and the optimistic flip was undone.
    RolledBack,
}

struct SessionState {
    viewer: Option<Id<UserMarker>>,
    feed: FeedPage,
    comments: HashMap<Id<PostMarker>, CommentTree>,
    thread: ThreadView,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    callbacks: Vec<(ObserverId, Observer)>,
}

pub struct Session<S> {
    db: Arc<DbClient<S>>,
    settings: FeedSettings,
    state: Mutex<SessionState>,
    generation: AtomicU64,
    observers: Mutex<Observers>,
}

/// Keeps a follow count watch alive. Dropping it stops the watch.
pub struct FollowCountsWatch {
    task: JoinHandle<()>,
}

impl Drop for FollowCountsWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SessionState {
    fn new(viewer: Option<Id<UserMarker>>, settings: FeedSettings) -> Self {
        Self {
            viewer,
            feed: FeedPage::new(settings.initial_visible_count),
            comments: HashMap::new(),
            thread: ThreadView::Closed,
        }
    }

    fn post_of_comment(&self, comment_id: Id<CommentMarker>) -> Option<Id<PostMarker>> {
        self.comments
            .iter()
            .find(|(_, tree)| tree.contains(comment_id))
            .map(|(&post_id, _)| post_id)
    }
}

impl Session<PgStore> {
    /// A signed-out session on the database named by `env`.
    pub async fn connect(env: &WatchlogEnv) -> Result<Self> {
        let store = PgStore::connect(&env.database_url)
            .await
            .map_err(DbError::from)?;
        info!("Connected to the store");

        Ok(Self::new(DbClient::new(store), FeedSettings::from(env)))
    }
}

impl<S: StoreClient> Session<S> {
    #[must_use]
    pub fn new(db: DbClient<S>, settings: FeedSettings) -> Self {
        Self {
            db: Arc::new(db),
            settings,
            state: Mutex::new(SessionState::new(None, settings)),
            generation: AtomicU64::new(0),
            observers: Mutex::new(Observers::default()),
        }
    }

    #[must_use]
    pub fn db(&self) -> &DbClient<S> {
        &self.db
    }

    #[must_use]
    pub fn settings(&self) -> FeedSettings {
        self.settings
    }

    #[must_use]
    pub fn viewer(&self) -> Option<Id<UserMarker>> {
        self.state.lock().viewer
    }

    pub fn sign_in(&self, viewer: Id<UserMarker>) {
        self.reset(Some(viewer));
        debug!(%viewer, "Signed in");
    }

    /// Drops the feed, every cached comment tree and the thread view.
    pub fn sign_out(&self) {
        self.reset(None);
        debug!("Signed out");
    }

    /// Detaches every observer and turns responses still in flight into no-ops.
    pub fn dispose(&self) {
        {
            let _state = self.state.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        self.observers.lock().callbacks.clear();
    }

    pub fn observe(&self, callback: impl Fn(SessionEvent) + Send + Sync + 'static) -> ObserverId {
        let mut observers = self.observers.lock();
        let id = ObserverId(observers.next_id);
        observers.next_id += 1;
        observers.callbacks.push((id, Arc::new(callback)));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.callbacks.len();
        observers.callbacks.retain(|(observer, _)| *observer != id);
        observers.callbacks.len() != before
    }

    fn notify(&self, events: &[SessionEvent]) {
        let callbacks: Vec<Observer> = self
            .observers
            .lock()
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for &event in events {
            for callback in &callbacks {
                callback(event);
            }
        }
    }

    fn reset(&self, viewer: Option<Id<UserMarker>>) {
        {
            let mut state = self.state.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            *state = SessionState::new(viewer, self.settings);
        }
        self.notify(&[SessionEvent::FeedChanged, SessionEvent::ThreadChanged]);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The current generation and viewer, for a request that needs a viewer.
    fn begin(&self) -> Result<(u64, Id<UserMarker>)> {
        let state = self.state.lock();
        let viewer = state.viewer.ok_or(CoreError::NotSignedIn)?;
        Ok((self.generation(), viewer))
    }

    /// Applies a response to the state if no sign-in, sign-out or dispose happened
    /// since `generation` was read.
    fn commit<T>(&self, generation: u64, apply: impl FnOnce(&mut SessionState) -> T) -> Result<T> {
        let mut state = self.state.lock();
        if self.generation() != generation {
            debug!(generation, "Dropping response of a superseded request");
            return Err(CoreError::Stale);
        }
        Ok(apply(&mut state))
    }

    // Feed

    /// Fetches rows `[offset, offset + limit - 1]` of the viewer's feed. Offset zero
    /// replaces the loaded posts; anything else appends.
    ///
    /// On failure the loaded feed is left exactly as it was.
    pub async fn get_feed_page(&self, limit: usize, offset: usize) -> Result<FeedPageResult> {
        let (generation, viewer) = self.begin()?;

        let page = FeedAggregator::new(&self.db, self.settings.followee_cap)
            .fetch_page(viewer, limit, offset)
            .await
            .inspect_err(|error| {
                warn!(%error, %viewer, offset, "Feed fetch failed, keeping loaded feed");
            })?;

        self.commit(generation, |state| {
            state.feed.merge(offset, page.posts.clone(), page.has_more);
        })?;
        self.notify(&[SessionEvent::FeedChanged]);

        Ok(page)
    }

    /// Reloads the first page, replacing the loaded feed.
    pub async fn refresh_feed(&self) -> Result<FeedPageResult> {
        self.get_feed_page(self.settings.page_size, 0).await
    }

    /// Reveals up to `step` more loaded posts without touching the network.
    pub fn reveal_more(&self, step: usize) {
        self.state.lock().feed.reveal_more(step);
        self.notify(&[SessionEvent::FeedChanged]);
    }

    /// [`Self::reveal_more`] by the configured step.
    pub fn reveal_next(&self) {
        self.reveal_more(self.settings.reveal_step);
    }

    /// Fetches the page after the loaded posts, if everything loaded is already
    /// visible and the store may have more. `None` means nothing was fetched.
    pub async fn load_more_from_server(&self) -> Result<Option<FeedPageResult>> {
        let offset = {
            let state = self.state.lock();
            if !state.feed.needs_server_fetch() {
                return Ok(None);
            }
            state.feed.posts().len()
        };

        self.get_feed_page(self.settings.page_size, offset)
            .await
            .map(Some)
    }

    #[must_use]
    pub fn feed(&self) -> FeedPage {
        self.state.lock().feed.clone()
    }

    #[must_use]
    pub fn visible_posts(&self) -> Vec<Post> {
        self.state.lock().feed.visible_posts().to_vec()
    }

    // Likes

    /// Flips the viewer's like on a loaded post right away, then writes it to the
    /// store. A rejected write is undone and reported as [`LikeOutcome::RolledBack`].
    pub async fn toggle_like(&self, post_id: Id<PostMarker>) -> Result<LikeOutcome> {
        let (generation, viewer) = self.begin()?;

        let toggle = self
            .commit(
                generation,
                |state| likes::apply_optimistic(&mut state.feed, post_id),
            )?
            .ok_or(CoreError::PostNotFound(post_id))?;
        self.notify(&[SessionEvent::FeedChanged]);

        let written = if toggle.liked() {
            self.db.insert_like(post_id, viewer).await
        } else {
            self.db.delete_like(post_id, viewer).await
        };

        match written {
            Ok(()) => Ok(LikeOutcome::Applied {
                liked: toggle.liked(),
            }),
            Err(error) => {
                warn!(%error, %post_id, liked = toggle.liked(), "Like toggle failed, rolling back");
                self.undo_like(generation, toggle)?;
                Ok(LikeOutcome::RolledBack)
            }
        }
    }

    fn undo_like(&self, generation: u64, toggle: LikeToggle) -> Result<()> {
        let restored = self.commit(generation, |state| likes::rollback(&mut state.feed, toggle))?;
        if restored {
            self.notify(&[SessionEvent::FeedChanged]);
        }
        Ok(())
    }

    // Comments and the thread viewer

    /// Fetches a post's comments, caches the tree and returns it.
    ///
    /// The loaded post's `comments_count` is brought in line with the tree, and an
    /// open thread on this post is re-checked against it.
    pub async fn get_comment_tree(&self, post_id: Id<PostMarker>) -> Result<CommentTree> {
        let generation = self.generation();
        let tree = CommentTree::build(self.db.fetch_comments(post_id).await?);

        let (count_changed, thread_changed) = self.commit(generation, |state| {
            let count = u32::try_from(tree.len()).unwrap_or(u32::MAX);
            let count_changed = match state.feed.post_mut(post_id) {
                Some(post) if post.comments_count != count => {
                    post.comments_count = count;
                    true
                }
                _ => false,
            };

            let thread_changed = if state.thread.post_id() == Some(post_id) {
                let reconciled = state.thread.reconcile(&tree);
                let changed = reconciled != state.thread;
                state.thread = reconciled;
                changed
            } else {
                false
            };

            state.comments.insert(post_id, tree.clone());
            (count_changed, thread_changed)
        })?;

        let mut events = vec![SessionEvent::CommentsChanged(post_id)];
        if count_changed {
            events.push(SessionEvent::FeedChanged);
        }
        if thread_changed {
            debug!(%post_id, "Focused comment is gone, closing thread");
            events.push(SessionEvent::ThreadChanged);
        }
        self.notify(&events);

        Ok(tree)
    }

    #[must_use]
    pub fn cached_comment_tree(&self, post_id: Id<PostMarker>) -> Option<CommentTree> {
        self.state.lock().comments.get(&post_id).cloned()
    }

    /// Fetches the post's comments and focuses `comment_id`.
    pub async fn open_thread(
        &self,
        comment_id: Id<CommentMarker>,
        post_id: Id<PostMarker>,
    ) -> Result<ThreadSnapshot> {
        let generation = self.generation();
        let tree = self.get_comment_tree(post_id).await?;

        let snapshot = self.commit(generation, |state| {
            let view = ThreadView::open(post_id, comment_id, &tree)?;
            state.thread = view;
            view.snapshot(&tree)
        })?;
        let snapshot = snapshot.ok_or(CoreError::CommentNotFound(comment_id))?;
        self.notify(&[SessionEvent::ThreadChanged]);

        Ok(snapshot)
    }

    /// Moves the focus of the open thread to another comment of the same post,
    /// such as a reply or an ancestor. Uses the cached tree.
    pub fn navigate_thread(&self, comment_id: Id<CommentMarker>) -> Result<ThreadSnapshot> {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(post_id) = state.thread.post_id() else {
                return Err(CoreError::CommentNotFound(comment_id));
            };
            let tree = state.comments.get(&post_id);
            let view = tree
                .and_then(|tree| ThreadView::open(post_id, comment_id, tree))
                .ok_or(CoreError::CommentNotFound(comment_id))?;
            let snapshot = tree.and_then(|tree| view.snapshot(tree));
            state.thread = view;
            snapshot
        };
        self.notify(&[SessionEvent::ThreadChanged]);

        snapshot.ok_or(CoreError::CommentNotFound(comment_id))
    }

    pub fn close_thread(&self) {
        self.state.lock().thread = ThreadView::Closed;
        self.notify(&[SessionEvent::ThreadChanged]);
    }

    #[must_use]
    pub fn thread(&self) -> ThreadView {
        self.state.lock().thread
    }

    /// The open thread as of the cached tree.
    #[must_use]
    pub fn thread_snapshot(&self) -> Option<ThreadSnapshot> {
        let state = self.state.lock();
        let tree = state.comments.get(&state.thread.post_id()?)?;
        state.thread.snapshot(tree)
    }

    /// Re-fetches the open thread's post and re-locates the focused comment. `None`
    /// if no thread is open, including when the refresh closed it.
    ///
    /// A failed fetch is logged and leaves the thread as it was.
    pub async fn refresh_focused_thread(&self) -> Result<Option<ThreadSnapshot>> {
        let Some(post_id) = self.thread().post_id() else {
            return Ok(None);
        };

        self.get_comment_tree(post_id).await.inspect_err(|error| {
            warn!(%error, %post_id, "Thread refresh failed");
        })?;

        Ok(self.thread_snapshot())
    }

    /// Posts a comment or a reply as the viewer. Blank text does nothing and
    /// returns `None`. A parent has to be a comment on the same post.
    pub async fn create_comment(
        &self,
        post_id: Id<PostMarker>,
        text: &str,
        image_url: Option<String>,
        parent_comment_id: Option<Id<CommentMarker>>,
    ) -> Result<Option<Comment>> {
        let Ok(text) = CommentText::new(text) else {
            debug!(%post_id, "Ignoring blank comment");
            return Ok(None);
        };
        let (_, viewer) = self.begin()?;

        if let Some(parent) = parent_comment_id {
            let parent_post_id = self.comment_post_id(parent).await?;
            if parent_post_id != post_id {
                return Err(CoreError::ParentOnOtherPost { parent, post_id });
            }
        }

        let comment = self
            .db
            .create_comment(
                viewer,
                &CreateComment {
                    post_id,
                    text,
                    image_url,
                    parent_comment_id,
                },
            )
            .await?;
        self.get_comment_tree(post_id).await?;

        Ok(Some(comment))
    }

    /// Replaces a comment's text. Returns `false` without writing if `text` is blank.
    pub async fn edit_comment(&self, comment_id: Id<CommentMarker>, text: &str) -> Result<bool> {
        let Ok(text) = CommentText::new(text) else {
            debug!(%comment_id, "Ignoring blank comment edit");
            return Ok(false);
        };
        let post_id = self.comment_post_id(comment_id).await?;

        if !self.db.update_comment_text(comment_id, &text).await? {
            return Err(CoreError::CommentNotFound(comment_id));
        }
        self.get_comment_tree(post_id).await?;

        Ok(true)
    }

    /// Deletes a comment along with its replies. If it was the focused comment the
    /// thread closes right away, before the tree is re-fetched.
    pub async fn delete_comment(&self, comment_id: Id<CommentMarker>) -> Result<()> {
        let post_id = self.comment_post_id(comment_id).await?;

        if !self.db.delete_comment(comment_id).await? {
            return Err(CoreError::CommentNotFound(comment_id));
        }

        let closed = {
            let mut state = self.state.lock();
            let focused = state.thread.focused() == Some(comment_id);
            if focused {
                state.thread = ThreadView::Closed;
            }
            focused
        };
        if closed {
            self.notify(&[SessionEvent::ThreadChanged]);
        }

        self.get_comment_tree(post_id).await?;
        Ok(())
    }

    async fn comment_post_id(&self, comment_id: Id<CommentMarker>) -> Result<Id<PostMarker>> {
        let cached = self.state.lock().post_of_comment(comment_id);
        if let Some(post_id) = cached {
            return Ok(post_id);
        }

        self.db
            .fetch_comment_post_id(comment_id)
            .await?
            .ok_or(CoreError::CommentNotFound(comment_id))
    }

    // Posts

    /// Publishes a post as the viewer and puts it on top of the feed. Blank
    /// content does nothing and returns `None`.
    pub async fn create_post(
        &self,
        content: &str,
        image_url: Option<String>,
        media_entry_id: Option<Id<MediaEntryMarker>>,
    ) -> Result<Option<Post>> {
        let Ok(content) = PostContent::new(content) else {
            debug!("Ignoring blank post");
            return Ok(None);
        };
        let (generation, viewer) = self.begin()?;

        let post = self
            .db
            .create_post(
                viewer,
                &CreatePost {
                    content,
                    image_url,
                    media_entry_id,
                },
            )
            .await?;

        self.commit(generation, |state| state.feed.prepend(post.clone()))?;
        self.notify(&[SessionEvent::FeedChanged]);

        Ok(Some(post))
    }

    /// Replaces a post's text. Returns `false` without writing if `content` is blank.
    pub async fn edit_post(&self, post_id: Id<PostMarker>, content: &str) -> Result<bool> {
        let Ok(content) = PostContent::new(content) else {
            debug!(%post_id, "Ignoring blank post edit");
            return Ok(false);
        };
        let generation = self.generation();

        if !self.db.update_post_content(post_id, &content).await? {
            return Err(CoreError::PostNotFound(post_id));
        }

        self.commit(generation, |state| {
            if let Some(post) = state.feed.post_mut(post_id) {
                post.content = String::from(content);
            }
        })?;
        self.notify(&[SessionEvent::FeedChanged]);

        Ok(true)
    }

    /// Deletes a post and forgets its comments, closing a thread open on it.
    pub async fn delete_post(&self, post_id: Id<PostMarker>) -> Result<()> {
        let generation = self.generation();

        if !self.db.delete_post(post_id).await? {
            return Err(CoreError::PostNotFound(post_id));
        }

        let thread_closed = self.commit(generation, |state| {
            state.feed.remove(post_id);
            state.comments.remove(&post_id);
            let open_on_post = state.thread.post_id() == Some(post_id);
            if open_on_post {
                state.thread = ThreadView::Closed;
            }
            open_on_post
        })?;

        let mut events = vec![
            SessionEvent::FeedChanged,
            SessionEvent::CommentsChanged(post_id),
        ];
        if thread_closed {
            events.push(SessionEvent::ThreadChanged);
        }
        self.notify(&events);

        Ok(())
    }

    // Follows

    /// Follow edges between the viewer and `profile`, in both directions.
    pub async fn relationship(&self, profile: Id<UserMarker>) -> Result<Relationship> {
        let (_, viewer) = self.begin()?;
        Ok(self.db.fetch_relationship(viewer, profile).await?)
    }

    pub async fn follow_counts(&self, profile: Id<UserMarker>) -> Result<FollowCounts> {
        Ok(self.db.fetch_follow_counts(profile).await?)
    }
}

impl<S: StoreClient + 'static> Session<S> {
    /// Calls `on_change` with fresh counts for `profile` whenever someone follows or
    /// unfollows them, or they follow or unfollow someone.
    pub async fn watch_follow_counts(
        &self,
        profile: Id<UserMarker>,
        on_change: impl Fn(FollowCounts) + Send + 'static,
    ) -> Result<FollowCountsWatch> {
        let (mut followers, mut following) = tokio::try_join!(
            self.db.subscribe_follows(profile, FollowSide::Followers),
            self.db.subscribe_follows(profile, FollowSide::Following),
        )?;
        let db = Arc::clone(&self.db);

        let task = tokio::spawn(async move {
            let (mut followers_open, mut following_open) = (true, true);
            loop {
                let (side, event) = tokio::select! {
                    event = followers.recv(), if followers_open => (FollowSide::Followers, event),
                    event = following.recv(), if following_open => (FollowSide::Following, event),
                    else => break,
                };
                let Some(event) = event else {
                    debug!(%profile, ?side, "Follow change stream ended");
                    match side {
                        FollowSide::Followers => followers_open = false,
                        FollowSide::Following => following_open = false,
                    }
                    continue;
                };

                debug!(%profile, kind = ?event.kind, "Follow edge changed");
                match db.fetch_follow_counts(profile).await {
                    Ok(counts) => on_change(counts),
                    Err(error) => warn!(%error, %profile, "Could not refresh follow counts"),
                }
            }
            debug!(%profile, "Follow count watch stopped");
        });

        Ok(FollowCountsWatch { task })
    }
}
