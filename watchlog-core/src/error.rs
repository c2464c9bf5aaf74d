use thiserror::Error;
use watchlog_common::model::{Id, comment::CommentMarker, post::PostMarker};
use watchlog_db::client::DbError;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("No viewer is signed in")]
    NotSignedIn,
    #[error("Comment {0} does not exist")]
    CommentNotFound(Id<CommentMarker>),
    #[error("Post {0} does not exist")]
    PostNotFound(Id<PostMarker>),
    #[error("Comment {parent} is not on post {post_id}")]
    ParentOnOtherPost {
        parent: Id<CommentMarker>,
        post_id: Id<PostMarker>,
    },
    #[error("The session changed while the request was in flight")]
    Stale,
}
