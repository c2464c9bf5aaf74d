pub mod comment;
pub mod follow;
pub mod media;
pub mod post;
pub mod user;

use crate::model::{media::UnknownMediaKindError, user::InvalidUserHandleError};
use derive_where::derive_where;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, marker::PhantomData};
use thiserror::Error;

#[derive(Clone, Eq, PartialEq, Debug, Hash, Error)]
pub enum ModelValidationError {
    #[error(transparent)]
    UserHandle(#[from] InvalidUserHandleError),
    #[error(transparent)]
    EmptyText(#[from] EmptyTextError),
    #[error(transparent)]
    MediaKind(#[from] UnknownMediaKindError),
}

/// Raised when user-entered text is blank after trimming.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Error)]
#[error("{0} text must not be empty")]
pub struct EmptyTextError(pub &'static str);

/// Row id as assigned by the relational store, tagged with the entity it belongs to.
#[derive_where(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Debug,
    Default,
    Hash,
    Serialize,
    Deserialize
)]
#[serde(transparent)]
pub struct Id<Marker>(i64, #[serde(skip)] PhantomData<Marker>);

impl<Marker> Id<Marker> {
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self(id, PhantomData)
    }

    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }
}

impl<Marker> Display for Id<Marker> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl<Marker> From<i64> for Id<Marker> {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl<Marker> From<Id<Marker>> for i64 {
    fn from(value: Id<Marker>) -> Self {
        value.0
    }
}

/// Trims `text` and rejects it when nothing is left.
pub(crate) fn non_empty_text(text: &str, what: &'static str) -> Result<String, EmptyTextError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(EmptyTextError(what))
    } else {
        Ok(trimmed.to_owned())
    }
}
