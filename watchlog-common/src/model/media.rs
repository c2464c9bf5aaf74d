use crate::model::Id;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash)]
pub struct MediaEntryMarker;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Show,
    Game,
    Book,
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Default, Hash, Error)]
#[error("Unknown media type: {0:?}")]
pub struct UnknownMediaKindError(String);

/// The slice of a logged media entry that is shown alongside a post.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct MediaSummary {
    pub id: Id<MediaEntryMarker>,
    pub title: String,
    pub kind: MediaKind,
    pub rating: Option<f64>,
    pub cover_url: Option<String>,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Show => "show",
            MediaKind::Game => "game",
            MediaKind::Book => "book",
        }
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = UnknownMediaKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "movie" | "film" => Ok(MediaKind::Movie),
            "show" | "tv" | "series" => Ok(MediaKind::Show),
            "game" => Ok(MediaKind::Game),
            "book" => Ok(MediaKind::Book),
            _ => Err(UnknownMediaKindError(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::model::media::MediaKind;

    #[test]
    fn kind_parsing_accepts_aliases() {
        assert_eq!("Movie".parse::<MediaKind>(), Ok(MediaKind::Movie));
        assert_eq!("tv".parse::<MediaKind>(), Ok(MediaKind::Show));
        assert_eq!("book".parse::<MediaKind>(), Ok(MediaKind::Book));
        assert!("podcast".parse::<MediaKind>().is_err());
    }
}
