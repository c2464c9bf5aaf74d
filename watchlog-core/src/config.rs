use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error parsing .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("Error parsing environment: {0}")]
    Envy(#[from] envy::Error),
}

fn default_feed_page_size() -> usize {
    10
}

fn default_initial_visible_count() -> usize {
    5
}

fn default_reveal_step() -> usize {
    5
}

fn default_followee_cap() -> usize {
    50
}

#[derive(Clone, Eq, PartialEq, Debug, Hash, Deserialize)]
pub struct WatchlogEnv {
    pub database_url: String,
    #[serde(default = "default_feed_page_size")]
    pub feed_page_size: usize,
    #[serde(default = "default_initial_visible_count")]
    pub initial_visible_count: usize,
    #[serde(default = "default_reveal_step")]
    pub reveal_step: usize,
    /// How many followees the fallback feed query draws from. `0` lifts the cap.
    #[serde(default = "default_followee_cap")]
    pub followee_cap: usize,
}

/// The feed knobs a [`crate::session::Session`] runs with.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub struct FeedSettings {
    pub page_size: usize,
    pub initial_visible_count: usize,
    pub reveal_step: usize,
    pub followee_cap: Option<usize>,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            page_size: default_feed_page_size(),
            initial_visible_count: default_initial_visible_count(),
            reveal_step: default_reveal_step(),
            followee_cap: Some(default_followee_cap()),
        }
    }
}

impl From<&WatchlogEnv> for FeedSettings {
    fn from(env: &WatchlogEnv) -> Self {
        Self {
            page_size: env.feed_page_size,
            initial_visible_count: env.initial_visible_count,
            reveal_step: env.reveal_step,
            followee_cap: (env.followee_cap > 0).then_some(env.followee_cap),
        }
    }
}

const DEFAULT_LOG_FILTER: &str = "watchlog_core=debug,watchlog_db=debug,sqlx=warn";

/// Installs the global subscriber. Later calls leave the first subscriber in place.
pub fn install_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_err() {
        debug!("Tracing subscriber was already installed");
    }
}

pub fn load_env() -> Result<WatchlogEnv, ConfigError> {
    if let Err(e) = dotenvy::dotenv() {
        if e.not_found() {
            debug!("No .env file found");
        } else {
            return Err(e.into());
        }
    }

    envy::from_env().map_err(ConfigError::from)
}

#[cfg(test)]
mod tests {
    use crate::config::{FeedSettings, WatchlogEnv};

    #[test]
    fn defaults_apply_to_missing_keys() {
        let env: WatchlogEnv = envy::from_iter([(
            "DATABASE_URL".to_owned(),
            "postgres://localhost/watchlog".to_owned(),
        )])
        .unwrap();

        assert_eq!(env.feed_page_size, 10);
        assert_eq!(FeedSettings::from(&env), FeedSettings::default());
    }

    #[test]
    fn zero_followee_cap_disables_it() {
        let env: WatchlogEnv = envy::from_iter([
            ("DATABASE_URL".to_owned(), "postgres://db".to_owned()),
            ("FOLLOWEE_CAP".to_owned(), "0".to_owned()),
            ("REVEAL_STEP".to_owned(), "8".to_owned()),
        ])
        .unwrap();
        let settings = FeedSettings::from(&env);

        assert_eq!(settings.followee_cap, None);
        assert_eq!(settings.reveal_step, 8);
    }

    #[test]
    fn database_url_is_required() {
        assert!(envy::from_iter::<_, WatchlogEnv>(Vec::<(String, String)>::new()).is_err());
    }
}
