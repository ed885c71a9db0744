//! Feed configuration.
//!
//! Values come from code or from the environment (`CHATLINE_PAGE_SIZE`) and are
//! validated with garde before a feed is built.

use garde::Validate;

use crate::error::FeedError;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 500;

const PAGE_SIZE_ENV: &str = "CHATLINE_PAGE_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Validate)]
#[garde(context(()))]
pub struct FeedConfig {
    /// Maximum number of messages requested per page, live or older.
    #[garde(range(min = 1, max = MAX_PAGE_SIZE))]
    pub page_size: usize,
}

impl FeedConfig {
    pub fn new(page_size: usize) -> Result<Self, FeedError> {
        let config = Self { page_size };
        config
            .validate()
            .map_err(|e| FeedError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Read the configuration from the environment, falling back to defaults
    /// for unset variables.
    pub fn from_env() -> Result<Self, FeedError> {
        match std::env::var(PAGE_SIZE_ENV) {
            Ok(raw) => Self::parse_page_size(&raw),
            Err(_) => Ok(Self::default()),
        }
    }

    fn parse_page_size(raw: &str) -> Result<Self, FeedError> {
        let page_size = raw.trim().parse::<usize>().map_err(|e| {
            FeedError::InvalidConfig(format!("{} must be a positive integer: {}", PAGE_SIZE_ENV, e))
        })?;
        Self::new(page_size)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}
