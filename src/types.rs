use serde::{Deserialize, Serialize};

/// Visibility of an uploaded video on the destination platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Private,
    Unlisted,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Private => "private",
            Privacy::Unlisted => "unlisted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Direction {
    /// Instagram Reels -> YouTube Shorts, then YouTube Shorts -> Instagram Reels
    Both,
    #[value(name = "reels-to-shorts")]
    ReelsToShorts,
    #[value(name = "shorts-to-reels")]
    ShortsToReels,
}

impl Direction {
    pub fn includes_reels_to_shorts(&self) -> bool {
        matches!(self, Direction::Both | Direction::ReelsToShorts)
    }

    pub fn includes_shorts_to_reels(&self) -> bool {
        matches!(self, Direction::Both | Direction::ShortsToReels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}
