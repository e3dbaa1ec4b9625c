use std::path::PathBuf;

use clap::Parser;

use crate::types::{Direction, LogLevel, Privacy};

/// Repost Instagram Reels to YouTube Shorts and YouTube Shorts to Instagram Reels.
#[derive(Parser, Debug)]
#[command(name = "reelshorts", version)]
pub struct Args {
    /// YouTube search query for Shorts (defaults to SHORTS_QUERY)
    pub query: Option<String>,

    /// Upper bound on new videos per direction
    #[clap(long, short = 'n')]
    pub max_videos: Option<usize>,

    #[clap(long, value_enum, default_value = "both")]
    pub direction: Direction,

    /// Visibility of uploaded Shorts
    #[clap(long, value_enum, default_value = "public")]
    pub privacy: Privacy,

    /// Fixed caption/title instead of the generated one
    #[clap(long)]
    pub caption: Option<String>,

    /// Parallel downloads
    #[clap(long)]
    pub workers: Option<usize>,

    /// Directory holding credentials, caches, downloads and the log
    #[clap(long, default_value = ".")]
    pub work_dir: PathBuf,

    /// Defaults to <work-dir>/.env
    #[clap(long)]
    pub env_file: Option<PathBuf>,

    /// Ignored when RUST_LOG is set
    #[clap(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["reelshorts"]).unwrap();
        assert_eq!(args.query, None);
        assert_eq!(args.direction, Direction::Both);
        assert_eq!(args.privacy, Privacy::Public);
        assert_eq!(args.work_dir, PathBuf::from("."));
        assert_eq!(args.log_level, LogLevel::Info);
    }

    #[test]
    fn test_query_and_flags() {
        let args = Args::try_parse_from([
            "reelshorts",
            "funny cats",
            "-n",
            "3",
            "--direction",
            "shorts-to-reels",
            "--privacy",
            "unlisted",
        ])
        .unwrap();
        assert_eq!(args.query.as_deref(), Some("funny cats"));
        assert_eq!(args.max_videos, Some(3));
        assert_eq!(args.direction, Direction::ShortsToReels);
        assert_eq!(args.privacy, Privacy::Unlisted);
    }

    #[test]
    fn test_unknown_direction_rejected() {
        assert!(Args::try_parse_from(["reelshorts", "--direction", "sideways"]).is_err());
    }
}
