//! CLI argument definitions using clap derive macros.

use clap::{Parser, Subcommand, ValueEnum};

use haul_core::{EpisodeRef, FileSelection};

/// Run download jobs on the embedded engine or an external daemon.
#[derive(Parser, Debug)]
#[command(name = "haul")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a magnet link, .torrent or direct URL
    Get {
        urn: String,

        #[arg(short, long, value_enum, default_value_t = Backend::Embedded)]
        backend: Backend,

        /// 0-based file indices to fetch, comma separated
        #[arg(short, long, value_delimiter = ',')]
        select: Vec<usize>,

        /// Glob matched against file paths (daemon backend only)
        #[arg(short, long)]
        pattern: Vec<String>,

        /// Episode to fetch, e.g. S01E02 (daemon backend only)
        #[arg(short, long, value_parser = parse_episode)]
        episode: Vec<EpisodeRef>,
    },

    /// List the files of a torrent without downloading it
    Files { urn: String },

    /// Restart every job interrupted by a previous run
    Resume {
        #[arg(short, long, value_enum, default_value_t = Backend::Embedded)]
        backend: Backend,
    },

    /// Drop resume entries older than the given age
    Cleanup {
        /// Defaults to the configured stale-resume age
        #[arg(long)]
        max_age_days: Option<u32>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Embedded,
    Daemon,
}

fn parse_episode(s: &str) -> Result<EpisodeRef, String> {
    s.parse()
}

impl Command {
    /// The file selection given to `get`, if any
    pub fn selection(&self) -> Option<FileSelection> {
        let Command::Get {
            select,
            pattern,
            episode,
            ..
        } = self
        else {
            return None;
        };
        let selection = FileSelection {
            file_indices: select.clone(),
            patterns: pattern.clone(),
            episodes: episode.clone(),
        };
        (!selection.is_empty()).then_some(selection)
    }
}
