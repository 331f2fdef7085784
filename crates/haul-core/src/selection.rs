//! Resolve a [`FileSelection`] against a file manifest.

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{FileEntry, FileSelection};

/// Indices selected by `selection` within `files`: explicit indices, files
/// matching any glob pattern and files matching any episode descriptor.
/// The result is sorted and free of duplicates.
pub fn resolve(selection: &FileSelection, files: &[FileEntry]) -> Result<Vec<usize>> {
    let mut indices = selection.file_indices.clone();

    let globs = selection
        .patterns
        .iter()
        .map(|p| glob_to_regex(p))
        .collect::<Result<Vec<_>>>()?;

    let episodes = selection
        .episodes
        .iter()
        .map(|ep| episode_regex(ep.season, ep.episode))
        .collect::<Result<Vec<_>>>()?;

    for file in files {
        let name = file.path.rsplit(['/', '\\']).next().unwrap_or(&file.path);
        let by_glob = globs.iter().any(|re| re.is_match(&file.path) || re.is_match(name));
        let by_episode = episodes.iter().any(|re| re.is_match(name));
        if by_glob || by_episode {
            indices.push(file.index);
        }
    }

    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

/// 1-based, comma separated form used on the daemon wire
pub fn to_wire_indices(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| (i + 1).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::Config(format!("bad file pattern {}: {}", pattern, e)))
}

fn episode_regex(season: u32, episode: u32) -> Result<Regex> {
    Regex::new(&format!(r"(?i)s0*{}\s*e0*{}(?:\D|$)", season, episode))
        .map_err(|e| Error::Config(format!("bad episode S{}E{}: {}", season, episode, e)))
}
