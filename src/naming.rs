//! Bit-exact filesystem name derivation for podcast directories and episode files.
//!
//! This is deliberately a different, simpler algorithm from the cross-platform
//! reserved-name-aware sanitizer the rest of the codebase historically used: the
//! fingerprint-based naming rule has its own idempotence and fallback invariants
//! that must hold exactly.

use crate::constants::filesystem::{MAX_EPISODE_NAME_LEN, MAX_PODCAST_DIR_LEN};
use crate::model::EpisodeId;
use sha2::{Digest, Sha256};

/// Apply the deterministic sanitization rule to a single component, truncating to
/// `max_len` characters (trimming trailing underscores again after truncation).
fn sanitize_component(input: &str, max_len: usize) -> String {
    let trimmed = input.trim();

    let mut mapped = String::with_capacity(trimmed.len());
    for ch in trimmed.chars() {
        if ch.is_ascii_alphanumeric() || ch == ' ' {
            mapped.push(ch);
        } else {
            mapped.push('_');
        }
    }

    let collapsed_spaces = collapse(&mapped, "  ", " ");
    let underscored = collapsed_spaces.replace(' ', "_");
    let collapsed_underscores = collapse(&underscored, "__", "_");

    let trimmed_underscores = collapsed_underscores.trim_matches('_').to_string();

    let truncated: String = trimmed_underscores.chars().take(max_len).collect();
    truncated.trim_end_matches('_').to_string()
}

/// Repeatedly replace `from` with `to` until no more replacements apply, in a single
/// left-to-right pass per call (mirrors step 3 of the derivation rule, applied once
/// per listed pair in order).
fn collapse(input: &str, from: &str, to: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = current.replace(from, to);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Derive the per-podcast directory name from its title.
pub fn podcast_dir_name(title: &str) -> String {
    let sanitized = sanitize_component(title, MAX_PODCAST_DIR_LEN);
    if sanitized.is_empty() {
        let mut hasher = Sha256::new();
        hasher.update(title.trim().to_lowercase().as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("podcast_{}", &hex[..20])
    } else {
        sanitized
    }
}

/// Derive the episode filename (without extension) from its title, falling back to
/// the episode's fingerprint identifier if sanitization empties the title out.
pub fn episode_file_stem(title: &str, id: &EpisodeId) -> String {
    let sanitized = sanitize_component(title, MAX_EPISODE_NAME_LEN);
    if sanitized.is_empty() {
        id.as_str().to_string()
    } else {
        sanitized
    }
}

/// Full episode filename including the hard-coded `.mp3` suffix (spec open question:
/// the extension is not derived from content type, kept hard-coded intentionally).
pub fn episode_filename(title: &str, id: &EpisodeId) -> String {
    format!("{}.mp3", episode_file_stem(title, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn id() -> EpisodeId {
        EpisodeId::new("https://feed.example/p", "https://cdn.example/e1.mp3", DateTime::from_timestamp(1, 0).unwrap())
    }

    #[test]
    fn sanitizes_punctuation_and_collapses_whitespace() {
        assert_eq!(sanitize_component("Hello,   World!!", 255), "Hello_World");
    }

    #[test]
    fn idempotent() {
        let once = sanitize_component("Weird!!  Title---here", 255);
        let twice = sanitize_component(&once, 255);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_title_falls_back_to_podcast_hash() {
        let name = podcast_dir_name("!!!");
        assert!(name.starts_with("podcast_"));
        assert_eq!(name.len(), "podcast_".len() + 20);
    }

    #[test]
    fn empty_title_falls_back_to_episode_id() {
        let eid = id();
        let stem = episode_file_stem("!!!", &eid);
        assert_eq!(stem, eid.as_str());
    }

    #[test]
    fn truncates_long_titles() {
        let long = "a".repeat(400);
        let name = podcast_dir_name(&long);
        assert!(name.len() <= MAX_PODCAST_DIR_LEN);
    }

    #[test]
    fn episode_filename_has_mp3_suffix() {
        let eid = id();
        assert!(episode_filename("My Episode", &eid).ends_with(".mp3"));
    }
}
