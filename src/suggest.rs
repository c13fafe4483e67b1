//! Directory suggestion from learned filename patterns.
//!
//! Scoring is a pure function of the filename and the mapping rows, so the
//! submission path can call it without touching engine state.

use crate::store::DirectoryMapping;

/// Characters that split filenames and patterns into tokens.
const DELIMITERS: [char; 4] = ['.', '_', '-', ' '];

/// Weight added per recorded use of a mapping.
const USE_COUNT_WEIGHT: f64 = 0.1;

/// Resolution and codec tokens that describe a release rather than its content.
const RELEASE_NOISE: &[&str] = &[
    "480p", "576p", "720p", "1080p", "1080i", "2160p", "4k", "uhd", "hdr", "x264", "x265", "h264",
    "h265", "hevc", "avc", "xvid", "divx", "aac", "ac3", "dts", "flac", "mp3", "bluray", "brrip",
    "bdrip", "webrip", "webdl", "web", "hdtv", "dvdrip", "remux", "10bit", "proper", "repack",
];

fn tokenize(value: &str) -> Vec<&str> {
    value
        .split(|c| DELIMITERS.contains(&c))
        .filter(|token| !token.is_empty())
        .collect()
}

/// Scores one pattern against an already lower-cased filename.
#[allow(clippy::cast_precision_loss)]
fn score(filename: &str, filename_tokens: &[&str], pattern: &str) -> f64 {
    if filename.is_empty() || !filename.contains(pattern) {
        return 0.0;
    }

    let pattern_tokens = tokenize(pattern);
    if pattern_tokens.is_empty() {
        return pattern.chars().count() as f64 / filename.chars().count() as f64;
    }

    let matches = pattern_tokens
        .iter()
        .filter(|token| filename_tokens.contains(token))
        .count();
    matches as f64 / filename_tokens.len().max(1) as f64
}

/// Returns the mapping that wins the suggestion for `filename`, if any
/// scores above zero.
///
/// `weighted = score * (1 + use_count * 0.1)`; the first mapping wins ties.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn best_mapping<'a>(
    filename: &str,
    mappings: &'a [DirectoryMapping],
) -> Option<&'a DirectoryMapping> {
    let filename = filename.to_lowercase();
    let filename_tokens = tokenize(&filename);

    let mut best: Option<(&DirectoryMapping, f64)> = None;
    for mapping in mappings {
        let pattern = mapping.filename_pattern.to_lowercase();
        let weighted = score(&filename, &filename_tokens, &pattern)
            * (1.0 + mapping.use_count as f64 * USE_COUNT_WEIGHT);

        if weighted <= 0.0 {
            continue;
        }
        // Strictly greater keeps the first mapping on ties.
        if best.is_none_or(|(_, top)| weighted > top) {
            best = Some((mapping, weighted));
        }
    }

    best.map(|(mapping, _)| mapping)
}

/// Returns the best directory for `filename`, or an empty string when no
/// mapping scores above zero.
#[must_use]
pub fn suggest_directory(filename: &str, mappings: &[DirectoryMapping]) -> String {
    best_mapping(filename, mappings)
        .map(|mapping| mapping.directory.clone())
        .unwrap_or_default()
}

fn is_noise(token: &str) -> bool {
    if RELEASE_NOISE.contains(&token) {
        return true;
    }
    let is_year = token.len() == 4
        && token.chars().all(|c| c.is_ascii_digit())
        && matches!(&token[..2], "19" | "20");
    is_year || is_episode_marker(token)
}

/// `s01`, `s01e02`, `e12`.
fn is_episode_marker(token: &str) -> bool {
    let mut chars = token.chars().peekable();
    let mut saw_marker = false;
    while let Some(c) = chars.next() {
        if c != 's' && c != 'e' {
            return false;
        }
        let mut digits = 0;
        while chars.peek().is_some_and(char::is_ascii_digit) {
            chars.next();
            digits += 1;
        }
        if digits == 0 {
            return false;
        }
        saw_marker = true;
    }
    saw_marker
}

/// Derives the pattern learned from a filename.
///
/// Takes the lower-cased stem (trailing extension removed) and cuts it at
/// the first release-noise token, keeping the original delimiters so the
/// pattern stays a substring of similar filenames.
#[must_use]
pub fn derive_pattern(filename: &str) -> String {
    let lower = filename.trim().to_lowercase();
    let stem = match lower.rfind('.') {
        Some(pos) if pos > 0 => &lower[..pos],
        _ => lower.as_str(),
    };

    let mut cut = stem.len();
    let mut offset = 0;
    for token in stem.split(|c| DELIMITERS.contains(&c)) {
        if !token.is_empty() && is_noise(token) {
            cut = offset;
            break;
        }
        offset += token.len() + 1;
    }

    let pattern = stem[..cut.min(stem.len())].trim_end_matches(|c| DELIMITERS.contains(&c));
    if pattern.is_empty() {
        stem.to_string()
    } else {
        pattern.to_string()
    }
}
