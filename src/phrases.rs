//! Banned phrase lists.
//!
//! Two files feed the list: one in plain lowercase text and one where every
//! character has been shifted up by one code point, so the offending words
//! are not stored readable on disk. Both are merged into one ordered set and
//! matched case-insensitively against page text.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct BannedPhrases {
    patterns: Vec<(String, Regex)>,
}

impl BannedPhrases {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns = phrases
            .into_iter()
            .map(|p| p.into().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .filter_map(|p| compile_phrase(&p).map(|re| (p, re)))
            .collect();

        Self { patterns }
    }

    pub fn empty() -> Self {
        Self::new(Vec::<String>::new())
    }

    /// Loads the plain list and the encoded list. A missing file contributes nothing.
    pub fn load(plain: impl AsRef<Path>, encoded: impl AsRef<Path>) -> Result<Self> {
        let mut phrases = read_phrase_lines(plain.as_ref())?;
        let plain_count = phrases.len();

        phrases.extend(
            read_phrase_lines(encoded.as_ref())?
                .iter()
                .map(|line| decode_phrase(line)),
        );

        info!(
            "Loaded {} banned phrases ({} plain, {} encoded)",
            phrases.len(),
            plain_count,
            phrases.len() - plain_count
        );

        Ok(Self::new(phrases))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// First phrase, in list order, that occurs in `text`.
    pub fn find_match(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(phrase, _)| phrase.as_str())
    }
}

fn compile_phrase(phrase: &str) -> Option<Regex> {
    let compiled = RegexBuilder::new(phrase)
        .case_insensitive(true)
        .build()
        .or_else(|_| {
            debug!("Phrase {:?} is not a valid pattern, matching literally", phrase);
            RegexBuilder::new(&regex::escape(phrase))
                .case_insensitive(true)
                .build()
        });

    match compiled {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Dropping banned phrase {:?}: {}", phrase, e);
            None
        }
    }
}

fn read_phrase_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        warn!("Phrase list {:?} not found, skipping", path);
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read phrase list: {:?}", path))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn shift_chars(word: &str, up: bool) -> String {
    word.chars()
        .map(|c| {
            let code = c as u32;
            let shifted = if up {
                code.checked_add(1)
            } else {
                code.checked_sub(1)
            };
            shifted.and_then(char::from_u32).unwrap_or(c)
        })
        .collect()
}

pub fn encode_phrase(word: &str) -> String {
    shift_chars(word, true)
}

pub fn decode_phrase(word: &str) -> String {
    shift_chars(word, false)
}

/// Writes `<stem>_encoded.txt` next to `path` and returns its location.
pub fn encode_file(path: &Path) -> Result<PathBuf> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read phrase list: {:?}", path))?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Phrase list path has no file name")?;
    let target = path.with_file_name(format!("{}_encoded.txt", stem));

    let mut encoded = String::with_capacity(content.len());
    for line in content.lines().map(str::trim) {
        // comments and blanks stay readable so the file keeps its layout
        if line.is_empty() || line.starts_with('#') {
            encoded.push_str(line);
        } else {
            encoded.push_str(&encode_phrase(line));
        }
        encoded.push('\n');
    }

    std::fs::write(&target, encoded)
        .with_context(|| format!("Failed to write encoded list: {:?}", target))?;

    Ok(target)
}
