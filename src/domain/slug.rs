//! Heading anchors for the table of contents.
//!
//! ASCII text goes straight through `slug`; Chinese characters are
//! transliterated with `pinyin` first so `基线对齐` becomes `ji-xian-dui-qi`.

use std::collections::HashMap;

use pinyin::{Pinyin, ToPinyin};
use slug::slugify;
use thiserror::Error;

/// Anchor used for headings whose text yields no usable slug.
const FALLBACK_ANCHOR: &str = "section";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlugError {
    #[error("slug source text is empty")]
    EmptyInput,
    #[error("failed to derive slug from `{input}`")]
    Unrepresentable { input: String },
}

/// Derive a slug from human-readable heading text.
pub fn derive_slug(input: &str) -> Result<String, SlugError> {
    if input.trim().is_empty() {
        return Err(SlugError::EmptyInput);
    }

    let candidate = slugify(transliterate_to_ascii(input));
    if candidate.is_empty() {
        return Err(SlugError::Unrepresentable {
            input: input.to_string(),
        });
    }

    Ok(candidate)
}

/// Hands out anchors that are unique within a single document.
///
/// Repeated headings get monotonic suffixes (`setup`, `setup-2`, `setup-3`).
/// Headings without a usable slug share the `section` base.
#[derive(Default, Debug)]
pub struct AnchorSlugger {
    occurrences: HashMap<String, usize>,
}

impl AnchorSlugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anchor_for(&mut self, heading: &str) -> String {
        let base = derive_slug(heading).unwrap_or_else(|_| FALLBACK_ANCHOR.to_string());
        let count = self.occurrences.entry(base.clone()).or_insert(0);
        *count += 1;

        if *count == 1 {
            base
        } else {
            format!("{base}-{}", *count)
        }
    }

    /// Take an author-supplied anchor verbatim and count it, so a later
    /// heading with the same slug gets a suffix.
    pub fn claim(&mut self, anchor: &str) -> String {
        *self.occurrences.entry(anchor.to_string()).or_insert(0) += 1;
        anchor.to_string()
    }
}

fn transliterate_to_ascii(input: &str) -> String {
    let mut output = String::with_capacity(input.len());

    for ch in input.chars() {
        if ch.is_ascii() {
            output.push(ch);
            continue;
        }

        match ch.to_pinyin() {
            Some(py) => append_pinyin(&mut output, py),
            None if ch.is_whitespace() => output.push(' '),
            None => output.push(ch),
        }
    }

    output
}

fn append_pinyin(buffer: &mut String, pinyin: Pinyin) {
    if !buffer.is_empty() && !buffer.ends_with(' ') {
        buffer.push(' ');
    }
    buffer.push_str(pinyin.plain());
}
