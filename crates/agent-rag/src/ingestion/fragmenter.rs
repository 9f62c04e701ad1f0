//! Text fragmentation with boundary-aware, bounded windows
//!
//! Policy: windows of at most `chunk_size` characters. When the text continues
//! past the window, the cut is moved back to the last paragraph break, else
//! the last sentence boundary, else the last word boundary, provided that
//! keeps the fragment over half the window; otherwise the cut is hard. The
//! next window starts `chunk_overlap` characters before the previous cut.
//! Fragments are exact slices of the source, so with zero overlap their
//! concatenation is the source text.

use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::types::Fragment;

/// A fragment borrowed from its source text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSpan<'a> {
    /// Zero-based sequence number
    pub position: u32,
    /// Slice of the source text
    pub text: &'a str,
    /// Character offset of the first character
    pub char_start: usize,
    /// Character offset one past the last character
    pub char_end: usize,
}

/// Splits text into ordered fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragmenter {
    /// Maximum fragment length in characters
    chunk_size: usize,
    /// Characters repeated at the start of the next fragment
    overlap: usize,
}

impl Fragmenter {
    /// Create a fragmenter. The size is at least 1 and the overlap is
    /// clamped below the size so every window makes progress.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into spans
    pub fn split<'a>(&self, text: &'a str) -> Vec<FragmentSpan<'a>> {
        // Byte offset of every character, plus the end of the text
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        let total = bounds.len() - 1;
        if total == 0 {
            return Vec::new();
        }

        let to_char = |byte: usize| bounds.binary_search(&byte).unwrap_or_else(|i| i);

        let paragraphs = paragraph_breaks(text);
        let sentences: Vec<usize> = text
            .split_sentence_bound_indices()
            .map(|(i, _)| to_char(i))
            .filter(|&c| c > 0)
            .collect();
        let words: Vec<usize> = text
            .split_word_bound_indices()
            .map(|(i, _)| to_char(i))
            .filter(|&c| c > 0)
            .collect();

        let mut spans = Vec::new();
        let mut start = 0usize;

        loop {
            let window_end = (start + self.chunk_size).min(total);
            let end = if window_end == total {
                total
            } else {
                let floor = start + self.chunk_size / 2;
                last_within(&paragraphs, floor, window_end)
                    .or_else(|| last_within(&sentences, floor, window_end))
                    .or_else(|| last_within(&words, floor, window_end))
                    .unwrap_or(window_end)
            };

            spans.push(FragmentSpan {
                position: spans.len() as u32,
                text: &text[bounds[start]..bounds[end]],
                char_start: start,
                char_end: end,
            });

            if end == total {
                break;
            }
            start = end.saturating_sub(self.overlap).max(start + 1);
        }

        spans
    }

    /// Build owned fragments for a document
    pub fn fragment(
        &self,
        text: &str,
        document_id: Uuid,
        agent_id: Uuid,
        tenant_id: Uuid,
    ) -> Vec<Fragment> {
        self.split(text)
            .into_iter()
            .map(|span| Fragment {
                document_id,
                position: span.position,
                text: span.text.to_string(),
                char_start: span.char_start,
                char_end: span.char_end,
                agent_id,
                tenant_id,
            })
            .collect()
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

/// Character positions directly after a blank line ("\n\n")
fn paragraph_breaks(text: &str) -> Vec<usize> {
    let mut breaks = Vec::new();
    let mut newlines = 0usize;
    for (idx, ch) in text.chars().enumerate() {
        if ch == '\n' {
            newlines += 1;
            if newlines >= 2 {
                breaks.push(idx + 1);
            }
        } else if ch != '\r' {
            newlines = 0;
        }
    }
    breaks
}

/// Largest candidate in `(floor, ceiling]`
fn last_within(candidates: &[usize], floor: usize, ceiling: usize) -> Option<usize> {
    let idx = candidates.partition_point(|&c| c <= ceiling);
    if idx > 0 && candidates[idx - 1] > floor {
        Some(candidates[idx - 1])
    } else {
        None
    }
}
