//! Sliding-window text chunker.
//!
//! Splits normalized document text into overlapping [`Chunk`]s of at most
//! `chunk_size` characters. Consecutive chunks share exactly `overlap`
//! characters, so the original text can always be reconstructed by
//! concatenating the first chunk with every later chunk minus its overlap
//! prefix.
//!
//! Each chunk carries a deterministic id derived from its document id and
//! ordinal, character offsets into the normalized text, and a SHA-256 hash
//! of its text.
//!
//! # Algorithm
//!
//! 1. Start a window at character 0.
//! 2. Tentatively end the window at `start + chunk_size` (clamped to the end).
//! 3. If the window does not reach the end of the text, pull the end back to
//!    the last paragraph, line, or sentence break inside the window, as long
//!    as the window still extends past `start + overlap`.
//! 4. Emit the window, then start the next one at `end - overlap`.
//! 5. Stop after the window that reaches the end of the text.
//!
//! Offsets and sizes are in characters, never bytes, so multi-byte text is
//! never split inside a code point.
//!
//! # Example
//!
//! ```rust
//! use testbrain_core::chunk::chunk_text;
//!
//! let chunks: Vec<_> = chunk_text("doc-1", "Hello world.", 1000, 200).unwrap().collect();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "Hello world.");
//! ```

use std::iter::FusedIterator;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Break sequences tried in order when pulling a window end back.
const BREAKS: [&str; 5] = ["\n\n", "\n", ". ", "! ", "? "];

/// Create a lazy chunk sequence over `text`.
///
/// # Errors
///
/// Fails if `chunk_size` is zero or `overlap >= chunk_size`.
///
/// # Guarantees
///
/// - Empty text yields zero chunks.
/// - Text of at most `chunk_size` characters yields exactly one chunk.
/// - Ordinals are contiguous from 0 and offsets are monotonic.
pub fn chunk_text<'a>(
    document_id: &'a str,
    text: &'a str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Chunks<'a>> {
    if chunk_size == 0 {
        bail!("chunk_size must be > 0");
    }
    if overlap >= chunk_size {
        bail!(
            "chunk overlap ({}) must be smaller than chunk_size ({})",
            overlap,
            chunk_size
        );
    }

    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    offsets.push(text.len());

    Ok(Chunks {
        document_id,
        text,
        offsets,
        chunk_size,
        overlap,
        start: 0,
        ordinal: 0,
        done: text.is_empty(),
    })
}

/// Iterator over the chunks of one document. Finite and not restartable.
pub struct Chunks<'a> {
    document_id: &'a str,
    text: &'a str,
    /// Byte offset of every char, plus a trailing `text.len()`.
    offsets: Vec<usize>,
    chunk_size: usize,
    overlap: usize,
    start: usize,
    ordinal: usize,
    done: bool,
}

impl<'a> Chunks<'a> {
    fn char_len(&self) -> usize {
        self.offsets.len() - 1
    }

    fn byte_at(&self, char_idx: usize) -> usize {
        self.offsets[char_idx]
    }

    fn char_at_byte(&self, byte_idx: usize) -> usize {
        // `byte_idx` always comes from a match boundary on a char boundary.
        self.offsets.partition_point(|&b| b < byte_idx)
    }

    /// Pull `end` back to the last natural break inside the window, keeping
    /// the window strictly longer than the overlap so the cursor advances.
    fn snap_end(&self, start: usize, end: usize) -> usize {
        let min_end = start + self.overlap + 1;
        if min_end >= end {
            return end;
        }
        let lo = self.byte_at(min_end - 1);
        let hi = self.byte_at(end);
        let window = &self.text[lo..hi];
        for brk in BREAKS {
            if let Some(pos) = window.rfind(brk) {
                let cut = self.char_at_byte(lo + pos + brk.len());
                if cut >= min_end {
                    return cut;
                }
            }
        }
        end
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }

        let total = self.char_len();
        let start = self.start;
        let tentative = (start + self.chunk_size).min(total);
        let end = if tentative < total {
            self.snap_end(start, tentative)
        } else {
            tentative
        };

        let overlap = if self.ordinal == 0 { 0 } else { self.overlap };
        let chunk = make_chunk(
            self.document_id,
            self.ordinal,
            start,
            end,
            overlap,
            &self.text[self.byte_at(start)..self.byte_at(end)],
        );

        if end >= total {
            self.done = true;
        } else {
            self.start = end - self.overlap;
            self.ordinal += 1;
        }

        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        // Every window advances the cursor by at least one character.
        let remaining = self.char_len() - self.start;
        (1, Some(remaining.max(1)))
    }
}

impl FusedIterator for Chunks<'_> {}

/// Deterministic chunk id: `{document_id}:{ordinal}`.
pub fn chunk_id(document_id: &str, ordinal: usize) -> String {
    format!("{}:{}", document_id, ordinal)
}

fn make_chunk(
    document_id: &str,
    ordinal: usize,
    start: usize,
    end: usize,
    overlap: usize,
    text: &str,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: chunk_id(document_id, ordinal),
        document_id: document_id.to_string(),
        ordinal,
        start,
        end,
        overlap,
        text: text.to_string(),
        hash,
    }
}
