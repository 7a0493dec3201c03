//! Structure-aware sliding-window chunker.
//!
//! Splits a document's normalized text into overlapping [`Chunk`]s of at
//! most `chunk_size` characters. Cut points prefer legal structure over
//! arbitrary positions, and consecutive chunks share exactly
//! `chunk_overlap` characters.
//!
//! # Algorithm
//!
//! 1. Take the window `[start, start + chunk_size]`, clamped to the text.
//! 2. If the window reaches the end of the text, emit it and stop.
//! 3. Otherwise pick the cut point from the highest boundary class that has
//!    a candidate in the window, taking the largest candidate:
//!    section marker (`§ 12`, `Art. 3`, `Abschnitt 2`, …) > paragraph
//!    break > line break > sentence end > whitespace.
//!    Section and paragraph cuts must leave at least `min_chunk_size`
//!    characters in the chunk. Every cut lies strictly beyond
//!    `start + chunk_overlap`, so chunking always advances.
//! 4. Without any boundary, hard-cut at the window end.
//! 5. The next window starts `chunk_overlap` characters before the cut.
//!
//! Offsets are character offsets, and every chunk's text is exactly the
//! slice it covers, so dropping the overlap prefix of each chunk after the
//! first and concatenating reconstructs the document.
//!
//! # Example
//!
//! ```rust
//! use lexrag_core::chunk::{chunk_text, ChunkParams};
//!
//! let text = "abcdefghi ".repeat(120);
//! let params = ChunkParams::new(500, 50).unwrap();
//! let chunks = chunk_text("doc-1", &text, &params);
//! let spans: Vec<_> = chunks.iter().map(|c| (c.char_start, c.char_end)).collect();
//! assert_eq!(spans, vec![(0, 500), (450, 950), (900, 1200)]);
//! ```

use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{Chunk, Document};

/// Approximate characters-per-token ratio used for `token_count`.
const CHARS_PER_TOKEN: usize = 4;

/// Line prefixes that open a new legal unit.
const SECTION_MARKERS: &[&str] = &[
    "§",
    "Art.",
    "Artikel ",
    "Abschnitt ",
    "Unterabschnitt ",
    "Teil ",
    "Kapitel ",
    "Anlage ",
];

/// Validated chunking parameters, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Minimum chunk length for a cut at a section or paragraph boundary.
    pub min_chunk_size: usize,
}

impl ChunkParams {
    /// Parameters with `min_chunk_size` defaulting to a fifth of the size.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        Self::with_min(chunk_size, chunk_overlap, chunk_size / 5)
    }

    pub fn with_min(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::config("chunk_size must be > 0"));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        if min_chunk_size > chunk_size {
            return Err(RagError::config(format!(
                "min_chunk_size ({}) must not exceed chunk_size ({})",
                min_chunk_size, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        })
    }
}

/// Chunk a document.
///
/// Fails with [`RagError::Configuration`] when `chunk_size == 0` or
/// `chunk_overlap >= chunk_size`. Empty text yields no chunks.
pub fn chunk(document: &Document, chunk_size: usize, chunk_overlap: usize) -> Result<Vec<Chunk>> {
    let params = ChunkParams::new(chunk_size, chunk_overlap)?;
    Ok(chunk_document(document, &params))
}

/// Chunk a document with pre-validated parameters.
pub fn chunk_document(document: &Document, params: &ChunkParams) -> Vec<Chunk> {
    chunk_text(&document.id, &document.normalized_text, params)
}

/// Chunk raw text on behalf of `document_id`.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    let mut chunks = Vec::new();
    if len == 0 {
        return chunks;
    }

    let mut start = 0usize;
    loop {
        let limit = (start + params.chunk_size).min(len);
        let end = if limit == len {
            len
        } else {
            find_cut(&chars, start, limit, params)
        };

        chunks.push(make_chunk(document_id, chunks.len() as i64, &chars, start, end));

        if end == len {
            break;
        }
        start = end - params.chunk_overlap;
    }

    chunks
}

/// Boundary classes, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Section,
    Paragraph,
    Line,
    Sentence,
    Word,
}

const BOUNDARY_ORDER: [Boundary; 5] = [
    Boundary::Section,
    Boundary::Paragraph,
    Boundary::Line,
    Boundary::Sentence,
    Boundary::Word,
];

fn find_cut(chars: &[char], start: usize, limit: usize, params: &ChunkParams) -> usize {
    let progress_floor = start + params.chunk_overlap + 1;

    for class in BOUNDARY_ORDER {
        let floor = match class {
            Boundary::Section | Boundary::Paragraph => {
                progress_floor.max(start + params.min_chunk_size)
            }
            _ => progress_floor,
        };
        if floor > limit {
            continue;
        }
        if let Some(pos) = (floor..=limit).rev().find(|&p| is_boundary(chars, p, class)) {
            return pos;
        }
    }

    limit
}

/// Whether a cut between `chars[pos - 1]` and `chars[pos]` is a boundary
/// of the given class.
fn is_boundary(chars: &[char], pos: usize, class: Boundary) -> bool {
    if pos == 0 || pos >= chars.len() {
        return false;
    }
    let prev = chars[pos - 1];
    let next = chars[pos];
    match class {
        Boundary::Section => {
            prev == '\n' && !next.is_whitespace() && starts_section(&chars[pos..])
        }
        Boundary::Paragraph => prev == '\n' && pos >= 2 && chars[pos - 2] == '\n',
        Boundary::Line => prev == '\n',
        Boundary::Sentence => {
            prev.is_whitespace()
                && pos >= 2
                && matches!(chars[pos - 2], '.' | '!' | '?' | ';' | ':')
        }
        Boundary::Word => prev.is_whitespace() || next.is_whitespace(),
    }
}

fn starts_section(rest: &[char]) -> bool {
    SECTION_MARKERS.iter().any(|marker| {
        let mut it = rest.iter();
        marker.chars().all(|m| it.next() == Some(&m))
    })
}

fn make_chunk(document_id: &str, index: i64, chars: &[char], start: usize, end: usize) -> Chunk {
    let text: String = chars[start..end].iter().collect();
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        sequence_index: index,
        token_count: estimate_tokens(end - start),
        text,
        char_start: start,
        char_end: end,
    }
}

/// Estimated token count for a span of `chars` characters.
pub fn estimate_tokens(chars: usize) -> usize {
    chars.div_ceil(CHARS_PER_TOKEN)
}
