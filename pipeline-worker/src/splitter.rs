//! Token-aware recursive text splitter.
//!
//! Splits a normalized message body into overlapping, token-bounded chunks by
//! descending an ordered separator list: paragraph breaks first, then line
//! breaks, sentence ends, spaces. Pieces that fit the token budget are kept,
//! oversized pieces are re-split with the next separator, and adjacent small
//! pieces are merged back greedily so the output is not a pile of fragments.
//!
//! Everything here must be a pure function of the input text and config:
//! chunk IDs downstream are `hash(message_id, chunk_index)`, which is only
//! stable because the same body always splits at the same boundaries.

use thiserror::Error;
use tiktoken_rs::CoreBPE;

/// Deterministic token counting (cl100k_base). One instance per process;
/// construction loads the vocabulary, counting is cheap after that.
pub struct TokenCounter {
    bpe: CoreBPE,
}

impl TokenCounter {
    pub fn cl100k() -> anyhow::Result<Self> {
        Ok(Self {
            bpe: tiktoken_rs::cl100k_base()?,
        })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_ordinary(text).len()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Target size for a chunk's core text.
    pub chunk_size_tokens: usize,
    /// Tokens of trailing context carried over from the previous chunk.
    pub chunk_overlap_tokens: usize,
    /// Chunks below this are dropped, except a sole or final chunk.
    pub min_chunk_size_tokens: usize,
    /// Hard cap; no produced chunk may ever exceed this.
    pub max_chunk_size_tokens: usize,
    /// Boundary strings, most preferred first. An empty string means
    /// "give up on boundaries, cut at the token budget".
    pub separators: Vec<String>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 384,
            chunk_overlap_tokens: 50,
            min_chunk_size_tokens: 100,
            max_chunk_size_tokens: 512,
            separators: vec![
                "\n\n".to_owned(),
                "\n".to_owned(),
                ". ".to_owned(),
                " ".to_owned(),
                String::new(),
            ],
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkConfigError {
    #[error("chunk_size_tokens must be positive")]
    ZeroChunkSize,
    #[error("max_chunk_size_tokens {max} is below chunk_size_tokens {chunk_size}")]
    MaxBelowTarget { max: usize, chunk_size: usize },
    #[error("chunk_size_tokens + chunk_overlap_tokens ({total}) exceeds max_chunk_size_tokens {max}")]
    OverlapBreaksCap { total: usize, max: usize },
    #[error("min_chunk_size_tokens {min} exceeds chunk_size_tokens {chunk_size}")]
    MinAboveTarget { min: usize, chunk_size: usize },
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), ChunkConfigError> {
        if self.chunk_size_tokens == 0 {
            return Err(ChunkConfigError::ZeroChunkSize);
        }
        if self.max_chunk_size_tokens < self.chunk_size_tokens {
            return Err(ChunkConfigError::MaxBelowTarget {
                max: self.max_chunk_size_tokens,
                chunk_size: self.chunk_size_tokens,
            });
        }
        if self.chunk_size_tokens + self.chunk_overlap_tokens > self.max_chunk_size_tokens {
            return Err(ChunkConfigError::OverlapBreaksCap {
                total: self.chunk_size_tokens + self.chunk_overlap_tokens,
                max: self.max_chunk_size_tokens,
            });
        }
        if self.min_chunk_size_tokens > self.chunk_size_tokens {
            return Err(ChunkConfigError::MinAboveTarget {
                min: self.min_chunk_size_tokens,
                chunk_size: self.chunk_size_tokens,
            });
        }
        Ok(())
    }
}

/// One produced chunk. `text` is the overlap prefix plus the core span;
/// the offsets delimit the core span only, so concatenating
/// `body[start_offset..end_offset]` over all chunks rebuilds the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub token_count: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub overlap_with_previous: bool,
    pub overlap_with_next: bool,
}

/// Split `text` into chunks. Empty or whitespace-only input yields no chunks.
pub fn split(text: &str, config: &ChunkConfig, counter: &TokenCounter) -> Vec<Chunk> {
    if text.trim().is_empty() {
        tracing::debug!("skipping empty body, nothing to chunk");
        return Vec::new();
    }

    let pieces = split_range(text, 0..text.len(), 0, config, counter);
    let merged = merge_adjacent(text, pieces, config, counter);
    let kept = drop_undersized(text, merged, config, counter);
    apply_overlap(text, kept, config, counter)
}

type Range = std::ops::Range<usize>;

/// Recursive separator descent. Returns contiguous ranges covering the input
/// range, each within the target budget whenever the text allows it.
fn split_range(
    text: &str,
    range: Range,
    separator_index: usize,
    config: &ChunkConfig,
    counter: &TokenCounter,
) -> Vec<Range> {
    if counter.count(&text[range.clone()]) <= config.chunk_size_tokens {
        return vec![range];
    }

    for (offset, separator) in config.separators[separator_index..].iter().enumerate() {
        if separator.is_empty() {
            // Explicit request to stop looking for boundaries
            break;
        }
        let pieces = split_on(text, range.clone(), separator);
        if pieces.len() < 2 {
            continue;
        }
        let next_index = separator_index + offset + 1;
        return pieces
            .into_iter()
            .flat_map(|piece| split_range(text, piece, next_index, config, counter))
            .collect();
    }

    // No separator splits this piece. Oversized-but-unsplittable text is
    // accepted whole as long as it fits the hard cap (the cap check is
    // inclusive: a piece of exactly max tokens is not cut); past the cap we
    // cut at the raw token boundary, which guarantees termination.
    if counter.count(&text[range.clone()]) <= config.max_chunk_size_tokens {
        return vec![range];
    }
    hard_cut(text, range, config, counter)
}

/// Split a range on every occurrence of `separator`, attaching the separator
/// to the preceding piece so no byte of the input is lost.
fn split_on(text: &str, range: Range, separator: &str) -> Vec<Range> {
    let slice = &text[range.clone()];
    let mut pieces = Vec::new();
    let mut piece_start = 0;
    let mut search_from = 0;

    while let Some(found) = slice[search_from..].find(separator) {
        let separator_end = search_from + found + separator.len();
        pieces.push(range.start + piece_start..range.start + separator_end);
        piece_start = separator_end;
        search_from = separator_end;
        if search_from >= slice.len() {
            break;
        }
    }
    if piece_start < slice.len() {
        pieces.push(range.start + piece_start..range.end);
    }

    pieces.retain(|piece| !piece.is_empty());
    pieces
}

/// Cut a boundary-less range into windows at the target budget. Cuts land on
/// char boundaries: the window is the longest char prefix that still fits.
fn hard_cut(text: &str, range: Range, config: &ChunkConfig, counter: &TokenCounter) -> Vec<Range> {
    let mut pieces = Vec::new();
    let mut start = range.start;

    while start < range.end {
        let rest = &text[start..range.end];
        if counter.count(rest) <= config.chunk_size_tokens {
            pieces.push(start..range.end);
            break;
        }

        let boundaries: Vec<usize> = rest.char_indices().map(|(i, _)| i).skip(1).collect();
        // Largest prefix (by char count) within budget; at least one char so
        // the loop always advances.
        let mut low = 0usize;
        let mut high = boundaries.len();
        while low < high {
            let mid = (low + high).div_ceil(2);
            let end = boundaries.get(mid - 1).copied().unwrap_or(rest.len());
            if counter.count(&rest[..end]) <= config.chunk_size_tokens {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        let cut = if low == 0 {
            boundaries.first().copied().unwrap_or(rest.len())
        } else {
            boundaries.get(low - 1).copied().unwrap_or(rest.len())
        };
        pieces.push(start..start + cut);
        start += cut;
    }

    pieces
}

/// Greedy merge of adjacent pieces back up to the target budget, so a
/// paragraph of short lines becomes one chunk instead of many fragments.
fn merge_adjacent(
    text: &str,
    pieces: Vec<Range>,
    config: &ChunkConfig,
    counter: &TokenCounter,
) -> Vec<Range> {
    let mut merged: Vec<Range> = Vec::new();

    for piece in pieces {
        match merged.last_mut() {
            Some(current)
                if counter.count(&text[current.start..piece.end]) <= config.chunk_size_tokens =>
            {
                current.end = piece.end;
            }
            _ => merged.push(piece),
        }
    }

    merged
}

/// Drop sub-minimum chunks, sparing a sole chunk and the final chunk so a
/// nonempty input never produces empty output.
fn drop_undersized(
    text: &str,
    pieces: Vec<Range>,
    config: &ChunkConfig,
    counter: &TokenCounter,
) -> Vec<Range> {
    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .filter(|(i, piece)| {
            total == 1
                || *i == total - 1
                || counter.count(&text[piece.clone()]) >= config.min_chunk_size_tokens
        })
        .map(|(_, piece)| piece)
        .collect()
}

/// Extend every chunk but the first backwards into its predecessor's core by
/// the overlap budget, and materialize the final `Chunk` values.
fn apply_overlap(
    text: &str,
    cores: Vec<Range>,
    config: &ChunkConfig,
    counter: &TokenCounter,
) -> Vec<Chunk> {
    let total = cores.len();
    let mut chunks: Vec<Chunk> = Vec::with_capacity(total);

    for (index, core) in cores.iter().enumerate() {
        let core_text = &text[core.clone()];
        let core_tokens = counter.count(core_text);

        let mut overlap = String::new();
        if index > 0 && config.chunk_overlap_tokens > 0 {
            let previous = &text[cores[index - 1].clone()];
            let budget = config
                .chunk_overlap_tokens
                .min(config.max_chunk_size_tokens.saturating_sub(core_tokens));
            overlap = overlap_suffix(previous, budget, counter).to_owned();
        }

        let mut chunk_text = format!("{}{}", overlap, core_text);
        let mut token_count = counter.count(&chunk_text);
        // Token merges across the overlap boundary can nudge the count; shave
        // the overlap until the hard cap holds.
        while token_count > config.max_chunk_size_tokens && !overlap.is_empty() {
            let mut chars = overlap.chars();
            chars.next();
            overlap = chars.as_str().to_owned();
            chunk_text = format!("{}{}", overlap, core_text);
            token_count = counter.count(&chunk_text);
        }

        chunks.push(Chunk {
            index,
            text: chunk_text,
            token_count,
            start_offset: core.start,
            end_offset: core.end,
            overlap_with_previous: !overlap.is_empty(),
            overlap_with_next: false,
        });
    }

    for index in 0..total.saturating_sub(1) {
        chunks[index].overlap_with_next = chunks[index + 1].overlap_with_previous;
    }

    chunks
}

/// Longest char-boundary suffix of `previous` within the token budget.
fn overlap_suffix<'t>(previous: &'t str, budget: usize, counter: &TokenCounter) -> &'t str {
    if budget == 0 {
        return "";
    }
    if counter.count(previous) <= budget {
        return previous;
    }

    let starts: Vec<usize> = previous.char_indices().map(|(i, _)| i).collect();
    // Bisect over how many trailing chars to keep
    let mut low = 0usize;
    let mut high = starts.len();
    while low < high {
        let mid = (low + high).div_ceil(2);
        let from = starts[starts.len() - mid];
        if counter.count(&previous[from..]) <= budget {
            low = mid;
        } else {
            high = mid - 1;
        }
    }
    if low == 0 {
        ""
    } else {
        &previous[starts[starts.len() - low]..]
    }
}
