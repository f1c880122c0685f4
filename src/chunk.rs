//! Paragraph-boundary text chunker with overlap.
//!
//! Splits document text into [`TextChunk`]s that respect a `max_tokens`
//! limit. Splitting occurs on paragraph boundaries (`\n\n`) to preserve
//! semantic coherence; paragraphs longer than the limit are hard-split at
//! the last newline or space before the limit.
//!
//! When `overlap_tokens > 0`, each chunk after the first starts with the
//! tail of the previous chunk (cut at a word boundary) so passages that
//! straddle a boundary stay retrievable.

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub text: String,
}

/// Split text into chunks. Returns contiguous indices starting at 0;
/// blank input yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens.min(max_tokens.saturating_sub(1)) * CHARS_PER_TOKEN;

    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // +2 for \n\n separator
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            // Hard split at max_chars boundaries
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    pieces.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    // Flush remaining
    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    let mut chunks = Vec::with_capacity(pieces.len());
    for (index, piece) in pieces.iter().enumerate() {
        let text = match index.checked_sub(1).map(|prev| &pieces[prev]) {
            Some(prev) if overlap_chars > 0 => {
                let tail = overlap_tail(prev, overlap_chars);
                if tail.is_empty() {
                    piece.clone()
                } else {
                    format!("{}\n{}", tail, piece)
                }
            }
            _ => piece.clone(),
        };
        chunks.push(TextChunk { index, text });
    }

    chunks
}

/// Last `max_chars` bytes of `text`, starting at a word boundary.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut start = text.len() - max_chars;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim_start(),
        None => tail,
    }
}

/// Largest char boundary `<= index`, never 0 for non-empty text.
fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while i > 0 && !text.is_char_boundary(i) {
        i -= 1;
    }
    if i == 0 {
        // A single char wider than the limit.
        text.char_indices()
            .nth(1)
            .map(|(pos, _)| pos)
            .unwrap_or(text.len())
    } else {
        i
    }
}
