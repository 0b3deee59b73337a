//! Content hashing, chunking, and query term extraction.
//!
//! Everything here is pure: the same input always produces the same
//! output. Chunk `pos` values are byte offsets into the original body.

use sha2::{Digest, Sha256};

/// Retrieval-time chunk size in characters.
pub const CHUNK_SIZE_CHARS: usize = 2000;

/// Embedding-time chunk size in approximate tokens.
pub const CHUNK_SIZE_TOKENS: usize = 200;

/// Embedding-time overlap in approximate tokens.
pub const CHUNK_OVERLAP_TOKENS: usize = 40;

/// SHA-256 of the UTF-8 bytes, lowercase hex. The content primary key.
pub fn hash_content(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Short stable identifier: the first six hex chars of the content hash.
pub fn docid_from_hash(hash: &str) -> &str {
    &hash[..hash.len().min(6)]
}

/// A retrieval-time chunk: contiguous lines, bounded by characters.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    /// Byte offset of the chunk start within the body.
    pub pos: usize,
}

/// An embedding-time chunk with its approximate token count.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenChunk {
    pub text: String,
    pub pos: usize,
    pub tokens: usize,
}

/// Split a body into line-packed chunks of at most [`CHUNK_SIZE_CHARS`]
/// characters. A single oversized line becomes its own chunk rather than
/// being split mid-line.
pub fn chunk_document(body: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut start: Option<usize> = None;
    let mut chars_in_chunk = 0usize;
    let mut end = 0usize;

    for line in split_lines_with_offsets(body) {
        let line_chars = line.text.chars().count();
        match start {
            None => {
                start = Some(line.offset);
                chars_in_chunk = line_chars;
            }
            Some(s) => {
                if chars_in_chunk + 1 + line_chars > CHUNK_SIZE_CHARS {
                    chunks.push(Chunk {
                        text: body[s..end].to_string(),
                        pos: s,
                    });
                    start = Some(line.offset);
                    chars_in_chunk = line_chars;
                } else {
                    chars_in_chunk += 1 + line_chars;
                }
            }
        }
        end = line.offset + line.text.len();
    }

    if let Some(s) = start {
        let text = body[s..end].to_string();
        if !text.trim().is_empty() {
            chunks.push(Chunk { text, pos: s });
        }
    }

    // Drop leading/interior chunks that are pure whitespace.
    chunks.retain(|c| !c.text.trim().is_empty());
    chunks
}

/// Split a body into token-bounded chunks with overlap, for embedding.
///
/// Token counts use a locked whitespace-word approximation: a word costs
/// one token, words longer than eight characters cost `ceil(chars / 4)`.
/// Chunks cover the body in order; consecutive chunks overlap by
/// `overlap` tokens of trailing words.
pub fn chunk_document_by_tokens(
    body: &str,
    max_tokens: usize,
    overlap: usize,
) -> Vec<TokenChunk> {
    let max_tokens = max_tokens.max(1);
    let overlap = overlap.min(max_tokens.saturating_sub(1));

    let words = word_spans(body);
    if words.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut i = 0usize;
    while i < words.len() {
        let mut tokens = 0usize;
        let mut j = i;
        while j < words.len() {
            let cost = words[j].tokens;
            if j > i && tokens + cost > max_tokens {
                break;
            }
            tokens += cost;
            j += 1;
        }

        let start = words[i].start;
        let end = words[j - 1].end;
        chunks.push(TokenChunk {
            text: body[start..end].to_string(),
            pos: start,
            tokens,
        });

        if j >= words.len() {
            break;
        }

        // Back up over the trailing overlap, always making progress.
        let mut back = j;
        let mut overlap_tokens = 0usize;
        while back > i + 1 && overlap_tokens < overlap {
            back -= 1;
            overlap_tokens += words[back].tokens;
        }
        i = back.max(i + 1);
    }

    chunks
}

/// First Markdown heading, else the file stem of the fallback path.
pub fn extract_title(body: &str, fallback_path: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix('#') {
            let title = rest.trim_start_matches('#').trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    std::path::Path::new(fallback_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| fallback_path.to_string())
}

/// Extract match terms from a query for fast chunk scoring.
///
/// The query is lowercased and split on whitespace. CJK words contribute
/// their trigrams (and the word itself when shorter than three chars);
/// non-CJK tokens are kept when longer than two chars. The whole lowercase
/// query is always included as a phrase term.
pub fn query_terms(query: &str) -> Vec<String> {
    let lower = query.to_lowercase();
    let mut terms = Vec::new();

    for word in lower.split_whitespace() {
        if word.chars().any(is_cjk) {
            let chars: Vec<char> = word.chars().collect();
            if chars.len() < 3 {
                terms.push(word.to_string());
            }
            for window in chars.windows(3) {
                terms.push(window.iter().collect());
            }
        } else if word.chars().count() > 2 {
            terms.push(word.to_string());
        }
    }

    let phrase = lower.trim().to_string();
    if !phrase.is_empty() && !terms.contains(&phrase) {
        terms.push(phrase);
    }
    terms.dedup();
    terms
}

/// CJK ranges relevant for trigram extraction: unified ideographs (+ext A),
/// hiragana, katakana, hangul syllables.
pub fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF
        | 0x3400..=0x4DBF
        | 0x3040..=0x309F
        | 0x30A0..=0x30FF
        | 0xAC00..=0xD7AF)
}

struct LineSpan<'a> {
    text: &'a str,
    offset: usize,
}

fn split_lines_with_offsets(body: &str) -> Vec<LineSpan<'_>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    for line in body.split('\n') {
        out.push(LineSpan { text: line, offset });
        offset += line.len() + 1;
    }
    out
}

struct WordSpan {
    start: usize,
    end: usize,
    tokens: usize,
}

fn word_spans(body: &str) -> Vec<WordSpan> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, ch) in body.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push(make_word_span(body, s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push(make_word_span(body, s, body.len()));
    }
    spans
}

fn make_word_span(body: &str, start: usize, end: usize) -> WordSpan {
    let chars = body[start..end].chars().count();
    let tokens = if chars <= 8 { 1 } else { chars.div_ceil(4) };
    WordSpan { start, end, tokens }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_sha256() {
        let h = hash_content("hello");
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(docid_from_hash(&h), "2cf24d");
    }

    #[test]
    fn chunk_document_packs_lines() {
        let body = "alpha\nbeta\ngamma";
        let chunks = chunk_document(body);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].pos, 0);
        assert_eq!(chunks[0].text, body);
    }

    #[test]
    fn chunk_document_splits_on_budget() {
        let long_line = "x".repeat(1500);
        let body = format!("{long_line}\n{long_line}\nshort");
        let chunks = chunk_document(&body);
        assert!(chunks.len() >= 2);
        // pos values point at the chunk start inside the body.
        for c in &chunks {
            assert_eq!(&body[c.pos..c.pos + c.text.len()], c.text);
        }
    }

    #[test]
    fn token_chunking_is_deterministic() {
        let body = (0..400)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let a = chunk_document_by_tokens(&body, 50, 10);
        let b = chunk_document_by_tokens(&body, 50, 10);
        assert_eq!(a, b);
        assert!(a.len() > 1);
    }

    #[test]
    fn token_chunks_overlap_and_cover() {
        let body = (0..100)
            .map(|i| format!("w{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_document_by_tokens(&body, 20, 5);

        // Coverage: first chunk starts at 0, last chunk ends at the end.
        assert_eq!(chunks[0].pos, 0);
        let last = chunks.last().unwrap();
        assert_eq!(last.pos + last.text.len(), body.len());

        // Overlap: each chunk starts no later than the previous chunk ends.
        for pair in chunks.windows(2) {
            assert!(pair[1].pos <= pair[0].pos + pair[0].text.len());
            assert!(pair[1].pos > pair[0].pos, "must make forward progress");
        }
    }

    #[test]
    fn token_chunking_counts_long_words() {
        // A 16-char word costs ceil(16/4) = 4 tokens.
        let chunks = chunk_document_by_tokens("abcdefghijklmnop", 10, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].tokens, 4);
    }

    #[test]
    fn empty_body_has_no_token_chunks() {
        assert!(chunk_document_by_tokens("", 200, 40).is_empty());
        assert!(chunk_document_by_tokens("   \n\t", 200, 40).is_empty());
    }

    #[test]
    fn title_from_heading_or_filename() {
        assert_eq!(extract_title("# Pasta Notes\nbody", "x.md"), "Pasta Notes");
        assert_eq!(extract_title("## Deep\ntext", "x.md"), "Deep");
        assert_eq!(extract_title("no heading here", "notes/pasta.md"), "pasta");
        assert_eq!(extract_title("", "dir/readme.md"), "readme");
    }

    #[test]
    fn query_terms_basic() {
        let terms = query_terms("How do I make pasta");
        assert!(terms.contains(&"how".to_string()));
        assert!(terms.contains(&"make".to_string()));
        assert!(terms.contains(&"pasta".to_string()));
        // Short words are dropped, the phrase survives.
        assert!(!terms.contains(&"do".to_string()));
        assert!(terms.contains(&"how do i make pasta".to_string()));
    }

    #[test]
    fn query_terms_cjk_trigrams() {
        let terms = query_terms("日本の電車");
        assert!(terms.contains(&"日本の".to_string()));
        assert!(terms.contains(&"本の電".to_string()));
        assert!(terms.contains(&"の電車".to_string()));

        let short = query_terms("東京");
        assert!(short.contains(&"東京".to_string()));
    }
}
