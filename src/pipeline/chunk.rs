//! Page text → overlapping chunks.
//!
//! Words are packed greedily into chunks of at most `chunk_size` characters.
//! Each new chunk starts with the trailing words of the previous one, up to
//! `chunk_overlap` characters, so a sentence cut at a boundary is still seen
//! whole by one of the two chunks. A single word longer than `chunk_size` is
//! split on character boundaries.

/// Split `text` into overlapping chunks. Sizes are in characters.
///
/// Whitespace is normalised to single spaces; empty text yields no chunks.
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let chunk_overlap = chunk_overlap.min(chunk_size.saturating_sub(1));

    let words: Vec<String> = text
        .split_whitespace()
        .flat_map(|w| split_long_word(w, chunk_size))
        .collect();
    if words.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;
    let mut fresh = 0usize;

    for word in &words {
        let wlen = word.chars().count();
        let needed = if current.is_empty() { wlen } else { current_len + 1 + wlen };

        if needed > chunk_size && !current.is_empty() {
            chunks.push(current.join(" "));
            let (tail, tail_len) = overlap_tail(&current, chunk_overlap, chunk_size - wlen);
            current = tail;
            current_len = tail_len;
            fresh = 0;
        }

        current_len = if current.is_empty() { wlen } else { current_len + 1 + wlen };
        current.push(word);
        fresh += 1;
    }

    if fresh > 0 {
        chunks.push(current.join(" "));
    }
    chunks
}

/// Trailing words of `words` totalling at most `overlap` characters and
/// leaving room for a word that needs `room` characters.
fn overlap_tail<'a>(words: &[&'a str], overlap: usize, room: usize) -> (Vec<&'a str>, usize) {
    let budget = overlap.min(room.saturating_sub(1));
    let mut tail = Vec::new();
    let mut len = 0usize;
    for w in words.iter().rev() {
        let wlen = w.chars().count();
        let next = if tail.is_empty() { wlen } else { len + 1 + wlen };
        if next > budget {
            break;
        }
        tail.push(*w);
        len = next;
    }
    tail.reverse();
    (tail, len)
}

fn split_long_word(word: &str, max: usize) -> Vec<String> {
    if word.chars().count() <= max {
        return vec![word.to_string()];
    }
    let chars: Vec<char> = word.chars().collect();
    chars.chunks(max).map(|c| c.iter().collect()).collect()
}
