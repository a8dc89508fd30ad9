//! Overlapping character windows for embedding long text.

use switchboard_types::PlatformConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    /// Overlap is clamped below `chunk_size` so every window advances.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    pub fn from_config(config: &PlatformConfig) -> Self {
        Self::new(config.splitter_chunk_size, config.splitter_chunk_overlap)
    }

    /// Split `text` into trimmed chunks of at most `chunk_size` characters.
    ///
    /// A window ends after the last whitespace in its second half when there
    /// is one, otherwise at the hard limit. The next window starts
    /// `chunk_overlap` characters before the previous end.
    pub fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let hard_end = (start + self.chunk_size).min(chars.len());
            let end = if hard_end == chars.len() {
                hard_end
            } else {
                (start + self.chunk_size / 2..hard_end)
                    .rev()
                    .find(|&i| chars[i].is_whitespace())
                    .map_or(hard_end, |i| i + 1)
            };

            let chunk: String = chars[start..end].iter().collect();
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
            if end == chars.len() {
                break;
            }

            let next = end.saturating_sub(self.chunk_overlap);
            start = if next > start { next } else { end };
        }

        tracing::debug!(chars = chars.len(), chunks = chunks.len(), "split text");
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let splitter = TextSplitter::new(500, 50);
        assert_eq!(splitter.split("  hello world \n"), vec!["hello world"]);
        assert!(splitter.split("   ").is_empty());
    }

    #[test]
    fn breaks_at_whitespace_inside_the_window() {
        let splitter = TextSplitter::new(10, 0);
        assert_eq!(splitter.split("aaaa bbbb cccc"), vec!["aaaa bbbb", "cccc"]);
    }

    #[test]
    fn consecutive_windows_overlap() {
        let splitter = TextSplitter::new(4, 2);
        assert_eq!(splitter.split("abcdefghij"), vec!["abcd", "cdef", "efgh", "ghij"]);
    }

    #[test]
    fn counts_characters_not_bytes() {
        let splitter = TextSplitter::new(2, 0);
        assert_eq!(splitter.split("你好世界"), vec!["你好", "世界"]);
    }

    #[test]
    fn oversized_overlap_still_advances() {
        let splitter = TextSplitter::new(3, 10);
        assert_eq!(splitter.split("abcdef"), vec!["abc", "bcd", "cde", "def"]);
    }

    #[test]
    fn reads_sizes_from_config() {
        let config = PlatformConfig {
            splitter_chunk_size: 6,
            splitter_chunk_overlap: 0,
            ..PlatformConfig::default()
        };
        let chunks = TextSplitter::from_config(&config).split("one two three");
        assert_eq!(chunks, vec!["one", "two", "three"]);
    }
}
