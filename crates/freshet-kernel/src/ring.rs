//! Bounded accumulator for process output text.
//!
//! Long-running or verbose commands can produce unbounded output; the ring
//! buffer caps what is retained by evicting the oldest chunks. At least one
//! chunk is always kept, so a single chunk larger than the cap still leaves
//! the caller with content rather than nothing.

use std::collections::VecDeque;
use std::fmt;

/// Prefix prepended to the rendered output once anything was dropped or
/// the retained content exceeded the cap.
pub const TRUNCATION_MARKER: &str = "[output truncated]\n";

/// FIFO of text chunks bounded by a character budget.
///
/// Output is purely a function of the append sequence and the configured
/// cap.
pub struct RingBuffer {
    chunks: VecDeque<String>,
    total_chars: usize,
    max_chars: usize,
    truncated: bool,
}

impl RingBuffer {
    /// Create a buffer retaining at most `max_chars` characters.
    pub fn new(max_chars: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_chars: 0,
            max_chars,
            truncated: false,
        }
    }

    /// Append a chunk, evicting the oldest chunks while the running count
    /// exceeds the cap and more than one chunk remains. Empty input is a
    /// no-op.
    pub fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        self.total_chars += text.chars().count();
        self.chunks.push_back(text.to_string());

        if self.total_chars > self.max_chars {
            self.truncated = true;
        }
        while self.total_chars > self.max_chars && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.total_chars -= evicted.chars().count();
            }
        }
    }

    /// Whether any content exceeded the cap (and a marker will be shown).
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Characters currently retained.
    pub fn char_count(&self) -> usize {
        self.total_chars
    }

    /// Check if nothing has been retained.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl fmt::Display for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.truncated {
            f.write_str(TRUNCATION_MARKER)?;
        }
        for chunk in &self.chunks {
            f.write_str(chunk)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_cap_passes_through() {
        let mut buf = RingBuffer::new(100);
        buf.append("hello ");
        buf.append("world");
        assert_eq!(buf.to_string(), "hello world");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_empty_append_is_noop() {
        let mut buf = RingBuffer::new(4);
        buf.append("");
        assert!(buf.is_empty());
        assert_eq!(buf.to_string(), "");
    }

    #[test]
    fn test_eviction_example() {
        // cap 10: "hello" + " world!!" totals 13, so the oldest chunk goes.
        let mut buf = RingBuffer::new(10);
        buf.append("hello");
        buf.append(" world!!");

        let rendered = buf.to_string();
        assert!(rendered.ends_with(" world!!"));
        assert!(rendered.starts_with(TRUNCATION_MARKER));
        assert!(!rendered.contains("hello"));
        assert_eq!(buf.char_count(), 8);
    }

    #[test]
    fn test_single_oversized_chunk_is_kept() {
        let mut buf = RingBuffer::new(4);
        buf.append("much too long for the cap");

        // Can't honor the cap without losing everything; keep the chunk.
        assert!(buf.to_string().contains("much too long for the cap"));
        assert!(buf.is_truncated());
        assert!(buf.char_count() > 4);
    }

    #[test]
    fn test_cap_invariant_over_many_appends() {
        let mut buf = RingBuffer::new(32);
        for i in 0..100 {
            buf.append(&format!("line {i}\n"));
        }
        // Either within the cap, or down to a single chunk.
        assert!(buf.char_count() <= 32);
        assert!(buf.is_truncated());
        // The newest content always survives.
        assert!(buf.to_string().contains("line 99"));
    }

    #[test]
    fn test_marker_absent_when_exactly_at_cap() {
        let mut buf = RingBuffer::new(5);
        buf.append("12345");
        assert_eq!(buf.to_string(), "12345");
        assert!(!buf.is_truncated());
    }

    #[test]
    fn test_multibyte_counts_characters_not_bytes() {
        let mut buf = RingBuffer::new(4);
        buf.append("日本");
        buf.append("語✓");
        assert_eq!(buf.char_count(), 4);
        assert!(!buf.is_truncated());
        assert_eq!(buf.to_string(), "日本語✓");
    }
}
