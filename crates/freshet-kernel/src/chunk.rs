//! Chunk granularity for streamed text.
//!
//! Providers hand the streamer raw text fragments; the chunker decides
//! where one part ends and the next begins. The default splits after
//! punctuation followed by whitespace, which reads smoothly in a UI that
//! renders parts as they arrive. This is a policy knob, not a correctness
//! requirement — any split produces a valid delta log.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?,;:]\s+").expect("static pattern"));
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static pattern"));
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n").expect("static pattern"));

/// Boundary detector for one chunk granularity.
enum Boundary {
    Re(&'static Regex),
    Owned(Regex),
    /// Returns the byte offset just past the next boundary in the input,
    /// or `None` when no boundary remains.
    Custom(Box<dyn Fn(&str) -> Option<usize> + Send + Sync>),
}

/// Splits streamed text into parts at a configured granularity.
pub struct Chunker {
    boundary: Boundary,
}

impl fmt::Debug for Chunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.boundary {
            Boundary::Re(_) | Boundary::Owned(_) => "regex",
            Boundary::Custom(_) => "custom",
        };
        f.debug_struct("Chunker").field("boundary", &kind).finish()
    }
}

impl Chunker {
    /// Default granularity: split after punctuation followed by whitespace.
    pub fn sentence() -> Self {
        Self {
            boundary: Boundary::Re(&*SENTENCE_RE),
        }
    }

    /// Split after each whitespace run.
    pub fn word() -> Self {
        Self {
            boundary: Boundary::Re(&*WORD_RE),
        }
    }

    /// Split after each newline.
    pub fn line() -> Self {
        Self {
            boundary: Boundary::Re(&*LINE_RE),
        }
    }

    /// Split after each match of a caller-supplied pattern.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            boundary: Boundary::Owned(Regex::new(pattern)?),
        })
    }

    /// Split with a custom boundary detector. The detector receives the
    /// remaining input and returns the byte offset just past the next
    /// boundary, or `None` when no boundary remains.
    pub fn custom<F>(detector: F) -> Self
    where
        F: Fn(&str) -> Option<usize> + Send + Sync + 'static,
    {
        Self {
            boundary: Boundary::Custom(Box::new(detector)),
        }
    }

    /// Split `text` into chunks. Each boundary match stays attached to the
    /// chunk it terminates; any tail past the last boundary becomes the
    /// final chunk.
    pub fn split(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut last = 0;

        match &self.boundary {
            Boundary::Re(re) => {
                for m in re.find_iter(text) {
                    chunks.push(text[last..m.end()].to_string());
                    last = m.end();
                }
            }
            Boundary::Owned(re) => {
                for m in re.find_iter(text) {
                    chunks.push(text[last..m.end()].to_string());
                    last = m.end();
                }
            }
            Boundary::Custom(detector) => {
                while last < text.len() {
                    match detector(&text[last..]) {
                        Some(end) if end > 0 && last + end <= text.len() => {
                            chunks.push(text[last..last + end].to_string());
                            last += end;
                        }
                        _ => break,
                    }
                }
            }
        }

        if last < text.len() {
            chunks.push(text[last..].to_string());
        }
        chunks
    }
}

impl Default for Chunker {
    fn default() -> Self {
        Self::sentence()
    }
}
