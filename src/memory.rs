//! Long-term memory used to enrich prompts
//!
//! The dialogue core only needs `insert_text` and `query`; the scoring
//! below is deliberately plain keyword overlap.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::Result;

/// Passage returned by a memory query
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    /// Stored text
    pub content: String,
    /// Relevance, higher is better
    pub score: f64,
}

/// Store of past responses the orchestrator can consult
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Remember a piece of text
    ///
    /// # Errors
    ///
    /// Returns error if the store rejects the write
    async fn insert_text(&self, text: &str) -> Result<()>;

    /// Return up to `k` passages ranked by relevance to `text`
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be queried
    async fn query(&self, text: &str, k: usize) -> Result<Vec<MemoryHit>>;
}

#[derive(Debug, Clone)]
struct StoredText {
    content: String,
    words: HashSet<String>,
}

/// In-process memory ranking passages by shared words
#[derive(Debug, Default)]
pub struct KeywordMemory {
    entries: Mutex<Vec<StoredText>>,
}

impl KeywordMemory {
    /// Create an empty memory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored passages
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lowercased words of `text`; CJK characters count as one word each
fn words(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() && c.is_ascii() {
            current.extend(c.to_lowercase());
            continue;
        }
        if !current.is_empty() {
            out.insert(std::mem::take(&mut current));
        }
        if c.is_alphanumeric() {
            out.insert(c.to_string());
        }
    }
    if !current.is_empty() {
        out.insert(current);
    }
    out
}

#[async_trait]
impl MemoryStore for KeywordMemory {
    async fn insert_text(&self, text: &str) -> Result<()> {
        let entry = StoredText {
            content: text.to_string(),
            words: words(text),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        tracing::debug!(chars = text.chars().count(), "stored memory");
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    async fn query(&self, text: &str, k: usize) -> Result<Vec<MemoryHit>> {
        let query_words = words(text);
        if query_words.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<MemoryHit> = entries
            .iter()
            .filter_map(|entry| {
                let shared = entry.words.intersection(&query_words).count();
                (shared > 0).then(|| MemoryHit {
                    content: entry.content.clone(),
                    score: shared as f64 / query_words.len() as f64,
                })
            })
            .collect();
        drop(entries);

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let memory = KeywordMemory::new();
        memory.insert_text("The cat sleeps on the warm sofa").await.unwrap();
        memory.insert_text("Rust compiles to native code").await.unwrap();
        memory.insert_text("The cat likes warm milk").await.unwrap();

        let hits = memory.query("warm cat milk", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "The cat likes warm milk");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_query_without_overlap_is_empty() {
        let memory = KeywordMemory::new();
        memory.insert_text("alpha beta").await.unwrap();
        assert!(memory.query("gamma", 4).await.unwrap().is_empty());
        assert!(memory.query("", 4).await.unwrap().is_empty());
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_words_split_cjk() {
        let w = words("Hello, 世界!");
        assert!(w.contains("hello"));
        assert!(w.contains("世"));
        assert!(w.contains("界"));
    }
}
