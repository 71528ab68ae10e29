//! Historical incident similarity search.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use crate::models::envelope::JsonMap;
use crate::Result;

/// One match returned by [`SimilarityStore::query_similar`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimilarIncident {
    /// Stored incident id.
    pub id: String,
    /// Similarity in `[0, 1]`.
    pub score: f64,
    /// Stored incident text.
    pub summary: String,
    /// Metadata stored with the incident, such as severity and actions.
    pub metadata: JsonMap,
}

/// Boxed future returned by [`SimilarityStore`] methods.
pub type MemoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Store of past incidents queried for context before triage.
pub trait SimilarityStore: Send + Sync {
    /// Up to `top_k` stored incidents scoring at least `min_similarity`,
    /// best first.
    fn query_similar<'a>(
        &'a self,
        text: &'a str,
        top_k: usize,
        min_similarity: f64,
    ) -> MemoryFuture<'a, Vec<SimilarIncident>>;

    /// Store an incident. Returns `false` if it was not stored.
    fn store<'a>(&'a self, id: &'a str, text: &'a str, metadata: JsonMap) -> MemoryFuture<'a, bool>;
}

struct Entry {
    id: String,
    text: String,
    tokens: HashSet<String>,
    metadata: JsonMap,
}

/// In-process store scoring by token-set Jaccard similarity.
#[derive(Default)]
pub struct KeywordMemory {
    entries: RwLock<Vec<Entry>>,
}

impl KeywordMemory {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored incidents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

impl SimilarityStore for KeywordMemory {
    fn query_similar<'a>(
        &'a self,
        text: &'a str,
        top_k: usize,
        min_similarity: f64,
    ) -> MemoryFuture<'a, Vec<SimilarIncident>> {
        Box::pin(async move {
            let query = tokenize(text);
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            let mut matches: Vec<SimilarIncident> = entries
                .iter()
                .map(|entry| SimilarIncident {
                    id: entry.id.clone(),
                    score: jaccard(&query, &entry.tokens),
                    summary: entry.text.clone(),
                    metadata: entry.metadata.clone(),
                })
                .filter(|m| m.score > 0.0 && m.score >= min_similarity)
                .collect();
            drop(entries);
            matches.sort_by(|a, b| b.score.total_cmp(&a.score));
            matches.truncate(top_k);
            Ok(matches)
        })
    }

    fn store<'a>(&'a self, id: &'a str, text: &'a str, metadata: JsonMap) -> MemoryFuture<'a, bool> {
        Box::pin(async move {
            let tokens = tokenize(text);
            if tokens.is_empty() {
                return Ok(false);
            }
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|entry| entry.id != id);
            entries.push(Entry {
                id: id.to_owned(),
                text: text.to_owned(),
                tokens,
                metadata,
            });
            Ok(true)
        })
    }
}
