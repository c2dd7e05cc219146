use crate::error::{Error, Result};
use crate::store::CoordStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type DocId = String;

/// Title occurrences count four times, headers twice, body text once.
pub const TITLE_WEIGHT: i64 = 4;
pub const HEADER_WEIGHT: i64 = 2;
pub const BODY_WEIGHT: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub weight: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDoc {
    pub doc_id: DocId,
    pub score: f64,
}

/// log10(N / df). A token with no documents has no defined idf, and a
/// count smaller than df means the counter and the postings disagree.
pub fn idf(total_documents: i64, document_frequency: usize, token: &str) -> Result<f64> {
    if document_frequency == 0 {
        return Err(Error::UnknownToken(token.to_string()));
    }
    if total_documents < document_frequency as i64 {
        return Err(Error::InconsistentCount {
            token: token.to_string(),
            documents: total_documents,
            document_frequency,
        });
    }
    Ok((total_documents as f64 / document_frequency as f64).log10())
}

/// (1 + log10 tf) * idf, rejecting tf == 0 before the logarithm.
pub fn tf_idf_score(term_frequency: i64, idf: f64, token: &str, document: &str) -> Result<f64> {
    if term_frequency <= 0 {
        return Err(Error::ZeroTermFrequency { token: token.to_string(), document: document.to_string() });
    }
    Ok((1.0 + (term_frequency as f64).log10()) * idf)
}

/// Inverted index over the coordination store: per token, document -> accumulated weight.
#[derive(Clone)]
pub struct TokenStore {
    store: Arc<dyn CoordStore>,
}

impl TokenStore {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self { store }
    }

    /// Adds to the (token, document) weight. Repeated calls accumulate; nothing is overwritten.
    pub async fn add_weight(&self, token: &str, document_id: &str, amount: i64) -> Result<()> {
        self.store.incr_posting(token, document_id, amount).await?;
        Ok(())
    }

    /// Postings of `token`, lowest weight first.
    pub async fn document_ids_for(&self, token: &str) -> Result<Vec<Posting>> {
        self.postings(token, false).await
    }

    /// Postings of `token`, highest weight first.
    pub async fn document_ids_for_rev(&self, token: &str) -> Result<Vec<Posting>> {
        self.postings(token, true).await
    }

    async fn postings(&self, token: &str, descending: bool) -> Result<Vec<Posting>> {
        let raw = self.store.postings(token, descending).await?;
        Ok(raw.into_iter().map(|(doc_id, weight)| Posting { doc_id, weight }).collect())
    }

    pub async fn document_count_for(&self, token: &str) -> Result<usize> {
        self.store.posting_count(token).await
    }

    /// Raw accumulated weight; 0 when the token never occurred in the document.
    pub async fn term_frequency(&self, token: &str, document_id: &str) -> Result<i64> {
        Ok(self.store.posting(token, document_id).await?.unwrap_or(0))
    }

    pub async fn inverse_document_frequency(&self, token: &str) -> Result<f64> {
        let df = self.document_count_for(token).await?;
        idf(self.document_count().await?, df, token)
    }

    pub async fn tf_idf(&self, token: &str, document_id: &str) -> Result<f64> {
        let tf = self.term_frequency(token, document_id).await?;
        if tf <= 0 {
            return Err(Error::ZeroTermFrequency { token: token.to_string(), document: document_id.to_string() });
        }
        let idf = self.inverse_document_frequency(token).await?;
        tf_idf_score(tf, idf, token, document_id)
    }

    pub async fn increment_document_count(&self) -> Result<i64> {
        self.store.incr_counter(&self.store.keys().document_count(), 1).await
    }

    pub async fn document_count(&self) -> Result<i64> {
        self.store.counter(&self.store.keys().document_count()).await
    }

    /// Strips every posting of the given documents. One atomic batch; safe to retry.
    pub async fn deduplicate(&self, document_ids: &HashSet<DocId>) -> Result<usize> {
        let mut docs: Vec<DocId> = document_ids.iter().cloned().collect();
        docs.sort();
        let removed = self.store.remove_documents(&docs).await?;
        tracing::info!(documents = docs.len(), postings = removed, "deduplicated partially indexed documents");
        Ok(removed)
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    pub async fn tokens(&self) -> Result<Vec<String>> {
        self.store.tokens().await
    }

    pub async fn tokens_on_page(&self, document_id: &str) -> Result<Vec<String>> {
        let mut tokens = self.store.tokens_for_document(document_id).await?;
        tokens.sort();
        Ok(tokens)
    }

    /// Scores documents by the sum of per-token tf-idf. Tokens no document
    /// contains add nothing. Ties go to the smaller document id.
    pub async fn rank(&self, tokens: &[String], limit: usize) -> Result<Vec<ScoredDoc>> {
        let total = self.document_count().await?;
        let mut scores: HashMap<DocId, f64> = HashMap::new();
        let unique: HashSet<&String> = tokens.iter().collect();
        for token in unique {
            let postings = self.document_ids_for(token).await?;
            let token_idf = match idf(total, postings.len(), token) {
                Ok(v) => v,
                Err(Error::UnknownToken(_)) => continue,
                Err(e) => return Err(e),
            };
            for p in postings {
                if p.weight <= 0 {
                    continue;
                }
                let s = tf_idf_score(p.weight, token_idf, token, &p.doc_id)?;
                *scores.entry(p.doc_id).or_insert(0.0) += s;
            }
        }
        let mut scored: Vec<ScoredDoc> = scores.into_iter().map(|(doc_id, score)| ScoredDoc { doc_id, score }).collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.doc_id.cmp(&b.doc_id)));
        scored.truncate(limit);
        Ok(scored)
    }
}
