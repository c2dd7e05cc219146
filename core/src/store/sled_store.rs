//! Embedded coordination store on sled.
//!
//! One tree holds everything. Read-modify-write operations run under a single
//! mutex and commit through one `sled::Batch`, which is atomic on disk, so a
//! crash never leaves half a move or half a deduplication behind. Pub/sub is
//! in-process only: workers and supervisor must share this handle.

use super::{CoordStore, Keys, List, Subscription};
use crate::error::{Error, Result};
use crate::job::Job;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use sled::{Batch, IVec, Tree};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::broadcast;

const SEP: u8 = 0;
const TOPIC_CAPACITY: usize = 64;

pub struct SledStore {
    tree: Tree,
    keys: Keys,
    write_lock: Mutex<()>,
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(dir: P, keys: Keys) -> Result<Self> {
        let db = sled::open(dir)?;
        Self::from_db(db, keys)
    }

    /// A store that disappears when dropped.
    pub fn temporary(keys: Keys) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, keys)
    }

    fn from_db(db: sled::Db, keys: Keys) -> Result<Self> {
        let tree = db.open_tree(keys.prefix())?;
        Ok(Self { tree, keys, write_lock: Mutex::new(()), topics: Mutex::new(HashMap::new()) })
    }

    fn composite(head: &str, tail: &[u8]) -> Vec<u8> {
        let mut k = Vec::with_capacity(head.len() + 1 + tail.len());
        k.extend_from_slice(head.as_bytes());
        k.push(SEP);
        k.extend_from_slice(tail);
        k
    }

    fn list_prefix(&self, list: List) -> Vec<u8> {
        Self::composite(&list.key(&self.keys), &[])
    }

    fn list_entries(&self, list: List) -> Result<Vec<(IVec, String)>> {
        self.tree
            .scan_prefix(self.list_prefix(list))
            .map(|kv| {
                let (k, v) = kv?;
                Ok((k, String::from_utf8_lossy(&v).into_owned()))
            })
            .collect()
    }

    fn next_seq(&self, list: List) -> Result<u64> {
        let prefix = self.list_prefix(list);
        match self.tree.scan_prefix(&prefix).next_back() {
            Some(kv) => {
                let (k, _) = kv?;
                Ok(decode_seq(&k[prefix.len()..])? + 1)
            }
            None => Ok(0),
        }
    }

    fn list_key(&self, list: List, seq: u64) -> Vec<u8> {
        Self::composite(&list.key(&self.keys), &seq.to_be_bytes())
    }

    fn read_i64(&self, key: &[u8]) -> Result<Option<i64>> {
        self.tree.get(key)?.map(|v| decode_i64(&v)).transpose()
    }

    fn posting_key(&self, token: &str, document: &str) -> Vec<u8> {
        Self::composite(&self.keys.postings(token), document.as_bytes())
    }

    fn reverse_key(&self, document: &str, token: &str) -> Vec<u8> {
        Self::composite(&self.keys.document_tokens(document), token.as_bytes())
    }

    fn document_token_list(&self, document: &str) -> Result<Vec<String>> {
        let prefix = Self::composite(&self.keys.document_tokens(document), &[]);
        self.tree
            .scan_prefix(&prefix)
            .map(|kv| {
                let (k, _) = kv?;
                Ok(String::from_utf8_lossy(&k[prefix.len()..]).into_owned())
            })
            .collect()
    }

    /// Queues removal of every posting of `document` into `batch`.
    fn strip_document(&self, document: &str, batch: &mut Batch) -> Result<usize> {
        let tokens = self.document_token_list(document)?;
        for token in &tokens {
            batch.remove(self.posting_key(token, document));
            batch.remove(self.reverse_key(document, token));
        }
        Ok(tokens.len())
    }

    /// Queues `document_count += delta` into `batch`. Callers hold the write lock.
    fn count_documents(&self, delta: i64, batch: &mut Batch) -> Result<()> {
        let key = self.keys.document_count();
        let count = self.read_i64(key.as_bytes())?.unwrap_or(0);
        batch.insert(key.as_bytes(), (count + delta).to_be_bytes().to_vec());
        Ok(())
    }

    fn commit(&self, batch: Batch) -> Result<()> {
        self.tree.apply_batch(batch).map_err(|e| Error::StoreWrite(e.to_string()))
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::Backend(format!("expected 8-byte integer, found {} bytes", bytes.len())))?;
    Ok(i64::from_be_bytes(arr))
}

fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::Backend("corrupt list sequence".into()))?;
    Ok(u64::from_be_bytes(arr))
}

#[async_trait]
impl CoordStore for SledStore {
    fn keys(&self) -> &Keys { &self.keys }

    async fn push_all(&self, list: List, entries: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut seq = self.next_seq(list)?;
        let mut batch = Batch::default();
        for entry in entries {
            batch.insert(self.list_key(list, seq), entry.as_bytes());
            seq += 1;
        }
        self.commit(batch)
    }

    async fn claim_next(&self) -> Result<Option<String>> {
        let _guard = self.write_lock.lock();
        let (key, value) = match self.tree.scan_prefix(self.list_prefix(List::Idle)).next() {
            Some(kv) => kv?,
            None => return Ok(None),
        };
        let mut batch = Batch::default();
        batch.remove(key);
        batch.insert(self.list_key(List::Active, self.next_seq(List::Active)?), value.clone());
        self.count_documents(1, &mut batch)?;
        self.commit(batch)?;
        Ok(Some(String::from_utf8_lossy(&value).into_owned()))
    }

    async fn release_claim(&self, entry: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        for kv in self.tree.scan_prefix(self.list_prefix(List::Active)) {
            let (k, v) = kv?;
            if v.as_ref() == entry.as_bytes() {
                let mut batch = Batch::default();
                batch.remove(k);
                self.count_documents(-1, &mut batch)?;
                self.commit(batch)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn remove_one(&self, list: List, entry: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        for kv in self.tree.scan_prefix(self.list_prefix(list)) {
            let (k, v) = kv?;
            if v.as_ref() == entry.as_bytes() {
                self.tree.remove(k).map_err(|e| Error::StoreWrite(e.to_string()))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn range(&self, list: List) -> Result<Vec<String>> {
        Ok(self.list_entries(list)?.into_iter().map(|(_, v)| v).collect())
    }

    async fn len(&self, list: List) -> Result<usize> {
        Ok(self.tree.scan_prefix(self.list_prefix(list)).count())
    }

    async fn requeue_active(&self, strip_postings: bool) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let active = self.list_entries(List::Active)?;
        if active.is_empty() {
            return Ok(0);
        }
        let mut batch = Batch::default();
        let mut seq = self.next_seq(List::Idle)?;
        for (key, entry) in &active {
            if strip_postings {
                match Job::decode(entry) {
                    Ok(job) => {
                        self.strip_document(&job.path, &mut batch)?;
                    }
                    Err(e) => tracing::warn!(error = %e, "cannot strip postings of undecodable entry"),
                }
            }
            batch.remove(key.clone());
            batch.insert(self.list_key(List::Idle, seq), entry.as_bytes());
            seq += 1;
        }
        self.count_documents(-(active.len() as i64), &mut batch)?;
        self.commit(batch)?;
        Ok(active.len())
    }

    async fn flag(&self, key: &str) -> Result<bool> {
        Ok(self.tree.get(key)?.map(|v| v.as_ref() == b"1").unwrap_or(false))
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        let bytes: &[u8] = if value { b"1" } else { b"0" };
        self.tree.insert(key, bytes).map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(())
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        Ok(self.read_i64(key.as_bytes())?.unwrap_or(0))
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> Result<i64> {
        let _guard = self.write_lock.lock();
        let next = self.read_i64(key.as_bytes())?.unwrap_or(0) + delta;
        self.tree.insert(key, next.to_be_bytes().to_vec()).map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(next)
    }

    async fn incr_posting(&self, token: &str, document: &str, amount: i64) -> Result<i64> {
        let _guard = self.write_lock.lock();
        let key = self.posting_key(token, document);
        let next = self.read_i64(&key)?.unwrap_or(0) + amount;
        let mut batch = Batch::default();
        batch.insert(key, next.to_be_bytes().to_vec());
        batch.insert(self.reverse_key(document, token), Vec::<u8>::new());
        self.commit(batch)?;
        Ok(next)
    }

    async fn postings(&self, token: &str, descending: bool) -> Result<Vec<(String, i64)>> {
        let prefix = Self::composite(&self.keys.postings(token), &[]);
        let mut out = self
            .tree
            .scan_prefix(&prefix)
            .map(|kv| {
                let (k, v) = kv?;
                Ok((String::from_utf8_lossy(&k[prefix.len()..]).into_owned(), decode_i64(&v)?))
            })
            .collect::<Result<Vec<(String, i64)>>>()?;
        out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        if descending {
            out.reverse();
        }
        Ok(out)
    }

    async fn posting_count(&self, token: &str) -> Result<usize> {
        let prefix = Self::composite(&self.keys.postings(token), &[]);
        Ok(self.tree.scan_prefix(prefix).count())
    }

    async fn posting(&self, token: &str, document: &str) -> Result<Option<i64>> {
        self.read_i64(&self.posting_key(token, document))
    }

    async fn tokens(&self) -> Result<Vec<String>> {
        let prefix = self.keys.postings_prefix();
        let mut out: Vec<String> = Vec::new();
        for kv in self.tree.scan_prefix(prefix.as_bytes()) {
            let (k, _) = kv?;
            let rest = &k[prefix.len()..];
            let end = rest.iter().position(|b| *b == SEP).unwrap_or(rest.len());
            let token = String::from_utf8_lossy(&rest[..end]);
            if out.last().map(|t| t.as_str()) != Some(&*token) {
                out.push(token.into_owned());
            }
        }
        Ok(out)
    }

    async fn tokens_for_document(&self, document: &str) -> Result<Vec<String>> {
        self.document_token_list(document)
    }

    async fn remove_documents(&self, documents: &[String]) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let mut batch = Batch::default();
        let mut removed = 0;
        for document in documents {
            removed += self.strip_document(document, &mut batch)?;
        }
        self.commit(batch)?;
        Ok(removed)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<usize> {
        // A send with no live receivers is not an error, just nobody listening.
        Ok(self.sender(topic).send(message.to_string()).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let rx = self.sender(topic).subscribe();
        let messages = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => return Some((msg, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber lagged behind publisher");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Subscription::new(messages.boxed()))
    }

    async fn subscriber_count(&self, topic: &str) -> Result<usize> {
        Ok(self.topics.lock().get(topic).map(|tx| tx.receiver_count()).unwrap_or(0))
    }

    async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SledStore {
        SledStore::temporary(Keys::new("test")).unwrap()
    }

    #[tokio::test]
    async fn lists_are_fifo_and_claims_count_documents() {
        let s = store();
        let count = s.keys().document_count();
        s.push_all(List::Idle, &["a".into(), "b".into(), "c".into()]).await.unwrap();
        assert_eq!(s.claim_next().await.unwrap().as_deref(), Some("a"));
        assert_eq!(s.claim_next().await.unwrap().as_deref(), Some("b"));
        assert_eq!(s.counter(&count).await.unwrap(), 2);
        assert_eq!(s.range(List::Idle).await.unwrap(), vec!["c".to_string()]);
        assert_eq!(s.range(List::Active).await.unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(s.remove_one(List::Active, "a").await.unwrap());
        assert!(!s.remove_one(List::Active, "a").await.unwrap());
        assert_eq!(s.counter(&count).await.unwrap(), 2);
        assert!(s.release_claim("b").await.unwrap());
        assert!(!s.release_claim("b").await.unwrap());
        assert_eq!(s.counter(&count).await.unwrap(), 1);
        assert_eq!(s.len(List::Active).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tokens_do_not_bleed_into_longer_prefixes() {
        let s = store();
        s.incr_posting("foo", "0/0", 1).await.unwrap();
        s.incr_posting("foobar", "0/0", 2).await.unwrap();
        s.incr_posting("foo", "0/1", 3).await.unwrap();
        assert_eq!(s.posting_count("foo").await.unwrap(), 2);
        assert_eq!(s.tokens().await.unwrap(), vec!["foo".to_string(), "foobar".to_string()]);
        let mut for_doc = s.tokens_for_document("0/0").await.unwrap();
        for_doc.sort();
        assert_eq!(for_doc, vec!["foo".to_string(), "foobar".to_string()]);
    }

    #[tokio::test]
    async fn subscriber_count_follows_subscription_lifetime() {
        let s = store();
        assert_eq!(s.subscriber_count("topic").await.unwrap(), 0);
        let mut sub = s.subscribe("topic").await.unwrap();
        assert_eq!(s.subscriber_count("topic").await.unwrap(), 1);
        assert_eq!(s.publish("topic", "hello").await.unwrap(), 1);
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
        drop(sub);
        assert_eq!(s.subscriber_count("topic").await.unwrap(), 0);
        assert_eq!(s.publish("topic", "nobody").await.unwrap(), 0);
    }
}
