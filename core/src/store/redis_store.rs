//! Redis coordination store for multi-process deployments.
//!
//! Single commands are atomic on the server; multi-key operations go through
//! MULTI pipelines or Lua scripts so no client-side locking is needed.

use super::{CoordStore, Keys, List, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::{Config as RedisConfig, Connection, Pool, Runtime};
use futures::StreamExt;

const SCAN_COUNT: usize = 500;

/// KEYS: idle, active, document_count.
const CLAIM_NEXT: &str = r#"
local entry = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if entry then
  redis.call('INCR', KEYS[3])
end
return entry
"#;

/// KEYS: active, document_count. ARGV[1]: entry.
const RELEASE_CLAIM: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed > 0 then
  redis.call('DECR', KEYS[2])
end
return removed
"#;

/// KEYS: active, idle, document_count. ARGV: strip flag, postings prefix,
/// document-tokens prefix.
const REQUEUE_ACTIVE: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
for _, entry in ipairs(entries) do
  if ARGV[1] == '1' then
    local ok, job = pcall(cjson.decode, entry)
    if ok and type(job) == 'table' and type(job.path) == 'string' then
      local dkey = ARGV[3] .. job.path
      for _, token in ipairs(redis.call('SMEMBERS', dkey)) do
        redis.call('ZREM', ARGV[2] .. token, job.path)
      end
      redis.call('DEL', dkey)
    end
  end
  redis.call('RPUSH', KEYS[2], entry)
end
if #entries > 0 then
  redis.call('DECRBY', KEYS[3], #entries)
  redis.call('DEL', KEYS[1])
end
return #entries
"#;

/// ARGV[1], ARGV[2]: postings and document-tokens prefixes; ARGV[3..]: documents.
const REMOVE_DOCUMENTS: &str = r#"
local removed = 0
for i = 3, #ARGV do
  local doc = ARGV[i]
  local dkey = ARGV[2] .. doc
  for _, token in ipairs(redis.call('SMEMBERS', dkey)) do
    removed = removed + redis.call('ZREM', ARGV[1] .. token, doc)
  end
  redis.call('DEL', dkey)
end
return removed
"#;

pub struct RedisStore {
    pool: Pool,
    client: redis::Client,
    keys: Keys,
}

impl RedisStore {
    pub async fn connect(url: &str, keys: Keys) -> Result<Self> {
        let pool = RedisConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Backend(e.to_string()))?;
        let client = redis::Client::open(url)?;
        let store = Self { pool, client, keys };
        let mut conn = store.conn().await?;
        let _pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(store)
    }

    async fn conn(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }

    fn decode_postings(raw: Vec<(String, f64)>) -> Vec<(String, i64)> {
        raw.into_iter().map(|(doc, score)| (doc, score.round() as i64)).collect()
    }
}

fn zrange_command(descending: bool) -> &'static str {
    if descending { "ZREVRANGE" } else { "ZRANGE" }
}

#[async_trait]
impl CoordStore for RedisStore {
    fn keys(&self) -> &Keys { &self.keys }

    async fn push_all(&self, list: List, entries: &[String]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _len: i64 = conn.rpush(list.key(&self.keys), entries).await.map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let entry: Option<String> = Script::new(CLAIM_NEXT)
            .key(self.keys.idle())
            .key(self.keys.active())
            .key(self.keys.document_count())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(entry)
    }

    async fn release_claim(&self, entry: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = Script::new(RELEASE_CLAIM)
            .key(self.keys.active())
            .key(self.keys.document_count())
            .arg(entry)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn remove_one(&self, list: List, entry: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.lrem(list.key(&self.keys), 1, entry).await.map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn range(&self, list: List) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let entries: Vec<String> = conn.lrange(list.key(&self.keys), 0, -1).await?;
        Ok(entries)
    }

    async fn len(&self, list: List) -> Result<usize> {
        let mut conn = self.conn().await?;
        let n: usize = conn.llen(list.key(&self.keys)).await?;
        Ok(n)
    }

    async fn requeue_active(&self, strip_postings: bool) -> Result<usize> {
        let mut conn = self.conn().await?;
        let moved: i64 = Script::new(REQUEUE_ACTIVE)
            .key(self.keys.active())
            .key(self.keys.idle())
            .key(self.keys.document_count())
            .arg(if strip_postings { "1" } else { "0" })
            .arg(self.keys.postings_prefix())
            .arg(self.keys.document_tokens_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(moved.max(0) as usize)
    }

    async fn flag(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let v: Option<String> = conn.get(key).await?;
        Ok(v.as_deref() == Some("1"))
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(key, if value { "1" } else { "0" }).await.map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(())
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        let v: Option<i64> = conn.get(key).await?;
        Ok(v.unwrap_or(0))
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let v: i64 = conn.incr(key, delta).await.map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(v)
    }

    async fn incr_posting(&self, token: &str, document: &str, amount: i64) -> Result<i64> {
        let mut conn = self.conn().await?;
        let (score,): (Option<f64>,) = redis::pipe()
            .atomic()
            .cmd("ZINCRBY")
            .arg(self.keys.postings(token))
            .arg(amount)
            .arg(document)
            .cmd("SADD")
            .arg(self.keys.document_tokens(document))
            .arg(token)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;
        match score {
            Some(s) => Ok(s.round() as i64),
            None => Err(Error::StoreWrite(format!("ZINCRBY {token} {document} returned no score"))),
        }
    }

    async fn postings(&self, token: &str, descending: bool) -> Result<Vec<(String, i64)>> {
        let mut conn = self.conn().await?;
        let raw: Vec<(String, f64)> = redis::cmd(zrange_command(descending))
            .arg(self.keys.postings(token))
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(Self::decode_postings(raw))
    }

    async fn posting_count(&self, token: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        let n: usize = conn.zcard(self.keys.postings(token)).await?;
        Ok(n)
    }

    async fn posting(&self, token: &str, document: &str) -> Result<Option<i64>> {
        let mut conn = self.conn().await?;
        let score: Option<f64> = conn.zscore(self.keys.postings(token), document).await?;
        Ok(score.map(|s| s.round() as i64))
    }

    async fn tokens(&self) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let prefix = self.keys.postings_prefix();
        let pattern = format!("{prefix}*");
        let mut tokens = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            tokens.extend(batch.into_iter().filter_map(|k| k.strip_prefix(&prefix).map(str::to_string)));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        tokens.sort();
        tokens.dedup();
        Ok(tokens)
    }

    async fn tokens_for_document(&self, document: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let tokens: Vec<String> = conn.smembers(self.keys.document_tokens(document)).await?;
        Ok(tokens)
    }

    async fn remove_documents(&self, documents: &[String]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let script = Script::new(REMOVE_DOCUMENTS);
        let mut invocation = script.prepare_invoke();
        invocation.arg(self.keys.postings_prefix()).arg(self.keys.document_tokens_prefix());
        for doc in documents {
            invocation.arg(doc);
        }
        let removed: i64 = invocation.invoke_async(&mut conn).await.map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(removed.max(0) as usize)
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        let receivers: usize = conn.publish(topic, message).await.map_err(|e| Error::Channel(e.to_string()))?;
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| Error::Channel(e.to_string()))?;
        pubsub.subscribe(topic).await.map_err(|e| Error::Channel(e.to_string()))?;
        let messages = pubsub.into_on_message().filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(Subscription::new(messages.boxed()))
    }

    async fn subscriber_count(&self, topic: &str) -> Result<usize> {
        let mut conn = self.conn().await?;
        let counts: Vec<(String, usize)> = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(topic)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;
        Ok(counts.into_iter().map(|(_, n)| n).sum())
    }

    async fn flush(&self) -> Result<()> {
        // Durability is the server's persistence policy.
        Ok(())
    }
}
