//! Redis-backed [`TimeoutStore`].
//!
//! One logical client per process: [`redis::aio::ConnectionManager`]
//! multiplexes and reconnects internally, and is cheap to clone per
//! operation. Paired key writes go through a single pipeline so a
//! successful call leaves the waiting index and the notification state
//! consistent. The lease refresh and release are server-side scripts -
//! a plain GET-then-EXPIRE would race a concurrent acquisition.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::{ErrorKind, RedisError, Script, Value};
use tracing::info;

use super::{
    LEADER_KEY, NOTIFICATION_STATES_KEY, StoreError, StreamEntry, TIMEOUT_EVENTS_STREAM,
    TimeoutStore, WAITING_CONVERSATIONS_KEY,
};
use crate::event::{EscalationLevel, TimeoutEvent};

const RENEW_LEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const RELEASE_LEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// [`TimeoutStore`] implementation over a Redis-compatible server.
pub struct RedisStore {
    conn: ConnectionManager,
    renew_lease: Script,
    release_lease: Script,
}

impl RedisStore {
    /// Connects to the store and verifies the connection with a ping.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the URL is invalid or the server is
    /// unreachable. Startup treats this as fatal.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let mut conn = ConnectionManager::new(client).await.map_err(StoreError::from)?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(StoreError::from)?;

        info!(url = %url, "connected to store");

        Ok(Self {
            conn,
            renew_lease: Script::new(RENEW_LEASE_SCRIPT),
            release_lease: Script::new(RELEASE_LEASE_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.kind() == ErrorKind::TypeError {
            Self::UnexpectedResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

fn entry_from_stream_id(id: &StreamId) -> Result<StreamEntry, StoreError> {
    let mut fields = Vec::with_capacity(id.map.len());
    for (name, value) in &id.map {
        let value: String = redis::from_redis_value(value)
            .map_err(|e| StoreError::UnexpectedResponse(format!("stream field {name}: {e}")))?;
        fields.push((name.clone(), value));
    }
    // HashMap iteration order is arbitrary; keep entries stable for logs.
    fields.sort();
    Ok(StreamEntry {
        id: id.id.clone(),
        fields,
    })
}

#[async_trait]
impl TimeoutStore for RedisStore {
    async fn track(&self, conversation_id: &str, basis_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::pipe()
            .cmd("ZADD")
            .arg(WAITING_CONVERSATIONS_KEY)
            .arg(basis_ms)
            .arg(conversation_id)
            .ignore()
            .cmd("HDEL")
            .arg(NOTIFICATION_STATES_KEY)
            .arg(conversation_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::pipe()
            .cmd("ZREM")
            .arg(WAITING_CONVERSATIONS_KEY)
            .arg(conversation_id)
            .ignore()
            .cmd("HDEL")
            .arg(NOTIFICATION_STATES_KEY)
            .arg(conversation_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn waiting_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCARD")
            .arg(WAITING_CONVERSATIONS_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn due_before(&self, max_ms: i64) -> Result<Vec<(String, i64)>, StoreError> {
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(WAITING_CONVERSATIONS_KEY)
            .arg(0)
            .arg(max_ms)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        #[allow(clippy::cast_possible_truncation)] // scores are ms-epoch integers
        Ok(members
            .into_iter()
            .map(|(member, score)| (member, score as i64))
            .collect())
    }

    async fn level(&self, conversation_id: &str) -> Result<EscalationLevel, StoreError> {
        let mut conn = self.conn();
        let raw: Option<u8> = redis::cmd("HGET")
            .arg(NOTIFICATION_STATES_KEY)
            .arg(conversation_id)
            .query_async(&mut conn)
            .await?;
        match raw {
            None => Ok(EscalationLevel::None),
            Some(value) => EscalationLevel::try_from(value)
                .map_err(|e| StoreError::UnexpectedResponse(e.to_string())),
        }
    }

    async fn set_level(
        &self,
        conversation_id: &str,
        level: EscalationLevel,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("HSET")
            .arg(NOTIFICATION_STATES_KEY)
            .arg(conversation_id)
            .arg(level.as_u8())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_older_than(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let max = format!("({cutoff_ms}");

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(WAITING_CONVERSATIONS_KEY)
            .arg(0)
            .arg(&max)
            .query_async(&mut conn)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let (removed, _state_removed): (u64, u64) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(WAITING_CONVERSATIONS_KEY)
            .arg(0)
            .arg(&max)
            .cmd("HDEL")
            .arg(NOTIFICATION_STATES_KEY)
            .arg(&expired)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(LEADER_KEY)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn renew_lease(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let extended: i64 = self
            .renew_lease
            .key(LEADER_KEY)
            .arg(holder)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release_lease(&self, holder: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let released: i64 = self
            .release_lease
            .key(LEADER_KEY)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn lease_holder(&self) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        let holder: Option<String> = redis::cmd("GET")
            .arg(LEADER_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(holder)
    }

    async fn ensure_group(&self, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(TIMEOUT_EVENTS_STREAM)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async::<()>(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn append_event(&self, event: &TimeoutEvent) -> Result<String, StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(TIMEOUT_EVENTS_STREAM).arg("*");
        for (name, value) in event.to_fields() {
            cmd.arg(name).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    #[allow(clippy::cast_possible_truncation)] // block timeouts are small
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn();
        let value: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(TIMEOUT_EVENTS_STREAM)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        // A block timeout with nothing to deliver answers nil.
        if value == Value::Nil {
            return Ok(Vec::new());
        }

        let reply: StreamReadReply = redis::from_redis_value(&value).map_err(StoreError::from)?;
        let mut entries = Vec::new();
        for key in &reply.keys {
            for id in &key.ids {
                entries.push(entry_from_stream_id(id)?);
            }
        }
        Ok(entries)
    }

    async fn ack(&self, group: &str, entry_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("XACK")
            .arg(TIMEOUT_EVENTS_STREAM)
            .arg(group)
            .arg(entry_id)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending_count(&self, group: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let value: Value = redis::cmd("XPENDING")
            .arg(TIMEOUT_EVENTS_STREAM)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        // Summary reply shape: [count, first-id, last-id, per-consumer].
        match value {
            Value::Array(items) if !items.is_empty() => {
                redis::from_redis_value::<u64>(&items[0]).map_err(StoreError::from)
            },
            other => Err(StoreError::UnexpectedResponse(format!(
                "XPENDING summary: {other:?}"
            ))),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // idle thresholds are small
    async fn claim_idle(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn();
        let reply: StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(TIMEOUT_EVENTS_STREAM)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        reply
            .claimed
            .iter()
            .map(entry_from_stream_id)
            .collect::<Result<Vec<_>, _>>()
    }
}
