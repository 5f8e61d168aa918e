//! Redis backend.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use tokio::sync::{Mutex, mpsc};

use crate::{Batch, Op, Store, StoreError, Subscription};

/// Redis expiries are whole seconds; never round a TTL down to zero.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Applies `ARGV` as (op, key, value, ttl) quadruples unless `KEYS[1]` exists.
const GUARDED_BATCH: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
for i = 1, #ARGV, 4 do
    local op, key, value, ttl = ARGV[i], ARGV[i + 1], ARGV[i + 2], tonumber(ARGV[i + 3])
    if op == 'set' then
        if ttl > 0 then
            redis.call('SET', key, value, 'EX', ttl)
        else
            redis.call('SET', key, value)
        end
    elseif op == 'del' then
        redis.call('DEL', key)
    elseif op == 'rpush' then
        redis.call('RPUSH', key, value)
    elseif op == 'lrem' then
        redis.call('LREM', key, 0, value)
    elseif op == 'sadd' then
        redis.call('SADD', key, value)
    elseif op == 'srem' then
        redis.call('SREM', key, value)
    end
end
return 1
"#;

/// Store backed by a Redis server.
///
/// Ordinary commands share a reconnecting [`ConnectionManager`]. Blocking
/// pops get a connection of their own so they never stall other commands,
/// and every subscription opens a dedicated pub/sub connection.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("Connected to Redis");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.conn().exists(key).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: usize = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        Ok(self.conn().rpush(key, value).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().lpop(key, None).await?)
    }

    async fn blpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let mut guard = self.blocking.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::Closed);
        };
        match conn
            .blpop::<_, Option<(String, String)>>(keys, timeout.as_secs_f64())
            .await
        {
            Ok(popped) => Ok(popped),
            Err(err) => {
                // Reconnect on the next call.
                *guard = None;
                Err(err.into())
            }
        }
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().lrange(key, start, stop).await?)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.conn().llen(key).await?)
    }

    async fn lrem(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        Ok(self.conn().lrem(key, 0, value).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let added: usize = self.conn().sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed: usize = self.conn().srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn scard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.conn().scard(key).await?)
    }

    async fn execute(&self, batch: Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.into_ops() {
            match op {
                Op::Set {
                    key,
                    value,
                    ttl: Some(ttl),
                } => pipe.set_ex(key, value, ttl_secs(ttl)).ignore(),
                Op::Set {
                    key,
                    value,
                    ttl: None,
                } => pipe.set(key, value).ignore(),
                Op::Delete { key } => pipe.del(key).ignore(),
                Op::RPush { key, value } => pipe.rpush(key, value).ignore(),
                Op::LRem { key, value } => pipe.lrem(key, 0, value).ignore(),
                Op::SAdd { key, member } => pipe.sadd(key, member).ignore(),
                Op::SRem { key, member } => pipe.srem(key, member).ignore(),
            };
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn execute_if_absent(&self, guard: &str, batch: Batch) -> Result<bool, StoreError> {
        let script = redis::Script::new(GUARDED_BATCH);
        let mut invocation = script.prepare_invoke();
        invocation.key(guard);
        for op in batch.into_ops() {
            let (name, key, value, ttl) = match op {
                Op::Set { key, value, ttl } => ("set", key, value, ttl.map_or(0, ttl_secs)),
                Op::Delete { key } => ("del", key, String::new(), 0),
                Op::RPush { key, value } => ("rpush", key, value, 0),
                Op::LRem { key, value } => ("lrem", key, value, 0),
                Op::SAdd { key, member } => ("sadd", key, member, 0),
                Op::SRem { key, member } => ("srem", key, member, 0),
            };
            invocation.arg(name).arg(key).arg(value).arg(ttl);
        }
        let mut conn = self.conn();
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        Ok(self.conn().publish(channel, message).await?)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping undecodable message on {}: {}", name, e),
                }
            }
            tracing::debug!("Subscription to {} ended", name);
        });

        Ok(Subscription::new(channel, rx).with_forwarder(forwarder))
    }

    async fn close(&self) -> Result<(), StoreError> {
        *self.blocking.lock().await = None;
        Ok(())
    }
}
