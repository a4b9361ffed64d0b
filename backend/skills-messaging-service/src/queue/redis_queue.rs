use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EnqueueOutcome, JobEnvelope, JobQueue, QueueStats, MAX_DEAD_LETTERS};
use crate::error::AppResult;
use crate::redis_client::RedisClient;

// KEYS: jobs, delayed, user set | ARGV: id, payload, due_ms, indexed
static ENQUEUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
            return 0
        end
        redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
        if ARGV[4] == '1' then
            redis.call('SADD', KEYS[3], ARGV[1])
        end
        return 1
        "#,
    )
});

// KEYS: delayed, active, jobs | ARGV: now_ms, limit, lease_until_ms
static RESERVE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
        for _, id in ipairs(expired) do
            redis.call('ZREM', KEYS[2], id)
            redis.call('ZADD', KEYS[1], ARGV[1], id)
        end
        local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
        local out = {}
        for _, id in ipairs(ids) do
            redis.call('ZREM', KEYS[1], id)
            local payload = redis.call('HGET', KEYS[3], id)
            if payload then
                redis.call('ZADD', KEYS[2], ARGV[3], id)
                table.insert(out, payload)
            end
        end
        return out
        "#,
    )
});

// KEYS: user set, delayed | ARGV: now_ms
static PROMOTE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local ids = redis.call('SMEMBERS', KEYS[1])
        local moved = 0
        for _, id in ipairs(ids) do
            moved = moved + redis.call('ZADD', KEYS[2], 'XX', 'CH', ARGV[1], id)
        end
        return moved
        "#,
    )
});

/// Redis-backed job queue.
///
/// Layout under `{prefix}:{name}`: `jobs` HASH (id -> envelope JSON),
/// `delayed` ZSET (id -> due ms), `active` ZSET (id -> lease expiry ms),
/// `user:{id}` SET (pending delivery ids per receiver), `dead` LIST.
#[derive(Clone)]
pub struct RedisJobQueue {
    redis: RedisClient,
    name: String,
    prefix: String,
}

impl RedisJobQueue {
    pub fn new(redis: RedisClient, key_prefix: &str, name: &str) -> Self {
        Self {
            redis,
            name: name.to_string(),
            prefix: format!("{key_prefix}:{name}"),
        }
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    fn user_key(&self, user_id: Option<Uuid>) -> String {
        match user_id {
            Some(id) => format!("{}:user:{}", self.prefix, id),
            None => format!("{}:user:none", self.prefix),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn due_in(delay: Duration) -> i64 {
        Self::now_ms() + delay.as_millis() as i64
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, envelope: JobEnvelope, delay: Duration) -> AppResult<EnqueueOutcome> {
        let receiver = envelope.job.receiver_id();
        let payload = serde_json::to_string(&envelope)?;
        let mut con = self.redis.connection();

        let inserted: i64 = ENQUEUE
            .key(self.jobs_key())
            .key(self.delayed_key())
            .key(self.user_key(receiver))
            .arg(&envelope.id)
            .arg(payload)
            .arg(Self::due_in(delay))
            .arg(if receiver.is_some() { "1" } else { "0" })
            .invoke_async(&mut con)
            .await?;

        Ok(if inserted == 1 {
            EnqueueOutcome::Enqueued
        } else {
            EnqueueOutcome::Duplicate
        })
    }

    async fn reserve_due(&self, limit: usize, lease: Duration) -> AppResult<Vec<JobEnvelope>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut con = self.redis.connection();
        let payloads: Vec<String> = RESERVE
            .key(self.delayed_key())
            .key(self.active_key())
            .key(self.jobs_key())
            .arg(Self::now_ms())
            .arg(limit)
            .arg(Self::due_in(lease))
            .invoke_async(&mut con)
            .await?;

        let mut out = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<JobEnvelope>(&payload) {
                Ok(envelope) => out.push(envelope),
                Err(e) => {
                    // Unreadable payloads would be re-leased forever; drop them
                    warn!(queue = %self.name, error = %e, "discarding malformed job payload");
                    if let Some(id) = serde_json::from_str::<serde_json::Value>(&payload)
                        .ok()
                        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_owned))
                    {
                        let _: () = redis::pipe()
                            .atomic()
                            .hdel(self.jobs_key(), &id)
                            .ignore()
                            .zrem(self.active_key(), &id)
                            .ignore()
                            .query_async(&mut con)
                            .await?;
                    }
                }
            }
        }
        Ok(out)
    }

    async fn complete(&self, envelope: &JobEnvelope) -> AppResult<()> {
        let mut con = self.redis.connection();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(self.jobs_key(), &envelope.id)
            .ignore()
            .zrem(self.active_key(), &envelope.id)
            .ignore()
            .zrem(self.delayed_key(), &envelope.id)
            .ignore();
        if let Some(receiver) = envelope.job.receiver_id() {
            pipe.srem(self.user_key(Some(receiver)), &envelope.id).ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;
        debug!(queue = %self.name, job_id = %envelope.id, "job completed");
        Ok(())
    }

    async fn retry_later(&self, envelope: &JobEnvelope, delay: Duration) -> AppResult<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut con = self.redis.connection();
        let _: () = redis::pipe()
            .atomic()
            .hset(self.jobs_key(), &envelope.id, payload)
            .ignore()
            .zrem(self.active_key(), &envelope.id)
            .ignore()
            .zadd(self.delayed_key(), &envelope.id, Self::due_in(delay))
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, envelope: JobEnvelope, reason: String) -> AppResult<JobEnvelope> {
        let id = envelope.id.clone();
        let receiver = envelope.job.receiver_id();
        let dead = envelope.into_dead_letter(&self.name, reason);
        let payload = serde_json::to_string(&dead)?;

        let mut con = self.redis.connection();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .hdel(self.jobs_key(), &id)
            .ignore()
            .zrem(self.active_key(), &id)
            .ignore()
            .zrem(self.delayed_key(), &id)
            .ignore()
            .lpush(self.dead_key(), payload)
            .ignore()
            .ltrim(self.dead_key(), 0, MAX_DEAD_LETTERS as isize - 1)
            .ignore();
        if let Some(receiver) = receiver {
            pipe.srem(self.user_key(Some(receiver)), &id).ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;
        Ok(dead)
    }

    async fn promote_for_user(&self, user_id: Uuid) -> AppResult<u64> {
        let mut con = self.redis.connection();
        let moved: u64 = PROMOTE
            .key(self.user_key(Some(user_id)))
            .key(self.delayed_key())
            .arg(Self::now_ms())
            .invoke_async(&mut con)
            .await?;
        Ok(moved)
    }

    async fn stats(&self) -> AppResult<QueueStats> {
        let mut con = self.redis.connection();
        let (queued, active, dead): (u64, u64, u64) = redis::pipe()
            .zcard(self.delayed_key())
            .zcard(self.active_key())
            .llen(self.dead_key())
            .query_async(&mut con)
            .await?;
        Ok(QueueStats {
            queued,
            active,
            dead,
        })
    }

    async fn dead_letters(&self, limit: usize) -> AppResult<Vec<JobEnvelope>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut con = self.redis.connection();
        let payloads: Vec<String> = con
            .lrange(self.dead_key(), 0, limit as isize - 1)
            .await?;
        Ok(payloads
            .iter()
            .filter_map(|p| serde_json::from_str(p).ok())
            .collect())
    }
}
