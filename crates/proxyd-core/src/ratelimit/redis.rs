use super::RateLimiter;
use crate::store::{CacheError, RedisStore};
use async_trait::async_trait;
use dashmap::DashSet;
use redis::{AsyncCommands, Script};
use std::{sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

/// TTL of this replica's WebSocket counters. A crashed replica's slots free themselves after
/// this long; live replicas refresh the TTL at half this interval.
const WS_CONNS_TTL: Duration = Duration::from_secs(300);

const INC_RPS_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], 1)
end
return count
";

// KEYS[1] = set of per-replica counter keys, KEYS[2] = this replica's counter.
// Members whose counter has expired are pruned while summing.
const INC_WS_CONNS_SCRIPT: &str = r"
local max = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local total = 0
for _, key in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local value = redis.call('GET', key)
  if value then
    total = total + tonumber(value)
  else
    redis.call('SREM', KEYS[1], key)
  end
end
if max > 0 and total >= max then
  return 0
end
redis.call('INCR', KEYS[2])
redis.call('EXPIRE', KEYS[2], ttl)
redis.call('SADD', KEYS[1], KEYS[2])
return 1
";

const DEC_WS_CONNS_SCRIPT: &str = r"
local count = redis.call('DECR', KEYS[1])
if count < 0 then
  redis.call('SET', KEYS[1], 0)
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
return 1
";

fn offline_key(name: &str) -> String {
    format!("backend:{name}:offline")
}

fn rps_key(name: &str) -> String {
    format!("backend:{name}:ratelimit")
}

fn proxies_key(name: &str) -> String {
    format!("backend:{name}:proxies")
}

/// [`RateLimiter`] whose state lives in Redis and is shared by every proxy replica.
///
/// WebSocket slots are counted per replica under `proxy:<replica id>:wsconns:<backend>` and
/// summed across the replicas registered in `backend:<backend>:proxies`.
pub struct RedisRateLimiter {
    store: RedisStore,
    replica_id: String,
    tracked_backends: DashSet<String>,
    inc_rps: Script,
    inc_ws_conns: Script,
    dec_ws_conns: Script,
}

impl RedisRateLimiter {
    #[must_use]
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            replica_id: uuid::Uuid::new_v4().to_string(),
            tracked_backends: DashSet::new(),
            inc_rps: Script::new(INC_RPS_SCRIPT),
            inc_ws_conns: Script::new(INC_WS_CONNS_SCRIPT),
            dec_ws_conns: Script::new(DEC_WS_CONNS_SCRIPT),
        }
    }

    #[must_use]
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    fn ws_conns_key(&self, name: &str) -> String {
        format!("proxy:{}:wsconns:{name}", self.replica_id)
    }

    /// Refreshes the TTL of this replica's WebSocket counters until shutdown.
    pub fn start_refresh_task(
        self: &Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WS_CONNS_TTL / 2);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = limiter.refresh_ws_conns_ttl().await {
                            warn!(error = %e, "failed to refresh websocket connection counters");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("redis rate limiter refresh task shutting down");
                        break;
                    }
                }
            }
        })
    }

    async fn refresh_ws_conns_ttl(&self) -> Result<(), CacheError> {
        let mut conn = self.store.connection();
        let ttl = i64::try_from(WS_CONNS_TTL.as_secs()).unwrap_or(i64::MAX);
        let names: Vec<String> = self.tracked_backends.iter().map(|name| name.clone()).collect();

        for name in names {
            conn.expire::<_, ()>(self.ws_conns_key(&name), ttl)
                .await
                .map_err(|e| self.store.backend_error("refresh_ws_conns", &e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn is_backend_online(&self, name: &str) -> Result<bool, CacheError> {
        let mut conn = self.store.connection();
        let offline: bool = conn
            .exists(offline_key(name))
            .await
            .map_err(|e| self.store.backend_error("is_backend_online", &e))?;
        Ok(!offline)
    }

    async fn set_backend_offline(&self, name: &str, duration: Duration) -> Result<(), CacheError> {
        let mut conn = self.store.connection();
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1);
        conn.pset_ex::<_, _, ()>(offline_key(name), 1, millis)
            .await
            .map_err(|e| self.store.backend_error("set_backend_offline", &e))
    }

    async fn inc_backend_rps(&self, name: &str) -> Result<u64, CacheError> {
        let mut conn = self.store.connection();
        self.inc_rps
            .key(rps_key(name))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.store.backend_error("inc_backend_rps", &e))
    }

    async fn inc_backend_ws_conns(&self, name: &str, max: u64) -> Result<bool, CacheError> {
        let mut conn = self.store.connection();
        let admitted: i64 = self
            .inc_ws_conns
            .key(proxies_key(name))
            .key(self.ws_conns_key(name))
            .arg(max)
            .arg(WS_CONNS_TTL.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.store.backend_error("inc_backend_ws_conns", &e))?;

        if admitted == 1 {
            self.tracked_backends.insert(name.to_string());
        }
        Ok(admitted == 1)
    }

    async fn dec_backend_ws_conns(&self, name: &str) -> Result<(), CacheError> {
        let mut conn = self.store.connection();
        self.dec_ws_conns
            .key(self.ws_conns_key(name))
            .arg(WS_CONNS_TTL.as_secs())
            .invoke_async::<i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| self.store.backend_error("dec_backend_ws_conns", &e))
    }

    async fn flush_backend_ws_conns(&self, names: &[String]) -> Result<(), CacheError> {
        let mut conn = self.store.connection();
        for name in names {
            let key = self.ws_conns_key(name);
            conn.del::<_, ()>(&key)
                .await
                .map_err(|e| self.store.backend_error("flush_backend_ws_conns", &e))?;
            conn.srem::<_, _, ()>(proxies_key(name), &key)
                .await
                .map_err(|e| self.store.backend_error("flush_backend_ws_conns", &e))?;
            self.tracked_backends.remove(name);
        }
        Ok(())
    }
}
