//! Redis-backed depth store
//!
//! Layout per pool:
//! - `{prefix}:{pool}:{bids|asks}:{precision}` hash, field = bucket price,
//!   value = aggregate in integer units of 1e-8
//! - `{prefix}:{pool}:processed` sorted set of applied event ids (score = time)
//!
//! Each `apply_deltas` call runs as one Lua script, so the dedup check, every
//! HINCRBY and the dust cleanup commit together. Redis does not roll a script
//! back, so every projected aggregate is checked against
//! [`money::MAX_QTY_UNITS`] before the first write; a rejected call records no
//! id. Quantities never pass through Lua numbers except for the dust and bound
//! comparisons, and the bound sits far enough below `i64::MAX` that float
//! rounding cannot let an increment overflow. `clean_stale` is one script too,
//! comparing bucket fields as decimal strings.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::{
    DepthApplyResult, DepthDelta, DepthError, DepthKey, DepthSnapshot, DepthStore, PriceLevel,
    depth_change, key::processed_key, plan_groups,
};
use crate::core_types::PoolId;
use crate::models::Side;
use crate::money;
use crate::precision::{self, Precision};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "depth";

// KEYS[1] = processed zset, KEYS[2..] = depth hashes
// ARGV = capacity, group_count, dust_units, limit_units, then per group:
//        unique_id ('' when absent), entry_count, (key_index, field, units)*
//
// Pass 1 finds duplicates and bound-checks every projected aggregate without
// writing. Pass 2 records ids and increments only when every check passed.
const APPLY_SCRIPT: &str = r#"
local cap = tonumber(ARGV[1])
local ngroups = tonumber(ARGV[2])
local dust = tonumber(ARGV[3])
local limit = tonumber(ARGV[4])
local groups = {}
local dups = {}
local projected = {}
local pos = 5
for g = 1, ngroups do
  local id = ARGV[pos]
  local n = tonumber(ARGV[pos + 1])
  local skip = id ~= '' and redis.call('ZSCORE', KEYS[1], id) ~= false
  if skip then
    table.insert(dups, id)
  else
    for i = 0, n - 1 do
      local at = pos + 2 + i * 3
      local k = tonumber(ARGV[at])
      local field = ARGV[at + 1]
      local tag = k .. '|' .. field
      local cur = projected[tag]
      if cur == nil then
        cur = tonumber(redis.call('HGET', KEYS[k], field) or '0')
      end
      cur = cur + tonumber(ARGV[at + 2])
      if math.abs(cur) > limit then
        return redis.error_reply('LEVEL_LIMIT ' .. KEYS[k] .. ' ' .. field)
      end
      projected[tag] = cur
    end
  end
  table.insert(groups, {id, n, pos + 2, skip})
  pos = pos + 2 + n * 3
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000000 + tonumber(t[2])
local seen = {}
local touched = {}
for g, grp in ipairs(groups) do
  if not grp[4] then
    if grp[1] ~= '' then
      redis.call('ZADD', KEYS[1], now + g, grp[1])
    end
    for i = 0, grp[2] - 1 do
      local at = grp[3] + i * 3
      local k = tonumber(ARGV[at])
      local field = ARGV[at + 1]
      redis.call('HINCRBY', KEYS[k], field, ARGV[at + 2])
      local tag = k .. '|' .. field
      if not seen[tag] then
        seen[tag] = true
        table.insert(touched, {k, field})
      end
    end
  end
end
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, -(cap + 1))
local changes = {}
for _, e in ipairs(touched) do
  local v = redis.call('HGET', KEYS[e[1]], e[2]) or '0'
  local removed = 0
  if tonumber(v) <= dust then
    redis.call('HDEL', KEYS[e[1]], e[2])
    removed = 1
  end
  table.insert(changes, {e[1], e[2], v, removed})
end
return {dups, changes}
"#;

// KEYS = stale-side hashes, ARGV = trade price (plain decimal), 'le' | 'ge'
//
// Bucket fields are compared as exact decimal strings, never as Lua numbers.
const STALE_SCRIPT: &str = r#"
local function split(s)
  local i, f = string.match(s, '^(%d*)%.?(%d*)$')
  if i == nil then
    return nil
  end
  i = string.gsub(i, '^0+', '')
  f = string.gsub(f, '0+$', '')
  return i, f
end
local function cmp(a, b)
  local ai, af = split(a)
  local bi, bf = split(b)
  if ai == nil or bi == nil then
    return nil
  end
  if #ai ~= #bi then
    return #ai < #bi and -1 or 1
  end
  if ai ~= bi then
    return ai < bi and -1 or 1
  end
  local n = math.max(#af, #bf)
  af = af .. string.rep('0', n - #af)
  bf = bf .. string.rep('0', n - #bf)
  if af == bf then
    return 0
  end
  return af < bf and -1 or 1
end
local removed = 0
for _, key in ipairs(KEYS) do
  for _, field in ipairs(redis.call('HKEYS', key)) do
    local c = cmp(field, ARGV[1])
    if c ~= nil and ((ARGV[2] == 'le' and c <= 0) or (ARGV[2] == 'ge' and c >= 0)) then
      removed = removed + redis.call('HDEL', key, field)
    end
  end
end
return removed
"#;

/// Error code the apply script raises when a level would pass the bound
const LEVEL_LIMIT_CODE: &str = "LEVEL_LIMIT";

// KEYS[1] = processed zset, ARGV = unique_id, capacity
const MARK_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
local t = redis.call('TIME')
redis.call('ZADD', KEYS[1], tonumber(t[1]) * 1000000 + tonumber(t[2]), ARGV[1])
redis.call('ZREMRANGEBYRANK', KEYS[1], 0, -(tonumber(ARGV[2]) + 1))
return 1
"#;

/// (key index, field, units, removed flag) as returned by the apply script
type ScriptChange = (usize, String, String, i64);

pub struct RedisDepthStore {
    conn: MultiplexedConnection,
    prefix: String,
    dedup_capacity: usize,
    apply: redis::Script,
    mark: redis::Script,
    stale: redis::Script,
}

impl RedisDepthStore {
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        dedup_capacity: usize,
    ) -> Result<Self, DepthError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::with_connection(conn, prefix, dedup_capacity))
    }

    pub fn with_connection(
        conn: MultiplexedConnection,
        prefix: impl Into<String>,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            dedup_capacity: dedup_capacity.max(1),
            apply: redis::Script::new(APPLY_SCRIPT),
            mark: redis::Script::new(MARK_SCRIPT),
            stale: redis::Script::new(STALE_SCRIPT),
        }
    }

    async fn read_levels(
        &self,
        key: &DepthKey,
    ) -> Result<Vec<(Decimal, String, i64)>, DepthError> {
        let name = key.redis_key(&self.prefix);
        let mut conn = self.conn.clone();
        let raw: Vec<(String, String)> = conn.hgetall(&name).await?;

        raw.into_iter()
            .map(|(field, value)| {
                let corrupt = || DepthError::Corrupt {
                    key: name.clone(),
                    field: field.clone(),
                    value: value.clone(),
                };
                let bucket: Decimal = field.parse().map_err(|_| corrupt())?;
                let units: i64 = value.parse().map_err(|_| corrupt())?;
                Ok((bucket, field.clone(), units))
            })
            .collect()
    }
}

#[async_trait]
impl DepthStore for RedisDepthStore {
    async fn apply_deltas(
        &self,
        pool_id: PoolId,
        deltas: &[DepthDelta],
    ) -> Result<DepthApplyResult, DepthError> {
        let groups = plan_groups(deltas)?;
        if groups.is_empty() {
            return Ok(DepthApplyResult::default());
        }

        // Depth hashes touched by this call, in KEYS order after the zset
        let mut keys: Vec<DepthKey> = Vec::new();
        let mut invocation = self.apply.prepare_invoke();
        invocation.key(processed_key(&self.prefix, pool_id));
        invocation
            .arg(self.dedup_capacity)
            .arg(groups.len())
            .arg(1i64)
            .arg(money::MAX_QTY_UNITS);

        for group in &groups {
            invocation
                .arg(group.unique_id.as_deref().unwrap_or(""))
                .arg(group.levels.len());
            for (level, qty) in &group.levels {
                let key = DepthKey::new(pool_id, level.side, level.precision);
                let index = match keys.iter().position(|k| *k == key) {
                    Some(i) => i,
                    None => {
                        keys.push(key);
                        invocation.key(key.redis_key(&self.prefix));
                        keys.len() - 1
                    }
                };
                invocation
                    .arg(index + 2)
                    .arg(precision::format_bucket(level.bucket, level.precision))
                    .arg(money::qty_to_units(*qty)?);
            }
        }

        let mut conn = self.conn.clone();
        let (duplicates, raw_changes): (Vec<String>, Vec<ScriptChange>) =
            match invocation.invoke_async(&mut conn).await {
                Ok(reply) => reply,
                Err(e) if e.code() == Some(LEVEL_LIMIT_CODE) => {
                    let detail = e.detail().unwrap_or_default();
                    let (key, bucket) = detail.split_once(' ').unwrap_or((detail, ""));
                    return Err(DepthError::LevelLimit {
                        key: key.to_string(),
                        bucket: bucket.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            };

        let mut changes = Vec::with_capacity(raw_changes.len());
        for (index, field, value, removed) in raw_changes {
            let Some(key) = index.checked_sub(2).and_then(|i| keys.get(i)).copied() else {
                return Err(DepthError::Corrupt {
                    key: format!("KEYS[{}]", index),
                    field,
                    value,
                });
            };
            let units: i64 = value.parse().map_err(|_| DepthError::Corrupt {
                key: key.redis_key(&self.prefix),
                field: field.clone(),
                value: value.clone(),
            })?;
            if removed == 1 && units < 0 {
                warn!(pool_id, key = %key, bucket = %field, units, "Depth aggregate went negative, level removed");
            }
            changes.push(depth_change(
                pool_id,
                key.side,
                key.precision,
                field,
                money::units_to_qty(units),
            ));
        }

        if !duplicates.is_empty() {
            debug!(pool_id, count = duplicates.len(), "Skipped already processed events");
        }
        Ok(DepthApplyResult {
            changes,
            duplicates,
        })
    }

    async fn mark_processed(&self, pool_id: PoolId, unique_id: &str) -> Result<bool, DepthError> {
        let mut conn = self.conn.clone();
        let fresh: i64 = self
            .mark
            .key(processed_key(&self.prefix, pool_id))
            .arg(unique_id)
            .arg(self.dedup_capacity)
            .invoke_async(&mut conn)
            .await?;
        Ok(fresh == 1)
    }

    async fn snapshot(
        &self,
        pool_id: PoolId,
        precision: Precision,
        limit: usize,
    ) -> Result<DepthSnapshot, DepthError> {
        let mut sides = Vec::with_capacity(2);
        for side in [Side::Buy, Side::Sell] {
            let mut levels: Vec<(Decimal, i64)> = self
                .read_levels(&DepthKey::new(pool_id, side, precision))
                .await?
                .into_iter()
                .filter(|(_, _, units)| *units > 1)
                .map(|(bucket, _, units)| (bucket, units))
                .collect();
            match side {
                Side::Buy => levels.sort_by(|a, b| b.0.cmp(&a.0)),
                Side::Sell => levels.sort_by(|a, b| a.0.cmp(&b.0)),
            }
            let rendered: Vec<PriceLevel> = levels
                .into_iter()
                .take(limit)
                .map(|(bucket, units)| {
                    (
                        precision::format_bucket(bucket, precision),
                        money::format_qty(money::units_to_qty(units)),
                    )
                })
                .collect();
            sides.push(rendered);
        }

        let asks = sides.pop().unwrap_or_default();
        let bids = sides.pop().unwrap_or_default();
        Ok(DepthSnapshot { bids, asks })
    }

    async fn clear_pool(&self, pool_id: PoolId) -> Result<(), DepthError> {
        let mut names: Vec<String> = DepthKey::all_for_pool(pool_id)
            .map(|k| k.redis_key(&self.prefix))
            .collect();
        names.push(processed_key(&self.prefix, pool_id));

        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(&names).query_async(&mut conn).await?;
        debug!(pool_id, removed, "Cleared depth keys");
        Ok(())
    }

    async fn clear_levels(&self, pool_id: PoolId) -> Result<(), DepthError> {
        let names: Vec<String> = DepthKey::all_for_pool(pool_id)
            .map(|k| k.redis_key(&self.prefix))
            .collect();
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(&names).query_async(&mut conn).await?;
        debug!(pool_id, removed, "Cleared depth levels");
        Ok(())
    }

    async fn clean_stale(
        &self,
        pool_id: PoolId,
        last_trade_price: Decimal,
        last_trade_side: Side,
    ) -> Result<usize, DepthError> {
        let stale_side = last_trade_side.opposite();
        let mode = match stale_side {
            Side::Sell => "le",
            Side::Buy => "ge",
        };

        let mut invocation = self.stale.prepare_invoke();
        for prec in Precision::all() {
            invocation.key(DepthKey::new(pool_id, stale_side, prec).redis_key(&self.prefix));
        }
        invocation
            .arg(last_trade_price.normalize().to_string())
            .arg(mode);

        let mut conn = self.conn.clone();
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed.max(0) as usize)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
