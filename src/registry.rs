// src/registry.rs
//
// =============================================================================
// STRATUS: GPU RESOURCE REGISTRY & ADMISSION CONTROLLER
// =============================================================================
//
// The only shared mutable state in the system.
//
// Responsibilities:
// 1. Enforce the slice invariant: used_mb == sum(allocations), never above
//    the budget.
// 2. FIFO fairness: a parked job is admitted no later than any job parked
//    after it.
// 3. Release-and-wake: freeing a slice hands the head of the queue its
//    payload for immediate dispatch.
//
// Two backends behind one trait:
// - MemoryRegistry: a single mutex, one critical section per operation.
//   Single-process deployments and tests.
// - RedisRegistry: process-external state shared by the front end and the
//   worker fleet. Compound operations run as server-side Lua scripts so
//   no client ever observes a half-applied step.

use crate::core::JobPayload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

pub const GPU_USED_KEY: &str = "gpu:used";
pub const GPU_ALLOC_KEY: &str = "gpu:allocations";
pub const GPU_QUEUE_KEY: &str = "gpu:queue";

/// One parked job: the id plus everything the worker needs to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: i64,
    pub payload: JobPayload,
}

/// Point-in-time view for the status surface and for invariant checks.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSnapshot {
    pub total_mb: u64,
    pub used_mb: u64,
    pub queue_len: u64,
    pub allocations: BTreeMap<i64, u64>,
}

#[async_trait]
pub trait GpuRegistry: Send + Sync {
    /// Reserve one slice for the task. True on success; false leaves the
    /// registry untouched.
    async fn try_acquire(&self, task_id: i64) -> Result<bool>;

    /// Park a payload at the tail of the waiting queue. Callers must not
    /// enqueue the same task twice.
    async fn enqueue(&self, task_id: i64, payload: JobPayload) -> Result<()>;

    /// Free the task's slice (unknown ids are a no-op), then try to admit
    /// the queue head. A returned payload must be dispatched by the caller.
    async fn release(&self, task_id: i64) -> Result<Option<JobPayload>>;

    async fn snapshot(&self) -> Result<GpuSnapshot>;
}

// ============================================================================
// 1. IN-MEMORY BACKEND
// ============================================================================

struct LedgerState {
    used_mb: u64,
    allocations: HashMap<i64, u64>,
    queue: VecDeque<QueueEntry>,
}

pub struct MemoryRegistry {
    total_mb: u64,
    slice_mb: u64,
    state: Mutex<LedgerState>,
}

impl MemoryRegistry {
    pub fn new(total_mb: u64, slice_mb: u64) -> Self {
        Self {
            total_mb,
            slice_mb,
            state: Mutex::new(LedgerState {
                used_mb: 0,
                allocations: HashMap::new(),
                queue: VecDeque::new(),
            }),
        }
    }

    fn acquire_locked(&self, state: &mut LedgerState, task_id: i64) -> bool {
        if state.used_mb + self.slice_mb <= self.total_mb {
            state.used_mb += self.slice_mb;
            state.allocations.insert(task_id, self.slice_mb);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl GpuRegistry for MemoryRegistry {
    async fn try_acquire(&self, task_id: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(self.acquire_locked(&mut state, task_id))
    }

    async fn enqueue(&self, task_id: i64, payload: JobPayload) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(QueueEntry { task_id, payload });
        Ok(())
    }

    async fn release(&self, task_id: i64) -> Result<Option<JobPayload>> {
        let mut state = self.state.lock().unwrap();

        if let Some(slice) = state.allocations.remove(&task_id) {
            state.used_mb = state.used_mb.saturating_sub(slice);
        }

        let Some(entry) = state.queue.pop_front() else {
            return Ok(None);
        };
        if self.acquire_locked(&mut state, entry.task_id) {
            Ok(Some(entry.payload))
        } else {
            // Cannot happen with a fixed budget; guards against the budget
            // being reconfigured downward between runs.
            state.queue.push_front(entry);
            Ok(None)
        }
    }

    async fn snapshot(&self) -> Result<GpuSnapshot> {
        let state = self.state.lock().unwrap();
        Ok(GpuSnapshot {
            total_mb: self.total_mb,
            used_mb: state.used_mb,
            queue_len: state.queue.len() as u64,
            allocations: state.allocations.iter().map(|(k, v)| (*k, *v)).collect(),
        })
    }
}

// ============================================================================
// 2. REDIS BACKEND
// ============================================================================

// ARGV: task_id, slice_mb, total_mb. Returns 1 on acquire, 0 otherwise.
const ACQUIRE_LUA: &str = r#"
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
if used + tonumber(ARGV[2]) <= tonumber(ARGV[3]) then
  redis.call('INCRBY', KEYS[1], ARGV[2])
  redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
  return 1
end
return 0
"#;

// ARGV: task_id, slice_mb, total_mb. Frees the slice (if held), then pops
// the queue head and tries to admit it. Returns the popped entry's JSON on
// admission, false otherwise (re-pushing the entry to the head).
const RELEASE_LUA: &str = r#"
local slice = redis.call('HGET', KEYS[2], ARGV[1])
if slice then
  redis.call('DECRBY', KEYS[1], slice)
  redis.call('HDEL', KEYS[2], ARGV[1])
end
local head = redis.call('LPOP', KEYS[3])
if not head then
  return false
end
local entry = cjson.decode(head)
local used = tonumber(redis.call('GET', KEYS[1]) or '0')
if used + tonumber(ARGV[2]) <= tonumber(ARGV[3]) then
  redis.call('INCRBY', KEYS[1], ARGV[2])
  redis.call('HSET', KEYS[2], tostring(entry.task_id), ARGV[2])
  return head
end
redis.call('LPUSH', KEYS[3], head)
return false
"#;

pub struct RedisRegistry {
    conn: redis::aio::MultiplexedConnection,
    total_mb: u64,
    slice_mb: u64,
    acquire: redis::Script,
    release: redis::Script,
}

impl RedisRegistry {
    pub async fn connect(url: &str, total_mb: u64, slice_mb: u64) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid redis URL")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to redis registry")?;
        Ok(Self {
            conn,
            total_mb,
            slice_mb,
            acquire: redis::Script::new(ACQUIRE_LUA),
            release: redis::Script::new(RELEASE_LUA),
        })
    }
}

#[async_trait]
impl GpuRegistry for RedisRegistry {
    async fn try_acquire(&self, task_id: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let admitted: i64 = self
            .acquire
            .key(GPU_USED_KEY)
            .key(GPU_ALLOC_KEY)
            .arg(task_id)
            .arg(self.slice_mb)
            .arg(self.total_mb)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn enqueue(&self, task_id: i64, payload: JobPayload) -> Result<()> {
        let mut conn = self.conn.clone();
        let entry = serde_json::to_string(&QueueEntry { task_id, payload })?;
        conn.rpush::<_, _, ()>(GPU_QUEUE_KEY, entry).await?;
        Ok(())
    }

    async fn release(&self, task_id: i64) -> Result<Option<JobPayload>> {
        let mut conn = self.conn.clone();
        let woken: Option<String> = self
            .release
            .key(GPU_USED_KEY)
            .key(GPU_ALLOC_KEY)
            .key(GPU_QUEUE_KEY)
            .arg(task_id)
            .arg(self.slice_mb)
            .arg(self.total_mb)
            .invoke_async(&mut conn)
            .await?;

        match woken {
            Some(json) => {
                let entry: QueueEntry =
                    serde_json::from_str(&json).context("Corrupt queue entry in registry")?;
                Ok(Some(entry.payload))
            }
            None => Ok(None),
        }
    }

    async fn snapshot(&self) -> Result<GpuSnapshot> {
        let mut conn = self.conn.clone();
        let used: Option<u64> = conn.get(GPU_USED_KEY).await?;
        let queue_len: u64 = conn.llen(GPU_QUEUE_KEY).await?;
        let raw: HashMap<String, u64> = conn.hgetall(GPU_ALLOC_KEY).await?;

        let mut allocations = BTreeMap::new();
        for (k, v) in raw {
            if let Ok(id) = k.parse::<i64>() {
                allocations.insert(id, v);
            }
        }

        Ok(GpuSnapshot {
            total_mb: self.total_mb,
            used_mb: used.unwrap_or(0),
            queue_len,
            allocations,
        })
    }
}
