//! Worker pools and the scheduler that owns them.
//!
//! ```text
//!                      +--> queue 0 --> worker 0 --+
//!  router --offer--> hash                          +--> ItemExecutor
//!                      +--> queue N --> worker N --+
//! ```
//!
//! Each pool has a fixed number of bounded FIFO queues with one worker per
//! queue. Items for the same account land on the same queue, so they are
//! executed in order; ordering across queues is not kept.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::Concurrency;
use crate::connection::ResourceConnection;
use crate::packet::Packet;
use crate::plugin::{AdHocCommand, Processor};
use crate::stats::PoolStats;

/// Pool used when a task names no pool of its own.
pub(crate) const DEFAULT_POOL: &str = "default-threads-pool";

/// Work a queued item performs.
#[derive(Clone)]
pub(crate) enum Task {
    Processor(Arc<dyn Processor>),
    Command(Arc<dyn AdHocCommand>),
}

impl Task {
    pub(crate) fn id(&self) -> &str {
        match self {
            Task::Processor(p) => p.id(),
            Task::Command(c) => c.node(),
        }
    }
}

/// One unit of queued work.
pub(crate) struct QueueItem {
    pub task: Task,
    pub packet: Packet,
    pub conn: Option<Arc<ResourceConnection>>,
}

/// Runs queued items. Implemented by the session context.
#[async_trait]
pub(crate) trait ItemExecutor: Send + Sync {
    async fn execute(&self, item: QueueItem);
}

pub(crate) struct WorkerPool {
    name: String,
    concurrency: Concurrency,
    senders: Vec<mpsc::Sender<QueueItem>>,
    processed: Arc<AtomicU64>,
    dropped: AtomicU64,
    token: CancellationToken,
}

impl WorkerPool {
    /// Start the pool's workers.
    ///
    /// Workers stop when `parent` is cancelled, or once every queued item
    /// is done after the pool is dropped.
    pub(crate) fn start(
        name: &str,
        concurrency: Concurrency,
        executor: Weak<dyn ItemExecutor>,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let processed = Arc::new(AtomicU64::new(0));
        let mut senders = Vec::with_capacity(concurrency.queues);

        for idx in 0..concurrency.queues {
            let (tx, rx) = mpsc::channel(concurrency.queue_depth);
            senders.push(tx);
            tokio::spawn(run_worker(
                format!("{name}-{idx}"),
                rx,
                executor.clone(),
                Arc::clone(&processed),
                token.clone(),
            ));
        }

        debug!(
            pool = %name,
            queues = concurrency.queues,
            queue_depth = concurrency.queue_depth,
            "Started worker pool"
        );

        Self {
            name: name.to_string(),
            concurrency,
            senders,
            processed,
            dropped: AtomicU64::new(0),
            token,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Queue an item without waiting. Returns false if its queue is full or
    /// the pool is stopped.
    pub(crate) fn offer(&self, item: QueueItem) -> bool {
        let idx = (shard_key(&item) % self.senders.len() as u64) as usize;
        match self.senders[idx].try_send(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let queued = self
            .senders
            .iter()
            .map(|s| s.max_capacity() - s.capacity())
            .sum();
        PoolStats {
            name: self.name.clone(),
            queues: self.concurrency.queues,
            queue_depth: self.concurrency.queue_depth,
            queued,
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers without draining their queues.
    pub(crate) fn shutdown(&self) {
        self.token.cancel();
    }
}

async fn run_worker(
    name: String,
    mut rx: mpsc::Receiver<QueueItem>,
    executor: Weak<dyn ItemExecutor>,
    processed: Arc<AtomicU64>,
    token: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let Some(executor) = executor.upgrade() else {
            break;
        };
        trace!(worker = %name, task = %item.task.id(), "Executing queued item");
        executor.execute(item).await;
        processed.fetch_add(1, Ordering::Relaxed);
    }
    trace!(worker = %name, "Worker stopped");
}

/// Queue selection key: the account for authenticated traffic, otherwise
/// the destination, otherwise the source connection.
fn shard_key(item: &QueueItem) -> u64 {
    let mut hasher = DefaultHasher::new();
    match item.conn.as_ref().and_then(|c| c.user()) {
        Some(user) => user.hash(&mut hasher),
        None => match (item.packet.stanza_to(), item.packet.from_address()) {
            (Some(to), _) => to.to_bare().hash(&mut hasher),
            (None, Some(from)) => from.hash(&mut hasher),
            (None, None) => 0u8.hash(&mut hasher),
        },
    }
    hasher.finish()
}

/// Fixed table of worker pools, keyed by plugin id.
pub(crate) struct Scheduler {
    pools: HashMap<String, Arc<WorkerPool>>,
    default_pool: Arc<WorkerPool>,
}

impl Scheduler {
    /// Start one pool per entry of `table` plus the default pool.
    pub(crate) fn build(
        table: &[(String, Concurrency)],
        default: Concurrency,
        executor: Weak<dyn ItemExecutor>,
        parent: &CancellationToken,
    ) -> Self {
        let pools = table
            .iter()
            .map(|(id, c)| {
                let pool = WorkerPool::start(id, *c, executor.clone(), parent);
                (id.clone(), Arc::new(pool))
            })
            .collect();
        let default_pool = Arc::new(WorkerPool::start(DEFAULT_POOL, default, executor, parent));
        Self {
            pools,
            default_pool,
        }
    }

    /// Build a scheduler for `table`, reusing pools whose id and concurrency
    /// did not change.
    ///
    /// Pools left out of the new table stop once their queued items are
    /// done and the old scheduler is dropped.
    pub(crate) fn rebuild(
        &self,
        table: &[(String, Concurrency)],
        default: Concurrency,
        executor: Weak<dyn ItemExecutor>,
        parent: &CancellationToken,
    ) -> Self {
        let mut reused = 0usize;
        let pools = table
            .iter()
            .map(|(id, c)| {
                let pool = match self.pools.get(id) {
                    Some(existing) if existing.concurrency() == *c => {
                        reused += 1;
                        Arc::clone(existing)
                    }
                    _ => Arc::new(WorkerPool::start(id, *c, executor.clone(), parent)),
                };
                (id.clone(), pool)
            })
            .collect::<HashMap<_, _>>();

        let default_pool = if self.default_pool.concurrency() == default {
            Arc::clone(&self.default_pool)
        } else {
            Arc::new(WorkerPool::start(DEFAULT_POOL, default, executor, parent))
        };

        let removed: Vec<&str> = self
            .pools
            .keys()
            .filter(|id| !pools.contains_key(*id))
            .map(String::as_str)
            .collect();
        info!(
            pools = pools.len(),
            reused,
            removed = ?removed,
            "Rebuilt worker pool table"
        );

        Self {
            pools,
            default_pool,
        }
    }

    /// Pool for `id`, falling back to the default pool.
    pub(crate) fn pool_for(&self, id: &str) -> &Arc<WorkerPool> {
        self.pools.get(id).unwrap_or(&self.default_pool)
    }

    pub(crate) fn has_pool(&self, id: &str) -> bool {
        self.pools.contains_key(id)
    }

    pub(crate) fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.values().map(|p| p.stats()).collect();
        stats.push(self.default_pool.stats());
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub(crate) fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown();
        }
        self.default_pool.shutdown();
    }
}
