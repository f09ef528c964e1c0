//! Per-client frequency-ordered candidate list.
//!
//! Trial decryption tries servers in the order a client has hit them before,
//! so a returning client's steady state is O(1) rather than O(N) over the
//! whole server set. A background task periodically decays weights so cold
//! candidates don't accumulate unbounded priority from a single burst.

use crate::config::Server;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

const DECAY_BASE: Duration = Duration::from_secs(10);
const DECAY_JITTER_SECS: u64 = 3;

/// One candidate server plus its hit-frequency weight.
pub struct Node {
    pub server: Server,
    weight: AtomicU32,
}

impl Node {
    fn new(server: Server, weight: u32) -> Arc<Self> {
        Arc::new(Node {
            server,
            weight: AtomicU32::new(weight),
        })
    }

    #[inline]
    pub fn promote(&self) {
        self.weight.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum InsertStrategy {
    /// New candidates start at `max + 1`: tried before anything settled.
    InsertFront,
    /// New candidates start at `avg + 1`: tried somewhere in the middle.
    InsertAverage,
}

struct Inner {
    list: Vec<Arc<Node>>,
    max: u32,
    avg: u32,
    strategy: InsertStrategy,
}

/// Concurrent, lazily-sorted frequency list of candidate servers for one
/// client identity.
pub struct UserContext {
    inner: RwLock<Inner>,
    closed: Arc<AtomicBool>,
    jitter_secs: u64,
}

impl UserContext {
    pub fn new(servers: Vec<Server>, strategy: InsertStrategy) -> Arc<Self> {
        let list: Vec<Arc<Node>> = servers.into_iter().map(|s| Node::new(s, 0)).collect();
        let jitter_secs = rand::thread_rng().gen_range(0..=2 * DECAY_JITTER_SECS);
        let ctx = Arc::new(UserContext {
            inner: RwLock::new(Inner {
                list,
                max: 0,
                avg: 0,
                strategy,
            }),
            closed: Arc::new(AtomicBool::new(false)),
            jitter_secs,
        });
        ctx.spawn_decay_task();
        ctx
    }

    /// Ordered snapshot of candidates, most-promoted first (until the next
    /// decay resort). Cloning `Arc<Node>` handles is cheap; trial decryption
    /// never touches the live list while iterating this snapshot.
    pub fn snapshot(&self) -> Vec<Arc<Node>> {
        self.inner.read().list.clone()
    }

    pub fn promote(&self, node: &Node) {
        node.promote();
    }

    pub fn insert(&self, server: Server) {
        let mut inner = self.inner.write();
        let weight = match inner.strategy {
            InsertStrategy::InsertFront => inner.max + 1,
            InsertStrategy::InsertAverage => inner.avg + 1,
        };
        inner.list.push(Node::new(server, weight));
    }

    pub fn remove(&self, target: &str) {
        let mut inner = self.inner.write();
        inner.list.retain(|n| n.server.target != target);
    }

    pub fn len(&self) -> usize {
        self.inner.read().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().list.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Stops the background decay task on its next tick.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Holds only a weak handle back to the context: the task outlives
    /// neither its owner's last `Arc` nor a `close()`, so it can never be
    /// the thing keeping a stale context alive after eviction.
    fn spawn_decay_task(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let jitter = Duration::from_secs(self.jitter_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DECAY_BASE + jitter);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let Some(ctx) = weak.upgrade() else {
                    return;
                };
                if ctx.is_closed() {
                    return;
                }
                ctx.decay_and_resort();
            }
        });
    }

    fn decay_and_resort(&self) {
        let mut inner = self.inner.write();
        inner
            .list
            .sort_by_key(|n| std::cmp::Reverse(n.weight()));

        let mut sum: u64 = 0;
        let mut count: u64 = 0;
        let mut max = 0u32;
        for node in inner.list.iter() {
            let w = node.weight();
            if w == 0 {
                break; // sorted descending: no nonzero weights remain
            }
            sum += w as u64;
            count += 1;
            if w > max {
                max = w;
            }
        }
        inner.max = max;
        inner.avg = sum.checked_div(count).unwrap_or(0) as u32;

        for node in inner.list.iter() {
            let w = node.weight();
            if w == 0 {
                break;
            }
            node.weight.store(w / 2, Ordering::Relaxed);
        }
    }
}
