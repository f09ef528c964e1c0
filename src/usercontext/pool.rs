//! Maps a client identity to its `UserContext`, with lazy TTL eviction.

use super::context::{InsertStrategy, UserContext};
use crate::config::Server;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

struct Entry {
    ctx: Arc<UserContext>,
    deadline: Instant,
}

/// Timed map from client identity (peer IP, port dropped) to `UserContext`.
/// Eviction is opportunistic: it only happens when `get_or_insert` runs,
/// never on a background timer.
pub struct UserContextPool {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    strategy: InsertStrategy,
}

impl UserContextPool {
    pub fn new(ttl: Duration, strategy: InsertStrategy) -> Self {
        UserContextPool {
            entries: Mutex::new(HashMap::new()),
            ttl,
            strategy,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL, InsertStrategy::InsertFront)
    }

    /// Returns the context for `id`, creating it from `servers` if absent,
    /// and the list of entries evicted for having expired — the caller must
    /// `close()` each of these so their decay tasks stop.
    pub fn get_or_insert(&self, id: &str, servers: &[Server]) -> (Arc<UserContext>, Vec<Arc<UserContext>>) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let mut evicted = Vec::new();
        entries.retain(|_, entry| {
            if entry.deadline <= now {
                evicted.push(entry.ctx.clone());
                false
            } else {
                true
            }
        });

        if let Some(entry) = entries.get_mut(id) {
            entry.deadline = now + self.ttl;
            return (entry.ctx.clone(), evicted);
        }

        let ctx = UserContext::new(servers.to_vec(), self.strategy);
        entries.insert(
            id.to_string(),
            Entry {
                ctx: ctx.clone(),
                deadline: now + self.ttl,
            },
        );
        (ctx, evicted)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Closes every context held by this pool. Used when a group is
    /// rebuilt on reload and the whole pool is being discarded.
    pub fn close_all(&self) {
        let entries = self.entries.lock();
        for entry in entries.values() {
            entry.ctx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherSpec;

    fn server(target: &str) -> Server {
        Server {
            target: target.to_string(),
            tcp_fast_open: false,
            cipher: CipherSpec::new("aes-128-gcm", "pw").unwrap(),
            upstream_tag: None,
        }
    }

    #[tokio::test]
    async fn test_get_or_insert_reuses_context() {
        let pool = UserContextPool::with_default_ttl();
        let (ctx1, _) = pool.get_or_insert("1.2.3.4", &[server("a")]);
        let (ctx2, _) = pool.get_or_insert("1.2.3.4", &[server("b")]);
        assert!(Arc::ptr_eq(&ctx1, &ctx2));
        assert_eq!(ctx1.len(), 1);
        pool.close_all();
    }

    #[tokio::test]
    async fn test_distinct_clients_get_distinct_contexts() {
        let pool = UserContextPool::with_default_ttl();
        let (ctx1, _) = pool.get_or_insert("1.1.1.1", &[server("a")]);
        let (ctx2, _) = pool.get_or_insert("2.2.2.2", &[server("a")]);
        assert!(!Arc::ptr_eq(&ctx1, &ctx2));
        pool.close_all();
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_and_returned() {
        let pool = UserContextPool::new(Duration::from_millis(1), InsertStrategy::InsertFront);
        let (ctx1, _) = pool.get_or_insert("1.2.3.4", &[server("a")]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (ctx2, evicted) = pool.get_or_insert("5.6.7.8", &[server("b")]);
        assert!(!Arc::ptr_eq(&ctx1, &ctx2));
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &ctx1));
        ctx1.close();
        ctx2.close();
    }
}
