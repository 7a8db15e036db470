//! Cache of exported senders — secondary authenticated connections to
//! foreign DCs used for parallel transfers — plus the work partitioner
//! that fans byte ranges out across them.

use std::ops::Range;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::sender::Sender;

/// Exported senders idle longer than this are terminated by the cleaner.
pub const DISCONNECT_EXPORTED_AFTER: Duration = Duration::from_secs(15 * 60);

struct ExportedEntry {
    sender: Sender,
    dc_id: i32,
    added_at: Instant,
}

/// The per-client cache of exported senders.
#[derive(Default)]
pub(crate) struct SenderPool {
    cache: RwLock<Vec<ExportedEntry>>,
}

impl SenderPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Senders already bound to `dc_id`.
    pub async fn cached_for(&self, dc_id: i32) -> Vec<Sender> {
        self.cache
            .read()
            .await
            .iter()
            .filter(|entry| entry.dc_id == dc_id && !entry.sender.is_stopped())
            .map(|entry| entry.sender.clone())
            .collect()
    }

    pub async fn insert(&self, dc_id: i32, sender: Sender) {
        self.cache.write().await.push(ExportedEntry {
            sender,
            dc_id,
            added_at: Instant::now(),
        });
    }

    /// Remove entries older than the TTL, returning them for termination.
    pub async fn sweep(&self, now: Instant) -> Vec<Sender> {
        let mut cache = self.cache.write().await;
        let mut expired = Vec::new();
        cache.retain(|entry| {
            if now.duration_since(entry.added_at) > DISCONNECT_EXPORTED_AFTER {
                expired.push(entry.sender.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Empty the cache, returning every sender for termination.
    pub async fn drain(&self) -> Vec<Sender> {
        self.cache
            .write()
            .await
            .drain(..)
            .map(|entry| entry.sender)
            .collect()
    }

    #[cfg(test)]
    async fn insert_at(&self, dc_id: i32, sender: Sender, added_at: Instant) {
        self.cache.write().await.push(ExportedEntry {
            sender,
            dc_id,
            added_at,
        });
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// Divide `parts` work items among up to `workers` workers.
///
/// Worker `i` receives a contiguous range; the first `parts % workers`
/// workers take one extra item. More workers than items shrinks the worker
/// count to the item count; zero items degenerate to a single empty range.
pub fn partition(parts: u32, workers: usize) -> Vec<Range<u32>> {
    let workers = if parts == 0 {
        1
    } else {
        workers.clamp(1, parts as usize)
    };

    let per = parts / workers as u32;
    let rem = parts % workers as u32;

    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0u32;
    for i in 0..workers {
        let extra = if (i as u32) < rem { 1 } else { 0 };
        let end = start + per + extra;
        ranges.push(start..end);
        start = end;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStore;
    use std::sync::Arc;

    fn test_sender() -> Sender {
        Sender::detached(Arc::new(MemoryStore::new()), Arc::new(Vec::new()), None)
    }

    #[tokio::test]
    async fn sweep_terminates_only_expired_entries() {
        let pool = SenderPool::new();
        let now = Instant::now();
        let sweep_time = now + DISCONNECT_EXPORTED_AFTER + Duration::from_secs(60);

        // Young enough to survive the sweep below.
        pool.insert_at(2, test_sender(), now + Duration::from_secs(10 * 60)).await;
        // Both of these exceed the TTL by the time the cleaner runs.
        pool.insert_at(2, test_sender(), now).await;
        pool.insert_at(4, test_sender(), now).await;

        let expired = pool.sweep(sweep_time).await;
        assert_eq!(expired.len(), 2);
        assert_eq!(pool.len().await, 1);
        assert_eq!(pool.cached_for(2).await.len(), 1);
        assert!(pool.cached_for(4).await.is_empty());
    }

    #[tokio::test]
    async fn fresh_entries_survive_a_sweep_cycle() {
        let pool = SenderPool::new();
        pool.insert(1, test_sender()).await;
        assert!(pool.sweep(Instant::now()).await.is_empty());
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn drain_empties_the_cache() {
        let pool = SenderPool::new();
        pool.insert(1, test_sender()).await;
        pool.insert(2, test_sender()).await;
        assert_eq!(pool.drain().await.len(), 2);
        assert_eq!(pool.len().await, 0);
    }

    fn assert_covers(parts: u32, workers: usize) {
        let ranges = partition(parts, workers);
        assert!(!ranges.is_empty());
        assert!(ranges.len() <= workers.max(1));

        let mut expected_start = 0u32;
        for range in &ranges {
            assert_eq!(range.start, expected_start, "ranges must be contiguous");
            assert!(range.end >= range.start);
            expected_start = range.end;
        }
        assert_eq!(expected_start, parts, "ranges must cover [0, parts)");
    }

    #[test]
    fn partition_covers_exactly() {
        for parts in 0..40 {
            for workers in 1..12 {
                assert_covers(parts, workers);
            }
        }
    }

    #[test]
    fn partition_spreads_remainder_to_leading_workers() {
        let ranges = partition(10, 4);
        assert_eq!(ranges, vec![0..3, 3..6, 6..8, 8..10]);
    }

    #[test]
    fn partition_shrinks_workers_to_parts() {
        let ranges = partition(3, 8);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn partition_of_nothing_is_one_empty_range() {
        assert_eq!(partition(0, 4), vec![0..0]);
    }

    #[test]
    fn partition_even_split() {
        let ranges = partition(512, 4);
        assert_eq!(ranges, vec![0..128, 128..256, 256..384, 384..512]);
    }
}
