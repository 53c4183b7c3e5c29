//! Frame queue backed by a key-value store with conditional writes.
//!
//! Each frame is one item carrying a `contention` counter: the number of
//! workers that have claimed it. A frame is done when its item is gone.
//!
//! Claiming works in tiers. A worker first looks for frames nobody has
//! claimed (`contention == 0`) and tries to bump the counter from the value
//! it read. If another worker bumped it first the write is rejected and the
//! next candidate is tried. Once a tier yields nothing the worker moves on
//! to frames already claimed by one worker, then two, and so on up to
//! [`MAX_TIER`]. Workers therefore spread across the frame range before
//! doubling up, and near the end of a job idle workers duplicate the
//! stragglers instead of waiting.
//!
//! A frame whose counter reaches `MAX_TIER` and whose claimants all die is
//! never handed out again.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cloud::{ConditionalWrite, Item, KeySchema, KeyValueStore};
use crate::error::StoreError;

/// Tiers scanned are `0..MAX_TIER`.
pub const MAX_TIER: i64 = 4;

const PARTITION: &str = "partition";
const FRAME: &str = "frame";
const CONTENTION: &str = "contention";

/// One worker's handle on a frame queue.
///
/// The tier reached is remembered per handle and never goes back down, so
/// give each worker its own handle.
pub struct FrameQueue {
    store: Arc<dyn KeyValueStore>,
    table: String,
    tier: i64,
    max_tier: i64,
}

fn key(frame: i64) -> Item {
    Item::from([(PARTITION.to_string(), 0), (FRAME.to_string(), frame)])
}

impl FrameQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            tier: 0,
            max_tier: MAX_TIER,
        }
    }

    pub fn with_max_tier(mut self, max_tier: i64) -> Self {
        self.max_tier = max_tier;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current claim tier of this handle.
    pub fn tier(&self) -> i64 {
        self.tier
    }

    /// Create the table and insert every frame with zero contention.
    pub async fn initialize(
        &self,
        frames: impl IntoIterator<Item = i64>,
    ) -> Result<(), StoreError> {
        self.store
            .create_table(&self.table, &KeySchema::new(PARTITION, FRAME))
            .await?;

        let items: Vec<Item> = frames
            .into_iter()
            .map(|frame| {
                let mut item = key(frame);
                item.insert(CONTENTION.to_string(), 0);
                item
            })
            .collect();
        let count = items.len();
        self.store.put_items(&self.table, items).await?;

        info!(table = %self.table, frames = count, "Frame queue initialized");
        Ok(())
    }

    /// Claim a frame, or `None` once every tier is exhausted.
    pub async fn claim_next(&mut self) -> Result<Option<i64>, StoreError> {
        while self.tier < self.max_tier {
            let candidates = self
                .store
                .scan_eq(&self.table, CONTENTION, self.tier)
                .await?;

            for candidate in candidates {
                let Some(&frame) = candidate.get(FRAME) else {
                    continue;
                };
                let current = candidate.get(CONTENTION).copied().unwrap_or(self.tier);
                let outcome = self
                    .store
                    .increment_if_equals(&self.table, &key(frame), CONTENTION, current, 1)
                    .await?;
                match outcome {
                    ConditionalWrite::Applied => {
                        debug!(frame, tier = self.tier, "Claimed frame");
                        return Ok(Some(frame));
                    }
                    ConditionalWrite::Rejected => continue,
                }
            }

            self.tier += 1;
            debug!(tier = self.tier, "Escalating claim tier");
        }
        Ok(None)
    }

    /// Mark a frame done by deleting it. Completing twice is harmless.
    pub async fn complete(&self, frame: i64) -> Result<(), StoreError> {
        self.store.delete_item(&self.table, &key(frame)).await
    }

    /// Frames not yet completed (strongly consistent).
    pub async fn remaining_count(&self) -> Result<usize, StoreError> {
        self.store.count(&self.table).await
    }

    /// Delete the backing table.
    pub async fn destroy(&self) -> Result<(), StoreError> {
        let started = std::time::Instant::now();
        self.store.delete_table(&self.table).await?;
        info!(
            table = %self.table,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Frame queue deleted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use futures::future::join_all;

    use super::*;
    use crate::cloud::memory::MemoryKeyValueStore;

    async fn queue_with(frames: impl IntoIterator<Item = i64>) -> (Arc<MemoryKeyValueStore>, FrameQueue) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let queue = FrameQueue::new(store.clone(), "frames");
        queue.initialize(frames).await.unwrap();
        (store, queue)
    }

    async fn contention(store: &MemoryKeyValueStore, frame: i64) -> Option<i64> {
        store
            .get_item("frames", &key(frame))
            .await
            .unwrap()
            .map(|item| item[CONTENTION])
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let (store, queue) = queue_with(1..=3).await;
        assert_eq!(queue.remaining_count().await.unwrap(), 3);
        let again = FrameQueue::new(store, "frames");
        assert!(matches!(
            again.initialize([1]).await,
            Err(StoreError::TableExists { .. })
        ));
    }

    #[tokio::test]
    async fn claims_in_scan_order_and_bumps_contention() {
        let (store, mut queue) = queue_with([5, 3, 9]).await;
        assert_eq!(queue.claim_next().await.unwrap(), Some(3));
        assert_eq!(queue.claim_next().await.unwrap(), Some(5));
        assert_eq!(contention(&store, 3).await, Some(1));
        assert_eq!(contention(&store, 9).await, Some(0));
        assert_eq!(queue.tier(), 0);
    }

    #[tokio::test]
    async fn unclaimed_frames_come_before_escalation() {
        let (_store, mut queue) = queue_with(1..=3).await;
        let first: Vec<_> = [
            queue.claim_next().await.unwrap(),
            queue.claim_next().await.unwrap(),
            queue.claim_next().await.unwrap(),
        ]
        .into_iter()
        .flatten()
        .collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(queue.tier(), 0);

        // Everything is now claimed once, so the next claim duplicates work.
        assert_eq!(queue.claim_next().await.unwrap(), Some(1));
        assert_eq!(queue.tier(), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_tier() {
        let (store, mut queue) = queue_with([7]).await;
        let mut claims = 0;
        while queue.claim_next().await.unwrap().is_some() {
            claims += 1;
        }
        assert_eq!(claims, MAX_TIER);
        assert_eq!(contention(&store, 7).await, Some(MAX_TIER));
        assert_eq!(queue.remaining_count().await.unwrap(), 1);

        // The frame is stranded: no handle will ever claim it again.
        let mut fresh = FrameQueue::new(store, "frames");
        assert_eq!(fresh.claim_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (_store, mut queue) = queue_with(1..=2).await;
        let frame = queue.claim_next().await.unwrap().unwrap();
        queue.complete(frame).await.unwrap();
        assert_eq!(queue.remaining_count().await.unwrap(), 1);
        queue.complete(frame).await.unwrap();
        queue.complete(99).await.unwrap();
        assert_eq!(queue.remaining_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn each_completion_removes_exactly_one_frame() {
        let (_store, mut queue) = queue_with(0..25).await;
        let mut completed = 0;
        while let Some(frame) = queue.claim_next().await.unwrap() {
            let before = queue.remaining_count().await.unwrap();
            queue.complete(frame).await.unwrap();
            let after = queue.remaining_count().await.unwrap();
            assert_eq!(before - after, 1, "completing frame {frame}");
            completed += 1;
        }
        assert_eq!(completed, 25);
        assert_eq!(queue.remaining_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claiming_without_a_table_is_an_error() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let mut never_created = FrameQueue::new(store, "frames");
        assert!(matches!(
            never_created.claim_next().await,
            Err(StoreError::TableNotFound { .. })
        ));

        let (_store, mut queue) = queue_with(1..=3).await;
        queue.destroy().await.unwrap();
        assert!(matches!(
            queue.claim_next().await,
            Err(StoreError::TableNotFound { .. })
        ));
        assert!(matches!(
            queue.remaining_count().await,
            Err(StoreError::TableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn destroy_removes_table() {
        let (store, queue) = queue_with(1..=2).await;
        queue.destroy().await.unwrap();
        assert!(!store.has_table("frames").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_first_claims_are_exclusive() {
        let (store, _queue) = queue_with(0..16).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mut queue = FrameQueue::new(store.clone(), "frames");
            handles.push(tokio::spawn(async move {
                let frame = queue.claim_next().await.unwrap();
                (frame, queue.tier())
            }));
        }

        let mut seen = HashSet::new();
        for result in join_all(handles).await {
            let (frame, tier) = result.unwrap();
            assert_eq!(tier, 0);
            assert!(seen.insert(frame.unwrap()), "frame claimed twice in tier 0");
        }
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn three_workers_drain_ten_frames() {
        let (store, queue) = queue_with(1..=10).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut worker = FrameQueue::new(store.clone(), "frames");
            handles.push(tokio::spawn(async move {
                let mut done = Vec::new();
                while let Some(frame) = worker.claim_next().await.unwrap() {
                    let before = worker.remaining_count().await.unwrap();
                    worker.complete(frame).await.unwrap();
                    let after = worker.remaining_count().await.unwrap();
                    assert!(after <= before);
                    done.push(frame);
                }
                done
            }));
        }

        let mut completions: HashMap<i64, usize> = HashMap::new();
        let mut total = 0;
        for handle in handles {
            for frame in handle.await.unwrap() {
                *completions.entry(frame).or_default() += 1;
                total += 1;
            }
        }

        assert_eq!(queue.remaining_count().await.unwrap(), 0);
        assert_eq!(completions.len(), 10);
        assert!(total >= 10);
    }
}
