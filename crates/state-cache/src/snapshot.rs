//! Bounded, block-indexed history of immutable states.

use std::{collections::VecDeque, fmt, num::NonZeroUsize, sync::Arc};

/// A state as of the end of a block.
pub struct Snapshot<S> {
    pub block_number: u64,
    pub state: Arc<S>,
}

impl<S> Clone for Snapshot<S> {
    fn clone(&self) -> Self {
        Self {
            block_number: self.block_number,
            state: self.state.clone(),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for Snapshot<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("block_number", &self.block_number)
            .field("state", &self.state)
            .finish()
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("block {block} is not after the latest stored block {latest}")]
    NotAfterLatest { block: u64, latest: u64 },
    #[error("snapshot store was invalidated")]
    Invalidated,
}

/// Ring buffer of the most recent snapshots of one entity.
///
/// Block numbers strictly increase from front to back. Once more than the
/// configured number of snapshots are stored the oldest ones get evicted.
#[derive(Debug)]
pub struct SnapshotStore<S> {
    snapshots: VecDeque<Snapshot<S>>,
    capacity: NonZeroUsize,
    invalidated: bool,
}

impl<S> SnapshotStore<S> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            snapshots: VecDeque::with_capacity(capacity.get()),
            capacity,
            invalidated: false,
        }
    }

    /// The state at exactly the given block.
    pub fn get(&self, block: u64) -> Option<Arc<S>> {
        self.snapshots
            .iter()
            .rev()
            .find(|snapshot| snapshot.block_number == block)
            .map(|snapshot| snapshot.state.clone())
    }

    /// The most recent state regardless of its block.
    pub fn get_stale(&self) -> Option<Arc<S>> {
        self.snapshots.back().map(|snapshot| snapshot.state.clone())
    }

    pub fn latest_block_number(&self) -> Option<u64> {
        self.snapshots.back().map(|snapshot| snapshot.block_number)
    }

    /// The most recent snapshot of a block strictly before `block`.
    pub fn latest_before(&self, block: u64) -> Option<Snapshot<S>> {
        self.snapshots
            .iter()
            .rev()
            .find(|snapshot| snapshot.block_number < block)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Appends a snapshot for a block after all stored ones.
    pub fn put(&mut self, block: u64, state: Arc<S>) -> Result<(), StoreError> {
        if self.invalidated {
            return Err(StoreError::Invalidated);
        }
        if let Some(latest) = self.latest_block_number() {
            if block <= latest {
                return Err(StoreError::NotAfterLatest { block, latest });
            }
        }
        self.push(block, state);
        Ok(())
    }

    /// Stores a snapshot in block order, replacing the one of the same block.
    /// Snapshots of later blocks are kept.
    pub fn insert(&mut self, block: u64, state: Arc<S>) -> Result<(), StoreError> {
        if self.invalidated {
            return Err(StoreError::Invalidated);
        }
        let index = self
            .snapshots
            .partition_point(|snapshot| snapshot.block_number < block);
        match self.snapshots.get_mut(index) {
            Some(snapshot) if snapshot.block_number == block => snapshot.state = state,
            _ => {
                self.snapshots.insert(
                    index,
                    Snapshot {
                        block_number: block,
                        state,
                    },
                );
                while self.snapshots.len() > self.capacity.get() {
                    self.snapshots.pop_front();
                }
            }
        }
        Ok(())
    }

    /// Replaces the snapshots of `block` and every later block with a single
    /// new snapshot. Used when the chain reorganized.
    ///
    /// Returns how many snapshots were dropped.
    pub fn supersede(&mut self, block: u64, state: Arc<S>) -> Result<usize, StoreError> {
        if self.invalidated {
            return Err(StoreError::Invalidated);
        }
        let dropped = self.truncate(block);
        self.push(block, state);
        Ok(dropped)
    }

    /// Drops the snapshots of `block` and every later block. Returns how many
    /// were dropped.
    pub fn truncate(&mut self, block: u64) -> usize {
        let keep = self
            .snapshots
            .partition_point(|snapshot| snapshot.block_number < block);
        let dropped = self.snapshots.len() - keep;
        self.snapshots.truncate(keep);
        dropped
    }

    /// Drops all snapshots and rejects any further writes.
    pub fn invalidate(&mut self) {
        self.snapshots.clear();
        self.invalidated = true;
    }

    fn push(&mut self, block: u64, state: Arc<S>) {
        while self.snapshots.len() >= self.capacity.get() {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(Snapshot {
            block_number: block,
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize) -> SnapshotStore<u64> {
        SnapshotStore::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn keeps_only_most_recent_snapshots() {
        let mut store = store(3);
        for block in 10..15 {
            store.put(block, Arc::new(block * 2)).unwrap();
        }

        assert_eq!(store.len(), 3);
        for block in 10..12 {
            assert_eq!(store.get(block), None);
        }
        for block in 12..15 {
            assert_eq!(store.get(block).as_deref(), Some(&(block * 2)));
        }
    }

    #[test]
    fn exact_and_stale_reads() {
        let mut store = store(10);
        assert_eq!(store.get_stale(), None);
        assert_eq!(store.latest_block_number(), None);

        store.put(5, Arc::new(50)).unwrap();
        store.put(8, Arc::new(80)).unwrap();

        assert_eq!(store.get(6), None);
        assert_eq!(store.get(5).as_deref(), Some(&50));
        assert_eq!(store.get_stale().as_deref(), Some(&80));
        assert_eq!(store.latest_block_number(), Some(8));
        assert_eq!(store.latest_before(8).map(|s| s.block_number), Some(5));
        assert_eq!(store.latest_before(100).map(|s| s.block_number), Some(8));
        assert!(store.latest_before(5).is_none());
    }

    #[test]
    fn rejects_blocks_that_are_not_newer() {
        let mut store = store(10);
        store.put(5, Arc::new(1)).unwrap();
        assert_eq!(
            store.put(5, Arc::new(2)),
            Err(StoreError::NotAfterLatest {
                block: 5,
                latest: 5
            })
        );
        assert_eq!(
            store.put(4, Arc::new(2)),
            Err(StoreError::NotAfterLatest {
                block: 4,
                latest: 5
            })
        );
        assert_eq!(store.get(5).as_deref(), Some(&1));
    }

    #[test]
    fn supersede_drops_later_snapshots() {
        let mut store = store(10);
        for block in 1..=5 {
            store.put(block, Arc::new(block)).unwrap();
        }

        assert_eq!(store.supersede(3, Arc::new(33)), Ok(3));
        assert_eq!(store.latest_block_number(), Some(3));
        assert_eq!(store.get(3).as_deref(), Some(&33));
        assert_eq!(store.get(4), None);
        assert_eq!(store.get(2).as_deref(), Some(&2));

        // Superseding past the end behaves like a put.
        assert_eq!(store.supersede(9, Arc::new(9)), Ok(0));
        assert_eq!(store.len(), 4);

        assert_eq!(store.truncate(3), 2);
        assert_eq!(store.latest_block_number(), Some(2));
        assert_eq!(store.truncate(3), 0);
    }

    #[test]
    fn insert_keeps_later_snapshots() {
        let mut store = store(3);
        store.put(10, Arc::new(10)).unwrap();
        store.put(12, Arc::new(12)).unwrap();

        store.insert(11, Arc::new(11)).unwrap();
        assert_eq!(store.get(11).as_deref(), Some(&11));
        assert_eq!(store.get(12).as_deref(), Some(&12));
        assert_eq!(store.latest_block_number(), Some(12));
        assert_eq!(store.latest_before(12).map(|s| s.block_number), Some(11));

        store.insert(12, Arc::new(120)).unwrap();
        assert_eq!(store.get(12).as_deref(), Some(&120));
        assert_eq!(store.len(), 3);

        // Full stores evict the oldest snapshot.
        store.insert(13, Arc::new(13)).unwrap();
        assert_eq!(store.get(10), None);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn invalidated_store_stays_empty() {
        let mut store = store(10);
        store.put(1, Arc::new(1)).unwrap();
        store.invalidate();

        assert!(store.is_empty());
        assert_eq!(store.get_stale(), None);
        assert_eq!(store.put(2, Arc::new(2)), Err(StoreError::Invalidated));
        assert_eq!(store.supersede(2, Arc::new(2)), Err(StoreError::Invalidated));
        assert_eq!(store.insert(2, Arc::new(2)), Err(StoreError::Invalidated));
    }
}
