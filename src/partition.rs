//! Bottom-up merge sort partition tracker.
//!
//! The tracker owns the sequence being sorted and splits it into blocks of the current epoch width.
//! Pairs of adjacent blocks are handed out as [`Task`]s and merged runs are written back with
//! [`PartitionTracker::apply_result`]. Once every block of an epoch is received the block width is
//! doubled and a new epoch begins. The sequence is sorted when a single block covers all of it.

/// Block delivery status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// Block is not handed out yet.
    Unsent,
    /// Block is handed out as a part of a task and its merged run is not received yet.
    Sent,
    /// Merged run covering the block is written back.
    Received,
}

/// A pair of adjacent blocks to be merged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task<T> {
    /// Sequence index the left block starts at.
    pub index: usize,
    /// Left block.
    pub a: Vec<T>,
    /// Right block, clipped to the sequence end. Empty for an unpaired tail block.
    pub b: Vec<T>,
    /// Epoch the task was created in.
    pub epoch: u64,
}

/// Outcome of writing a merged run back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The run is written, the epoch continues.
    Merged,
    /// The run is written and it completed the epoch.
    EpochAdvanced,
    /// The run is stale or duplicated and has been discarded.
    Stale,
}

/// Partition tracker.
pub struct PartitionTracker<T> {
    items: Vec<T>,
    status: Vec<BlockStatus>,
    width: usize,
    epoch: u64,
}

impl<T> PartitionTracker<T> {
    /// Creates a tracker for the sequence. The first epoch uses blocks of a single item.
    pub fn new(items: Vec<T>) -> Self {
        let status = vec![BlockStatus::Unsent; items.len()];

        return PartitionTracker {
            items,
            status,
            width: 1,
            epoch: 0,
        };
    }

    /// Checks if the sequence still consists of more than one sorted run.
    pub fn is_unsorted(&self) -> bool {
        self.width < self.items.len()
    }

    /// Returns the current epoch number.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns the current block width.
    pub fn block_width(&self) -> usize {
        self.width
    }

    /// Returns the status of the block with the given block number.
    pub fn block_status(&self, block: usize) -> Option<BlockStatus> {
        self.status.get(block).copied()
    }

    /// Returns the sequence length.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Consumes the tracker returning the sequence.
    pub fn into_inner(self) -> Vec<T> {
        self.items
    }

    /// Hands out the next pair of blocks to be merged.
    ///
    /// The lowest unsent block is preferred. If every block is already sent the lowest block still
    /// waiting for its merged run is handed out again, so a task lost together with its worker is
    /// eventually redelivered. Both blocks of the pair are marked as sent.
    /// Returns [`None`] if the sequence is already sorted.
    pub fn acquire_task(&mut self) -> Option<Task<T>>
    where
        T: Clone,
    {
        if !self.is_unsorted() {
            return None;
        }

        let block = self
            .find_block(BlockStatus::Unsent)
            .or_else(|| self.find_block(BlockStatus::Sent))?;
        // tasks always start at the left block of a pair
        let block = block - block % 2;

        let start = block * self.width;
        let middle = (start + self.width).min(self.items.len());
        let end = (start + 2 * self.width).min(self.items.len());

        let last = (block + 2).min(self.status.len());
        for status in &mut self.status[block..last] {
            *status = BlockStatus::Sent;
        }

        log::debug!(
            "task acquired (index: {}, width: {}, epoch: {})",
            start,
            self.width,
            self.epoch
        );

        return Some(Task {
            index: start,
            a: self.items[start..middle].to_vec(),
            b: self.items[middle..end].to_vec(),
            epoch: self.epoch,
        });
    }

    /// Writes a merged run back to the sequence.
    ///
    /// The run is accepted only if it was produced in the current epoch, starts at a task boundary,
    /// covers exactly the task range and the task blocks are still marked as sent. Anything else is
    /// discarded. Accepting the last run of an epoch starts the next one.
    ///
    /// # Arguments
    /// * `index` - Sequence index the run starts at
    /// * `merged` - Merged run
    /// * `epoch` - Epoch the run was produced in
    pub fn apply_result(&mut self, index: usize, merged: Vec<T>, epoch: u64) -> Applied {
        if epoch != self.epoch || index >= self.items.len() || index % (2 * self.width) != 0 {
            return Applied::Stale;
        }

        let block = index / self.width;
        if self.status[block] != BlockStatus::Sent {
            return Applied::Stale;
        }

        let end = (index + 2 * self.width).min(self.items.len());
        if merged.len() != end - index {
            log::warn!(
                "merged run length mismatch (index: {}, expected: {}, actual: {})",
                index,
                end - index,
                merged.len()
            );
            return Applied::Stale;
        }

        for (slot, item) in self.items[index..end].iter_mut().zip(merged) {
            *slot = item;
        }

        let last = (block + 2).min(self.status.len());
        for status in &mut self.status[block..last] {
            *status = BlockStatus::Received;
        }

        if self.status.iter().all(|status| *status == BlockStatus::Received) {
            self.advance_epoch();
            return Applied::EpochAdvanced;
        }

        return Applied::Merged;
    }

    fn advance_epoch(&mut self) {
        self.epoch += 1;
        self.width = self.width.saturating_mul(2);
        let blocks = (self.items.len() + self.width - 1) / self.width;
        self.status = vec![BlockStatus::Unsent; blocks];

        log::debug!("epoch {} started (block width: {})", self.epoch, self.width);
    }

    fn find_block(&self, status: BlockStatus) -> Option<usize> {
        self.status.iter().position(|s| *s == status)
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{Applied, BlockStatus, PartitionTracker, Task};
    use crate::merger::merge;

    fn run_epoch(tracker: &mut PartitionTracker<i64>) -> Applied {
        let epoch = tracker.epoch();
        let width = tracker.block_width();
        let blocks = (tracker.len() + width - 1) / width;

        let tasks: Vec<Task<i64>> = (0..(blocks + 1) / 2).map(|_| tracker.acquire_task().unwrap()).collect();

        let mut last = Applied::Stale;
        for task in tasks {
            assert_eq!(task.epoch, epoch);
            last = tracker.apply_result(task.index, merge(task.a, task.b), task.epoch);
        }
        last
    }

    #[test]
    fn test_scenario() {
        let mut tracker = PartitionTracker::new(vec![5, 3, 1, 4, 2]);
        assert!(tracker.is_unsorted());

        let first = tracker.acquire_task().unwrap();
        let second = tracker.acquire_task().unwrap();
        let third = tracker.acquire_task().unwrap();
        assert_eq!((first.index, first.a.as_slice(), first.b.as_slice()), (0, &[5][..], &[3][..]));
        assert_eq!((second.index, second.a.as_slice(), second.b.as_slice()), (2, &[1][..], &[4][..]));
        assert_eq!((third.index, third.a.as_slice(), third.b.as_slice()), (4, &[2][..], &[][..]));

        assert_eq!(tracker.apply_result(0, vec![3, 5], 0), Applied::Merged);
        assert_eq!(tracker.apply_result(2, vec![1, 4], 0), Applied::Merged);
        assert_eq!(tracker.apply_result(4, vec![2], 0), Applied::EpochAdvanced);
        assert_eq!(tracker.as_slice(), &[3, 5, 1, 4, 2]);
        assert_eq!((tracker.epoch(), tracker.block_width()), (1, 2));

        let first = tracker.acquire_task().unwrap();
        assert_eq!((first.index, first.a.as_slice(), first.b.as_slice()), (0, &[3, 5][..], &[1, 4][..]));
        let tail = tracker.acquire_task().unwrap();
        assert_eq!((tail.index, tail.a.as_slice(), tail.b.as_slice()), (4, &[2][..], &[][..]));

        assert_eq!(tracker.apply_result(0, merge(first.a, first.b), 1), Applied::Merged);
        assert_eq!(tracker.apply_result(4, merge(tail.a, tail.b), 1), Applied::EpochAdvanced);
        assert_eq!(tracker.as_slice(), &[1, 3, 4, 5, 2]);

        let last = tracker.acquire_task().unwrap();
        assert_eq!((last.index, last.a.as_slice(), last.b.as_slice()), (0, &[1, 3, 4, 5][..], &[2][..]));
        assert_eq!(tracker.apply_result(0, merge(last.a, last.b), 2), Applied::EpochAdvanced);

        assert_eq!(tracker.as_slice(), &[1, 2, 3, 4, 5]);
        assert!(!tracker.is_unsorted());
        assert_eq!(tracker.acquire_task(), None);
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 0)]
    #[case(2, 1)]
    #[case(3, 2)]
    #[case(4, 2)]
    #[case(5, 3)]
    #[case(8, 3)]
    #[case(9, 4)]
    #[case(17, 5)]
    #[case(100, 7)]
    fn test_epoch_count(#[case] len: i64, #[case] expected_epochs: u64) {
        let mut items = Vec::from_iter(0..len);
        items.shuffle(&mut rand::thread_rng());

        let mut tracker = PartitionTracker::new(items);
        while tracker.is_unsorted() {
            assert_eq!(run_epoch(&mut tracker), Applied::EpochAdvanced);
        }

        assert_eq!(tracker.epoch(), expected_epochs);
        assert_eq!(tracker.into_inner(), Vec::from_iter(0..len));
    }

    #[test]
    fn test_tasks_are_disjoint() {
        let mut tracker = PartitionTracker::new(Vec::from_iter(0..11i64));
        // finish the first epoch so that the tail block pair is clipped
        run_epoch(&mut tracker);
        assert_eq!(tracker.block_width(), 2);

        let tasks: Vec<Task<i64>> = (0..3).map(|_| tracker.acquire_task().unwrap()).collect();
        let ranges: Vec<(usize, usize)> = tasks
            .iter()
            .map(|task| (task.index, task.index + task.a.len() + task.b.len()))
            .collect();

        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 11)]);
        assert_eq!((tasks[2].a.len(), tasks[2].b.len()), (2, 1));
    }

    #[test]
    fn test_redelivery() {
        let mut tracker = PartitionTracker::new(vec![4, 3, 2, 1]);

        let first = tracker.acquire_task().unwrap();
        let second = tracker.acquire_task().unwrap();
        assert_eq!((first.index, second.index), (0, 2));

        // every block is sent, the lowest one still waiting is offered again
        assert_eq!(tracker.acquire_task().unwrap(), first);

        assert_eq!(tracker.apply_result(0, vec![3, 4], 0), Applied::Merged);
        assert_eq!(tracker.acquire_task().unwrap(), second);
    }

    #[test]
    fn test_apply_result_is_idempotent() {
        let mut tracker = PartitionTracker::new(vec![2, 1, 4, 3]);
        let task = tracker.acquire_task().unwrap();
        tracker.acquire_task().unwrap();

        assert_eq!(tracker.apply_result(task.index, vec![1, 2], task.epoch), Applied::Merged);
        assert_eq!(tracker.apply_result(task.index, vec![2, 1], task.epoch), Applied::Stale);
        assert_eq!(tracker.apply_result(task.index, vec![1, 2], task.epoch), Applied::Stale);
        assert_eq!(tracker.as_slice(), &[1, 2, 4, 3]);
        assert_eq!(tracker.block_status(0), Some(BlockStatus::Received));
        assert_eq!(tracker.block_status(2), Some(BlockStatus::Sent));
    }

    #[test]
    fn test_stale_epoch_is_discarded() {
        let mut tracker = PartitionTracker::new(vec![2, 1, 4, 3, 6, 5]);
        let task = tracker.acquire_task().unwrap();

        assert_eq!(tracker.apply_result(task.index, vec![1, 2], task.epoch + 1), Applied::Stale);
        assert_eq!(tracker.as_slice(), &[2, 1, 4, 3, 6, 5]);
        assert_eq!(tracker.block_status(0), Some(BlockStatus::Sent));
    }

    #[rstest]
    #[case(1, vec![1, 2])]
    #[case(0, vec![1, 2, 3])]
    #[case(0, vec![1])]
    #[case(6, vec![1, 2])]
    fn test_malformed_result_is_discarded(#[case] index: usize, #[case] merged: Vec<i64>) {
        let mut tracker = PartitionTracker::new(vec![2, 1, 4, 3]);
        tracker.acquire_task().unwrap();
        tracker.acquire_task().unwrap();

        assert_eq!(tracker.apply_result(index, merged, 0), Applied::Stale);
        assert_eq!(tracker.as_slice(), &[2, 1, 4, 3]);
    }

    #[test]
    fn test_unsent_result_is_discarded() {
        let mut tracker = PartitionTracker::new(vec![2, 1, 4, 3]);

        assert_eq!(tracker.apply_result(0, vec![1, 2], 0), Applied::Stale);
        assert_eq!(tracker.as_slice(), &[2, 1, 4, 3]);
    }
}
