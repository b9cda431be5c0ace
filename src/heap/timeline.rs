use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 120;

/// Sliding window of used-heap samples, most recent first.
///
/// Only the protected snapshot action touches the timeline, and that action
/// only runs on the engine's home thread.
#[derive(Debug, Clone)]
pub struct StatisticsTimeline {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl StatisticsTimeline {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn record(&mut self, sample: u64) {
        self.samples.push_front(sample);
        self.samples.truncate(self.capacity);
    }

    /// Integer mean of the retained samples. Zero when nothing was recorded.
    pub fn mean(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: u128 = self.samples.iter().map(|&s| u128::from(s)).sum();
        (sum / self.samples.len() as u128) as u64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<u64> {
        self.samples.front().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.samples.iter().copied()
    }
}

impl Default for StatisticsTimeline {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
