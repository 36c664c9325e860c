//! Bounded sample queues
//!
//! A lossy FIFO between the decoding path and the downstream publisher.
//! The BLE peripheral offers no flow control, so when the consumer falls
//! behind the oldest entries are shed instead of stalling the link.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::sensor::{EcgBatch, HeartRateSample, ImuBatch, SampleBatch, SampleCategory};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 50;

/// Fixed-capacity FIFO with a drop-oldest overflow policy.
///
/// Safe to share between a producer and consumers on different threads.
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    overflows: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            overflows: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append to the tail. When full, the head is evicted and returned.
    pub fn enqueue(&self, item: T) -> Option<T> {
        let mut items = self.lock();
        items.push_back(item);
        if items.len() > self.capacity {
            let evicted = items.pop_front();
            drop(items);
            let total = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!(
                "{} queue overloaded (capacity {}), dropped oldest entry ({} dropped so far)",
                self.name,
                self.capacity,
                total
            );
            return evicted;
        }
        None
    }

    /// Remove and return the head, or `None` if empty. Never blocks on data.
    pub fn dequeue(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entries evicted by overflow since creation.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

/// Per-category capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub imu: usize,
    pub heart_rate: usize,
    pub ecg: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            imu: DEFAULT_CAPACITY * 2,
            heart_rate: DEFAULT_CAPACITY,
            ecg: DEFAULT_CAPACITY * 2,
        }
    }
}

/// The output queues, one per sample category.
///
/// Cloning shares the underlying queues, so the session and the consumers
/// hold handles to the same storage.
#[derive(Clone)]
pub struct SampleQueues {
    pub imu: Arc<BoundedQueue<ImuBatch>>,
    pub heart_rate: Arc<BoundedQueue<HeartRateSample>>,
    pub ecg: Arc<BoundedQueue<EcgBatch>>,
}

impl SampleQueues {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            imu: Arc::new(BoundedQueue::new("IMU", config.imu)),
            heart_rate: Arc::new(BoundedQueue::new("HR", config.heart_rate)),
            ecg: Arc::new(BoundedQueue::new("ECG", config.ecg)),
        }
    }

    /// Route a batch to its category's queue. Returns `true` if an older
    /// entry had to be dropped to make room.
    pub fn push(&self, batch: SampleBatch) -> bool {
        match batch {
            SampleBatch::Imu(imu) => self.imu.enqueue(imu).is_some(),
            SampleBatch::HeartRate(hr) => self.heart_rate.enqueue(hr).is_some(),
            SampleBatch::Ecg(ecg) => self.ecg.enqueue(ecg).is_some(),
        }
    }

    pub fn len_of(&self, category: SampleCategory) -> usize {
        match category {
            SampleCategory::Imu => self.imu.len(),
            SampleCategory::HeartRate => self.heart_rate.len(),
            SampleCategory::Ecg => self.ecg.len(),
        }
    }

    /// Total overflow evictions across all queues.
    pub fn overflow_count(&self) -> u64 {
        self.imu.overflow_count() + self.heart_rate.overflow_count() + self.ecg.overflow_count()
    }
}

impl Default for SampleQueues {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}
