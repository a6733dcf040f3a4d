//! Sample ring buffer
//!
//! Fixed capacity, oldest sample evicted first. Readers take a snapshot copy
//! so the polling side is only ever held up for the duration of that copy.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ParameterId, TelemetrySample};

/// Bounded, shareable store of recent samples
#[derive(Debug, Clone)]
pub struct SampleRing {
    inner: Arc<Mutex<VecDeque<TelemetrySample>>>,
    capacity: usize,
}

impl SampleRing {
    /// Create a ring holding at most `capacity` samples (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<TelemetrySample>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sample, evicting the oldest when full
    pub fn push(&self, sample: TelemetrySample) {
        let mut buffer = self.buffer();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(sample);
    }

    /// Copy of all samples, oldest first
    pub fn snapshot(&self) -> Vec<TelemetrySample> {
        self.buffer().iter().cloned().collect()
    }

    /// Most recent sample for a parameter
    pub fn latest(&self, id: ParameterId) -> Option<TelemetrySample> {
        self.buffer()
            .iter()
            .rev()
            .find(|s| s.parameter_id == id)
            .cloned()
    }

    /// Samples currently stored
    pub fn len(&self) -> usize {
        self.buffer().len()
    }

    /// Whether no sample is stored
    pub fn is_empty(&self) -> bool {
        self.buffer().is_empty()
    }

    /// Maximum samples kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every stored sample
    pub fn clear(&self) {
        self.buffer().clear();
    }
}
