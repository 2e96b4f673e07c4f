//! Free list of byte buffers shared by decoders
//!
//! Buffers are grouped by capacity. A request is served by the smallest
//! pooled buffer that fits, as long as it is not wastefully large.

use crate::memory::TrimLevel;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Largest ratio between a reused buffer's capacity and the requested one
const MAX_OVER_SIZE_MULTIPLE: usize = 8;

#[derive(Default)]
struct PoolState {
    by_capacity: BTreeMap<usize, Vec<Vec<u8>>>,
    /// Capacities in the order buffers were returned, oldest first
    order: VecDeque<usize>,
    current_size: usize,
}

impl PoolState {
    fn take(&mut self, capacity: usize) -> Option<Vec<u8>> {
        let group = self.by_capacity.get_mut(&capacity)?;
        let buffer = group.pop()?;
        if group.is_empty() {
            self.by_capacity.remove(&capacity);
        }
        if let Some(position) = self.order.iter().rposition(|c| *c == capacity) {
            self.order.remove(position);
        }
        self.current_size -= capacity;
        Some(buffer)
    }

    fn trim_to_size(&mut self, size: usize) {
        while self.current_size > size {
            let Some(capacity) = self.order.pop_front() else {
                break;
            };
            let Some(group) = self.by_capacity.get_mut(&capacity) else {
                continue;
            };
            if group.pop().is_some() {
                self.current_size -= capacity;
            }
            if group.is_empty() {
                self.by_capacity.remove(&capacity);
            }
        }
    }
}

/// Byte-budgeted pool of reusable `Vec<u8>` buffers
pub struct BufferPool {
    max_size: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create a pool retaining at most `max_size` bytes of capacity
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Budget in bytes
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Capacity currently retained
    #[must_use]
    pub fn current_bytes(&self) -> usize {
        self.state.lock().current_size
    }

    /// An empty buffer with capacity of at least `min_capacity`
    #[must_use]
    pub fn get(&self, min_capacity: usize) -> Vec<u8> {
        let limit = min_capacity.saturating_mul(MAX_OVER_SIZE_MULTIPLE);
        let mut state = self.state.lock();
        let candidate = state
            .by_capacity
            .range(min_capacity..)
            .next()
            .map(|(capacity, _)| *capacity)
            .filter(|capacity| *capacity <= limit);
        if let Some(capacity) = candidate
            && let Some(mut buffer) = state.take(capacity)
        {
            buffer.clear();
            return buffer;
        }
        drop(state);
        Vec::with_capacity(min_capacity)
    }

    /// Return a buffer for reuse
    ///
    /// Buffers larger than half the budget are dropped instead.
    pub fn put(&self, mut buffer: Vec<u8>) {
        let capacity = buffer.capacity();
        if capacity == 0 || capacity > self.max_size / 2 {
            return;
        }
        buffer.clear();
        let mut state = self.state.lock();
        state.by_capacity.entry(capacity).or_default().push(buffer);
        state.order.push_back(capacity);
        state.current_size += capacity;
        state.trim_to_size(self.max_size);
    }

    /// Shed pooled buffers according to host pressure
    pub fn trim_memory(&self, level: TrimLevel) {
        if level >= TrimLevel::Background {
            self.clear();
        } else if level >= TrimLevel::UiHidden || level == TrimLevel::RunningCritical {
            self.state.lock().trim_to_size(self.max_size / 2);
        }
    }

    /// Drop every pooled buffer
    pub fn clear(&self) {
        self.state.lock().trim_to_size(0);
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("max_size", &self.max_size)
            .field("current_bytes", &self.current_bytes())
            .finish()
    }
}
