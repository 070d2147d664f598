//! 64-bit counters addressed by id.
//!
//! The status of a publication's channel is a counter owned by whoever
//! manages the stream. The publication only reads it.

use crossbeam_utils::CachePadded;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Channel status: the channel is being set up.
pub const CHANNEL_STATUS_INITIALIZING: i64 = 0;
/// Channel status: the channel is up.
pub const CHANNEL_STATUS_ACTIVE: i64 = 1;
/// Channel status: the channel failed.
pub const CHANNEL_STATUS_ERRORED: i64 = -1;
/// Channel status: the channel is closing.
pub const CHANNEL_STATUS_CLOSING: i64 = 2;

/// A fixed set of counter slots, each on its own cache line so that writers
/// of neighbouring counters do not contend.
#[derive(Debug)]
pub struct CountersBuffer {
    values: Box<[CachePadded<AtomicI64>]>,
}

impl CountersBuffer {
    /// Allocates `max_counters` slots, all zero.
    pub fn new(max_counters: usize) -> Arc<Self> {
        let mut values = Vec::with_capacity(max_counters);
        values.resize_with(max_counters, || CachePadded::new(AtomicI64::new(0)));
        Arc::new(Self {
            values: values.into_boxed_slice(),
        })
    }

    pub fn max_counters(&self) -> usize {
        self.values.len()
    }

    /// Handle on slot `id`, or `None` if the id is out of range.
    pub fn counter(self: &Arc<Self>, id: i32) -> Option<Counter> {
        let index = usize::try_from(id).ok()?;
        (index < self.values.len()).then(|| Counter {
            values: Arc::clone(self),
            id,
        })
    }
}

/// Shared handle on one counter slot.
#[derive(Clone)]
pub struct Counter {
    values: Arc<CountersBuffer>,
    id: i32,
}

impl Counter {
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline(always)]
    fn slot(&self) -> &AtomicI64 {
        &self.values.values[self.id as usize]
    }

    /// Acquire load.
    #[inline(always)]
    pub fn get(&self) -> i64 {
        self.slot().load(Ordering::Acquire)
    }

    /// Release store.
    #[inline(always)]
    pub fn set(&self, value: i64) {
        self.slot().store(value, Ordering::Release)
    }

    /// Stores `value` only if it is larger than the current one.
    pub fn propose_max(&self, value: i64) -> bool {
        self.slot().fetch_max(value, Ordering::AcqRel) < value
    }
}

impl Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("id", &self.id)
            .field("value", &self.get())
            .finish()
    }
}
