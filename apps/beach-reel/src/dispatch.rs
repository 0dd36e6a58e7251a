//! Hand-off of work to the owning thread.
//!
//! Producers (the network thread, the host itself) push [`DispatchTask`]s;
//! the owning thread drains the queue once per tick. A drain swaps the whole
//! queue out under the lock and runs the snapshot unlocked, so tasks queued
//! while a drain is running wait for the next tick.

use std::mem;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::metrics;
use crate::protocol::StreamId;
use crate::session::Resolution;

pub const DEFAULT_HIGH_WATER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTask {
    /// Build the decoder session for a stream seen for the first time.
    CreateSession {
        stream: StreamId,
        resolution: Resolution,
    },
    /// Push one decoded picture to the consumer, resizing its resources first
    /// if `resolution` differs from what they were last sized for.
    UploadPlanes {
        stream: StreamId,
        resolution: Resolution,
        luma: Bytes,
        chroma: Bytes,
    },
}

impl DispatchTask {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchTask::CreateSession { .. } => "create_session",
            DispatchTask::UploadPlanes { .. } => "upload_planes",
        }
    }

    pub fn stream(&self) -> StreamId {
        match self {
            DispatchTask::CreateSession { stream, .. } | DispatchTask::UploadPlanes { stream, .. } => {
                *stream
            }
        }
    }
}

#[derive(Debug)]
pub struct Dispatcher<T> {
    queue: Mutex<Vec<T>>,
    high_water: usize,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T> {
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    /// `high_water` is the depth past which enqueue logs a warning. The queue
    /// itself never rejects work.
    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            high_water: high_water.max(1),
        }
    }

    pub fn enqueue(&self, task: T) {
        let depth = {
            let mut queue = self.queue.lock();
            queue.push(task);
            queue.len()
        };
        metrics::DISPATCH_QUEUE_DEPTH.set(depth as i64);
        if depth == self.high_water + 1 {
            tracing::warn!(
                target: "beach_reel::dispatch",
                depth,
                high_water = self.high_water,
                "dispatch queue above high-water mark; owning thread is falling behind"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Removes and returns everything queued so far, oldest first.
    pub fn take(&self) -> Vec<T> {
        let tasks = mem::take(&mut *self.queue.lock());
        metrics::DISPATCH_QUEUE_DEPTH.set(0);
        tasks
    }

    /// Runs `run` on every task queued before the call, in FIFO order. The
    /// lock is not held while `run` executes.
    pub fn drain<F>(&self, mut run: F) -> usize
    where
        F: FnMut(T),
    {
        let tasks = self.take();
        let count = tasks.len();
        for task in tasks {
            run(task);
        }
        metrics::DISPATCH_BATCH.observe(count as f64);
        count
    }
}
