//! Parallel frame preparation for animated playback.
//!
//! Frames are computed out of order on the rayon pool and handed back
//! strictly in frame order.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::executor::block_on;
use tracing::debug;

use crate::cache::ReconstructionCache;
use crate::error::ReconstructionError;
use crate::reconstruction::{
    CancelToken, DepthRange, Reconstruct, ReconstructionRequest, ReconstructionResult,
};
use crate::volume::Volume;

/// Holds frames that arrived early until every frame before them is in.
#[derive(Debug)]
pub struct ReassemblyBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReassemblyBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReassemblyBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Returns false for an index already released or already pending.
    pub fn insert(&mut self, index: usize, frame: T) -> bool {
        if index < self.next || self.pending.contains_key(&index) {
            return false;
        }
        self.pending.insert(index, frame);
        true
    }

    /// The next frame in order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<(usize, T)> {
        let entry = self.pending.first_entry()?;
        if *entry.key() != self.next {
            return None;
        }
        self.next += 1;
        Some(entry.remove_entry())
    }

    pub fn drain_ready(&mut self) -> Vec<(usize, T)> {
        std::iter::from_fn(|| self.pop_ready()).collect()
    }

    /// Index of the next frame to be released.
    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Runs one task per frame on the rayon pool and yields results in frame
/// order. Dropping the prefetcher cancels tasks that have not finished.
pub struct FramePrefetcher<T> {
    receiver: UnboundedReceiver<(usize, T)>,
    buffer: ReassemblyBuffer<T>,
    total: usize,
    cancel: CancelToken,
}

impl<T: Send + 'static> FramePrefetcher<T> {
    /// Submit every task at once. Each task receives the prefetcher's
    /// cancellation token.
    pub fn spawn<I, F>(tasks: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded();
        let cancel = CancelToken::new();
        let mut total = 0;
        for (index, task) in tasks.into_iter().enumerate() {
            let sender = sender.clone();
            let cancel = cancel.clone();
            rayon::spawn(move || {
                // The receiver is gone once the prefetcher is dropped.
                let _ = sender.unbounded_send((index, task(&cancel)));
            });
            total += 1;
        }
        debug!(frames = total, "Prefetching frames");
        Self {
            receiver,
            buffer: ReassemblyBuffer::new(),
            total,
            cancel,
        }
    }

    /// Block until the next frame in order is ready. `None` once every frame
    /// has been returned.
    pub fn next_frame(&mut self) -> Option<T> {
        loop {
            if let Some((_, frame)) = self.buffer.pop_ready() {
                return Some(frame);
            }
            if self.buffer.next_index() >= self.total {
                return None;
            }
            let (index, frame) = block_on(self.receiver.next())?;
            self.buffer.insert(index, frame);
        }
    }

    /// Frames that can be released now, in order, without blocking.
    pub fn ready_frames(&mut self) -> Vec<T> {
        while let Some(Some((index, frame))) = self.receiver.next().now_or_never() {
            self.buffer.insert(index, frame);
        }
        self.buffer
            .drain_ready()
            .into_iter()
            .map(|(_, frame)| frame)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Frames not yet returned.
    pub fn remaining(&self) -> usize {
        self.total - self.buffer.next_index()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T: Send + 'static> Iterator for FramePrefetcher<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.next_frame()
    }
}

impl<T> Drop for FramePrefetcher<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub type SweepFrame = Result<Arc<ReconstructionResult>, ReconstructionError>;

/// Fill `cache` with `request` moved to each of `positions`, e.g. every
/// slice of an axial play-through. Single-depth modes are placed at the
/// position; range modes have their range shifted to start there.
pub fn prefetch_depth_sweep<E>(
    cache: &Arc<ReconstructionCache<E>>,
    volume: &Arc<Volume>,
    request: &ReconstructionRequest,
    positions: impl IntoIterator<Item = f64>,
) -> FramePrefetcher<SweepFrame>
where
    E: Reconstruct + 'static,
{
    let DepthRange { start, end } = request.depth();
    let tasks: Vec<_> = positions
        .into_iter()
        .map(|position| {
            let cache = Arc::clone(cache);
            let volume = Arc::clone(volume);
            let request = request
                .clone()
                .with_depth(DepthRange::new(position, position + (end - start)));
            move |cancel: &CancelToken| cache.get(&volume, &request, cancel)
        })
        .collect();
    FramePrefetcher::spawn(tasks)
}
