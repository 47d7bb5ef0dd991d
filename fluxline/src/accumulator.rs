//! Batch accumulation and the dispatch queue.
//!
//! The [`Accumulator`] keeps one pending sequence of fragments per
//! [`WriteTarget`]. Reaching `batch_size` hands the batch to the
//! [`DispatchQueue`] synchronously, inside the caller's write call; the timer,
//! an explicit flush and shutdown hand off whatever is pending.
//!
//! The dispatch queue is bounded in lines by `buffer_limit`. Overflow
//! discards the oldest waiting batches and reports each discard as a
//! backpressure event.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::error::PipelineError;
use crate::events::{BackpressureEvent, EventPublisher, WriteEvent};
use crate::target::WriteTarget;

/// Fragments for one target, dispatched in one write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Batch {
    pub(crate) target: WriteTarget,
    pub(crate) lines: Vec<String>,
}

impl Batch {
    /// Joins the fragments with `\n`, without a trailing newline.
    pub(crate) fn payload(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Default)]
struct QueueState {
    batches: VecDeque<Batch>,
    buffered_lines: usize,
    closed: bool,
}

/// FIFO of batches waiting for the dispatcher.
pub(crate) struct DispatchQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    buffer_limit: usize,
    events: EventPublisher,
}

impl DispatchQueue {
    pub(crate) fn new(buffer_limit: usize, events: EventPublisher) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            buffer_limit,
            events,
        }
    }

    /// Appends a batch, discarding the oldest waiting batches on overflow.
    pub(crate) fn push(&self, batch: Batch) {
        let mut dropped = Vec::new();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.buffered_lines += batch.lines.len();
            state.batches.push_back(batch);

            while state.buffered_lines > self.buffer_limit && state.batches.len() > 1 {
                if let Some(oldest) = state.batches.pop_front() {
                    state.buffered_lines -= oldest.lines.len();
                    dropped.push((oldest, state.buffered_lines));
                }
            }
        }

        for (batch, buffered_lines) in dropped {
            tracing::warn!(
                bucket = %batch.target.bucket,
                org = %batch.target.organization,
                lines = batch.lines.len(),
                buffer_limit = self.buffer_limit,
                "buffer limit exceeded, discarding oldest batch"
            );
            self.events.publish(WriteEvent::Backpressure(BackpressureEvent {
                organization: batch.target.organization,
                bucket: batch.target.bucket,
                dropped_lines: batch.lines.len(),
                buffered_lines,
            }));
        }

        self.ready.notify_one();
    }

    /// Waits for the next batch. Returns `None` once closed and drained.
    pub(crate) async fn pop(&self) -> Option<Batch> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(batch) = state.batches.pop_front() {
                    state.buffered_lines -= batch.lines.len();
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Stops the consumer once the remaining batches are drained.
    pub(crate) fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
        self.ready.notify_one();
    }

    /// Number of lines waiting for dispatch.
    pub(crate) fn buffered_lines(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffered_lines
    }
}

#[derive(Default)]
struct Pending {
    // Targets in first-seen order; the set of live targets is small.
    targets: Vec<(WriteTarget, Vec<String>)>,
    closed: bool,
}

/// Per-target pending fragments with a size trigger.
pub(crate) struct Accumulator {
    pending: Mutex<Pending>,
    batch_size: usize,
    queue: Arc<DispatchQueue>,
}

impl Accumulator {
    pub(crate) fn new(batch_size: usize, queue: Arc<DispatchQueue>) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            batch_size,
            queue,
        }
    }

    /// Appends fragments for `target`, handing off every full batch.
    ///
    /// All fragments of one call are appended under a single lock, so they
    /// stay contiguous relative to concurrent callers.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Closed`] once [`Accumulator::close`] ran.
    pub(crate) fn enqueue<I>(&self, target: &WriteTarget, fragments: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.closed {
            return Err(PipelineError::Closed);
        }

        let index = match pending.targets.iter().position(|(t, _)| t == target) {
            Some(index) => index,
            None => {
                pending.targets.push((target.clone(), Vec::new()));
                pending.targets.len() - 1
            }
        };

        for fragment in fragments {
            let lines = &mut pending.targets[index].1;
            lines.push(fragment);

            if lines.len() >= self.batch_size {
                let lines = std::mem::take(lines);
                tracing::debug!(%target, lines = lines.len(), "batch size reached");
                self.queue.push(Batch {
                    target: target.clone(),
                    lines,
                });
            }
        }

        if pending.targets[index].1.is_empty() {
            pending.targets.remove(index);
        }
        Ok(())
    }

    /// Hands off everything pending for every target. Returns the number of
    /// batches handed off.
    pub(crate) fn flush_all(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.hand_off_all(&mut pending)
    }

    /// Hands off everything pending for one target.
    pub(crate) fn flush_target(&self, target: &WriteTarget) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = pending.targets.iter().position(|(t, _)| t == target) else {
            return false;
        };

        let (target, lines) = pending.targets.remove(index);
        if lines.is_empty() {
            return false;
        }
        self.queue.push(Batch { target, lines });
        true
    }

    /// Flushes everything, refuses further fragments and closes the queue.
    /// Returns the number of batches handed off, or `None` if already closed.
    pub(crate) fn close(&self) -> Option<usize> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.closed {
            return None;
        }

        pending.closed = true;
        let handed_off = self.hand_off_all(&mut pending);
        self.queue.close();
        Some(handed_off)
    }

    /// Returns `true` once [`Accumulator::close`] ran.
    pub(crate) fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Number of lines not yet handed off.
    pub(crate) fn pending_lines(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .targets
            .iter()
            .map(|(_, lines)| lines.len())
            .sum()
    }

    // Pushing under the lock keeps flushed batches ordered against
    // size-triggered ones from concurrent writers.
    fn hand_off_all(&self, pending: &mut Pending) -> usize {
        let mut handed_off = 0;
        for (target, lines) in pending.targets.drain(..) {
            if !lines.is_empty() {
                self.queue.push(Batch { target, lines });
                handed_off += 1;
            }
        }
        handed_off
    }
}
