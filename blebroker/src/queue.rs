use std::collections::VecDeque;

use log::{debug, trace};

use crate::{Error, Result};

/// A queued request that can be turned away without ever running
pub(crate) trait Operation {
    /// Short name used for logging and `Error::SubmitFailed`
    fn name(&self) -> &'static str;

    /// Resolves the operation's caller with `err`
    fn reject(self, err: Error);
}

/// FIFO of operations with at most one submitted to the native stack at a time.
///
/// The queue doesn't know how to submit or complete anything itself: callers
/// pass a `submit` closure whenever the queue might be able to make progress
/// and take the in-flight operation back out when its completion arrives.
#[derive(Debug)]
pub(crate) struct OperationQueue<T> {
    queue: VecDeque<T>,

    // Last submitted operation which we expect a completion for
    in_flight: Option<T>,
}

impl<T: Operation> OperationQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> Option<&T> {
        self.in_flight.as_ref()
    }

    /// Number of operations waiting behind the in-flight one
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn enqueue<F>(&mut self, op: T, submit: F)
        where F: FnMut(&T) -> Result<()>
    {
        self.queue.push_back(op);
        self.advance(submit);
    }

    /// Takes the in-flight operation if `is_completed_by` accepts it, leaving
    /// the queue idle. The caller must resolve the operation and then
    /// [`advance`](Self::advance).
    pub fn complete<P>(&mut self, is_completed_by: P) -> Option<T>
        where P: FnOnce(&T) -> bool
    {
        if self.in_flight.as_ref().map_or(false, is_completed_by) {
            self.in_flight.take()
        } else {
            None
        }
    }

    /// Submits queued operations until one is accepted or the queue runs dry.
    ///
    /// Operations the native stack refuses are rejected with
    /// `Error::SubmitFailed` straight away and never become in-flight. An
    /// operation whose target no longer exists (`submit` returns
    /// `Error::NotFound`) is rejected with that error instead.
    pub fn advance<F>(&mut self, mut submit: F)
        where F: FnMut(&T) -> Result<()>
    {
        while self.in_flight.is_none() {
            let op = match self.queue.pop_front() {
                Some(op) => op,
                None => break,
            };
            match submit(&op) {
                Ok(()) => {
                    trace!("Submitted {} request ({} more queued)", op.name(), self.queue.len());
                    self.in_flight = Some(op);
                }
                Err(Error::NotFound(kind)) => {
                    debug!("Dropping {} request for stale {} handle", op.name(), kind);
                    op.reject(Error::NotFound(kind));
                }
                Err(err) => {
                    debug!("Native stack refused {} request: {:?}", op.name(), err);
                    let name = op.name();
                    op.reject(Error::SubmitFailed(name));
                }
            }
        }
    }

    /// Rejects the in-flight operation and everything queued behind it
    pub fn drain<E>(&mut self, mut error: E)
        where E: FnMut() -> Error
    {
        if let Some(op) = self.in_flight.take() {
            op.reject(error());
        }
        for op in self.queue.drain(..) {
            op.reject(error());
        }
    }
}
