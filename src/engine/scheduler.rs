//! Cyclic FIFO deciding which test case each worker runs next.
//!
//! Items are taken with [`RoundRobin::next`] and put back at the tail with
//! [`RoundRobin::release`]; nothing is ever consumed, so the number of items
//! held is constant across a run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::EngineError;
use crate::plan::TestCase;

pub struct RoundRobin {
    queue: Mutex<VecDeque<Arc<TestCase>>>,
    available: Notify,
}

impl RoundRobin {
    /// Build the queue over `tests` in `order`. An id may appear more than
    /// once; every occurrence shares the same `TestCase`.
    pub fn preload(tests: &[TestCase], order: &[u16]) -> Result<Self, EngineError> {
        if order.is_empty() {
            return Err(EngineError::EmptyExecutionOrder);
        }

        let by_id: HashMap<u16, Arc<TestCase>> = tests
            .iter()
            .map(|t| (t.id, Arc::new(t.clone())))
            .collect();

        let mut queue = VecDeque::with_capacity(order.len());
        for &id in order {
            if id == 0 {
                return Err(EngineError::InvalidTestId(id));
            }
            let test = by_id.get(&id).ok_or(EngineError::InvalidTestId(id))?;
            queue.push_back(Arc::clone(test));
        }

        Ok(Self {
            queue: Mutex::new(queue),
            available: Notify::new(),
        })
    }

    /// Take the test case at the head, waiting if the queue is momentarily empty.
    pub async fn next(&self) -> Arc<TestCase> {
        loop {
            let notified = self.available.notified();
            let head = self.lock().pop_front();
            if let Some(test) = head {
                return test;
            }
            notified.await;
        }
    }

    /// Put a test case back at the tail, making it eligible for immediate re-dispatch.
    pub fn release(&self, test: Arc<TestCase>) {
        self.lock().push_back(test);
        self.available.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<TestCase>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
