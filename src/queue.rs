//! Bounded multi-producer work queues with explicit termination.
//!
//! Consumers call [`WorkQueue::get`] until it fails with [`QueueDone`], which
//! happens exactly when the queue is empty *and* every registered
//! [`Producer`] has finished. [`WorkQueue::join`] resolves once every item
//! ever enqueued has been acknowledged; acknowledgement is tied to dropping
//! the [`Job`] guard, so a cancelled consumer can never leave `join` stuck.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::result::Result as StdResult;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};

/// The queue is empty and all producers have finished.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("the queue is done")]
pub struct QueueDone;

pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    count_items: bool,
    state: Mutex<State<T>>,

    /// One permit per queued item; closed when the producer count drops to zero.
    items: Semaphore,
    /// One permit per free slot.
    slots: Semaphore,
    /// Signalled whenever the unacknowledged-item count drops to zero.
    drained: Notify,
}

struct State<T> {
    items: VecDeque<T>,
    n_producers: usize,
    n_unfinished: usize,
    n_enqueued: usize,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_counting(capacity, true)
    }

    /// A pass-through queue: items flowing through it are not counted,
    /// so that splitters do not inflate progress totals.
    pub fn pass_through(capacity: usize) -> Self {
        Self::with_counting(capacity, false)
    }

    /// A queue without back-pressure. Required when the producers are the
    /// same workers that drain the source queue: blocking them on a bounded
    /// put would deadlock the pipeline.
    pub fn unbounded() -> Self {
        Self::with_counting(Semaphore::MAX_PERMITS, true)
    }

    fn with_counting(capacity: usize, count_items: bool) -> Self {
        assert!(capacity >= 1);
        Self {
            shared: Arc::new(Shared {
                count_items,
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    n_producers: 0,
                    n_unfinished: 0,
                    n_enqueued: 0,
                }),
                items: Semaphore::new(0),
                slots: Semaphore::new(capacity),
                drained: Notify::new(),
            }),
        }
    }

    /// Registers a new producer. The queue does not report [`QueueDone`]
    /// until every producer handle has been finished or dropped.
    pub fn producer(&self) -> Producer<T> {
        let mut state = self.shared.state.lock().unwrap();
        state.n_producers += 1;
        drop(state);
        Producer {
            queue: self.clone(),
            finished: false,
        }
    }

    /// Dequeues the next item, waiting for one to arrive if necessary.
    ///
    /// Fails with [`QueueDone`] once the queue is drained and no producers
    /// remain. The item is wrapped in a [`Job`] guard which acknowledges it
    /// on drop.
    pub async fn get(&self) -> StdResult<Job<T>, QueueDone> {
        match self.shared.items.acquire().await {
            // A closed-over drainer may still have raced the permit holder to
            // the item, hence `ok_or` on both paths.
            Ok(permit) => {
                permit.forget();
                self.pop().ok_or(QueueDone)
            }
            // The semaphore is closed: producers are gone,
            // drain whatever is still queued.
            Err(_) => self.pop().ok_or(QueueDone),
        }
    }

    fn pop(&self) -> Option<Job<T>> {
        let mut state = self.shared.state.lock().unwrap();
        let item = state.items.pop_front()?;
        drop(state);
        self.shared.slots.add_permits(1);
        Some(Job {
            shared: Arc::clone(&self.shared),
            item: Some(item),
        })
    }

    /// Waits until every enqueued item has been acknowledged.
    pub async fn join(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.state.lock().unwrap().n_unfinished == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().items.len()
    }

    /// Total number of items ever enqueued (unless the queue is pass-through).
    pub fn count(&self) -> usize {
        self.shared.state.lock().unwrap().n_enqueued
    }
}

pub struct Producer<T> {
    queue: WorkQueue<T>,
    finished: bool,
}

impl<T> Producer<T> {
    /// Enqueues an item, waiting for a free slot under back-pressure.
    pub async fn put(&self, item: T) {
        let shared = &self.queue.shared;
        let permit = shared
            .slots
            .acquire()
            .await
            .expect("the slot semaphore is never closed");
        permit.forget();

        let mut state = shared.state.lock().unwrap();
        state.items.push_back(item);
        state.n_unfinished += 1;
        if shared.count_items {
            state.n_enqueued += 1;
        }
        drop(state);
        shared.items.add_permits(1);
    }

    /// Deregisters the producer. Once the last producer has finished,
    /// pending consumers observe [`QueueDone`] after the queue drains.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let shared = &self.queue.shared;
        let mut state = shared.state.lock().unwrap();
        state.n_producers -= 1;
        let last = state.n_producers == 0;
        drop(state);
        if last {
            shared.items.close();
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// A dequeued item. Dropping the guard acknowledges the item, which keeps
/// [`WorkQueue::join`] correct even when the consumer is cancelled mid-work.
pub struct Job<T> {
    shared: Arc<Shared<T>>,
    item: Option<T>,
}

impl<T> Job<T> {
    /// Acknowledges the item and returns it by value.
    pub fn into_inner(mut self) -> T {
        self.item.take().expect("the job still holds its item")
    }
}

impl<T> Deref for Job<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("the job still holds its item")
    }
}

impl<T> DerefMut for Job<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("the job still holds its item")
    }
}

impl<T> Drop for Job<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.n_unfinished -= 1;
        let drained = state.n_unfinished == 0;
        drop(state);
        if drained {
            self.shared.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::spawn;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::prelude::*;

    #[tokio::test]
    async fn get_fails_after_last_producer_finishes() -> Result {
        let queue = WorkQueue::new(4);
        let producer = queue.producer();
        producer.put(1).await;
        producer.put(2).await;
        producer.finish();

        assert_eq!(*queue.get().await.unwrap(), 1);
        assert_eq!(*queue.get().await.unwrap(), 2);
        assert_eq!(queue.get().await.err(), Some(QueueDone));
        assert_eq!(queue.get().await.err(), Some(QueueDone));
        Ok(())
    }

    #[tokio::test]
    async fn all_consumers_observe_queue_done() -> Result {
        let queue = WorkQueue::<i32>::new(1);
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                spawn(async move { queue.get().await.err() })
            })
            .collect();
        sleep(StdDuration::from_millis(10)).await;
        queue.producer().finish();
        for consumer in consumers {
            assert_eq!(consumer.await?, Some(QueueDone));
        }
        Ok(())
    }

    #[tokio::test]
    async fn put_blocks_at_capacity() -> Result {
        let queue = WorkQueue::new(1);
        let producer = queue.producer();
        producer.put(1).await;

        let blocked = {
            let queue = queue.clone();
            spawn(async move {
                let producer = queue.producer();
                producer.put(2).await;
                producer.finish();
            })
        };
        sleep(StdDuration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        let job = queue.get().await.unwrap();
        assert_eq!(job.into_inner(), 1);
        blocked.await?;
        producer.finish();
        assert_eq!(queue.get().await.unwrap().into_inner(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn join_returns_once_jobs_are_acknowledged() -> Result {
        let queue = WorkQueue::new(4);
        let producer = queue.producer();
        producer.put(1).await;
        producer.put(2).await;
        producer.finish();

        let job_1 = queue.get().await.unwrap();
        let job_2 = queue.get().await.unwrap();

        let joined = {
            let queue = queue.clone();
            spawn(async move { queue.join().await })
        };
        sleep(StdDuration::from_millis(10)).await;
        assert!(!joined.is_finished());

        drop(job_1);
        drop(job_2);
        timeout(StdDuration::from_secs(1), joined).await??;
        Ok(())
    }

    #[tokio::test]
    async fn dropping_a_producer_counts_as_finishing() -> Result {
        let queue = WorkQueue::<i32>::new(1);
        {
            let _producer = queue.producer();
        }
        assert_eq!(queue.get().await.err(), Some(QueueDone));
        Ok(())
    }

    #[tokio::test]
    async fn pass_through_suppresses_counting() -> Result {
        let queue = WorkQueue::new(4);
        let pass_through = WorkQueue::pass_through(4);
        let producer = queue.producer();
        let splitter = pass_through.producer();
        producer.put(1).await;
        splitter.put(1).await;
        assert_eq!(queue.count(), 1);
        assert_eq!(pass_through.count(), 0);
        assert_eq!(pass_through.len(), 1);
        Ok(())
    }
}
