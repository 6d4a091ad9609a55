use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Semaphore};
use util::sync::RwLock;

use crate::chunk::chunk_data::ChunkData;

/// Basic queue for either ordered or unordered chunks.
pub(crate) type PendingBaseQueue = VecDeque<ChunkData>;

/// Outbound DATA chunks not yet handed to the reliability engine, split by
/// ordering mode.
///
/// Appends go through a semaphore sized in payload bytes, which is what
/// makes a send call block once the writer outruns the wire. The extra
/// mutex around the semaphore keeps the fragments of one message adjacent
/// in the queue; it is separate from the semaphore so permits can be
/// returned without taking it.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    semaphore_lock: Mutex<()>,
    semaphore: Semaphore,

    unordered_queue: RwLock<PendingBaseQueue>,
    ordered_queue: RwLock<PendingBaseQueue>,
    queue_len: AtomicUsize,
    n_bytes: AtomicUsize,
    selected: AtomicBool,
    unordered_is_selected: AtomicBool,
}

impl Default for PendingQueue {
    fn default() -> Self {
        PendingQueue::new()
    }
}

// Some tests push a lot of data before anything is transmitted.
#[cfg(test)]
const QUEUE_BYTES_LIMIT: usize = 128 * 1024 * 1024;
#[cfg(not(test))]
const QUEUE_BYTES_LIMIT: usize = 128 * 1024;

const QUEUE_APPEND_LARGE: usize = (QUEUE_BYTES_LIMIT * 2) / 3;

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self {
            semaphore_lock: Mutex::default(),
            semaphore: Semaphore::new(QUEUE_BYTES_LIMIT),
            unordered_queue: Default::default(),
            ordered_queue: Default::default(),
            queue_len: Default::default(),
            n_bytes: Default::default(),
            selected: Default::default(),
            unordered_is_selected: Default::default(),
        }
    }

    /// Appends one chunk, blocking while the queue is over its byte limit.
    pub(crate) async fn push(&self, c: ChunkData) {
        let user_data_len = c.user_data.len();

        {
            let sem_lock = self.semaphore_lock.lock().await;
            let permits = self.semaphore.acquire_many(user_data_len as u32).await;
            // the semaphore is never closed while self is alive
            if let Ok(permits) = permits {
                permits.forget();
            }

            if c.unordered {
                self.unordered_queue.write().push_back(c);
            } else {
                self.ordered_queue.write().push_back(c);
            }
            drop(sem_lock);
        }

        self.n_bytes.fetch_add(user_data_len, Ordering::SeqCst);
        self.queue_len.fetch_add(1, Ordering::SeqCst);
    }

    /// Appends the fragments of one message, keeping them adjacent. All
    /// chunks must share one ordering mode.
    pub(crate) async fn append(&self, chunks: Vec<ChunkData>) {
        if chunks.is_empty() {
            return;
        }

        let total_user_data_len = chunks.iter().fold(0, |acc, c| acc + c.user_data.len());

        if total_user_data_len >= QUEUE_APPEND_LARGE {
            self.append_large(chunks).await
        } else {
            let sem_lock = self.semaphore_lock.lock().await;
            let permits = self
                .semaphore
                .acquire_many(total_user_data_len as u32)
                .await;
            // the semaphore is never closed while self is alive
            if let Ok(permits) = permits {
                permits.forget();
            }
            self.append_unlimited(chunks, total_user_data_len);
            drop(sem_lock);
        }
    }

    // A message larger than the queue limit is appended chunk by chunk so
    // transmission can make progress and return permits while we wait.
    async fn append_large(&self, chunks: Vec<ChunkData>) {
        // lock this for the whole duration
        let sem_lock = self.semaphore_lock.lock().await;

        for chunk in chunks.into_iter() {
            let user_data_len = chunk.user_data.len();
            let permits = self.semaphore.acquire_many(user_data_len as u32).await;
            // the semaphore is never closed while self is alive
            if let Ok(permits) = permits {
                permits.forget();
            }

            if chunk.unordered {
                self.unordered_queue.write().push_back(chunk);
            } else {
                self.ordered_queue.write().push_back(chunk);
            }
            self.n_bytes.fetch_add(user_data_len, Ordering::SeqCst);
            self.queue_len.fetch_add(1, Ordering::SeqCst);
        }

        drop(sem_lock);
    }

    /// Assumes enough permits were acquired and forgotten and that
    /// semaphore_lock is held.
    fn append_unlimited(&self, chunks: Vec<ChunkData>, total_user_data_len: usize) {
        let chunks_len = chunks.len();
        let unordered = chunks.first().map(|c| c.unordered).unwrap_or_default();

        debug_assert!(
            chunks.iter().all(|c| c.unordered == unordered),
            "all fragments of one message share the ordering mode"
        );

        if unordered {
            self.unordered_queue.write().extend(chunks);
        } else {
            self.ordered_queue.write().extend(chunks);
        }

        self.n_bytes
            .fetch_add(total_user_data_len, Ordering::SeqCst);
        self.queue_len.fetch_add(chunks_len, Ordering::SeqCst);
    }

    pub(crate) fn peek(&self) -> Option<ChunkData> {
        if self.selected.load(Ordering::SeqCst) {
            if self.unordered_is_selected.load(Ordering::SeqCst) {
                return self.unordered_queue.read().front().cloned();
            } else {
                return self.ordered_queue.read().front().cloned();
            }
        }

        let c = self.unordered_queue.read().front().cloned();
        if c.is_some() {
            return c;
        }

        self.ordered_queue.read().front().cloned()
    }

    /// Pops the chunk returned by the preceding peek. While a fragmented
    /// message is being drained its queue stays selected, so fragments of
    /// the two ordering modes never interleave on the wire.
    pub(crate) fn pop(&self, beginning_fragment: bool, unordered: bool) -> Option<ChunkData> {
        let popped = if self.selected.load(Ordering::SeqCst) {
            let popped = if self.unordered_is_selected.load(Ordering::SeqCst) {
                self.unordered_queue.write().pop_front()
            } else {
                self.ordered_queue.write().pop_front()
            };
            if let Some(p) = &popped {
                if p.ending_fragment {
                    self.selected.store(false, Ordering::SeqCst);
                }
            }
            popped
        } else {
            if !beginning_fragment {
                return None;
            }
            let popped = if unordered {
                self.unordered_queue.write().pop_front()
            } else {
                self.ordered_queue.write().pop_front()
            };
            if let Some(p) = &popped {
                if !p.ending_fragment {
                    self.selected.store(true, Ordering::SeqCst);
                    self.unordered_is_selected.store(unordered, Ordering::SeqCst);
                }
            }
            popped
        };

        if let Some(p) = &popped {
            let user_data_len = p.user_data.len();
            self.n_bytes.fetch_sub(user_data_len, Ordering::SeqCst);
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
            self.semaphore.add_permits(user_data_len);
        }

        popped
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
