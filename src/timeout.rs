//! Read/write timeout enforcement.
//!
//! Every outstanding socket read or write registers with its queue before
//! awaiting; a single background sweeper walks both queues once a second
//! and disposes connections whose I/O has not completed by its expiry.
//! Completed entries are dropped silently, so completion never has to
//! unregister anything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// FIFO of in-flight I/O operations sharing one timeout.
///
/// Entries are enqueued with `now + timeout`, so expiries are
/// nondecreasing and only the head ever needs inspection.
pub struct TimeoutQueue {
    timeout: Duration,
    items: Mutex<VecDeque<TimeoutItem>>,
}

struct TimeoutItem {
    expires_at: Instant,
    io: Arc<AtomicBool>,
    token: CancellationToken,
    conn_id: u64,
}

/// Marks the registered I/O as completed. Dropping the guard counts as
/// completion so failed operations are never reaped twice.
pub struct IoGuard {
    io: Arc<AtomicBool>,
}

impl IoGuard {
    pub fn complete(&self) {
        self.io.store(true, Ordering::Release);
    }
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        self.complete();
    }
}

impl TimeoutQueue {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, items: Mutex::new(VecDeque::new()) }
    }

    /// Registers an I/O that is about to be awaited on behalf of the
    /// connection owning `token`.
    pub fn register(&self, token: &CancellationToken, conn_id: u64) -> IoGuard {
        let io = Arc::new(AtomicBool::new(false));
        let item = TimeoutItem {
            expires_at: Instant::now() + self.timeout,
            io: Arc::clone(&io),
            token: token.clone(),
            conn_id,
        };
        self.items.lock().expect("timeout queue poisoned").push_back(item);
        IoGuard { io }
    }

    /// Dequeues expired heads, disposing connections whose I/O is still
    /// outstanding. Returns how many were disposed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut disposed = 0;
        let mut items = self.items.lock().expect("timeout queue poisoned");

        while let Some(head) = items.front() {
            if head.expires_at > now {
                break;
            }
            let item = items.pop_front().expect("nonempty");
            if !item.io.load(Ordering::Acquire) {
                warn!(conn_id = item.conn_id, "i/o timed out, disposing connection");
                item.token.cancel();
                disposed += 1;
            }
        }

        disposed
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("timeout queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn head_expiry(&self) -> Option<Instant> {
        self.items.lock().unwrap().front().map(|item| item.expires_at)
    }
}

/// The two per-direction queues and their sweeper task.
pub struct TimeoutManager {
    pub read_queue: Arc<TimeoutQueue>,
    pub write_queue: Arc<TimeoutQueue>,
    sweeper: tokio::task::JoinHandle<()>,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

impl TimeoutManager {
    /// Creates the queues and starts the sweeper.
    pub fn start(read_timeout: Duration, write_timeout: Duration) -> Self {
        let read_queue = Arc::new(TimeoutQueue::new(read_timeout));
        let write_queue = Arc::new(TimeoutQueue::new(write_timeout));

        let read = Arc::clone(&read_queue);
        let write = Arc::clone(&write_queue);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let now = ticker.tick().await;
                let disposed = read.sweep(now) + write.sweep(now);
                if disposed > 0 {
                    trace!(disposed, "timeout sweep");
                }
            }
        });

        Self { read_queue, write_queue, sweeper }
    }

    pub fn shutdown(&self) {
        self.sweeper.abort();
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn head_always_holds_the_earliest_expiry() {
        let queue = TimeoutQueue::new(Duration::from_secs(5));
        let token = CancellationToken::new();

        let mut guards = Vec::new();
        for id in 0..8 {
            guards.push(queue.register(&token, id));
            tokio::time::advance(Duration::from_millis(250)).await;
        }

        let head = queue.head_expiry().unwrap();
        let mut items = queue.items.lock().unwrap();
        assert!(items.iter().all(|item| head <= item.expires_at));

        // enqueue order is nondecreasing in expiry throughout
        let expiries: Vec<_> = items.iter().map(|item| item.expires_at).collect();
        let mut sorted = expiries.clone();
        sorted.sort();
        assert_eq!(expiries, sorted);
        items.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_outstanding_io_disposes_the_connection() {
        let queue = TimeoutQueue::new(Duration::from_secs(2));
        let token = CancellationToken::new();
        let _guard = queue.register(&token, 1);

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(queue.sweep(Instant::now()), 0);
        assert!(!token.is_cancelled());

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(queue.sweep(Instant::now()), 1);
        assert!(token.is_cancelled());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_io_is_dropped_silently() {
        let queue = TimeoutQueue::new(Duration::from_secs(2));
        let token = CancellationToken::new();

        let guard = queue.register(&token, 1);
        guard.complete();
        drop(guard);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(queue.sweep(Instant::now()), 0);
        assert!(!token.is_cancelled());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unexpired_entries_stay_queued() {
        let queue = TimeoutQueue::new(Duration::from_secs(10));
        let token = CancellationToken::new();
        let _guard = queue.register(&token, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        queue.sweep(Instant::now());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_reaps_on_its_cadence() {
        let manager = TimeoutManager::start(Duration::from_secs(1), Duration::from_secs(1));
        let token = CancellationToken::new();
        let _guard = manager.read_queue.register(&token, 7);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(token.is_cancelled());
        assert!(manager.read_queue.is_empty());
    }
}
