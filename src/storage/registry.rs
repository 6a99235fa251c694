//! Registry of open transactions and the published environment state.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::types::TxId;

/// Identifier handed to every registered transaction.
pub type ReaderId = u64;

const MAX_SLOW_READER_SAMPLES: usize = 4;

#[derive(Clone, Debug)]
struct ActiveReader {
    snapshot: TxId,
    begin_instant: Instant,
    thread_id: ThreadId,
    write: bool,
}

/// Token returned by [`TransactionRegistry::register`]; hand it back to
/// [`TransactionRegistry::release`].
#[derive(Debug, Eq, PartialEq)]
pub struct ReaderToken {
    id: ReaderId,
    snapshot: TxId,
}

/// A long-running transaction reported by [`RegistrySnapshot`].
#[derive(Clone, Debug)]
pub struct SlowReader {
    /// Registry id.
    pub reader_id: ReaderId,
    /// Pinned snapshot.
    pub snapshot: TxId,
    /// Age in milliseconds.
    pub age_ms: u64,
    /// Thread that opened the transaction.
    pub thread_id: ThreadId,
    /// Whether it is the write transaction.
    pub write: bool,
}

/// Summary of open transactions.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    /// Open transactions, the writer included.
    pub active: u64,
    /// Oldest pinned snapshot.
    pub oldest_snapshot: Option<TxId>,
    /// Newest pinned snapshot.
    pub newest_snapshot: Option<TxId>,
    /// Age of the oldest open transaction in milliseconds.
    pub max_age_ms: u64,
    /// Oldest transactions first.
    pub slow_readers: Vec<SlowReader>,
}

struct Published<S> {
    state: Arc<S>,
    last_tx: TxId,
}

/// Tracks open transactions and the state they start from.
///
/// Registering and releasing never wait for the writer: a transaction
/// pins the published snapshot in a concurrent map, then checks that no
/// commit landed in between and pins the newer state if one did. The
/// published state is only write-locked for the pointer swap.
pub struct TransactionRegistry<S> {
    published: RwLock<Published<S>>,
    last_tx: AtomicU64,
    readers: DashMap<ReaderId, ActiveReader>,
    next_id: AtomicU64,
    oldest_active: AtomicU64,
    slow_threshold: Duration,
}

impl<S> TransactionRegistry<S> {
    /// Registry publishing `state`, the result of `last_tx`.
    pub fn new(state: Arc<S>, last_tx: TxId, slow_threshold: Duration) -> Self {
        Self {
            published: RwLock::new(Published { state, last_tx }),
            last_tx: AtomicU64::new(last_tx.0),
            readers: DashMap::new(),
            next_id: AtomicU64::new(1),
            oldest_active: AtomicU64::new(last_tx.0),
            slow_threshold,
        }
    }

    /// Registers a transaction against the current state.
    pub fn register(&self, write: bool) -> (ReaderToken, Arc<S>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let begin_instant = Instant::now();
        let thread_id = thread::current().id();
        loop {
            let (state, snapshot) = {
                let published = self.published.read();
                (Arc::clone(&published.state), published.last_tx)
            };
            self.readers.insert(
                id,
                ActiveReader {
                    snapshot,
                    begin_instant,
                    thread_id,
                    write,
                },
            );
            // Pairs with the fence in `oldest_snapshot`: either this load
            // sees the newer commit or the writer's scan sees this entry.
            fence(Ordering::SeqCst);
            if self.last_tx.load(Ordering::SeqCst) == snapshot.0 {
                return (ReaderToken { id, snapshot }, state);
            }
            self.readers.remove(&id);
            trace!(reader_id = id, snapshot = snapshot.0, "registry.register.retry");
        }
    }

    /// Drops a registration.
    pub fn release(&self, token: ReaderToken) {
        self.readers.remove(&token.id);
    }

    /// Publishes the state produced by `last_tx`.
    pub fn publish(&self, state: Arc<S>, last_tx: TxId) {
        {
            let mut published = self.published.write();
            published.state = state;
            published.last_tx = last_tx;
            self.last_tx.store(last_tx.0, Ordering::SeqCst);
        }
        self.refresh_oldest();
    }

    /// Replaces the published state without advancing the transaction.
    pub fn republish(&self, state: Arc<S>) {
        self.published.write().state = state;
    }

    fn refresh_oldest(&self) -> TxId {
        let oldest = self
            .oldest_snapshot()
            .unwrap_or(TxId(self.last_tx.load(Ordering::SeqCst)));
        let previous = self.oldest_active.fetch_max(oldest.0, Ordering::AcqRel);
        TxId(previous.max(oldest.0))
    }

    /// Currently published state.
    pub fn current(&self) -> Arc<S> {
        Arc::clone(&self.published.read().state)
    }

    /// Oldest snapshot pinned by an open transaction.
    pub fn oldest_snapshot(&self) -> Option<TxId> {
        fence(Ordering::SeqCst);
        self.readers.iter().map(|entry| entry.snapshot).min()
    }

    /// Oldest transaction any open transaction may still observe. Never
    /// decreases.
    pub fn oldest_active(&self) -> TxId {
        self.refresh_oldest()
    }

    /// Open transactions.
    pub fn active(&self) -> usize {
        self.readers.len()
    }

    /// Summary of open transactions at `now`.
    pub fn snapshot(&self, now: Instant) -> RegistrySnapshot {
        let mut slow: Vec<SlowReader> = self
            .readers
            .iter()
            .map(|entry| SlowReader {
                reader_id: *entry.key(),
                snapshot: entry.snapshot,
                age_ms: now
                    .saturating_duration_since(entry.begin_instant)
                    .as_millis()
                    .min(u64::MAX as u128) as u64,
                thread_id: entry.thread_id,
                write: entry.write,
            })
            .collect();
        let mut snapshot = RegistrySnapshot {
            active: slow.len() as u64,
            oldest_snapshot: slow.iter().map(|r| r.snapshot).min(),
            newest_snapshot: slow.iter().map(|r| r.snapshot).max(),
            ..RegistrySnapshot::default()
        };
        slow.sort_by(|a, b| b.age_ms.cmp(&a.age_ms));
        snapshot.max_age_ms = slow.first().map(|r| r.age_ms).unwrap_or(0);
        slow.truncate(MAX_SLOW_READER_SAMPLES);
        snapshot.slow_readers = slow;
        snapshot
    }

    /// Logs every transaction open longer than the configured threshold and
    /// returns how many there were.
    pub fn report_slow_readers(&self, now: Instant) -> usize {
        let threshold_ms = self.slow_threshold.as_millis() as u64;
        let snapshot = self.snapshot(now);
        let mut reported = 0;
        for reader in snapshot
            .slow_readers
            .iter()
            .filter(|r| r.age_ms > threshold_ms)
        {
            warn!(
                reader_id = reader.reader_id,
                snapshot = reader.snapshot.0,
                age_ms = reader.age_ms,
                write = reader.write,
                thread = ?reader.thread_id,
                "registry.slow_reader"
            );
            reported += 1;
        }
        reported
    }
}
