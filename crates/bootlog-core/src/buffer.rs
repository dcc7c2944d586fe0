use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use bootlog_types::LogEntry;

/// Index-based ring over a pre-sized slot array
struct Ring {
    slots: Vec<Option<LogEntry>>,
    count: usize,
    read_index: usize,
    write_index: usize,
    /// Sequence number of the entry at `read_index`
    read_seq: u64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            count: 0,
            read_index: 0,
            write_index: 0,
            read_seq: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert at the write cursor, overwriting the oldest entry when full
    fn push(&mut self, entry: LogEntry) -> bool {
        let capacity = self.capacity();
        self.slots[self.write_index] = Some(entry);
        self.write_index = (self.write_index + 1) % capacity;

        if self.count < capacity {
            self.count += 1;
            false
        } else {
            self.read_index = (self.read_index + 1) % capacity;
            self.read_seq += 1;
            true
        }
    }

    fn peek(&self, max: usize) -> Batch {
        let n = self.count.min(max);
        let capacity = self.capacity();
        let entries = (0..n)
            .filter_map(|i| self.slots[(self.read_index + i) % capacity].clone())
            .collect();
        Batch {
            first_seq: self.read_seq,
            entries,
        }
    }

    /// Drop `n` entries from the read side
    fn advance(&mut self, n: usize) {
        let n = n.min(self.count);
        let capacity = self.capacity();
        for _ in 0..n {
            self.slots[self.read_index] = None;
            self.read_index = (self.read_index + 1) % capacity;
        }
        self.count -= n;
        self.read_seq += n as u64;
    }

    /// Remove what is left of `[first_seq, first_seq + len)`
    ///
    /// Returns `(removed, overtaken)`, where `overtaken` counts batch entries
    /// the write cursor evicted after the peek.
    fn commit(&mut self, first_seq: u64, len: usize) -> (usize, usize) {
        let overtaken = (self.read_seq.saturating_sub(first_seq) as usize).min(len);
        let n = (len - overtaken).min(self.count);
        self.advance(n);
        (n, overtaken)
    }
}

/// A copy of buffered entries that has not been removed yet
#[derive(Clone, Debug, Default)]
pub struct Batch {
    /// Sequence number of the first entry in the batch
    pub first_seq: u64,

    /// Entries in FIFO order
    pub entries: Vec<LogEntry>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Thread-safe, fixed-capacity ring buffer for pending log entries
#[derive(Clone)]
pub struct EntryBuffer {
    /// Ring storage and cursors
    ring: Arc<Mutex<Ring>>,

    /// Maximum capacity
    capacity: usize,

    /// Fast atomic mirror of the ring's count (avoids locking on occupancy())
    occupancy: Arc<AtomicUsize>,

    /// Total entries overwritten because the buffer was full
    evicted: Arc<AtomicU64>,
}

impl EntryBuffer {
    /// Create a new buffer with the given capacity
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "entry buffer capacity must be non-zero");
        Self {
            ring: Arc::new(Mutex::new(Ring::new(capacity))),
            capacity,
            occupancy: Arc::new(AtomicUsize::new(0)),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push an entry, evicting the oldest unread one if at capacity
    ///
    /// Returns `true` when an entry was evicted.
    pub fn push(&self, entry: LogEntry) -> bool {
        let mut ring = self.ring.lock();
        let evicted = ring.push(entry);
        self.occupancy.store(ring.count, Ordering::Release);
        drop(ring);

        if evicted {
            let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(total, "buffer full, evicted oldest entry");
        }
        evicted
    }

    /// Remove up to `max` entries (all if `None`) in FIFO order
    pub fn drain(&self, max: Option<usize>) -> Vec<LogEntry> {
        let mut ring = self.ring.lock();
        let batch = ring.peek(max.unwrap_or(usize::MAX));
        ring.advance(batch.len());
        self.occupancy.store(ring.count, Ordering::Release);
        batch.entries
    }

    /// Copy up to `max` entries (all if `None`) without removing them
    pub fn peek(&self, max: Option<usize>) -> Batch {
        self.ring.lock().peek(max.unwrap_or(usize::MAX))
    }

    /// Mark a previously peeked batch as delivered
    ///
    /// Removes the batch entries that are still buffered. Entries evicted
    /// while the batch was in flight did reach the sink, so they are taken
    /// back out of the [`evicted`](Self::evicted) count. Returns the number
    /// of entries removed.
    pub fn commit(&self, batch: &Batch) -> usize {
        let mut ring = self.ring.lock();
        let (removed, overtaken) = ring.commit(batch.first_seq, batch.len());
        self.occupancy.store(ring.count, Ordering::Release);
        drop(ring);

        if overtaken > 0 {
            self.evicted.fetch_sub(overtaken as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Current entry count (lock-free)
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    /// Check if buffer is empty (lock-free)
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries lost to overflow without reaching a sink
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}
