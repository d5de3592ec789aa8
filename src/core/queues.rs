//! UtilityQueues (spec §3, §4.2): small in-memory structures stages use to
//! buffer and correlate chunks without reimplementing the same bookkeeping
//! in every stage.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{watch, Notify};

/// FIFO queue with a future-yielding read; a `None` push marks end-of-stream
/// and every subsequent `read()` keeps returning `None`.
pub struct SingleQueue<T> {
    items: std::sync::Mutex<VecDeque<Option<T>>>,
    notify: Notify,
    ended: std::sync::atomic::AtomicBool,
}

impl<T> Default for SingleQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleQueue<T> {
    pub fn new() -> Self {
        Self {
            items: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            ended: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().expect("queue mutex poisoned").push_back(Some(item));
        self.notify.notify_one();
    }

    /// Mark end-of-stream. Idempotent.
    pub fn close(&self) {
        self.ended.store(true, std::sync::atomic::Ordering::SeqCst);
        self.items.lock().expect("queue mutex poisoned").push_back(None);
        self.notify.notify_one();
    }

    /// Read the next item, suspending until one is pushed. Returns `None`
    /// once the queue has been closed and drained.
    pub async fn read(&self) -> Option<T> {
        loop {
            if let Some(slot) = self.items.lock().expect("queue mutex poisoned").pop_front() {
                return slot;
            }
            if self.ended.load(std::sync::atomic::Ordering::SeqCst) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Two FIFO queues read together as matched pairs — for stages that must
/// correlate items from two independent sources (e.g. audio frames against
/// external VAD decisions) before emitting (spec §4.2).
pub struct DoubleQueue<A, B> {
    a: SingleQueue<A>,
    b: SingleQueue<B>,
}

impl<A, B> Default for DoubleQueue<A, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, B> DoubleQueue<A, B> {
    pub fn new() -> Self {
        Self {
            a: SingleQueue::new(),
            b: SingleQueue::new(),
        }
    }

    pub fn push_a(&self, item: A) {
        self.a.push(item);
    }

    pub fn push_b(&self, item: B) {
        self.b.push(item);
    }

    pub fn close(&self) {
        self.a.close();
        self.b.close();
    }

    /// Read the next matched pair, suspending on whichever side is slower.
    /// Returns `None` once either side has ended.
    pub async fn read_pair(&self) -> Option<(A, B)> {
        let a = self.a.read().await?;
        let b = self.b.read().await?;
        Some((a, b))
    }
}

/// Append-only log read by multiple independent named pointers, with
/// explicit trimming of entries no pointer still needs (spec §4.2). `write`
/// and `read` are observable as change events so a caller can wait for
/// activity instead of polling (spec §3 "MultiPointerQueue").
pub struct MultiPointerQueue<T> {
    log: std::sync::Mutex<VecDeque<T>>,
    /// Index of the oldest entry still present in `log`, relative to the
    /// queue's start (entries before this have been trimmed away).
    base_index: std::sync::Mutex<usize>,
    pointers: std::sync::Mutex<HashMap<String, usize>>,
    write_seq: watch::Sender<u64>,
    read_seq: watch::Sender<u64>,
}

impl<T: Clone> Default for MultiPointerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> MultiPointerQueue<T> {
    pub fn new() -> Self {
        let (write_seq, _) = watch::channel(0);
        let (read_seq, _) = watch::channel(0);
        Self {
            log: std::sync::Mutex::new(VecDeque::new()),
            base_index: std::sync::Mutex::new(0),
            pointers: std::sync::Mutex::new(HashMap::new()),
            write_seq,
            read_seq,
        }
    }

    fn notify_write(&self) {
        self.write_seq.send_modify(|n| *n += 1);
    }

    fn notify_read(&self) {
        self.read_seq.send_modify(|n| *n += 1);
    }

    /// Subscribe to the `write` change event (append, insert, delete, touch).
    pub fn subscribe_write(&self) -> watch::Receiver<u64> {
        self.write_seq.subscribe()
    }

    /// Subscribe to the `read` change event (a pointer consuming an entry).
    pub fn subscribe_read(&self) -> watch::Receiver<u64> {
        self.read_seq.subscribe()
    }

    pub fn append(&self, item: T) {
        self.log.lock().expect("log mutex poisoned").push_back(item);
        self.notify_write();
    }

    /// Insert `item` at `offset` within the currently retained window,
    /// shifting every pointer at or past that position forward by one.
    pub fn insert_at(&self, offset: usize, item: T) {
        let mut log = self.log.lock().expect("log mutex poisoned");
        let idx = offset.min(log.len());
        log.insert(idx, item);
        drop(log);

        let base = *self.base_index.lock().expect("base mutex poisoned");
        let abs = base + idx;
        let mut pointers = self.pointers.lock().expect("pointers mutex poisoned");
        for pos in pointers.values_mut() {
            if *pos >= abs {
                *pos += 1;
            }
        }
        drop(pointers);
        self.notify_write();
    }

    /// Remove and return the entry at `offset` within the currently
    /// retained window, shifting every pointer past it back by one.
    pub fn delete_at(&self, offset: usize) -> Option<T> {
        let mut log = self.log.lock().expect("log mutex poisoned");
        if offset >= log.len() {
            return None;
        }
        let item = log.remove(offset);
        drop(log);

        let base = *self.base_index.lock().expect("base mutex poisoned");
        let abs = base + offset;
        let mut pointers = self.pointers.lock().expect("pointers mutex poisoned");
        for pos in pointers.values_mut() {
            if *pos > abs {
                *pos -= 1;
            }
        }
        drop(pointers);
        self.notify_write();
        item
    }

    /// Look at the entry at `offset` within the currently retained window
    /// without advancing any pointer.
    pub fn peek(&self, offset: usize) -> Option<T> {
        self.log.lock().expect("log mutex poisoned").get(offset).cloned()
    }

    /// Emit a `write` change event with no structural change, for a caller
    /// that mutated an entry in place (e.g. annotating it) and wants
    /// waiters woken without an append/insert/delete.
    pub fn touch(&self) {
        self.notify_write();
    }

    /// Register a named read pointer at the current tail (reads only items
    /// appended after registration) if it does not already exist.
    pub fn register_pointer(&self, name: &str) {
        let tail = *self.base_index.lock().expect("base mutex poisoned")
            + self.log.lock().expect("log mutex poisoned").len();
        self.pointers
            .lock()
            .expect("pointers mutex poisoned")
            .entry(name.to_string())
            .or_insert(tail);
    }

    /// The named pointer's current absolute position, or `None` if it has
    /// never been registered.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.pointers.lock().expect("pointers mutex poisoned").get(name).copied()
    }

    /// Read and advance the named pointer, one item at a time. Returns
    /// `None` if the pointer has caught up to the tail.
    pub fn read_next(&self, name: &str) -> Option<T> {
        let base = *self.base_index.lock().expect("base mutex poisoned");
        let log = self.log.lock().expect("log mutex poisoned");
        let mut pointers = self.pointers.lock().expect("pointers mutex poisoned");
        let pos = pointers.entry(name.to_string()).or_insert(base);
        if *pos < base {
            // Pointer fell behind the trim line: resync to the new base.
            *pos = base;
        }
        let offset = *pos - base;
        if offset >= log.len() {
            return None;
        }
        let item = log[offset].clone();
        *pos += 1;
        drop(log);
        drop(pointers);
        self.notify_read();
        Some(item)
    }

    /// Drop log entries older than every registered pointer's position.
    pub fn trim(&self) {
        let mut base = self.base_index.lock().expect("base mutex poisoned");
        let pointers = self.pointers.lock().expect("pointers mutex poisoned");
        let min_pos = pointers.values().copied().min().unwrap_or(*base);
        let mut log = self.log.lock().expect("log mutex poisoned");
        while *base < min_pos && !log.is_empty() {
            log.pop_front();
            *base += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.log.lock().expect("log mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Interval-keyed metadata bag: stores arbitrary values against a
/// `[start, end)` time window and fetches whatever windows overlap a query
/// range, pruning anything strictly before a given cutoff (spec §4.2; used
/// by word-aligned ASR to fold per-word timing onto settled chunks).
pub struct TimeStore<T> {
    entries: std::sync::Mutex<Vec<(i64, i64, T)>>,
}

impl<T: Clone> Default for TimeStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TimeStore<T> {
    pub fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self, start: i64, end: i64, value: T) {
        self.entries.lock().expect("store mutex poisoned").push((start, end, value));
    }

    /// Fetch every stored value whose interval overlaps `[start, end]`, in
    /// insertion order.
    pub fn fetch(&self, start: i64, end: i64) -> Vec<T> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .iter()
            .filter(|(s, e, _)| *s <= end && start <= *e)
            .map(|(_, _, v)| v.clone())
            .collect()
    }

    /// Discard every entry whose interval ends strictly before `cutoff`.
    pub fn prune(&self, cutoff: i64) {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .retain(|(_, e, _)| *e >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_queue_fifo_then_ends() {
        let q: SingleQueue<i32> = SingleQueue::new();
        q.push(1);
        q.push(2);
        q.close();
        assert_eq!(q.read().await, Some(1));
        assert_eq!(q.read().await, Some(2));
        assert_eq!(q.read().await, None);
        assert_eq!(q.read().await, None);
    }

    #[tokio::test]
    async fn single_queue_read_suspends_until_push() {
        let q = std::sync::Arc::new(SingleQueue::<i32>::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.read().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(42);
        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn double_queue_pairs_in_order() {
        let q: DoubleQueue<&str, i32> = DoubleQueue::new();
        q.push_a("x");
        q.push_a("y");
        q.push_b(1);
        q.push_b(2);
        assert_eq!(q.read_pair().await, Some(("x", 1)));
        assert_eq!(q.read_pair().await, Some(("y", 2)));
    }

    #[test]
    fn multi_pointer_queue_independent_readers_and_trim() {
        let q: MultiPointerQueue<i32> = MultiPointerQueue::new();
        q.append(1);
        q.register_pointer("slow");
        q.append(2);
        q.register_pointer("fast");
        q.append(3);

        assert_eq!(q.read_next("fast"), Some(2));
        assert_eq!(q.read_next("fast"), Some(3));
        assert_eq!(q.read_next("fast"), None);

        assert_eq!(q.read_next("slow"), Some(2));
        q.trim();
        assert_eq!(q.len(), 2, "entry before the slowest pointer is trimmed");
        assert_eq!(q.read_next("slow"), Some(3));
    }

    #[test]
    fn multi_pointer_queue_peek_insert_delete_and_position() {
        let q: MultiPointerQueue<i32> = MultiPointerQueue::new();
        q.append(1);
        q.append(3);
        q.register_pointer("r");
        assert_eq!(q.position("r"), Some(2));

        q.insert_at(1, 2);
        assert_eq!(q.peek(0), Some(1));
        assert_eq!(q.peek(1), Some(2));
        assert_eq!(q.peek(2), Some(3));
        assert_eq!(q.position("r"), Some(3), "pointer past the insertion point shifts forward");

        assert_eq!(q.delete_at(0), Some(1));
        assert_eq!(q.peek(0), Some(2));
        assert_eq!(q.position("r"), Some(2), "pointer past the deletion point shifts back");
    }

    #[tokio::test]
    async fn multi_pointer_queue_write_and_read_events_are_observable() {
        let q: MultiPointerQueue<i32> = MultiPointerQueue::new();
        let mut writes = q.subscribe_write();
        let mut reads = q.subscribe_read();

        q.append(1);
        writes.changed().await.unwrap();
        assert_eq!(*writes.borrow(), 1);

        q.register_pointer("r");
        q.read_next("r");
        reads.changed().await.unwrap();
        assert_eq!(*reads.borrow(), 1);

        q.touch();
        writes.changed().await.unwrap();
        assert_eq!(*writes.borrow(), 2);
    }

    #[test]
    fn time_store_fetch_overlaps_and_prune() {
        let ts: TimeStore<&str> = TimeStore::new();
        ts.store(0, 100, "a");
        ts.store(100, 200, "b");
        ts.store(300, 400, "c");

        let hits = ts.fetch(50, 150);
        assert_eq!(hits, vec!["a", "b"]);

        ts.prune(150);
        assert_eq!(ts.len(), 2);
        let hits = ts.fetch(0, 1000);
        assert_eq!(hits, vec!["b", "c"]);
    }
}
