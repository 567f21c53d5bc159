//! Head-cursor FIFO buffer

/// Consumed slots tolerated before compaction is considered
const COMPACT_MIN_HEAD: usize = 1024;

/// Append-only FIFO with a head cursor
///
/// `pop` is O(1): it takes the slot under the cursor and advances. The
/// consumed prefix is dropped once the cursor passes both
/// `COMPACT_MIN_HEAD` slots and half of the buffer, so memory stays bounded
/// without an O(n) shift per dequeue.
#[derive(Debug)]
pub struct FastQueue<T> {
    slots: Vec<Option<T>>,
    head: usize,
}

impl<T> Default for FastQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FastQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: 0,
        }
    }

    /// Append an item
    pub fn push(&mut self, item: T) {
        self.slots.push(Some(item));
    }

    /// Remove and return the oldest item
    pub fn pop(&mut self) -> Option<T> {
        let item = self.slots.get_mut(self.head)?.take();
        self.head += 1;
        if self.head == self.slots.len() {
            self.slots.clear();
            self.head = 0;
        } else if self.head > COMPACT_MIN_HEAD && self.head * 2 > self.slots.len() {
            self.slots.drain(..self.head);
            self.head = 0;
        }
        item
    }

    /// Oldest item without removing it
    #[must_use]
    pub fn peek(&self) -> Option<&T> {
        self.slots.get(self.head).and_then(Option::as_ref)
    }

    /// Number of unconsumed items
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.head
    }

    /// Whether no items are waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently allocated, consumed prefix included
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Drop every item
    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = 0;
    }
}
