//! Fixed-capacity FIFO used to stage sample blocks between the transport and whatever consumes
//! them. `N + 1` slots are allocated so that "full" and "empty" can be told apart from the
//! indices alone.
//!
//! A full buffer rejects new elements rather than overwriting old ones; the producer decides
//! whether to drop, flush or wait. There is no internal locking: a ring is owned by exactly one
//! worker.

use crate::error::RingError;

pub struct RingBuffer<T, const N: usize> {
    slots: Box<[Option<T>]>,
    /// Index of the oldest element
    head: usize,
    /// Index the next element will be written to
    tail: usize,
    /// Number of elements currently held. Always `(tail - head) mod (N + 1)`
    size: usize,
}

impl<T, const N: usize> RingBuffer<T, N> {
    pub fn new() -> Self {
        RingBuffer {
            slots: (0..=N).map(|_| None).collect(),
            head: 0,
            tail: 0,
            size: 0,
        }
    }

    /// Maximum number of elements the buffer holds
    pub fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self) -> bool {
        self.size == N
    }

    /// Append `item` at the tail. If the buffer is full the item is dropped and nothing changes
    pub fn push(&mut self, item: T) -> Result<(), RingError> {
        if self.is_full() {
            return Err(RingError::Full);
        }
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
        self.size += 1;
        Ok(())
    }

    /// Remove and return the oldest element
    pub fn pop(&mut self) -> Result<T, RingError> {
        if self.is_empty() {
            return Err(RingError::Empty);
        }
        let item = self.slots[self.head].take().ok_or(RingError::Empty)?;
        self.head = (self.head + 1) % self.slots.len();
        self.size -= 1;
        Ok(item)
    }

    /// The oldest element, left in place
    pub fn peek(&self) -> Result<&T, RingError> {
        if self.is_empty() {
            return Err(RingError::Empty);
        }
        self.slots[self.head].as_ref().ok_or(RingError::Empty)
    }

    /// Element `i` places after the oldest one (`index(0)` is the same as `peek()`)
    pub fn index(&self, i: usize) -> Result<&T, RingError> {
        let slots = self.slots.len();
        if i >= slots {
            return Err(RingError::OutOfRange { index: i, slots });
        }
        if i >= self.size {
            return Err(RingError::ExceedsSize {
                index: i,
                size: self.size,
            });
        }
        self.slots[(self.head + i) % slots]
            .as_ref()
            .ok_or(RingError::ExceedsSize {
                index: i,
                size: self.size,
            })
    }

    /// Oldest to newest, without consuming
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.size).filter_map(move |i| self.index(i).ok())
    }

    /// Pop every element, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.pop().ok())
    }
}

impl<T, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug, const N: usize> std::fmt::Debug for RingBuffer<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &N)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("size", &self.size)
            .finish()
    }
}
