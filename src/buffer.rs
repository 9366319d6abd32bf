//! Chunk accumulation buffers.

/// Base limited buffer interface.
pub trait ChunkBuffer<T> {
    /// Adds a new element to the buffer.
    fn push(&mut self, item: T);

    /// Returns buffer length
    fn len(&self) -> usize;

    /// Checks if the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks if the buffer reached the limit.
    fn is_full(&self) -> bool;

    /// Takes the buffered elements out leaving the buffer empty and ready for the next chunk.
    fn drain(&mut self) -> Vec<T>;
}

/// Buffer limited by elements count.
pub struct LimitedBuffer<T> {
    limit: usize,
    preallocate: bool,
    inner: Vec<T>,
}

impl<T> LimitedBuffer<T> {
    pub fn new(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            preallocate: false,
            inner: Vec::new(),
        }
    }

    /// Creates a buffer that reserves memory for `limit` elements up front and after every drain.
    pub fn with_capacity(limit: usize) -> Self {
        LimitedBuffer {
            limit,
            preallocate: true,
            inner: Vec::with_capacity(limit),
        }
    }
}

impl<T> ChunkBuffer<T> for LimitedBuffer<T> {
    fn push(&mut self, item: T) {
        self.inner.push(item);
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn is_full(&self) -> bool {
        self.inner.len() >= self.limit
    }

    fn drain(&mut self) -> Vec<T> {
        let fresh = if self.preallocate {
            Vec::with_capacity(self.limit)
        } else {
            Vec::new()
        };
        std::mem::replace(&mut self.inner, fresh)
    }
}
