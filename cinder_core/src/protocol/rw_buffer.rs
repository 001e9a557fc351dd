/// Default backing size for a freshly created [`RwBuffer`].
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// A byte buffer with independent read and write cursors.
///
/// Bytes between the read and write cursors are "unread". Writes append at the
/// write cursor; when a write would run past the end of the backing storage
/// the unread bytes are shifted to offset 0, and capacity doubles until the
/// unread bytes plus the incoming write fit.
#[derive(Debug)]
pub struct RwBuffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for RwBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl RwBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity.max(1)],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Copies `data` in after the last written byte.
    pub fn write(&mut self, data: &[u8]) {
        self.reserve(data.len());
        let end = self.write_pos + data.len();
        self.storage[self.write_pos..end].copy_from_slice(data);
        self.write_pos = end;
    }

    /// The bytes written but not yet consumed.
    pub fn unread(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Moves the read cursor. A negative amount un-consumes bytes that were
    /// consumed since the last write.
    ///
    /// # Panics
    /// If the cursor would leave the `[0, write cursor]` range.
    pub fn advance_read(&mut self, amount: isize) {
        let next = self
            .read_pos
            .checked_add_signed(amount)
            .filter(|&pos| pos <= self.write_pos);
        match next {
            Some(pos) => self.read_pos = pos,
            None => panic!(
                "read cursor {} moved by {amount} leaves the buffer (write cursor {})",
                self.read_pos, self.write_pos
            ),
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn reserve(&mut self, incoming: usize) {
        if self.write_pos + incoming > self.storage.len() {
            self.compact();
        }
        let mut capacity = self.storage.len();
        while self.len() + incoming > capacity {
            capacity *= 2;
        }
        if capacity != self.storage.len() {
            self.storage.resize(capacity, 0);
        }
    }

    fn compact(&mut self) {
        self.storage.copy_within(self.read_pos..self.write_pos, 0);
        self.write_pos -= self.read_pos;
        self.read_pos = 0;
    }
}
