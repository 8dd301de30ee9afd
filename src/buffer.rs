use std::io::{self, Read, Write};

/// Growable byte buffer with a consume cursor.
///
/// Connections keep their buffers across exchanges (and across pool
/// round trips), so the allocation is reused instead of reallocated per
/// message. Consumed bytes are compacted away lazily once the cursor
/// passes half the stored data.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl Buffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Bytes written but not yet consumed.
    pub(crate) fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.read_pos == self.data.len()
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Marks `count` pending bytes as consumed.
    pub(crate) fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.read_pos += count;
        if self.read_pos > self.data.len() / 2 {
            self.compact();
        }
    }

    /// Appends up to `max` bytes read from `source`.
    ///
    /// Returns the number of bytes appended; 0 means end of stream.
    /// `WouldBlock` and friends surface unchanged to the caller.
    pub(crate) fn fill_from<R: Read>(&mut self, source: &mut R, max: usize) -> io::Result<usize> {
        let start = self.data.len();
        self.data.resize(start + max, 0);
        match source.read(&mut self.data[start..]) {
            Ok(count) => {
                self.data.truncate(start + count);
                Ok(count)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    /// Writes pending bytes into `sink`, consuming what was accepted.
    pub(crate) fn drain_to<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let count = sink.write(self.peek())?;
        self.consume(count);
        Ok(count)
    }

    /// Drops all pending bytes but keeps the allocation.
    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[cfg(test)]
    pub(crate) fn storage_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn compact(&mut self) {
        self.data.drain(..self.read_pos);
        self.read_pos = 0;
    }
}
