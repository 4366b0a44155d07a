use std::ops::{Deref, Range};
use std::sync::Arc;

/// One slot of the input buffer ring.
///
/// The bytes are shared read-only with every task that has to look at them,
/// which can be two tasks when a record straddles a buffer boundary. A slot
/// may only be refilled once `readers_done == readers`.
#[derive(Debug, Default)]
pub(crate) struct InBuf {
    pub(crate) data: Arc<Vec<u8>>,
    pub(crate) readers: u32,
    pub(crate) readers_done: u32,
}

impl InBuf {
    /// Every assigned reader has finished with the current contents
    pub(crate) fn is_released(&self) -> bool {
        self.readers_done == self.readers
    }

    /// Publish freshly filled bytes, resetting the reader counts
    pub(crate) fn publish(&mut self, bytes: Vec<u8>, readers: u32) {
        self.data = Arc::new(bytes);
        self.readers = readers;
        self.readers_done = 0;
    }

    /// Take the storage back for refilling.
    ///
    /// The allocation is reused when no stale view is still alive, otherwise a
    /// fresh buffer is allocated.
    pub(crate) fn reclaim(&mut self, capacity: usize) -> Vec<u8> {
        match Arc::try_unwrap(std::mem::take(&mut self.data)) {
            Ok(mut bytes) if bytes.capacity() >= capacity => {
                bytes.clear();
                bytes
            }
            Ok(_) => Vec::with_capacity(capacity),
            Err(_) => {
                log::debug!("input buffer still referenced, allocating a replacement");
                Vec::with_capacity(capacity)
            }
        }
    }
}

/// A read-only window into an input buffer, handed to pump functions.
///
/// The chunk keeps the underlying buffer alive, but a pump function should not
/// hold on to it past its own invocation: doing so forces the ring to allocate
/// a replacement buffer.
#[derive(Debug, Clone, Default)]
pub struct InputChunk {
    data: Option<Arc<Vec<u8>>>,
    range: Range<usize>,
}

impl InputChunk {
    pub(crate) fn new(data: Arc<Vec<u8>>, range: Range<usize>) -> Self {
        Self {
            data: Some(data),
            range,
        }
    }

    /// Number of bytes in the chunk
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Check if the chunk is empty
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl Deref for InputChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[self.range.clone()],
            None => &[],
        }
    }
}

impl AsRef<[u8]> for InputChunk {
    fn as_ref(&self) -> &[u8] {
        self
    }
}
