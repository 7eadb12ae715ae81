//! Owned byte buffer used to move raw resource bytes between pipeline stages.
//!
//! A [`ByteBuffer`] always has exactly one owner. Cloning produces an
//! independent copy; [`ByteBuffer::take`] moves the contents out and leaves
//! the source empty, so a stage that hands its bytes to the next one cannot
//! keep reading them.

use std::fmt;
use std::io::Cursor;
use std::ops::{Deref, DerefMut};

/// Raised when the allocator cannot provide the requested buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not enough memory to allocate {requested} bytes")]
pub struct AllocError {
    /// Number of bytes that were requested
    pub requested: usize,
}

/// Owned, resizable raw byte container.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    /// Create an empty buffer without allocating.
    pub const fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Allocate a zero-filled buffer of `size` bytes.
    ///
    /// Unlike `vec![0; size]` this reports allocation failure instead of
    /// aborting the process, so one oversized resource fails on its own.
    pub fn allocate(size: usize) -> Result<Self, AllocError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| AllocError { requested: size })?;
        data.resize(size, 0);
        Ok(Self { data })
    }

    /// Copy `bytes` into a freshly allocated buffer.
    pub fn copy_from_slice(bytes: &[u8]) -> Result<Self, AllocError> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| AllocError { requested: bytes.len() })?;
        data.extend_from_slice(bytes);
        Ok(Self { data })
    }

    /// Resize in place, zero-filling any new tail.
    pub fn resize(&mut self, size: usize) -> Result<(), AllocError> {
        if size > self.data.len() {
            self.data
                .try_reserve_exact(size - self.data.len())
                .map_err(|_| AllocError { requested: size })?;
        }
        self.data.resize(size, 0);
        Ok(())
    }

    /// Move the contents out, leaving this buffer empty.
    pub fn take(&mut self) -> ByteBuffer {
        std::mem::take(self)
    }

    /// Release the memory held by this buffer.
    pub fn free(&mut self) {
        self.data = Vec::new();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes of heap memory held, used for footprint estimates.
    pub fn memory_size(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Readable stream over the contents.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.data)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for ByteBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl From<ByteBuffer> for Vec<u8> {
    fn from(buffer: ByteBuffer) -> Self {
        buffer.data
    }
}

impl Deref for ByteBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ByteBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl AsRef<[u8]> for ByteBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer").field("len", &self.data.len()).finish()
    }
}
