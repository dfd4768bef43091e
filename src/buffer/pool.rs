//! Power-of-two byte pool and the ref-counted [`Block`] handed to buffers.
//!
//! Requests are rounded up to the next power of two within
//! [`MIN_CLASS`]..=[`MAX_CLASS`]; anything larger is allocated directly and
//! never pooled.

use std::{
    fmt,
    sync::{Arc, LazyLock, Mutex, PoisonError},
};

/// Smallest pooled allocation.
pub const MIN_CLASS: usize = 64;
/// Largest pooled allocation.
pub const MAX_CLASS: usize = 1 << 20;

const CLASS_COUNT: usize = (MAX_CLASS.trailing_zeros() - MIN_CLASS.trailing_zeros() + 1) as usize;
const RETAIN_PER_CLASS: usize = 256;

static POOL: LazyLock<Pool> = LazyLock::new(Pool::new);

/// Process-wide pool used by every [`Block`].
#[must_use]
pub fn global() -> &'static Pool { &POOL }

/// Free lists keyed by size class.
pub struct Pool {
    classes: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
}

impl Pool {
    fn new() -> Self {
        Self {
            classes: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    fn class_index(size: usize) -> Option<usize> {
        if !size.is_power_of_two() || !(MIN_CLASS..=MAX_CLASS).contains(&size) {
            return None;
        }
        Some((size.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize)
    }

    /// Round `size` up to the allocation size that [`Pool::get`] returns.
    #[must_use]
    pub fn class_size(size: usize) -> usize {
        if size > MAX_CLASS {
            size
        } else {
            size.max(MIN_CLASS).next_power_of_two()
        }
    }

    /// Fetch a vector of at least `size` bytes.
    ///
    /// The returned vector's `len()` is the full allocation size.
    #[must_use]
    pub fn get(&self, size: usize) -> Vec<u8> {
        let class = Self::class_size(size);
        if let Some(idx) = Self::class_index(class) {
            let mut free = self.classes[idx]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(bytes) = free.pop() {
                return bytes;
            }
        }
        vec![0; class]
    }

    /// Return a vector to the pool.
    ///
    /// Vectors whose length is not a pooled power of two are dropped.
    pub fn put(&self, bytes: Vec<u8>) {
        let Some(idx) = Self::class_index(bytes.len()) else {
            return;
        };
        let mut free = self.classes[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < RETAIN_PER_CLASS {
            free.push(bytes);
        }
    }

    /// Number of idle vectors retained for `size`'s class.
    #[must_use]
    pub fn idle(&self, size: usize) -> usize {
        Self::class_index(Self::class_size(size)).map_or(0, |idx| {
            self.classes[idx]
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        })
    }

    /// Drop every retained vector.
    pub fn clear(&self) {
        for class in &self.classes {
            class.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("classes", &CLASS_COUNT)
            .finish_non_exhaustive()
    }
}

struct BlockData {
    bytes: Vec<u8>,
}

impl Drop for BlockData {
    fn drop(&mut self) { global().put(std::mem::take(&mut self.bytes)); }
}

/// A ref-counted allocation shared between buffer chunks.
///
/// Cloning increments the count; dropping the last handle returns the
/// storage to the pool.
#[derive(Clone)]
pub struct Block(Arc<BlockData>);

impl Block {
    /// Allocate a block of at least `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self(Arc::new(BlockData {
            bytes: global().get(size),
        }))
    }

    /// Allocation size in bytes.
    #[must_use]
    pub fn size(&self) -> usize { self.0.bytes.len() }

    /// Number of live handles.
    #[must_use]
    pub fn ref_count(&self) -> usize { Arc::strong_count(&self.0) }

    pub(crate) fn as_slice(&self) -> &[u8] { &self.0.bytes }

    /// Mutable access, only while this is the sole handle.
    pub(crate) fn get_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.0).map(|data| data.bytes.as_mut_slice())
    }

    pub(crate) fn is_unique(&self) -> bool { Arc::strong_count(&self.0) == 1 }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("size", &self.size())
            .field("refs", &self.ref_count())
            .finish()
    }
}
