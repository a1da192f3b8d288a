//! Slab of fixed-size `f32` buffers.
//!
//! Every buffer the engine touches (biases, weights, activations, gradients,
//! staging inputs) is allocated here once and addressed by a [`BufferId`].
//! Buffers are boxed slices, so they can never grow or shrink after allocation.
//!
//! Each buffer sits behind its own reader/writer lock. The task graph only runs
//! jobs concurrently when their write sets are disjoint from every other running
//! job's read and write sets, so in practice the locks never block; they exist so
//! that kernels can borrow buffers from several threads without `unsafe`.
//!
//! Every arena gets a process-unique id and stamps it into the handles it hands
//! out, so a handle from one network's arena is never mistaken for a buffer of
//! another.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

static ARENA_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn next_arena_id() -> usize {
    ARENA_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Handle to one buffer in an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId {
    arena: usize,
    index: usize,
}

impl BufferId {
    /// Position of the buffer within its arena.
    #[inline]
    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Debug)]
pub struct Arena {
    id: usize,
    buffers: Vec<RwLock<Box<[f32]>>>,
    total_len: usize,
}

impl Default for Arena {
    fn default() -> Self {
        Self {
            id: next_arena_id(),
            buffers: Vec::new(),
            total_len: 0,
        }
    }
}

/// Shared view of a buffer.
pub struct BufferRef<'a>(RwLockReadGuard<'a, Box<[f32]>>);

/// Exclusive view of a buffer.
pub struct BufferMut<'a>(RwLockWriteGuard<'a, Box<[f32]>>);

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zeroed buffer of `len` elements.
    pub fn alloc(&mut self, len: usize) -> BufferId {
        self.alloc_from(vec![0.0; len])
    }

    /// Takes ownership of `values` as a new buffer.
    pub fn alloc_from(&mut self, values: Vec<f32>) -> BufferId {
        let id = BufferId {
            arena: self.id,
            index: self.buffers.len(),
        };
        self.total_len += values.len();
        self.buffers.push(RwLock::new(values.into_boxed_slice()));
        id
    }

    #[inline]
    fn slot(&self, id: BufferId) -> &RwLock<Box<[f32]>> {
        assert_eq!(
            id.arena, self.id,
            "buffer {} belongs to another arena",
            id.index
        );
        &self.buffers[id.index]
    }

    /// Panics if `id` was not allocated by this arena.
    #[inline]
    pub fn read(&self, id: BufferId) -> BufferRef<'_> {
        // A panicking kernel cannot leave a half-written f32, so poisoning is ignored.
        BufferRef(self.slot(id).read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Panics if `id` was not allocated by this arena.
    #[inline]
    pub fn write(&self, id: BufferId) -> BufferMut<'_> {
        BufferMut(self.slot(id).write().unwrap_or_else(PoisonError::into_inner))
    }

    #[inline]
    pub fn len(&self, id: BufferId) -> usize {
        self.read(id).len()
    }

    /// Whether `id` was allocated by this arena.
    #[inline]
    pub fn contains(&self, id: BufferId) -> bool {
        id.arena == self.id && id.index < self.buffers.len()
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Sum of all buffer lengths, in elements.
    #[inline]
    pub fn total_len(&self) -> usize {
        self.total_len
    }
}

impl Deref for BufferRef<'_> {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl Deref for BufferMut<'_> {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl DerefMut for BufferMut<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.0
    }
}

impl std::fmt::Debug for BufferRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_tracks_sizes() {
        let mut arena = Arena::new();
        let a = arena.alloc(3);
        let b = arena.alloc_from(vec![1.0, 2.0]);

        assert_ne!(a, b);
        assert_eq!(arena.len(a), 3);
        assert_eq!(&*arena.read(b), &[1.0, 2.0]);
        assert_eq!(arena.buffer_count(), 2);
        assert_eq!(arena.total_len(), 5);
    }

    #[test]
    fn writes_are_visible_to_readers() {
        let mut arena = Arena::new();
        let a = arena.alloc(2);
        arena.write(a).copy_from_slice(&[4.0, 5.0]);
        assert_eq!(&*arena.read(a), &[4.0, 5.0]);
    }

    #[test]
    fn concurrent_shared_reads() {
        let mut arena = Arena::new();
        let a = arena.alloc_from(vec![1.0; 8]);
        let r1 = arena.read(a);
        let r2 = arena.read(a);
        assert_eq!(r1.len() + r2.len(), 16);
    }

    #[test]
    fn handles_do_not_cross_arenas() {
        let mut a = Arena::new();
        let mut b = Arena::new();
        let ia = a.alloc(2);
        let ib = b.alloc(2);

        // Same slot index, different owners.
        assert_eq!(ia.index(), ib.index());
        assert_ne!(ia, ib);
        assert!(a.contains(ia));
        assert!(!a.contains(ib));
        assert!(!b.contains(ia));
    }

    #[test]
    #[should_panic(expected = "another arena")]
    fn foreign_handle_panics_on_read() {
        let a = Arena::new();
        let mut b = Arena::new();
        let ib = b.alloc(1);
        let _ = a.read(ib);
    }
}
