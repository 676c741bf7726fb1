//! Scoped scratch tensors.
//!
//! Every frame needs a handful of large intermediate tensors (the rotated frame, the face crop,
//! the eye crops, the detector input). A [`TensorPool`] keeps the backing buffers of these tensors
//! around between frames, and a [`FrameScope`] hands them out for a single frame: every buffer
//! handed back to the scope with [`FrameScope::recycle`] returns to the pool when the scope is
//! dropped, whether the frame completed, bailed out with an error, or panicked.
//!
//! The pool retains at most a fixed number of buffers, so memory use stays bounded no matter how
//! many frames are processed.

use ndarray::{Array, Dimension};

/// A pool of reusable `f32` buffers.
#[derive(Debug)]
pub struct TensorPool {
    free: Vec<Vec<f32>>,
    max_free: usize,
    allocations: usize,
}

impl TensorPool {
    /// The default number of buffers the pool will retain.
    pub const DEFAULT_MAX_FREE: usize = 8;

    pub fn new() -> Self {
        Self::with_max_free(Self::DEFAULT_MAX_FREE)
    }

    /// Creates a pool that retains at most `max_free` unused buffers.
    pub fn with_max_free(max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            max_free,
            allocations: 0,
        }
    }

    /// Opens a scope for processing a single frame.
    pub fn scope(&mut self) -> FrameScope<'_> {
        FrameScope {
            pool: self,
            live: Vec::new(),
        }
    }

    /// Returns the number of buffers currently held by the pool.
    pub fn free_buffers(&self) -> usize {
        self.free.len()
    }

    /// Returns the total number of buffers this pool had to allocate because no free buffer was
    /// large enough.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    fn take(&mut self, len: usize) -> Vec<f32> {
        // Use the smallest free buffer that fits.
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.capacity() >= len)
            .min_by_key(|(_, buf)| buf.capacity())
            .map(|(i, _)| i);

        let mut buf = match best {
            Some(i) => self.free.swap_remove(i),
            None => {
                self.allocations += 1;
                Vec::with_capacity(len)
            }
        };
        buf.clear();
        buf.resize(len, 0.0);
        buf
    }

    fn give(&mut self, buf: Vec<f32>) {
        if self.free.len() < self.max_free {
            self.free.push(buf);
        } else if let Some(smallest) = self
            .free
            .iter_mut()
            .min_by_key(|free| free.capacity())
            .filter(|free| free.capacity() < buf.capacity())
        {
            // Keep the larger buffer, it can serve more requests.
            *smallest = buf;
        }
    }
}

impl Default for TensorPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out pooled tensors for the duration of one frame.
///
/// Created by [`TensorPool::scope`].
pub struct FrameScope<'p> {
    pool: &'p mut TensorPool,
    live: Vec<Vec<f32>>,
}

impl FrameScope<'_> {
    /// Returns a zero-filled tensor of the given shape, backed by a pooled buffer.
    pub fn zeros<D: Dimension>(&mut self, dim: D) -> Array<f32, D> {
        let buf = self.pool.take(dim.size());
        Array::from_shape_vec(dim, buf).expect("pooled buffer length matches tensor shape")
    }

    /// Registers a tensor that is no longer needed, so that its buffer returns to the pool once
    /// the scope ends.
    pub fn recycle<D: Dimension>(&mut self, tensor: Array<f32, D>) {
        self.live.push(tensor.into_raw_vec());
    }

    /// Returns the number of recycled buffers waiting for the end of the scope.
    pub fn pending(&self) -> usize {
        self.live.len()
    }
}

impl Drop for FrameScope<'_> {
    fn drop(&mut self) {
        for buf in self.live.drain(..) {
            self.pool.give(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Dim;

    use super::*;

    #[test]
    fn buffers_are_reused() {
        let mut pool = TensorPool::new();
        for _ in 0..10 {
            let mut scope = pool.scope();
            let a = scope.zeros(Dim([4, 4, 3]));
            let b = scope.zeros(Dim([1, 2, 2, 3]));
            assert!(a.iter().all(|&v| v == 0.0));
            scope.recycle(a);
            scope.recycle(b);
            assert_eq!(scope.pending(), 2);
        }
        assert_eq!(pool.allocations(), 2);
        assert_eq!(pool.free_buffers(), 2);
    }

    #[test]
    fn reused_buffers_are_zeroed() {
        let mut pool = TensorPool::new();
        {
            let mut scope = pool.scope();
            let mut a = scope.zeros(Dim([8]));
            a.fill(7.0);
            scope.recycle(a);
        }
        let mut scope = pool.scope();
        let a = scope.zeros(Dim([2, 3]));
        assert!(a.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn released_on_error() {
        fn frame(pool: &mut TensorPool) -> anyhow::Result<()> {
            let mut scope = pool.scope();
            let crop = scope.zeros(Dim([16, 16, 3]));
            scope.recycle(crop);
            anyhow::bail!("inference failed");
        }

        let mut pool = TensorPool::new();
        assert!(frame(&mut pool).is_err());
        assert_eq!(pool.free_buffers(), 1);
        assert!(frame(&mut pool).is_err());
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn pool_is_bounded() {
        let mut pool = TensorPool::with_max_free(3);
        let mut scope = pool.scope();
        for len in 1..=10 {
            let t = scope.zeros(Dim([len]));
            scope.recycle(t);
        }
        drop(scope);
        assert_eq!(pool.free_buffers(), 3);
    }
}
