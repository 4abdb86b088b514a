//! Configuration accepted by iterator constructors.

/// Default number of items a buffered iterator tries to keep ready
pub const DEFAULT_BUFFER_SIZE: usize = 4;

/// Buffering configuration shared by every buffered iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferOptions {
    /// Number of items to read ahead; `usize::MAX` means unbounded
    pub max_buffer_size: usize,
    /// Whether to start generating items immediately instead of on first read
    pub auto_start: bool,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            max_buffer_size: DEFAULT_BUFFER_SIZE,
            auto_start: true,
        }
    }
}

impl BufferOptions {
    /// Options with an unbounded buffer
    pub fn unbounded() -> Self {
        Self::default().max_buffer_size(usize::MAX)
    }

    /// Set the read-ahead size; zero is treated as one
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set whether to start generating items immediately
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub(crate) fn capacity(&self) -> usize {
        self.max_buffer_size.max(1)
    }
}

/// Configuration of a [`UnionIterator`](crate::union::UnionIterator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnionOptions {
    /// Buffering of the merged output
    pub buffer: BufferOptions,
    /// Whether sources still running are destroyed when the union terminates
    pub destroy_sources: bool,
}

impl Default for UnionOptions {
    fn default() -> Self {
        Self {
            buffer: BufferOptions::default(),
            destroy_sources: true,
        }
    }
}

impl UnionOptions {
    /// Set the buffering options
    pub fn buffer(mut self, buffer: BufferOptions) -> Self {
        self.buffer = buffer;
        self
    }

    /// Set the read-ahead size
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.buffer.max_buffer_size = size;
        self
    }

    /// Set whether to start merging immediately
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.buffer.auto_start = auto_start;
        self
    }

    /// Set whether remaining sources are destroyed on termination
    pub fn destroy_sources(mut self, destroy: bool) -> Self {
        self.destroy_sources = destroy;
        self
    }
}

pub use crate::processors::TransformOptions;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_defaults() {
        let options = BufferOptions::default();
        assert_eq!(options.max_buffer_size, 4);
        assert!(options.auto_start);
        assert_eq!(BufferOptions::unbounded().max_buffer_size, usize::MAX);
    }

    #[test]
    fn test_zero_capacity_means_one() {
        assert_eq!(BufferOptions::default().max_buffer_size(0).capacity(), 1);
    }

    #[test]
    fn test_union_builder() {
        let options = UnionOptions::default()
            .max_buffer_size(8)
            .auto_start(false)
            .destroy_sources(false);
        assert_eq!(options.buffer.max_buffer_size, 8);
        assert!(!options.buffer.auto_start);
        assert!(!options.destroy_sources);
    }
}
