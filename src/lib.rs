//! # Lazy asynchronous sequences for Rust
//!
//! This crate provides composable, pull-based sequences that can also be
//! consumed push-style. Every sequence is an [`AsyncIterator`]: a handle that
//! produces items on demand, signals when it may be read, and moves through a
//! small lifecycle (`Init`, `Open`, `Closing`, `Closed`, `Ended`,
//! `Destroyed`).
//!
//! ## Core Concepts
//!
//! - **Sources**: in-memory collections, integer ranges, pushable channels
//!   and async streams
//! - **Buffering**: derived iterators read ahead into a bounded buffer
//! - **Transforms**: map, filter, skip, take, prepend, append and custom
//!   one-to-many steps over a single owned source
//! - **Clones**: independent cursors over one shared source
//! - **Unions**: fair round-robin merging of many sources
//!
//! All asynchrony runs on a single thread through the scheduler hook in
//! [`scheduler`].
//!
//! ## Example
//!
//! ```rust
//! use asyncseq::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let odd_squares = range(1, 10)
//!         .map(|x| x * x)?
//!         .filter(|x| x % 2 == 1)?;
//!
//!     let items = block_on(odd_squares.to_vec())?;
//!     assert_eq!(items, vec![1, 9, 25, 49, 81]);
//!     Ok(())
//! }
//! ```

pub mod clone;
pub mod core;
pub mod error;
pub mod options;
pub mod processors;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod union;

// Re-export commonly used items
pub mod prelude {
    pub use crate::clone::ClonedIterator;
    pub use crate::core::{
        AsyncIterator, BufferedIterator, Emitter, Generator, PropertyValue, Signal, State,
        Subscription,
    };
    pub use crate::error::{Error, Result};
    pub use crate::options::{BufferOptions, TransformOptions, UnionOptions};
    pub use crate::processors::{
        Count, Inserter, MultiTransformIterator, MultiTransformOptions, TransformIterator,
    };
    pub use crate::scheduler::{block_on, run_until_stalled};
    pub use crate::sources::{
        empty, from_iter, from_stream, integers, pushable, range, single, Pusher, SourceExpr,
    };
    pub use crate::union::{UnionIterator, UnionSources};
}

// Re-export main types
pub use crate::core::{AsyncIterator, Signal, State};
pub use error::{Error, Result};

// Feature flags for optional dependencies
#[cfg(feature = "metrics")]
pub mod metrics;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
