//! Core types of the asyncseq library.
//!
//! This module contains the iterator handle with its lifecycle state machine,
//! the typed notification channels, the property bag and the buffering engine
//! every derived iterator is built on.

pub mod buffered;
pub mod events;
pub(crate) mod iterator;
pub mod properties;
pub mod state;

// Re-export core items
pub use buffered::{BufferedIterator, Emitter, Generator};
pub use events::{Signal, Subscription};
pub use iterator::AsyncIterator;
pub use properties::PropertyValue;
pub use state::State;
