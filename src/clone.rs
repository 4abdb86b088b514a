//! Fan-out of one source to independent consumers.
//!
//! All clones of a source share one [`History`]: every item is read from the
//! source exactly once and appended to the history, and each clone keeps its
//! own cursor into it. A slow clone never causes a re-read and a fast clone
//! never makes a slow one skip items.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use crate::core::iterator::{Link, Node, Stage, WeakIterator};
use crate::core::properties::{PropertyCallback, PropertyValue};
use crate::core::{AsyncIterator, State, Subscription};
use crate::error::{Error, Result};

/// Items read so far from a cloned source, shared by all its clones.
pub(crate) struct History<T: 'static> {
    source: WeakIterator<T>,
    items: RefCell<Vec<T>>,
    readers: RefCell<Vec<Weak<ClonedNode<T>>>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl<T: Clone + 'static> History<T> {
    /// The history of `source`, created on first use.
    fn of(source: &AsyncIterator<T>) -> Result<Rc<Self>> {
        if let Some(history) = source.history() {
            return Ok(history);
        }
        let history = Rc::new(History {
            source: source.downgrade(),
            items: RefCell::new(Vec::new()),
            readers: RefCell::new(Vec::new()),
            subscriptions: RefCell::new(Vec::new()),
        });
        source.attach(Link::Clones(history.clone()))?;

        let readable = Rc::downgrade(&history);
        let errored = Rc::downgrade(&history);
        let subscriptions = vec![
            source.on_readable(move || {
                if let Some(history) = readable.upgrade() {
                    history.notify_readable();
                }
            }),
            source.on_error(move |error| {
                if let Some(history) = errored.upgrade() {
                    history.notify_error(error);
                }
            }),
        ];
        *history.subscriptions.borrow_mut() = subscriptions;
        let terminated = Rc::downgrade(&history);
        source.on_terminate(move || {
            if let Some(history) = terminated.upgrade() {
                history.notify_terminated();
            }
        });
        Ok(history)
    }

    fn readers(&self) -> Vec<Rc<ClonedNode<T>>> {
        self.readers
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn notify_readable(&self) {
        for reader in self.readers() {
            handle(&reader).set_readable(true);
        }
    }

    fn notify_error(&self, error: &Error) {
        for reader in self.readers() {
            handle(&reader).emit_error(error.clone());
        }
    }

    /// The source is done: readers that saw everything close, the others
    /// get to read the rest of the history.
    fn notify_terminated(&self) {
        let len = self.len();
        for reader in self.readers() {
            let it = handle(&reader);
            if reader.stage.position.get() >= len {
                it.close();
            } else {
                it.set_readable(true);
            }
        }
    }

    /// The item at `position`, reading it from the source if needed.
    fn read_at(&self, position: usize) -> Option<T> {
        if let Some(item) = self.items.borrow().get(position) {
            return Some(item.clone());
        }
        let source = self.source.upgrade()?;
        let item = source.read()?;
        self.items.borrow_mut().push(item.clone());
        self.notify_readable();
        Some(item)
    }

    /// Whether a reader at `position` has seen everything.
    fn is_exhausted_at(&self, position: usize) -> bool {
        position >= self.items.borrow().len()
            && self.source.upgrade().map_or(true, |source| source.is_done())
    }

    fn register(&self, reader: &Rc<ClonedNode<T>>) {
        self.readers.borrow_mut().push(Rc::downgrade(reader));
    }

    /// Forget a terminated reader; the last one to leave releases the source.
    fn unregister(&self, reader: &Rc<ClonedNode<T>>) {
        let remaining = {
            let mut readers = self.readers.borrow_mut();
            readers.retain(|weak| weak.upgrade().map_or(false, |it| !Rc::ptr_eq(&it, reader)));
            readers.len()
        };
        if remaining > 0 {
            return;
        }
        let Some(source) = self.source.upgrade() else { return };
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        for subscription in &subscriptions {
            source.unsubscribe(subscription);
        }
        source.detach();
        if !source.is_done() {
            tracing::debug!(source = %source, "last clone terminated, releasing source");
            source.destroy();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.borrow().len()
    }
}

/// Stage of a clone: a cursor into the shared history.
pub(crate) struct Cloned<T: 'static> {
    source: AsyncIterator<T>,
    history: Rc<History<T>>,
    position: Cell<usize>,
}

type ClonedNode<T> = Node<T, Cloned<T>>;

fn handle<T: Clone + 'static>(node: &Rc<ClonedNode<T>>) -> AsyncIterator<T> {
    AsyncIterator::from_node(node.clone())
}

impl<T: Clone + 'static> Stage<T> for Cloned<T> {
    fn name(_: &Node<T, Self>) -> &'static str {
        "ClonedIterator"
    }

    fn read(node: &Rc<Node<T, Self>>) -> Option<T> {
        let stage = &node.stage;
        let position = stage.position.get();
        match stage.history.read_at(position) {
            Some(item) => {
                stage.position.set(position + 1);
                Some(item)
            }
            None => {
                let it = handle(node);
                it.set_readable(false);
                if stage.history.is_exhausted_at(position) {
                    it.close();
                }
                None
            }
        }
    }

    fn end(node: &Rc<Node<T, Self>>, destroy: bool) {
        if handle(node).base_end(destroy) {
            node.stage.history.unregister(node);
        }
    }

    fn details(node: &Node<T, Self>) -> Option<String> {
        Some(format!("{{source: {}}}", node.stage.source))
    }

    fn property(node: &Rc<Node<T, Self>>, name: &str) -> Option<PropertyValue> {
        let own = node.core.properties.borrow().get(name);
        own.or_else(|| node.stage.source.property_value(name))
    }

    fn on_property(node: &Rc<Node<T, Self>>, name: &str, callback: PropertyCallback) {
        if node.core.properties.borrow().contains(name) {
            node.core.on_property(name, callback);
            return;
        }
        // whichever of the clone and the source provides the value first wins
        let slot = Rc::new(RefCell::new(Some(callback)));
        let own = slot.clone();
        node.core.on_property(
            name,
            Box::new(move |value| {
                if let Some(callback) = own.borrow_mut().take() {
                    callback(value);
                }
            }),
        );
        node.stage.source.on_property(name, move |value| {
            if let Some(callback) = slot.borrow_mut().take() {
                callback(value);
            }
        });
    }

    fn properties(node: &Rc<Node<T, Self>>) -> HashMap<String, PropertyValue> {
        let mut properties = node.stage.source.get_properties();
        properties.extend(node.core.properties.borrow().snapshot());
        properties
    }
}

/// An independent consumer of a shared source.
///
/// Closing or destroying a clone leaves its siblings and the source alone;
/// once every clone has terminated, the source is destroyed. Properties of
/// the source are visible through every clone, while properties set on a
/// clone shadow them for that clone only.
pub struct ClonedIterator<T: 'static> {
    node: Rc<ClonedNode<T>>,
    iterator: AsyncIterator<T>,
}

impl<T: Clone + 'static> ClonedIterator<T> {
    /// Create a clone of `source`.
    ///
    /// Fails when `source` is already consumed by something other than
    /// clones.
    pub fn new(source: &AsyncIterator<T>) -> Result<Self> {
        let history = History::of(source)?;
        let node = Node::new(
            State::Open,
            Cloned {
                source: source.clone(),
                history: history.clone(),
                position: Cell::new(0),
            },
        );
        history.register(&node);
        let iterator = handle(&node);
        iterator.set_readable(true);
        Ok(Self { node, iterator })
    }

    /// The shared source
    pub fn source(&self) -> AsyncIterator<T> {
        self.node.stage.source.clone()
    }

    /// Number of items this clone has read
    pub fn position(&self) -> usize {
        self.node.stage.position.get()
    }

    /// The underlying iterator handle
    pub fn into_iterator(self) -> AsyncIterator<T> {
        self.iterator
    }
}

impl<T: 'static> Deref for ClonedIterator<T> {
    type Target = AsyncIterator<T>;

    fn deref(&self) -> &Self::Target {
        &self.iterator
    }
}

impl<T: 'static> From<ClonedIterator<T>> for AsyncIterator<T> {
    fn from(clone: ClonedIterator<T>) -> Self {
        clone.iterator
    }
}

impl<T: Clone + 'static> AsyncIterator<T> {
    /// Create an independent clone of this iterator.
    ///
    /// All clones of the same iterator share what was read from it; the
    /// iterator itself must not be consumed by anything else.
    pub fn fork(&self) -> Result<AsyncIterator<T>> {
        ClonedIterator::new(self).map(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BufferOptions;
    use crate::scheduler::{block_on, run_until_stalled};
    use crate::sources::{from_iter, pushable, range};

    fn drain<T: Clone + 'static>(it: &AsyncIterator<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = it.read() {
            items.push(item);
        }
        items
    }

    #[test]
    fn test_clones_read_independently() {
        let source = from_iter(vec!["a", "b"]);
        let first = ClonedIterator::new(&source).unwrap();
        let second = ClonedIterator::new(&source).unwrap();

        assert_eq!(drain(&first), vec!["a", "b"]);
        assert_eq!(second.position(), 0);
        assert_eq!(drain(&second), vec!["a", "b"]);
        run_until_stalled();
        assert!(first.is_ended());
        assert!(second.is_ended());
    }

    #[test]
    fn test_clones_interleaved() {
        let source = range(1, 3);
        let first = source.fork().unwrap();
        let second = source.fork().unwrap();
        assert_eq!(first.read(), Some(1));
        assert_eq!(second.read(), Some(1));
        assert_eq!(second.read(), Some(2));
        assert_eq!(first.read(), Some(2));
        assert_eq!(block_on(first.to_vec()).unwrap(), vec![3]);
        assert_eq!(block_on(second.to_vec()).unwrap(), vec![3]);
    }

    #[test]
    fn test_each_item_is_read_from_the_source_once() {
        let source = range(1, 4);
        let first = ClonedIterator::new(&source).unwrap();
        let second = ClonedIterator::new(&source).unwrap();
        let history = source.history().unwrap();
        assert_eq!(block_on(first.to_vec()).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(block_on(second.to_vec()).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(history.len(), 4);
        assert!(!source.has_destination());
    }

    #[test]
    fn test_cannot_clone_connected_source() {
        let source = range(1, 3);
        let _mapped = source.map(|x| x * 2).unwrap();
        assert!(matches!(source.fork(), Err(Error::AlreadyConnected)));
    }

    #[test]
    fn test_terminating_one_clone_keeps_siblings() {
        let source = range(1, 10);
        let first = source.fork().unwrap();
        let second = source.fork().unwrap();
        first.destroy();
        assert!(!source.is_done());
        assert_eq!(second.read(), Some(1));

        second.destroy();
        assert!(source.is_destroyed());
        assert!(!source.has_destination());
    }

    #[test]
    fn test_clones_wait_for_slow_source() {
        let (pusher, source) = pushable::<i32>(BufferOptions::default());
        let first = source.fork().unwrap();
        let second = source.fork().unwrap();
        run_until_stalled();
        assert_eq!(first.read(), None);
        assert!(!first.readable());

        pusher.push(5);
        run_until_stalled();
        assert!(first.readable());
        assert_eq!(first.read(), Some(5));
        assert!(second.readable());
        pusher.close();
        assert_eq!(block_on(second.to_vec()).unwrap(), vec![5]);
        assert_eq!(block_on(first.to_vec()).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn test_errors_reach_every_clone() {
        let (pusher, source) = pushable::<i32>(BufferOptions::default());
        let clones = [source.fork().unwrap(), source.fork().unwrap()];
        let errors = Rc::new(Cell::new(0));
        for clone in &clones {
            let seen = errors.clone();
            clone.on_error(move |_| seen.set(seen.get() + 1));
        }
        pusher.error(Error::custom("shared failure"));
        assert_eq!(errors.get(), 2);
    }

    #[test]
    fn test_properties_are_shadowed_per_clone() {
        let source = range(1, 3);
        let first = source.fork().unwrap();
        let second = source.fork().unwrap();
        source.set_property("origin", "source".to_string());
        first.set_property("origin", "first".to_string());
        first.set_property("own", 1i64);

        assert_eq!(first.get_property::<String>("origin").as_deref(), Some("first"));
        assert_eq!(second.get_property::<String>("origin").as_deref(), Some("source"));
        assert_eq!(source.get_property::<String>("origin").as_deref(), Some("source"));
        assert_eq!(second.get_property::<i64>("own"), None);
        assert_eq!(source.get_property::<i64>("own"), None);

        let merged = first.get_properties();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["origin"].get::<String>().as_deref(), Some("first"));
    }

    #[test]
    fn test_property_callback_fires_once() {
        let source = range(1, 3);
        let clone = source.fork().unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = calls.clone();
        clone.on_property("p", move |value| seen.borrow_mut().push(value.get::<i64>()));

        source.set_property("p", 1i64);
        clone.set_property("p", 2i64);
        run_until_stalled();
        assert_eq!(*calls.borrow(), vec![Some(1)]);
    }

    #[test]
    fn test_display_shows_source() {
        let source = from_iter(vec![1, 2]);
        let clone = source.fork().unwrap();
        assert_eq!(clone.to_string(), "[ClonedIterator {source: [ArrayIterator (2)]}]");
    }
}
