//! The iterator handle and its lifecycle.
//!
//! An [`AsyncIterator`] is a reference-counted handle to a node made of a
//! shared [`Core`] (state, readability, subscribers, properties, destination)
//! and a stage that decides how items are produced. Stages plug into the core
//! through the [`Stage`] trait; the handle erases the stage type behind the
//! object-safe [`Iterate`] trait.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::clone::History;
use crate::core::events::{Listeners, Signal, Subscription};
use crate::core::properties::{PropertyBag, PropertyCallback, PropertyValue};
use crate::core::state::State;
use crate::error::{Error, Result};
use crate::scheduler::schedule_task;

/// What currently consumes an iterator.
pub(crate) enum Link<T: 'static> {
    /// A single downstream stage
    Stage,
    /// A clone group replaying a shared history
    Clones(Rc<History<T>>),
}

/// State shared by every kind of iterator.
pub(crate) struct Core<T: 'static> {
    state: Cell<State>,
    readable: Cell<bool>,
    draining: Cell<bool>,
    listeners: RefCell<Listeners<T>>,
    pub(crate) properties: RefCell<PropertyBag>,
    link: RefCell<Option<Link<T>>>,
    terminators: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl<T: 'static> Core<T> {
    pub(crate) fn new(state: State) -> Self {
        Self {
            state: Cell::new(state),
            readable: Cell::new(false),
            draining: Cell::new(false),
            listeners: RefCell::new(Listeners::new()),
            properties: RefCell::new(PropertyBag::default()),
            link: RefCell::new(None),
            terminators: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state.get()
    }

    /// Deliver a property to `callback` now if known, or once it is set.
    pub(crate) fn on_property(&self, name: &str, callback: PropertyCallback) {
        let known = self.properties.borrow().get(name);
        match known {
            Some(value) => schedule_task(move || callback(value)),
            None => self.properties.borrow_mut().wait(name, callback),
        }
    }
}

/// A core together with the stage driving it.
pub(crate) struct Node<T: 'static, S> {
    pub(crate) core: Core<T>,
    pub(crate) stage: S,
}

impl<T: 'static, S> Node<T, S> {
    pub(crate) fn new(state: State, stage: S) -> Rc<Self> {
        Rc::new(Node {
            core: Core::new(state),
            stage,
        })
    }
}

/// Completion callback of a stage's destroy hook, optionally reporting an error.
pub(crate) type DestroyDone = Box<dyn FnOnce(Option<Error>)>;

/// How a concrete kind of iterator produces items and tears down.
///
/// Defaults implement the behaviour of a plain iterator; stages override what
/// they need.
pub(crate) trait Stage<T: Clone + 'static>: Sized + 'static {
    fn name(node: &Node<T, Self>) -> &'static str;

    fn read(node: &Rc<Node<T, Self>>) -> Option<T>;

    fn close(node: &Rc<Node<T, Self>>) {
        AsyncIterator::from_node(node.clone()).base_close();
    }

    fn destroy(node: &Rc<Node<T, Self>>, cause: Option<&Error>, done: DestroyDone) {
        let _ = (node, cause);
        done(None);
    }

    fn end(node: &Rc<Node<T, Self>>, destroy: bool) {
        AsyncIterator::from_node(node.clone()).base_end(destroy);
    }

    fn details(node: &Node<T, Self>) -> Option<String> {
        let _ = node;
        None
    }

    fn property(node: &Rc<Node<T, Self>>, name: &str) -> Option<PropertyValue> {
        node.core.properties.borrow().get(name)
    }

    fn on_property(node: &Rc<Node<T, Self>>, name: &str, callback: PropertyCallback) {
        node.core.on_property(name, callback);
    }

    fn properties(node: &Rc<Node<T, Self>>) -> HashMap<String, PropertyValue> {
        node.core.properties.borrow().snapshot()
    }

    fn max_buffer_size(node: &Node<T, Self>) -> Option<usize> {
        let _ = node;
        None
    }

    fn set_max_buffer_size(node: &Rc<Node<T, Self>>, size: usize) {
        let _ = (node, size);
    }
}

/// Object-safe view of a node, used by the handle.
pub(crate) trait Iterate<T: 'static> {
    fn core(&self) -> &Core<T>;
    fn name(&self) -> &'static str;
    fn details(&self) -> Option<String>;
    fn read(self: Rc<Self>) -> Option<T>;
    fn close(self: Rc<Self>);
    fn destroy(self: Rc<Self>, cause: Option<&Error>, done: DestroyDone);
    fn end(self: Rc<Self>, destroy: bool);
    fn property(self: Rc<Self>, name: &str) -> Option<PropertyValue>;
    fn on_property(self: Rc<Self>, name: &str, callback: PropertyCallback);
    fn properties(self: Rc<Self>) -> HashMap<String, PropertyValue>;
    fn max_buffer_size(&self) -> Option<usize>;
    fn set_max_buffer_size(self: Rc<Self>, size: usize);
}

impl<T: Clone + 'static, S: Stage<T>> Iterate<T> for Node<T, S> {
    fn core(&self) -> &Core<T> {
        &self.core
    }

    fn name(&self) -> &'static str {
        S::name(self)
    }

    fn details(&self) -> Option<String> {
        S::details(self)
    }

    fn read(self: Rc<Self>) -> Option<T> {
        S::read(&self)
    }

    fn close(self: Rc<Self>) {
        S::close(&self)
    }

    fn destroy(self: Rc<Self>, cause: Option<&Error>, done: DestroyDone) {
        S::destroy(&self, cause, done)
    }

    fn end(self: Rc<Self>, destroy: bool) {
        S::end(&self, destroy)
    }

    fn property(self: Rc<Self>, name: &str) -> Option<PropertyValue> {
        S::property(&self, name)
    }

    fn on_property(self: Rc<Self>, name: &str, callback: PropertyCallback) {
        S::on_property(&self, name, callback)
    }

    fn properties(self: Rc<Self>) -> HashMap<String, PropertyValue> {
        S::properties(&self)
    }

    fn max_buffer_size(&self) -> Option<usize> {
        S::max_buffer_size(self)
    }

    fn set_max_buffer_size(self: Rc<Self>, size: usize) {
        S::set_max_buffer_size(&self, size)
    }
}

/// Stage of a bare iterator that never produces items by itself.
pub(crate) struct Bare;

impl<T: Clone + 'static> Stage<T> for Bare {
    fn name(_: &Node<T, Self>) -> &'static str {
        "AsyncIterator"
    }

    fn read(_: &Rc<Node<T, Self>>) -> Option<T> {
        None
    }
}

/// A lazy, possibly asynchronous sequence of items.
///
/// Items are pulled with [`read`](AsyncIterator::read), which never blocks and
/// returns `None` when no item is available right now. Subscribing with
/// [`on_data`](AsyncIterator::on_data) switches the iterator to push mode, in
/// which it drains itself one item per turn until the last data subscriber
/// leaves.
///
/// Cloning the handle yields another reference to the same iterator; use
/// [`fork`](AsyncIterator::fork) for independent consumers.
pub struct AsyncIterator<T: 'static> {
    node: Rc<dyn Iterate<T>>,
}

impl<T: 'static> Clone for AsyncIterator<T> {
    fn clone(&self) -> Self {
        AsyncIterator {
            node: self.node.clone(),
        }
    }
}

/// A non-owning reference to an iterator.
pub(crate) struct WeakIterator<T: 'static> {
    node: Weak<dyn Iterate<T>>,
}

impl<T: 'static> Clone for WeakIterator<T> {
    fn clone(&self) -> Self {
        WeakIterator {
            node: self.node.clone(),
        }
    }
}

impl<T: 'static> WeakIterator<T> {
    pub(crate) fn upgrade(&self) -> Option<AsyncIterator<T>> {
        self.node.upgrade().map(|node| AsyncIterator { node })
    }
}

impl<T: 'static> AsyncIterator<T> {
    pub(crate) fn core(&self) -> &Core<T> {
        self.node.core()
    }

    pub(crate) fn downgrade(&self) -> WeakIterator<T> {
        WeakIterator {
            node: Rc::downgrade(&self.node),
        }
    }

    /// Whether both handles refer to the same iterator
    pub fn ptr_eq(&self, other: &AsyncIterator<T>) -> bool {
        std::ptr::eq(
            Rc::as_ptr(&self.node) as *const (),
            Rc::as_ptr(&other.node) as *const (),
        )
    }

    /// The current lifecycle state
    pub fn state(&self) -> State {
        self.core().state()
    }

    /// Whether a call to `read` may currently succeed
    pub fn readable(&self) -> bool {
        self.core().readable.get()
    }

    /// Whether no new items will be produced
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Whether the iterator ended normally
    pub fn is_ended(&self) -> bool {
        self.state() == State::Ended
    }

    /// Whether the iterator was destroyed
    pub fn is_destroyed(&self) -> bool {
        self.state() == State::Destroyed
    }

    /// Whether the iterator reached a terminal state
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Remove a subscription. Removing the last data subscriber returns the
    /// iterator to pull mode.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.core().listeners.borrow_mut().remove(subscription)
    }

    /// Number of active subscribers for `signal`
    pub fn subscriber_count(&self, signal: Signal) -> usize {
        self.core().listeners.borrow().count(signal)
    }
}

impl<T: Clone + 'static> AsyncIterator<T> {
    /// Create a bare iterator: open, never readable unless told so, and
    /// producing no items.
    pub fn new() -> Self {
        Self::from_node(Node::new(State::Open, Bare))
    }

    pub(crate) fn from_node<S: Stage<T>>(node: Rc<Node<T, S>>) -> Self {
        AsyncIterator { node }
    }

    /// Read the next item, or `None` if no item is available right now.
    pub fn read(&self) -> Option<T> {
        if self.is_done() {
            return None;
        }
        let item = self.node.clone().read();
        #[cfg(feature = "metrics")]
        if item.is_some() {
            crate::metrics::record_read();
        }
        item
    }

    /// Mark the iterator readable or not.
    ///
    /// Becoming readable notifies readable subscribers on a later turn. Has no
    /// effect once the iterator is done.
    pub fn set_readable(&self, readable: bool) {
        let readable = readable && !self.is_done();
        let core = self.core();
        if core.readable.get() != readable {
            core.readable.set(readable);
            if readable {
                let it = self.clone();
                schedule_task(move || it.emit_readable());
            }
        }
    }

    /// Stop producing new items; ends once the remaining items are read.
    pub fn close(&self) {
        self.node.clone().close();
    }

    /// Stop immediately and release resources.
    pub fn destroy(&self) {
        self.destroy_cause(None);
    }

    /// Stop immediately, reporting `error` to error subscribers first.
    pub fn destroy_with(&self, error: Error) {
        self.destroy_cause(Some(error));
    }

    pub(crate) fn destroy_cause(&self, cause: Option<Error>) {
        if self.is_done() {
            return;
        }
        let it = self.clone();
        let given = cause.clone();
        self.node.clone().destroy(
            cause.as_ref(),
            Box::new(move |error| {
                if let Some(error) = given.or(error) {
                    it.emit_error(error);
                }
                it.node.clone().end(true);
            }),
        );
    }

    /// Report an error to error subscribers.
    ///
    /// Errors raised after termination are dropped; errors nobody subscribed
    /// to are logged.
    pub fn emit_error(&self, error: Error) {
        if self.is_done() {
            tracing::debug!(iterator = self.node.name(), %error, "dropping error raised after termination");
            return;
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_error();
        let callbacks = self.core().listeners.borrow().error();
        if callbacks.is_empty() {
            tracing::error!(iterator = self.node.name(), %error, "unhandled iterator error");
            return;
        }
        for callback in callbacks {
            callback(&error);
        }
    }

    pub(crate) fn change_state(&self, next: State) -> bool {
        let core = self.core();
        let current = core.state.get();
        let valid = current.can_become(next);
        if valid {
            core.state.set(next);
            tracing::trace!(iterator = self.node.name(), from = %current, to = %next, "state change");
        }
        valid
    }

    /// Close a plain iterator: CLOSED now, ENDED on the next turn.
    pub(crate) fn base_close(&self) {
        if self.change_state(State::Closed) {
            self.end_async();
        }
    }

    /// Enter a terminal state and detach every subscriber.
    pub(crate) fn base_end(&self, destroy: bool) -> bool {
        let next = if destroy {
            State::Destroyed
        } else {
            State::Ended
        };
        if !self.change_state(next) {
            return false;
        }
        let core = self.core();
        core.readable.set(false);
        let ends = {
            let mut listeners = core.listeners.borrow_mut();
            let ends = if destroy { Vec::new() } else { listeners.end() };
            listeners.clear();
            ends
        };
        for callback in ends {
            callback();
        }
        let terminators = std::mem::take(&mut *core.terminators.borrow_mut());
        for terminate in terminators {
            terminate();
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_terminated(destroy);
        true
    }

    pub(crate) fn end_async(&self) {
        let it = self.clone();
        schedule_task(move || it.node.clone().end(false));
    }

    /// Run `callback` once the iterator is ENDED or DESTROYED.
    pub(crate) fn on_terminate<F: FnOnce() + 'static>(&self, callback: F) {
        if self.is_done() {
            schedule_task(callback);
        } else {
            self.core().terminators.borrow_mut().push(Box::new(callback));
        }
    }

    /// Be notified when the iterator may have become readable.
    pub fn on_readable<F: Fn() + 'static>(&self, callback: F) -> Subscription {
        self.core()
            .listeners
            .borrow_mut()
            .add_readable(Rc::new(callback))
    }

    /// Receive every item; switches the iterator to push mode.
    pub fn on_data<F: Fn(T) + 'static>(&self, callback: F) -> Subscription {
        let sub = self.core().listeners.borrow_mut().add_data(Rc::new(callback));
        if self.readable() {
            self.start_drain(false);
        }
        sub
    }

    /// Be notified once the iterator has ended.
    pub fn on_end<F: Fn() + 'static>(&self, callback: F) -> Subscription {
        self.core().listeners.borrow_mut().add_end(Rc::new(callback))
    }

    /// Be notified of errors.
    pub fn on_error<F: Fn(&Error) + 'static>(&self, callback: F) -> Subscription {
        self.core().listeners.borrow_mut().add_error(Rc::new(callback))
    }

    fn has_data_subscribers(&self) -> bool {
        self.subscriber_count(Signal::Data) > 0
    }

    fn emit_readable(&self) {
        if self.is_done() {
            return;
        }
        let callbacks = self.core().listeners.borrow().readable();
        for callback in callbacks {
            callback();
        }
        if self.has_data_subscribers() {
            self.start_drain(true);
        }
    }

    /// Start the push-mode loop unless one is already pending.
    fn start_drain(&self, immediate: bool) {
        if self.core().draining.replace(true) {
            return;
        }
        if immediate {
            self.drain_step();
        } else {
            let it = self.clone();
            schedule_task(move || it.drain_step());
        }
    }

    /// Emit one item, then yield before emitting the next.
    fn drain_step(&self) {
        self.core().draining.set(false);
        if self.is_done() || !self.has_data_subscribers() {
            return;
        }
        if let Some(item) = self.read() {
            self.emit_data(item);
            if !self.is_done() && self.has_data_subscribers() {
                self.start_drain(false);
            }
        }
    }

    pub(crate) fn emit_data(&self, item: T) {
        let callbacks = self.core().listeners.borrow().data();
        if let Some((last, rest)) = callbacks.split_last() {
            for callback in rest {
                callback(item.clone());
            }
            last(item);
        }
    }

    /// Whether another iterator consumes this one
    pub fn has_destination(&self) -> bool {
        self.core().link.borrow().is_some()
    }

    pub(crate) fn attach(&self, link: Link<T>) -> Result<()> {
        let mut slot = self.core().link.borrow_mut();
        if slot.is_some() {
            return Err(Error::AlreadyConnected);
        }
        *slot = Some(link);
        Ok(())
    }

    pub(crate) fn detach(&self) {
        self.core().link.borrow_mut().take();
    }

    pub(crate) fn history(&self) -> Option<Rc<History<T>>> {
        match &*self.core().link.borrow() {
            Some(Link::Clones(history)) => Some(history.clone()),
            _ => None,
        }
    }

    /// Set a property, notifying callbacks waiting for it on a later turn.
    pub fn set_property<V: Any>(&self, name: &str, value: V) {
        self.set_property_value(name, PropertyValue::new(value));
    }

    /// Set an already wrapped property value.
    pub fn set_property_value(&self, name: &str, value: PropertyValue) {
        let waiters = self.core().properties.borrow_mut().set(name, value.clone());
        if !waiters.is_empty() {
            schedule_task(move || {
                for waiter in waiters {
                    waiter(value.clone());
                }
            });
        }
    }

    /// Set several properties at once.
    pub fn set_properties(&self, properties: HashMap<String, PropertyValue>) {
        for (name, value) in properties {
            self.set_property_value(&name, value);
        }
    }

    /// The current value of a property.
    pub fn property_value(&self, name: &str) -> Option<PropertyValue> {
        self.node.clone().property(name)
    }

    /// The current value of a property, if it has type `V`.
    pub fn get_property<V: Any + Clone>(&self, name: &str) -> Option<V> {
        self.property_value(name).and_then(|value| value.get::<V>())
    }

    /// Receive the value of a property on a later turn, as soon as it is set.
    pub fn on_property<F: FnOnce(PropertyValue) + 'static>(&self, name: &str, callback: F) {
        self.node.clone().on_property(name, Box::new(callback));
    }

    /// A snapshot of all properties.
    pub fn get_properties(&self) -> HashMap<String, PropertyValue> {
        self.node.clone().properties()
    }

    /// Copy the named properties from `source` once they become available.
    pub fn copy_properties<U: Clone + 'static>(&self, source: &AsyncIterator<U>, names: &[&str]) {
        for name in names {
            let target = self.clone();
            let key = name.to_string();
            source.on_property(name, move |value| target.set_property_value(&key, value));
        }
    }

    /// The buffer capacity of buffered iterators
    pub fn max_buffer_size(&self) -> Option<usize> {
        self.node.max_buffer_size()
    }

    /// Change the buffer capacity of a buffered iterator; ignored otherwise.
    pub fn set_max_buffer_size(&self, size: usize) {
        self.node.clone().set_max_buffer_size(size);
    }
}

impl<T: Clone + 'static> Default for AsyncIterator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> fmt::Display for AsyncIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node.details() {
            Some(details) => write!(f, "[{} {}]", self.node.name(), details),
            None => write!(f, "[{}]", self.node.name()),
        }
    }
}

impl<T: 'static> fmt::Debug for AsyncIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.node.core();
        f.debug_struct("AsyncIterator")
            .field("kind", &self.node.name())
            .field("state", &core.state())
            .field("readable", &core.readable.get())
            .finish()
    }
}
