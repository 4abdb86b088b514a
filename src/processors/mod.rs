//! Transforming iterators.
//!
//! This module provides the iterators that consume a single upstream source:
//! [`TransformIterator`], which filters, skips, limits, maps and transforms
//! items one-to-one or one-to-many, and [`MultiTransformIterator`], which
//! expands every upstream item into a whole child sequence.

pub mod combinators;
pub mod multi;

pub use combinators::Count;
pub use multi::{MultiTransformIterator, MultiTransformOptions};

use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::Rc;

use crate::core::buffered::{handle, BufferNode, Buffered, Done, Emitter, Fill};
use crate::core::iterator::Link;
use crate::core::{AsyncIterator, Subscription};
use crate::error::{Error, Result};
use crate::options::BufferOptions;
use crate::scheduler::{schedule_task, spawn_local};
use crate::sources::{IteratorFuture, SourceExpr};

/// A source that has not been connected yet.
pub(crate) enum Pending<S: 'static> {
    Empty,
    Deferred(IteratorFuture<S>),
    Factory(Box<dyn FnOnce() -> IteratorFuture<S>>),
    Loading,
}

/// The single source an iterator consumes, and its wiring.
pub(crate) struct Upstream<S: 'static> {
    source: RefCell<Option<AsyncIterator<S>>>,
    pending: RefCell<Pending<S>>,
    subscriptions: RefCell<Vec<Subscription>>,
    destroy_source: bool,
    auto_start: bool,
}

impl<S: Clone + 'static> Upstream<S> {
    pub(crate) fn new(destroy_source: bool, auto_start: bool) -> Self {
        Self {
            source: RefCell::new(None),
            pending: RefCell::new(Pending::Empty),
            subscriptions: RefCell::new(Vec::new()),
            destroy_source,
            auto_start,
        }
    }

    pub(crate) fn source(&self) -> Option<AsyncIterator<S>> {
        self.source.borrow().clone()
    }

    pub(crate) fn destroy_source(&self) -> bool {
        self.destroy_source
    }

    fn is_set(&self) -> bool {
        self.source.borrow().is_some() || !matches!(*self.pending.borrow(), Pending::Empty)
    }

    pub(crate) fn details(&self) -> String {
        match self.source.try_borrow().as_deref() {
            Ok(Some(source)) => format!("{{source: {}}}", source),
            _ => "{source: none}".to_string(),
        }
    }

    /// Disconnect from the source, destroying it if owned.
    pub(crate) fn release(&self) {
        *self.pending.borrow_mut() = Pending::Empty;
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        let source = self.source();
        if let Some(source) = source {
            for subscription in &subscriptions {
                source.unsubscribe(subscription);
            }
            source.detach();
            if self.destroy_source {
                source.destroy();
            }
        }
    }
}

/// A buffered iterator pulling from an [`Upstream`].
pub(crate) trait Pull<S: Clone + 'static, D: Clone + 'static>: Fill<D> {
    fn upstream(&self) -> &Upstream<S>;

    /// React to the end of the source.
    fn source_ended(node: &Rc<BufferNode<D, Self>>) {
        handle(node).close();
    }
}

/// Validate and install the source of `node`.
pub(crate) fn set_source<S, D, G>(node: &Rc<BufferNode<D, G>>, expr: SourceExpr<S>) -> Result<()>
where
    S: Clone + 'static,
    D: Clone + 'static,
    G: Pull<S, D>,
{
    let upstream = node.stage.fill.upstream();
    if upstream.is_set() {
        return Err(Error::SourceAlreadySet);
    }
    let pending = match expr {
        SourceExpr::Iterator(source) => return connect(node, source),
        SourceExpr::Deferred(future) => Pending::Deferred(future),
        SourceExpr::Factory(factory) => Pending::Factory(factory),
    };
    *upstream.pending.borrow_mut() = pending;
    if upstream.auto_start || node.stage.started() {
        load(node);
    }
    Ok(())
}

fn connect<S, D, G>(node: &Rc<BufferNode<D, G>>, source: AsyncIterator<S>) -> Result<()>
where
    S: Clone + 'static,
    D: Clone + 'static,
    G: Pull<S, D>,
{
    source.attach(Link::Stage)?;
    tracing::debug!(source = %source, "connecting source");

    let ended = Rc::downgrade(node);
    let readable = Rc::downgrade(node);
    let errored = Rc::downgrade(node);
    let subscriptions = vec![
        source.on_end(move || {
            if let Some(node) = ended.upgrade() {
                G::source_ended(&node);
            }
        }),
        source.on_readable(move || {
            if let Some(node) = readable.upgrade() {
                Buffered::fill_buffer(&node);
            }
        }),
        source.on_error(move |error| {
            if let Some(node) = errored.upgrade() {
                handle(&node).emit_error(error.clone());
            }
        }),
    ];
    let upstream = node.stage.fill.upstream();
    *upstream.subscriptions.borrow_mut() = subscriptions;
    *upstream.source.borrow_mut() = Some(source.clone());

    if source.is_done() {
        G::source_ended(node);
    } else if source.readable() {
        Buffered::fill_buffer(node);
    }
    Ok(())
}

/// Resolve a deferred source in the background.
pub(crate) fn load<S, D, G>(node: &Rc<BufferNode<D, G>>)
where
    S: Clone + 'static,
    D: Clone + 'static,
    G: Pull<S, D>,
{
    let upstream = node.stage.fill.upstream();
    let pending = std::mem::replace(&mut *upstream.pending.borrow_mut(), Pending::Loading);
    let future = match pending {
        Pending::Deferred(future) => future,
        Pending::Factory(factory) => factory(),
        other => {
            *upstream.pending.borrow_mut() = other;
            return;
        }
    };
    let target = Rc::downgrade(node);
    let destroy_source = upstream.destroy_source;
    spawn_local(async move {
        let resolved = future.await;
        let Some(node) = target.upgrade() else {
            if let (true, Ok(source)) = (destroy_source, &resolved) {
                source.destroy();
            }
            return;
        };
        *node.stage.fill.upstream().pending.borrow_mut() = Pending::Empty;
        let it = handle(&node);
        match resolved {
            Ok(source) if it.is_closed() => {
                tracing::debug!(iterator = %it, "source arrived after close, dropping it");
                if destroy_source {
                    source.destroy();
                }
            }
            Ok(source) => {
                if let Err(error) = connect(&node, source) {
                    it.destroy_with(error);
                }
            }
            Err(error) => it.destroy_with(error),
        }
    });
}

/// Items inserted before or after the transformed items.
pub enum Inserter<T: 'static> {
    /// A fixed list of items
    Items(Vec<T>),
    /// The items of another iterator
    Iterator(AsyncIterator<T>),
}

impl<T: 'static> From<Vec<T>> for Inserter<T> {
    fn from(items: Vec<T>) -> Self {
        Inserter::Items(items)
    }
}

impl<T: Clone + 'static> From<&[T]> for Inserter<T> {
    fn from(items: &[T]) -> Self {
        Inserter::Items(items.to_vec())
    }
}

impl<T: 'static> From<AsyncIterator<T>> for Inserter<T> {
    fn from(iterator: AsyncIterator<T>) -> Self {
        Inserter::Iterator(iterator)
    }
}

/// The per-item step of a transforming iterator; a map yielding `None`
/// produces nothing for that item.
pub(crate) enum Step<S: 'static, D: 'static> {
    Map(Rc<dyn Fn(S) -> Option<D>>),
    Transform(Rc<dyn Fn(S, Emitter<D>)>),
}

/// Configuration of a [`TransformIterator`].
///
/// Every upstream item goes through `filter`, then `offset`, then `limit`,
/// and finally the map and transform steps.
pub struct TransformOptions<S: 'static, D: 'static> {
    step: Step<S, D>,
    filter: Option<Rc<dyn Fn(&S) -> bool>>,
    offset: Count,
    limit: Count,
    passthrough: Option<Rc<dyn Fn(S) -> D>>,
    prepend: Option<Inserter<D>>,
    append: Option<Inserter<D>>,
    destroy_source: bool,
    buffer: BufferOptions,
}

impl<S: Clone + 'static, D: Clone + 'static> TransformOptions<S, D> {
    fn with_step(step: Step<S, D>) -> Self {
        Self {
            step,
            filter: None,
            offset: Count::Finite(0),
            limit: Count::Unbounded,
            passthrough: None,
            prepend: None,
            append: None,
            destroy_source: true,
            buffer: BufferOptions::default(),
        }
    }

    /// Map every item synchronously
    pub fn map<F: Fn(S) -> D + 'static>(map: F) -> Self {
        Self::with_step(Step::Map(Rc::new(move |item| Some(map(item)))))
    }

    /// Map every item synchronously; `None` produces nothing for the item
    pub fn filter_map<F: Fn(S) -> Option<D> + 'static>(map: F) -> Self {
        Self::with_step(Step::Map(Rc::new(map)))
    }

    /// Transform every item into any number of items.
    ///
    /// The step is complete once the emitter is done or dropped; the next
    /// upstream item is not transformed before that.
    pub fn transform<F: Fn(S, Emitter<D>) + 'static>(transform: F) -> Self {
        Self::with_step(Step::Transform(Rc::new(transform)))
    }

    /// Map every item, then transform the mapped value.
    ///
    /// An item mapped to `None` is not transformed and counts as producing
    /// nothing.
    pub fn map_transform<M, F, G>(map: F, transform: G) -> Self
    where
        M: 'static,
        F: Fn(S) -> Option<M> + 'static,
        G: Fn(M, Emitter<D>) + 'static,
    {
        Self::transform(move |item, emitter| {
            if let Some(mapped) = map(item) {
                transform(mapped, emitter);
            }
        })
    }

    /// Only keep items matching `filter`
    pub fn filter<F: Fn(&S) -> bool + 'static>(mut self, filter: F) -> Self {
        self.filter = Some(Rc::new(filter));
        self
    }

    /// Skip this many admitted items
    pub fn offset<C: Into<Count>>(mut self, offset: C) -> Self {
        self.offset = offset.into();
        self
    }

    /// Stop after this many admitted items
    pub fn limit<C: Into<Count>>(mut self, limit: C) -> Self {
        self.limit = limit.into();
        self
    }

    /// Emit these items before the transformed ones
    pub fn prepend<I: Into<Inserter<D>>>(mut self, items: I) -> Self {
        self.prepend = Some(items.into());
        self
    }

    /// Emit these items after the transformed ones
    pub fn append<I: Into<Inserter<D>>>(mut self, items: I) -> Self {
        self.append = Some(items.into());
        self
    }

    /// Set whether the source is destroyed when this iterator terminates
    pub fn destroy_source(mut self, destroy: bool) -> Self {
        self.destroy_source = destroy;
        self
    }

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

    /// Set whether to start reading the source immediately
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.buffer.auto_start = auto_start;
        self
    }
}

impl<T: Clone + 'static> TransformOptions<T, T> {
    /// Pass items through unchanged
    pub fn identity() -> Self {
        Self::map(|item| item)
    }

    /// Emit an item unchanged when its map or transform step produced nothing
    pub fn optional(mut self) -> Self {
        self.passthrough = Some(Rc::new(|item| item));
        self
    }
}

/// Generation routine of a [`TransformIterator`].
pub(crate) struct Transform<S: 'static, D: 'static> {
    upstream: Upstream<S>,
    step: Step<S, D>,
    filter: Option<Rc<dyn Fn(&S) -> bool>>,
    offset: Cell<usize>,
    limit: Cell<Option<usize>>,
    passthrough: Option<Rc<dyn Fn(S) -> D>>,
    prepend: RefCell<Option<Inserter<D>>>,
    append: RefCell<Option<Inserter<D>>>,
}

type TransformNode<S, D> = BufferNode<D, Transform<S, D>>;

impl<S: Clone + 'static, D: Clone + 'static> Transform<S, D> {
    /// Apply filter and offset; admitted items count towards the limit.
    fn admit(&self, item: &S) -> bool {
        if let Some(filter) = &self.filter {
            if !filter(item) {
                return false;
            }
        }
        let offset = self.offset.get();
        if offset > 0 {
            self.offset.set(offset - 1);
            return false;
        }
        if let Some(limit) = self.limit.get() {
            self.limit.set(Some(limit.saturating_sub(1)));
        }
        true
    }

    fn read_and_transform(node: &Rc<TransformNode<S, D>>, count: usize, done: Done) {
        let fill = &node.stage.fill;
        let it = handle(node);
        let source = match fill.upstream.source() {
            Some(source) if !source.is_done() => source,
            _ => return done(),
        };
        while !it.is_closed() && node.stage.pushed() < count {
            if fill.limit.get() == Some(0) {
                break;
            }
            let Some(item) = source.read() else { break };
            if !fill.admit(&item) {
                continue;
            }
            match &fill.step {
                Step::Map(map) => {
                    let original = fill.passthrough.as_ref().map(|_| item.clone());
                    match (map(item), original, &fill.passthrough) {
                        (Some(mapped), _, _) => Buffered::push(node, mapped),
                        (None, Some(item), Some(passthrough)) => {
                            Buffered::push(node, passthrough(item))
                        }
                        (None, _, _) => {}
                    }
                }
                Step::Transform(step) => {
                    let step = step.clone();
                    Self::transform_item(node, step, item, count, done);
                    return;
                }
            }
        }
        if fill.limit.get() == Some(0) {
            it.close();
        }
        done();
    }

    fn transform_item(
        node: &Rc<TransformNode<S, D>>,
        step: Rc<dyn Fn(S, Emitter<D>)>,
        item: S,
        count: usize,
        done: Done,
    ) {
        let original = node
            .stage
            .fill
            .passthrough
            .as_ref()
            .map(|passthrough| (passthrough.clone(), item.clone()));
        let produced = Rc::new(Cell::new(0usize));
        let counter = produced.clone();
        let target = Rc::downgrade(node);
        let push: Rc<dyn Fn(D)> = Rc::new(move |output| {
            counter.set(counter.get() + 1);
            if let Some(node) = target.upgrade() {
                Buffered::push(&node, output);
            }
        });
        let next = node.clone();
        let finish = Box::new(move || {
            if produced.get() == 0 {
                if let Some((passthrough, item)) = original {
                    Buffered::push(&next, passthrough(item));
                }
            }
            schedule_task(move || Self::read_and_transform(&next, count, done));
        });
        step(item, Emitter::new(&handle(node), push, finish));
    }

    fn insert(node: &Rc<TransformNode<S, D>>, inserter: Option<Inserter<D>>, done: Done) {
        match inserter {
            None => done(),
            Some(Inserter::Items(items)) => {
                for item in items {
                    Buffered::push(node, item);
                }
                done();
            }
            Some(Inserter::Iterator(items)) => {
                if items.is_done() {
                    return done();
                }
                let target = Rc::downgrade(node);
                let errors = Rc::downgrade(node);
                items.on_error(move |error| {
                    if let Some(node) = errors.upgrade() {
                        handle(&node).emit_error(error.clone());
                    }
                });
                items.on_data(move |item| {
                    if let Some(node) = target.upgrade() {
                        Buffered::push(&node, item);
                    }
                });
                items.on_terminate(done);
            }
        }
    }
}

impl<S: Clone + 'static, D: Clone + 'static> Fill<D> for Transform<S, D> {
    fn name(&self) -> &'static str {
        "TransformIterator"
    }

    fn details(&self) -> Option<String> {
        Some(self.upstream.details())
    }

    fn begin(node: &Rc<TransformNode<S, D>>, done: Done) {
        let prepend = node.stage.fill.prepend.borrow_mut().take();
        Self::insert(node, prepend, done);
    }

    fn start(node: &Rc<TransformNode<S, D>>) {
        load(node);
    }

    fn read(node: &Rc<TransformNode<S, D>>, count: usize, done: Done) {
        Self::read_and_transform(node, count, done);
    }

    fn flush(node: &Rc<TransformNode<S, D>>, done: Done) {
        let append = node.stage.fill.append.borrow_mut().take();
        Self::insert(node, append, done);
    }

    fn end(node: &Rc<TransformNode<S, D>>, _: bool) {
        node.stage.fill.upstream.release();
    }
}

impl<S: Clone + 'static, D: Clone + 'static> Pull<S, D> for Transform<S, D> {
    fn upstream(&self) -> &Upstream<S> {
        &self.upstream
    }
}

/// An iterator transforming the items of a single source.
///
/// The source is owned: once this iterator terminates, the source is
/// destroyed unless configured otherwise.
pub struct TransformIterator<S: 'static, D: 'static> {
    node: Rc<TransformNode<S, D>>,
    iterator: AsyncIterator<D>,
}

impl<S: Clone + 'static, D: Clone + 'static> TransformIterator<S, D> {
    /// Create a transforming iterator over `source`.
    ///
    /// Fails when `source` is already consumed by another iterator.
    pub fn new<E: Into<SourceExpr<S>>>(source: E, options: TransformOptions<S, D>) -> Result<Self> {
        let transform = Self::without_source(options);
        if let Err(error) = transform.set_source(source) {
            transform.destroy();
            return Err(error);
        }
        Ok(transform)
    }

    /// Create a transforming iterator whose source is set later.
    pub fn without_source(options: TransformOptions<S, D>) -> Self {
        let TransformOptions {
            step,
            filter,
            offset,
            limit,
            passthrough,
            prepend,
            append,
            destroy_source,
            buffer,
        } = options;
        let (offset, limit) = match offset {
            Count::Finite(offset) => (offset, limit.finite()),
            Count::Unbounded => (0, Some(0)),
        };
        let fill = Transform {
            upstream: Upstream::new(destroy_source, buffer.auto_start),
            step,
            filter,
            offset: Cell::new(offset),
            limit: Cell::new(limit),
            passthrough,
            prepend: RefCell::new(prepend),
            append: RefCell::new(append),
        };
        let node = Buffered::create(fill, &buffer);
        let iterator = AsyncIterator::from_node(node.clone());
        Self { node, iterator }
    }

    /// Set the source; a source can only be set once.
    pub fn set_source<E: Into<SourceExpr<S>>>(&self, source: E) -> Result<()> {
        set_source(&self.node, source.into())
    }

    /// The source, once connected
    pub fn source(&self) -> Option<AsyncIterator<S>> {
        self.node.stage.fill.upstream.source()
    }

    /// The underlying iterator handle
    pub fn into_iterator(self) -> AsyncIterator<D> {
        self.iterator
    }
}

impl<S: 'static, D: 'static> Deref for TransformIterator<S, D> {
    type Target = AsyncIterator<D>;

    fn deref(&self) -> &Self::Target {
        &self.iterator
    }
}

impl<S: 'static, D: 'static> From<TransformIterator<S, D>> for AsyncIterator<D> {
    fn from(transform: TransformIterator<S, D>) -> Self {
        transform.iterator
    }
}
