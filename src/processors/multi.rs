//! One-to-many expansion into child sequences.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::Deref;
use std::rc::Rc;

use crate::core::buffered::{handle, BufferNode, Buffered, Done, Fill};
use crate::core::iterator::Link;
use crate::core::{AsyncIterator, Subscription};
use crate::error::Result;
use crate::options::BufferOptions;
use crate::processors::{set_source, Pull, Upstream};
use crate::sources::{empty, SourceExpr};

type Factory<S, D> = Rc<dyn Fn(S) -> Option<AsyncIterator<D>>>;

/// Configuration of a [`MultiTransformIterator`].
pub struct MultiTransformOptions<S: 'static, D: 'static> {
    factory: Factory<S, D>,
    passthrough: Option<Rc<dyn Fn(S) -> D>>,
    destroy_source: bool,
    buffer: BufferOptions,
}

impl<S: Clone + 'static, D: Clone + 'static> MultiTransformOptions<S, D> {
    /// Expand every item into the iterator returned by `factory`; `None`
    /// skips the item
    pub fn new<F: Fn(S) -> Option<AsyncIterator<D>> + 'static>(factory: F) -> Self {
        Self {
            factory: Rc::new(factory),
            passthrough: None,
            destroy_source: true,
            buffer: BufferOptions::default(),
        }
    }

    /// Set whether the source and open children are destroyed on termination
    pub fn destroy_source(mut self, destroy: bool) -> Self {
        self.destroy_source = destroy;
        self
    }

    /// Set the buffering options; the buffer size also bounds the number of
    /// children opened ahead
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

impl<T: Clone + 'static> MultiTransformOptions<T, T> {
    /// Emit an item unchanged when its child sequence produced nothing
    pub fn optional(mut self) -> Self {
        self.passthrough = Some(Rc::new(|item| item));
        self
    }
}

struct Child<S, D: 'static> {
    item: Option<S>,
    transformer: AsyncIterator<D>,
    subscriptions: Vec<Subscription>,
}

impl<S, D: Clone + 'static> Child<S, D> {
    fn release(&self, destroy: bool) {
        for subscription in &self.subscriptions {
            self.transformer.unsubscribe(subscription);
        }
        self.transformer.detach();
        if destroy {
            self.transformer.destroy();
        }
    }
}

/// Generation routine of a [`MultiTransformIterator`].
pub(crate) struct MultiTransform<S: 'static, D: 'static> {
    upstream: Upstream<S>,
    factory: Factory<S, D>,
    passthrough: Option<Rc<dyn Fn(S) -> D>>,
    queue: RefCell<VecDeque<Child<S, D>>>,
}

type MultiNode<S, D> = BufferNode<D, MultiTransform<S, D>>;

impl<S: Clone + 'static, D: Clone + 'static> MultiTransform<S, D> {
    /// Remove finished children from the front, passing through untouched items.
    fn drop_finished(node: &Rc<MultiNode<S, D>>) -> usize {
        let fill = &node.stage.fill;
        let mut passed = 0;
        loop {
            let finished = {
                let mut queue = fill.queue.borrow_mut();
                match queue.front() {
                    Some(child) if child.transformer.is_done() => queue.pop_front(),
                    _ => None,
                }
            };
            let Some(child) = finished else { break };
            child.release(false);
            if let (Some(passthrough), Some(item)) = (&fill.passthrough, child.item) {
                Buffered::push(node, passthrough(item));
                passed += 1;
            }
        }
        passed
    }

    /// Open children until as many are queued as the buffer holds items.
    fn open_children(node: &Rc<MultiNode<S, D>>) {
        let fill = &node.stage.fill;
        let Some(source) = fill.upstream.source() else { return };
        while !source.is_done() && fill.queue.borrow().len() < node.stage.max_buffer_size() {
            let Some(item) = source.read() else { break };
            let kept = fill.passthrough.as_ref().map(|_| item.clone());
            let transformer = (fill.factory)(item).unwrap_or_else(empty);
            if let Err(error) = transformer.attach(Link::Stage) {
                handle(node).emit_error(error);
                continue;
            }
            let refill = Rc::downgrade(node);
            let readable = Rc::downgrade(node);
            let errored = Rc::downgrade(node);
            let subscriptions = vec![
                transformer.on_end(move || {
                    if let Some(node) = refill.upgrade() {
                        Buffered::fill_buffer(&node);
                    }
                }),
                transformer.on_readable(move || {
                    if let Some(node) = readable.upgrade() {
                        Buffered::fill_buffer(&node);
                    }
                }),
                transformer.on_error(move |error| {
                    if let Some(node) = errored.upgrade() {
                        handle(&node).emit_error(error.clone());
                    }
                }),
            ];
            fill.queue.borrow_mut().push_back(Child {
                item: kept,
                transformer,
                subscriptions,
            });
        }
    }
}

impl<S: Clone + 'static, D: Clone + 'static> Fill<D> for MultiTransform<S, D> {
    fn name(&self) -> &'static str {
        "MultiTransformIterator"
    }

    fn details(&self) -> Option<String> {
        Some(self.upstream.details())
    }

    fn start(node: &Rc<MultiNode<S, D>>) {
        crate::processors::load(node);
    }

    fn read(node: &Rc<MultiNode<S, D>>, count: usize, done: Done) {
        let fill = &node.stage.fill;
        let mut remaining = count;
        loop {
            remaining = remaining.saturating_sub(Self::drop_finished(node));
            Self::open_children(node);

            let head = fill.queue.borrow().front().map(|child| child.transformer.clone());
            let Some(transformer) = head else {
                if fill.upstream.source().map_or(false, |source| source.is_done()) {
                    handle(node).close();
                }
                break;
            };
            while remaining > 0 {
                let Some(item) = transformer.read() else { break };
                Buffered::push(node, item);
                remaining -= 1;
                if let Some(child) = fill.queue.borrow_mut().front_mut() {
                    child.item = None;
                }
            }
            if !(transformer.is_done() && remaining > 0) {
                break;
            }
        }
        done();
    }

    fn end(node: &Rc<MultiNode<S, D>>, _: bool) {
        let fill = &node.stage.fill;
        let destroy = fill.upstream.destroy_source();
        let children = std::mem::take(&mut *fill.queue.borrow_mut());
        for child in &children {
            child.release(destroy);
        }
        fill.upstream.release();
    }
}

impl<S: Clone + 'static, D: Clone + 'static> Pull<S, D> for MultiTransform<S, D> {
    fn upstream(&self) -> &Upstream<S> {
        &self.upstream
    }

    fn source_ended(node: &Rc<MultiNode<S, D>>) {
        if node.stage.fill.queue.borrow().is_empty() {
            handle(node).close();
        } else {
            Buffered::fill_buffer(node);
        }
    }
}

/// An iterator replacing every source item by a whole child sequence.
///
/// Children are drained strictly in source order; up to `max_buffer_size`
/// of them are opened ahead. Errors of children are forwarded without
/// stopping the iterator.
///
/// A child should end (or report an error and end) rather than be
/// destroyed: a destroyed child never signals its end, so the iterator only
/// moves past it on the next signal from another child or the source.
pub struct MultiTransformIterator<S: 'static, D: 'static> {
    node: Rc<MultiNode<S, D>>,
    iterator: AsyncIterator<D>,
}

impl<S: Clone + 'static, D: Clone + 'static> MultiTransformIterator<S, D> {
    /// Create an expanding iterator over `source`.
    ///
    /// Fails when `source` is already consumed by another iterator.
    pub fn new<E: Into<SourceExpr<S>>>(
        source: E,
        options: MultiTransformOptions<S, D>,
    ) -> Result<Self> {
        let multi = Self::without_source(options);
        if let Err(error) = multi.set_source(source) {
            multi.destroy();
            return Err(error);
        }
        Ok(multi)
    }

    /// Create an expanding iterator whose source is set later.
    pub fn without_source(options: MultiTransformOptions<S, D>) -> Self {
        let MultiTransformOptions {
            factory,
            passthrough,
            destroy_source,
            buffer,
        } = options;
        let fill = MultiTransform {
            upstream: Upstream::new(destroy_source, buffer.auto_start),
            factory,
            passthrough,
            queue: RefCell::new(VecDeque::new()),
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

impl<S: 'static, D: 'static> Deref for MultiTransformIterator<S, D> {
    type Target = AsyncIterator<D>;

    fn deref(&self) -> &Self::Target {
        &self.iterator
    }
}

impl<S: 'static, D: 'static> From<MultiTransformIterator<S, D>> for AsyncIterator<D> {
    fn from(multi: MultiTransformIterator<S, D>) -> Self {
        multi.iterator
    }
}
