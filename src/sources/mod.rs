//! Leaf producers.
//!
//! This module provides the iterators that sit at the start of a pipeline:
//! in-memory sequences, integer ranges, single values, the empty iterator, a
//! push channel and an adapter for [`futures::Stream`]s. It also defines
//! [`SourceExpr`], the ways a derived iterator can be given its upstream.

use std::cell::RefCell;
use std::future::Future;
use std::iter::Peekable;
use std::rc::{Rc, Weak};

use futures::channel::mpsc;
use futures::future::LocalBoxFuture;
use futures::stream::LocalBoxStream;
use futures::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;

use crate::core::buffered::{BufferNode, Buffered, Done, Fill};
use crate::core::iterator::{Node, Stage};
use crate::core::{AsyncIterator, State};
use crate::error::{Error, Result};
use crate::options::BufferOptions;
use crate::scheduler::spawn_local;

/// Stage reading synchronously from an in-memory iterator.
pub(crate) struct Sequence<I: Iterator> {
    items: RefCell<Peekable<I>>,
    name: &'static str,
}

impl<T, I> Stage<T> for Sequence<I>
where
    T: Clone + 'static,
    I: Iterator<Item = T> + 'static,
{
    fn name(node: &Node<T, Self>) -> &'static str {
        node.stage.name
    }

    fn read(node: &Rc<Node<T, Self>>) -> Option<T> {
        let (item, exhausted) = {
            let mut items = node.stage.items.borrow_mut();
            let item = items.next();
            (item, items.peek().is_none())
        };
        if exhausted {
            AsyncIterator::from_node(node.clone()).close();
        }
        item
    }

    fn details(node: &Node<T, Self>) -> Option<String> {
        let items = node.stage.items.try_borrow().ok()?;
        match items.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(format!("({})", lower)),
            _ => None,
        }
    }
}

fn sequence<T, I>(items: I, name: &'static str) -> AsyncIterator<T>
where
    T: Clone + 'static,
    I: Iterator<Item = T> + 'static,
{
    let mut items = items.peekable();
    let exhausted = items.peek().is_none();
    let it = AsyncIterator::from_node(Node::new(
        State::Open,
        Sequence {
            items: RefCell::new(items),
            name,
        },
    ));
    if exhausted {
        it.close();
    } else {
        it.set_readable(true);
    }
    it
}

/// An iterator over the items of an in-memory collection.
///
/// The items are read synchronously; the iterator closes as soon as the last
/// one has been read.
pub fn from_iter<T, I>(items: I) -> AsyncIterator<T>
where
    T: Clone + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: 'static,
{
    sequence(items.into_iter(), "ArrayIterator")
}

impl<T: Clone + 'static> From<Vec<T>> for AsyncIterator<T> {
    fn from(items: Vec<T>) -> Self {
        from_iter(items)
    }
}

/// Integers from `next` to `last` (inclusive) in increments of `step`.
struct Integers {
    next: Option<i64>,
    last: i64,
    step: i64,
}

impl Iterator for Integers {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let current = self.next?;
        self.next = current
            .checked_add(self.step)
            .filter(|&next| if self.step >= 0 { next <= self.last } else { next >= self.last });
        Some(current)
    }
}

/// The integers from `start` to `end`, both inclusive.
pub fn range(start: i64, end: i64) -> AsyncIterator<i64> {
    range_step(start, end, 1)
}

/// The integers from `start` towards `end` (inclusive) in increments of
/// `step`; a negative step counts down.
pub fn range_step(start: i64, end: i64, step: i64) -> AsyncIterator<i64> {
    let in_range = if step >= 0 { start <= end } else { start >= end };
    let integers = Integers {
        next: in_range.then_some(start),
        last: end,
        step,
    };
    sequence(integers, "IntegerIterator")
}

/// The integers from `start` onwards, without end.
pub fn integers(start: i64) -> AsyncIterator<i64> {
    range(start, i64::MAX)
}

/// An iterator yielding exactly one item.
pub fn single<T: Clone + 'static>(item: T) -> AsyncIterator<T> {
    sequence(std::iter::once(item), "SingletonIterator")
}

/// An iterator that has already ended.
pub fn empty<T: Clone + 'static>() -> AsyncIterator<T> {
    let it = sequence(std::iter::empty(), "EmptyIterator");
    it.base_end(false);
    it
}

/// Generation routine of [`pushable`] iterators: items arrive from outside.
pub(crate) struct Channel;

impl<T: Clone + 'static> Fill<T> for Channel {
    fn name(&self) -> &'static str {
        "PushIterator"
    }

    fn read(_: &Rc<BufferNode<T, Self>>, _: usize, done: Done) {
        done();
    }
}

/// The writing end of a [`pushable`] iterator.
pub struct Pusher<T: 'static> {
    target: Weak<BufferNode<T, Channel>>,
}

impl<T: Clone + 'static> Pusher<T> {
    /// Append an item; returns `false` once the iterator no longer accepts items
    pub fn push(&self, item: T) -> bool {
        match self.target.upgrade() {
            Some(node) if !AsyncIterator::from_node(node.clone()).is_closed() => {
                Buffered::push(&node, item);
                true
            }
            _ => false,
        }
    }

    /// Signal that no more items will be pushed
    pub fn close(&self) {
        if let Some(node) = self.target.upgrade() {
            AsyncIterator::from_node(node).close();
        }
    }

    /// Report an error on the iterator
    pub fn error(&self, error: Error) {
        if let Some(node) = self.target.upgrade() {
            AsyncIterator::from_node(node).emit_error(error);
        }
    }

    /// Whether the iterator stopped accepting items
    pub fn is_closed(&self) -> bool {
        self.target
            .upgrade()
            .map_or(true, |node| AsyncIterator::from_node(node).is_closed())
    }
}

impl<T: 'static> Clone for Pusher<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
        }
    }
}

/// An iterator fed by hand through the returned [`Pusher`].
pub fn pushable<T: Clone + 'static>(options: BufferOptions) -> (Pusher<T>, AsyncIterator<T>) {
    let node = Buffered::create(Channel, &options);
    let pusher = Pusher {
        target: Rc::downgrade(&node),
    };
    (pusher, AsyncIterator::from_node(node))
}

type Request = (usize, Done);

/// Generation routine pulling from an async stream in a spawned task.
pub(crate) struct StreamFill<T: 'static> {
    stream: RefCell<Option<LocalBoxStream<'static, Result<T>>>>,
    requests: RefCell<Option<mpsc::UnboundedSender<Request>>>,
    token: CancellationToken,
}

impl<T: Clone + 'static> StreamFill<T> {
    async fn pump(
        node: Weak<BufferNode<T, Self>>,
        mut stream: LocalBoxStream<'static, Result<T>>,
        mut requests: mpsc::UnboundedReceiver<Request>,
        token: CancellationToken,
    ) {
        while let Some((count, done)) = requests.next().await {
            for _ in 0..count {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    next = stream.next() => next,
                };
                let Some(node) = node.upgrade() else { return };
                let it = AsyncIterator::from_node(node.clone());
                match next {
                    Some(Ok(item)) => Buffered::push(&node, item),
                    Some(Err(error)) => it.emit_error(error),
                    None => {
                        tracing::debug!(iterator = %it, "stream exhausted");
                        it.close();
                        break;
                    }
                }
            }
            done();
        }
    }
}

impl<T: Clone + 'static> Fill<T> for StreamFill<T> {
    fn name(&self) -> &'static str {
        "StreamIterator"
    }

    fn begin(node: &Rc<BufferNode<T, Self>>, done: Done) {
        let fill = &node.stage.fill;
        if let Some(stream) = fill.stream.borrow_mut().take() {
            let (sender, receiver) = mpsc::unbounded();
            *fill.requests.borrow_mut() = Some(sender);
            spawn_local(Self::pump(
                Rc::downgrade(node),
                stream,
                receiver,
                fill.token.clone(),
            ));
        }
        done();
    }

    fn read(node: &Rc<BufferNode<T, Self>>, count: usize, done: Done) {
        let sender = node.stage.fill.requests.borrow().clone();
        match sender {
            Some(sender) => {
                if let Err(rejected) = sender.unbounded_send((count, done)) {
                    let (_, done) = rejected.into_inner();
                    done();
                }
            }
            None => done(),
        }
    }

    fn end(node: &Rc<BufferNode<T, Self>>, _: bool) {
        let fill = &node.stage.fill;
        fill.token.cancel();
        fill.requests.borrow_mut().take();
    }
}

/// An iterator over the items of an async stream.
pub fn from_stream<T, St>(stream: St, options: BufferOptions) -> AsyncIterator<T>
where
    T: Clone + 'static,
    St: Stream<Item = T> + 'static,
{
    try_from_stream(stream.map(Ok::<T, Error>), options)
}

/// An iterator over a stream of results; errors are reported on the
/// iterator without ending it.
pub fn try_from_stream<T, E, St>(stream: St, options: BufferOptions) -> AsyncIterator<T>
where
    T: Clone + 'static,
    E: Into<Error>,
    St: Stream<Item = std::result::Result<T, E>> + 'static,
{
    let fill = StreamFill {
        stream: RefCell::new(Some(stream.map(|item| item.map_err(Into::into)).boxed_local())),
        requests: RefCell::new(None),
        token: CancellationToken::new(),
    };
    AsyncIterator::from_node(Buffered::create(fill, &options))
}

/// A future resolving to an iterator
pub type IteratorFuture<T> = LocalBoxFuture<'static, Result<AsyncIterator<T>>>;

/// The upstream of a derived iterator.
pub enum SourceExpr<T: 'static> {
    /// An iterator that is available now
    Iterator(AsyncIterator<T>),
    /// An iterator that becomes available once the future resolves
    Deferred(IteratorFuture<T>),
    /// A function creating the iterator when the consumer starts
    Factory(Box<dyn FnOnce() -> IteratorFuture<T>>),
}

impl<T: Clone + 'static> SourceExpr<T> {
    /// A source resolved from a future
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<AsyncIterator<T>>> + 'static,
    {
        SourceExpr::Deferred(Box::pin(future))
    }

    /// A source created on demand
    pub fn factory<F, Fut>(factory: F) -> Self
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<AsyncIterator<T>>> + 'static,
    {
        SourceExpr::Factory(Box::new(move || -> IteratorFuture<T> { Box::pin(factory()) }))
    }
}

impl<T: 'static> From<AsyncIterator<T>> for SourceExpr<T> {
    fn from(iterator: AsyncIterator<T>) -> Self {
        SourceExpr::Iterator(iterator)
    }
}

impl<T: Clone + 'static> From<Vec<T>> for SourceExpr<T> {
    fn from(items: Vec<T>) -> Self {
        SourceExpr::Iterator(from_iter(items))
    }
}
