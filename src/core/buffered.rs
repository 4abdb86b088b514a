//! The buffering engine.
//!
//! A buffered iterator keeps up to `max_buffer_size` items ready. Whenever
//! the buffer drops below capacity it asks its generation routine for more,
//! always on a later turn, so fast synchronous producers never recurse.
//! Derived iterators (transforms, unions, channels, streams) plug their
//! generation routine in through [`Fill`]; applications use the public
//! [`Generator`] trait instead.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::Deref;
use std::rc::Rc;

use crate::core::iterator::{AsyncIterator, DestroyDone, Node, Stage, WeakIterator};
use crate::core::state::State;
use crate::error::Error;
use crate::options::BufferOptions;
use crate::scheduler::schedule_task;

/// Largest number of items requested from a generator in one go.
const MAX_FILL: usize = 128;

pub(crate) type Done = Box<dyn FnOnce()>;
pub(crate) type BufferNode<T, G> = Node<T, Buffered<T, G>>;

/// Generation routine behind a buffered iterator.
pub(crate) trait Fill<T: Clone + 'static>: Sized + 'static {
    fn name(&self) -> &'static str;

    fn details(&self) -> Option<String> {
        None
    }

    /// Runs once before the first fill.
    fn begin(node: &Rc<BufferNode<T, Self>>, done: Done) {
        let _ = node;
        done();
    }

    /// Runs on the first call to `read`.
    fn start(node: &Rc<BufferNode<T, Self>>) {
        let _ = node;
    }

    /// Push up to `count` items, then call `done`.
    fn read(node: &Rc<BufferNode<T, Self>>, count: usize, done: Done);

    /// Runs once no new items will be generated.
    fn flush(node: &Rc<BufferNode<T, Self>>, done: Done) {
        let _ = node;
        done();
    }

    fn destroy(node: &Rc<BufferNode<T, Self>>, cause: Option<&Error>, done: DestroyDone) {
        let _ = (node, cause);
        done(None);
    }

    /// Release resources after the iterator reached a terminal state.
    fn end(node: &Rc<BufferNode<T, Self>>, destroy: bool) {
        let _ = (node, destroy);
    }
}

/// Stage of every buffered iterator.
pub(crate) struct Buffered<T, G> {
    buffer: RefCell<VecDeque<T>>,
    max_buffer_size: Cell<usize>,
    reading: Cell<bool>,
    refill: Cell<bool>,
    pushed: Cell<usize>,
    started: Cell<bool>,
    pub(crate) fill: G,
}

pub(crate) fn handle<T: Clone + 'static, G: Fill<T>>(node: &Rc<BufferNode<T, G>>) -> AsyncIterator<T> {
    AsyncIterator::from_node(node.clone())
}

impl<T: Clone + 'static, G: Fill<T>> Buffered<T, G> {
    /// Create the node and schedule its initialization.
    pub(crate) fn create(fill: G, options: &BufferOptions) -> Rc<BufferNode<T, G>> {
        let node = Node::new(
            State::Init,
            Buffered {
                buffer: RefCell::new(VecDeque::new()),
                max_buffer_size: Cell::new(options.capacity()),
                reading: Cell::new(true),
                refill: Cell::new(false),
                pushed: Cell::new(0),
                started: Cell::new(false),
                fill,
            },
        );
        let auto_start = options.auto_start;
        let init = node.clone();
        schedule_task(move || Self::init(&init, auto_start));
        node
    }

    fn init(node: &Rc<BufferNode<T, G>>, auto_start: bool) {
        if handle(node).is_done() {
            return;
        }
        let begun = node.clone();
        G::begin(
            node,
            Box::new(move || {
                begun.stage.reading.set(false);
                let it = handle(&begun);
                it.change_state(State::Open);
                if it.is_closed() {
                    Self::complete_close(&begun);
                } else if auto_start {
                    Self::fill_buffer_async(&begun);
                } else {
                    it.set_readable(true);
                }
            }),
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.borrow().len()
    }

    pub(crate) fn max_buffer_size(&self) -> usize {
        self.max_buffer_size.get()
    }

    /// Items pushed by the fill in progress
    pub(crate) fn pushed(&self) -> usize {
        self.pushed.get()
    }

    /// Whether `read` was called at least once
    pub(crate) fn started(&self) -> bool {
        self.started.get()
    }

    /// Add a generated item to the buffer.
    pub(crate) fn push(node: &Rc<BufferNode<T, G>>, item: T) {
        let it = handle(node);
        if it.is_done() {
            return;
        }
        node.stage.pushed.set(node.stage.pushed.get() + 1);
        node.stage.buffer.borrow_mut().push_back(item);
        it.set_readable(true);
    }

    /// An emitter pushing into this buffer; completion runs on a later turn.
    pub(crate) fn emitter(node: &Rc<BufferNode<T, G>>, done: Done) -> Emitter<T> {
        let target = Rc::downgrade(node);
        Emitter::new(
            &handle(node),
            Rc::new(move |item| {
                if let Some(node) = target.upgrade() {
                    Self::push(&node, item);
                }
            }),
            Box::new(move || schedule_task(done)),
        )
    }

    pub(crate) fn fill_buffer_async(node: &Rc<BufferNode<T, G>>) {
        let stage = &node.stage;
        if !stage.reading.replace(true) {
            let pending = node.clone();
            schedule_task(move || {
                pending.stage.reading.set(false);
                Self::fill_buffer(&pending);
            });
        }
    }

    /// Ask the generator for as many items as the buffer has room for.
    pub(crate) fn fill_buffer(node: &Rc<BufferNode<T, G>>) {
        let stage = &node.stage;
        let it = handle(node);
        if it.is_done() {
            return;
        }
        if stage.reading.get() {
            stage.refill.set(true);
            return;
        }
        if it.is_closed() {
            Self::complete_close(node);
            return;
        }
        let needed = stage
            .max_buffer_size
            .get()
            .saturating_sub(stage.len())
            .min(MAX_FILL);
        if needed == 0 {
            return;
        }
        stage.pushed.set(0);
        stage.refill.set(false);
        stage.reading.set(true);
        tracing::trace!(iterator = stage.fill.name(), needed, "filling buffer");
        let filled = node.clone();
        G::read(
            node,
            needed,
            Box::new(move || {
                let stage = &filled.stage;
                stage.reading.set(false);
                let it = handle(&filled);
                if it.is_closed() {
                    Self::complete_close(&filled);
                    return;
                }
                if stage.pushed.get() > 0 {
                    it.set_readable(true);
                    if stage.len() < stage.max_buffer_size.get() / 2 {
                        Self::fill_buffer_async(&filled);
                    }
                }
                if stage.refill.replace(false) {
                    Self::fill_buffer_async(&filled);
                }
            }),
        );
    }

    fn complete_close(node: &Rc<BufferNode<T, G>>) {
        if handle(node).change_state(State::Closed) {
            node.stage.reading.set(true);
            let flushed = node.clone();
            G::flush(
                node,
                Box::new(move || {
                    flushed.stage.reading.set(false);
                    if flushed.stage.buffer.borrow().is_empty() {
                        handle(&flushed).end_async();
                    }
                }),
            );
        }
    }
}

impl<T: Clone + 'static, G: Fill<T>> Stage<T> for Buffered<T, G> {
    fn name(node: &Node<T, Self>) -> &'static str {
        node.stage.fill.name()
    }

    fn read(node: &Rc<Node<T, Self>>) -> Option<T> {
        let stage = &node.stage;
        if !stage.started.replace(true) {
            G::start(node);
        }
        let it = handle(node);
        let (item, remaining) = {
            let mut buffer = stage.buffer.borrow_mut();
            let item = buffer.pop_front();
            (item, buffer.len())
        };
        if item.is_none() {
            it.set_readable(false);
        }
        if !stage.reading.get() && remaining < stage.max_buffer_size.get() {
            if !it.is_closed() {
                Self::fill_buffer_async(node);
            } else if remaining == 0 {
                it.end_async();
            }
        }
        item
    }

    fn close(node: &Rc<Node<T, Self>>) {
        if !node.stage.reading.get() {
            Self::complete_close(node);
        } else {
            handle(node).change_state(State::Closing);
        }
    }

    fn destroy(node: &Rc<Node<T, Self>>, cause: Option<&Error>, done: DestroyDone) {
        node.stage.buffer.borrow_mut().clear();
        G::destroy(node, cause, done);
    }

    fn end(node: &Rc<Node<T, Self>>, destroy: bool) {
        if handle(node).base_end(destroy) {
            G::end(node, destroy);
        }
    }

    fn details(node: &Node<T, Self>) -> Option<String> {
        node.stage.fill.details().or_else(|| {
            node.stage
                .buffer
                .try_borrow()
                .ok()
                .map(|buffer| format!("{{buffer: {}}}", buffer.len()))
        })
    }

    fn max_buffer_size(node: &Node<T, Self>) -> Option<usize> {
        Some(node.stage.max_buffer_size.get())
    }

    fn set_max_buffer_size(node: &Rc<Node<T, Self>>, size: usize) {
        let size = size.max(1);
        if node.stage.max_buffer_size.replace(size) != size
            && handle(node).state() == State::Open
        {
            Self::fill_buffer_async(node);
        }
    }
}

/// Handle through which a generation step delivers items.
///
/// The step is complete once [`done`](Emitter::done) is called or the emitter
/// is dropped, whichever comes first. Emitters may be moved into futures for
/// asynchronous generation.
pub struct Emitter<T: 'static> {
    push: Rc<dyn Fn(T)>,
    done: Option<Box<dyn FnOnce()>>,
    target: WeakIterator<T>,
}

impl<T: Clone + 'static> Emitter<T> {
    pub(crate) fn new(
        target: &AsyncIterator<T>,
        push: Rc<dyn Fn(T)>,
        done: Box<dyn FnOnce()>,
    ) -> Self {
        Self {
            push,
            done: Some(done),
            target: target.downgrade(),
        }
    }

    /// Emit an item
    pub fn push(&self, item: T) {
        (self.push)(item);
    }

    /// Signal that this step produced all its items
    pub fn done(mut self) {
        if let Some(done) = self.done.take() {
            done();
        }
    }

    /// Close the iterator being generated
    pub fn close(&self) {
        if let Some(it) = self.target.upgrade() {
            it.close();
        }
    }

    /// Report an error on the iterator being generated
    pub fn error(&self, error: Error) {
        if let Some(it) = self.target.upgrade() {
            it.emit_error(error);
        }
    }

    /// Whether the iterator being generated stopped producing
    pub fn is_closed(&self) -> bool {
        self.target
            .upgrade()
            .map_or(true, |it| it.is_closed())
    }
}

impl<T: 'static> Drop for Emitter<T> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            done();
        }
    }
}

/// A source of items for [`BufferedIterator`].
pub trait Generator<T: Clone + 'static>: 'static {
    /// Called once before the first read
    fn begin(&mut self, emitter: Emitter<T>) {
        drop(emitter);
    }

    /// Generate up to `count` items
    fn read(&mut self, count: usize, emitter: Emitter<T>);

    /// Called once the iterator is closed, before it ends
    fn flush(&mut self, emitter: Emitter<T>) {
        drop(emitter);
    }
}

impl<T, F> Generator<T> for F
where
    T: Clone + 'static,
    F: FnMut(usize, Emitter<T>) + 'static,
{
    fn read(&mut self, count: usize, emitter: Emitter<T>) {
        self(count, emitter);
    }
}

pub(crate) struct GeneratorFill<G> {
    generator: RefCell<G>,
}

impl<G> GeneratorFill<G> {
    fn call<T, F>(node: &Rc<BufferNode<T, Self>>, emitter: Emitter<T>, step: F)
    where
        T: Clone + 'static,
        G: Generator<T>,
        F: FnOnce(&mut G, Emitter<T>),
    {
        match node.stage.fill.generator.try_borrow_mut() {
            Ok(mut generator) => step(&mut *generator, emitter),
            Err(_) => tracing::warn!("generator re-entered while busy, step skipped"),
        }
    }
}

impl<T: Clone + 'static, G: Generator<T>> Fill<T> for GeneratorFill<G> {
    fn name(&self) -> &'static str {
        "BufferedIterator"
    }

    fn begin(node: &Rc<BufferNode<T, Self>>, done: Done) {
        let emitter = Buffered::emitter(node, done);
        Self::call(node, emitter, |generator, emitter| generator.begin(emitter));
    }

    fn read(node: &Rc<BufferNode<T, Self>>, count: usize, done: Done) {
        let emitter = Buffered::emitter(node, done);
        Self::call(node, emitter, |generator, emitter| {
            generator.read(count, emitter)
        });
    }

    fn flush(node: &Rc<BufferNode<T, Self>>, done: Done) {
        let emitter = Buffered::emitter(node, done);
        Self::call(node, emitter, |generator, emitter| generator.flush(emitter));
    }
}

/// An iterator buffering the items of a [`Generator`].
pub struct BufferedIterator<T: 'static> {
    iterator: AsyncIterator<T>,
}

impl<T: Clone + 'static> BufferedIterator<T> {
    /// Wrap a generator
    pub fn new<G: Generator<T>>(generator: G, options: BufferOptions) -> Self {
        let fill = GeneratorFill {
            generator: RefCell::new(generator),
        };
        Self {
            iterator: AsyncIterator::from_node(Buffered::create(fill, &options)),
        }
    }

    /// The underlying iterator handle
    pub fn into_iterator(self) -> AsyncIterator<T> {
        self.iterator
    }
}

impl<T: 'static> Deref for BufferedIterator<T> {
    type Target = AsyncIterator<T>;

    fn deref(&self) -> &Self::Target {
        &self.iterator
    }
}

impl<T: 'static> From<BufferedIterator<T>> for AsyncIterator<T> {
    fn from(buffered: BufferedIterator<T>) -> Self {
        buffered.iterator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{block_on, run_until_stalled};

    struct Counter {
        next: Rc<Cell<u32>>,
        limit: u32,
        flushed: Rc<Cell<bool>>,
    }

    impl Generator<u32> for Counter {
        fn read(&mut self, count: usize, emitter: Emitter<u32>) {
            for _ in 0..count {
                let next = self.next.get();
                if next >= self.limit {
                    emitter.close();
                    break;
                }
                emitter.push(next);
                self.next.set(next + 1);
            }
        }

        fn flush(&mut self, emitter: Emitter<u32>) {
            self.flushed.set(true);
            emitter.push(99);
        }
    }

    fn counter(limit: u32, options: BufferOptions) -> (BufferedIterator<u32>, Rc<Cell<u32>>, Rc<Cell<bool>>) {
        let next = Rc::new(Cell::new(0));
        let flushed = Rc::new(Cell::new(false));
        let it = BufferedIterator::new(
            Counter {
                next: next.clone(),
                limit,
                flushed: flushed.clone(),
            },
            options,
        );
        (it, next, flushed)
    }

    #[test]
    fn test_starts_in_init_and_opens_later() {
        let (it, _, _) = counter(100, BufferOptions::default());
        assert_eq!(it.state(), State::Init);
        run_until_stalled();
        assert_eq!(it.state(), State::Open);
        assert!(it.readable());

        let (short, _, _) = counter(3, BufferOptions::default());
        run_until_stalled();
        assert!(short.is_closed());
    }

    #[test]
    fn test_fills_up_to_capacity() {
        let (it, produced, _) = counter(100, BufferOptions::default());
        run_until_stalled();
        assert_eq!(produced.get(), 4);

        assert_eq!(it.read(), Some(0));
        run_until_stalled();
        assert_eq!(produced.get(), 5);
        assert_eq!(it.max_buffer_size(), Some(4));
    }

    #[test]
    fn test_without_auto_start_nothing_is_generated_before_read() {
        let (it, produced, _) = counter(10, BufferOptions::default().auto_start(false));
        run_until_stalled();
        assert_eq!(produced.get(), 0);
        assert!(it.readable());

        assert_eq!(it.read(), None);
        run_until_stalled();
        assert_eq!(produced.get(), 4);
        assert_eq!(it.read(), Some(0));
    }

    #[test]
    fn test_close_flushes_before_ending() {
        let (it, _, flushed) = counter(3, BufferOptions::default());
        let items = block_on(it.to_vec()).unwrap();
        assert_eq!(items, vec![0, 1, 2, 99]);
        assert!(flushed.get());
        assert!(it.is_ended());
    }

    #[test]
    fn test_close_while_idle_ends_after_flush() {
        let (it, produced, flushed) = counter(100, BufferOptions::default());
        run_until_stalled();
        it.close();
        assert!(it.is_closed());
        assert!(flushed.get());
        let rest = block_on(it.to_vec()).unwrap();
        assert_eq!(rest, vec![0, 1, 2, 3, 99]);
        assert_eq!(produced.get(), 4);
    }

    #[test]
    fn test_destroy_drops_buffered_items() {
        let (it, _, flushed) = counter(100, BufferOptions::default());
        run_until_stalled();
        it.destroy();
        assert!(it.is_destroyed());
        assert_eq!(it.read(), None);
        run_until_stalled();
        assert!(!flushed.get());
    }

    #[test]
    fn test_zero_buffer_size_reads_one_at_a_time() {
        let (it, produced, _) = counter(100, BufferOptions::default().max_buffer_size(0));
        run_until_stalled();
        assert_eq!(produced.get(), 1);
        assert_eq!(it.max_buffer_size(), Some(1));
    }

    #[test]
    fn test_growing_buffer_triggers_fill() {
        let (it, produced, _) = counter(100, BufferOptions::default());
        run_until_stalled();
        it.set_max_buffer_size(10);
        run_until_stalled();
        assert_eq!(produced.get(), 10);
    }

    #[test]
    fn test_closure_generator() {
        let mut next = 0;
        let it = BufferedIterator::new(
            move |count: usize, emitter: Emitter<i32>| {
                for _ in 0..count {
                    next += 1;
                    emitter.push(next);
                    if next == 6 {
                        emitter.close();
                        break;
                    }
                }
            },
            BufferOptions::default(),
        );
        assert_eq!(block_on(it.to_vec()).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_asynchronous_generator() {
        let it = BufferedIterator::new(
            |_count: usize, emitter: Emitter<&'static str>| {
                crate::scheduler::spawn_local(async move {
                    emitter.push("late");
                    emitter.close();
                    emitter.done();
                });
            },
            BufferOptions::default(),
        );
        assert_eq!(block_on(it.to_vec()).unwrap(), vec!["late"]);
    }

    #[test]
    fn test_display_shows_buffer_size() {
        let (it, _, _) = counter(100, BufferOptions::default());
        run_until_stalled();
        assert_eq!(it.to_string(), "[BufferedIterator {buffer: 4}]");
    }
}
