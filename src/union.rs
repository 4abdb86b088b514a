//! Fair merging of several sources.
//!
//! A [`UnionIterator`] reads its sources round-robin: each pass takes at
//! most one item from every live source before returning to the first, and
//! a source with nothing ready is skipped until it signals readiness again.
//! Sources can be given up front or through an iterator of iterators that
//! keeps producing while the merge runs.

use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::Rc;

use crate::core::buffered::{handle, BufferNode, Buffered, Done, Fill};
use crate::core::iterator::Link;
use crate::core::{AsyncIterator, Subscription};
use crate::error::Result;
use crate::options::UnionOptions;

/// The sources of a [`UnionIterator`].
pub enum UnionSources<T: 'static> {
    /// A fixed list of sources
    Fixed(Vec<AsyncIterator<T>>),
    /// Sources arriving over time
    Dynamic(AsyncIterator<AsyncIterator<T>>),
}

impl<T: 'static> From<Vec<AsyncIterator<T>>> for UnionSources<T> {
    fn from(sources: Vec<AsyncIterator<T>>) -> Self {
        UnionSources::Fixed(sources)
    }
}

impl<T: 'static> From<AsyncIterator<AsyncIterator<T>>> for UnionSources<T> {
    fn from(sources: AsyncIterator<AsyncIterator<T>>) -> Self {
        UnionSources::Dynamic(sources)
    }
}

/// A connected source with the subscriptions made on it.
struct Wired<T: 'static> {
    iterator: T,
    subscriptions: Vec<Subscription>,
}

/// Generation routine of a [`UnionIterator`].
pub(crate) struct Union<T: 'static> {
    sources: RefCell<Vec<Wired<AsyncIterator<T>>>>,
    pending: RefCell<Option<Wired<AsyncIterator<AsyncIterator<T>>>>>,
    cursor: Cell<usize>,
    destroy_sources: bool,
}

type UnionNode<T> = BufferNode<T, Union<T>>;

/// Subscribe `node` to the readiness, end and errors of `source`.
fn wire<T, U>(node: &Rc<UnionNode<T>>, source: &AsyncIterator<U>) -> Vec<Subscription>
where
    T: Clone + 'static,
    U: Clone + 'static,
{
    let readable = Rc::downgrade(node);
    let ended = Rc::downgrade(node);
    let errored = Rc::downgrade(node);
    vec![
        source.on_readable(move || {
            if let Some(node) = readable.upgrade() {
                Buffered::fill_buffer(&node);
            }
        }),
        source.on_end(move || {
            if let Some(node) = ended.upgrade() {
                Buffered::fill_buffer(&node);
            }
        }),
        source.on_error(move |error| {
            if let Some(node) = errored.upgrade() {
                handle(&node).emit_error(error.clone());
            }
        }),
    ]
}

fn unwire<U: Clone + 'static>(wired: &Wired<AsyncIterator<U>>, destroy: bool) {
    for subscription in &wired.subscriptions {
        wired.iterator.unsubscribe(subscription);
    }
    wired.iterator.detach();
    if destroy {
        wired.iterator.destroy();
    }
}

impl<T: Clone + 'static> Union<T> {
    /// Connect a new source; it joins the next round-robin pass.
    fn add_source(node: &Rc<UnionNode<T>>, source: AsyncIterator<T>) -> Result<()> {
        source.attach(Link::Stage)?;
        let subscriptions = wire(node, &source);
        node.stage.fill.sources.borrow_mut().push(Wired {
            iterator: source,
            subscriptions,
        });
        Ok(())
    }

    /// Take at most one new source from the source of sources.
    fn admit_next(node: &Rc<UnionNode<T>>) -> bool {
        let sources = node
            .stage
            .fill
            .pending
            .borrow()
            .as_ref()
            .map(|wired| wired.iterator.clone());
        let Some(source) = sources.and_then(|sources| sources.read()) else {
            return false;
        };
        tracing::debug!(source = %source, "adding source to union");
        if let Err(error) = Self::add_source(node, source) {
            handle(node).emit_error(error);
        }
        true
    }

    /// Drop sources that are done, keeping the cursor on the same source.
    fn prune(&self) {
        let mut sources = self.sources.borrow_mut();
        let mut index = 0;
        let mut cursor = self.cursor.get();
        sources.retain(|wired| {
            let keep = !wired.iterator.is_done();
            if !keep {
                unwire(wired, false);
                if index < cursor {
                    cursor -= 1;
                }
            }
            index += 1;
            keep
        });
        self.cursor.set(if sources.is_empty() { 0 } else { cursor % sources.len() });
    }

    /// Whether no source is left and none can arrive anymore.
    fn is_exhausted(&self) -> bool {
        let no_more_sources = self
            .pending
            .borrow()
            .as_ref()
            .map_or(true, |wired| wired.iterator.is_done());
        no_more_sources && self.sources.borrow().is_empty()
    }

    /// One round-robin pass reading at most one item per source.
    fn pass(node: &Rc<UnionNode<T>>, wanted: usize) -> usize {
        let fill = &node.stage.fill;
        let sources: Vec<AsyncIterator<T>> = fill
            .sources
            .borrow()
            .iter()
            .map(|wired| wired.iterator.clone())
            .collect();
        if sources.is_empty() {
            return 0;
        }
        let start = fill.cursor.get() % sources.len();
        let mut pushed = 0;
        for offset in 0..sources.len() {
            if pushed == wanted {
                break;
            }
            let index = (start + offset) % sources.len();
            fill.cursor.set((index + 1) % sources.len());
            if let Some(item) = sources[index].read() {
                Buffered::push(node, item);
                pushed += 1;
            }
        }
        pushed
    }
}

impl<T: Clone + 'static> Fill<T> for Union<T> {
    fn name(&self) -> &'static str {
        "UnionIterator"
    }

    fn read(node: &Rc<UnionNode<T>>, count: usize, done: Done) {
        let fill = &node.stage.fill;
        let admitted = Self::admit_next(node);
        let mut remaining = count;
        loop {
            fill.prune();
            let pushed = Self::pass(node, remaining);
            remaining -= pushed;
            if remaining == 0 || pushed == 0 {
                break;
            }
        }
        fill.prune();
        if fill.is_exhausted() {
            handle(node).close();
        } else if admitted && remaining > 0 {
            // the next source is admitted on a later turn
            Buffered::fill_buffer(node);
        }
        done();
    }

    fn end(node: &Rc<UnionNode<T>>, _: bool) {
        let fill = &node.stage.fill;
        let destroy = fill.destroy_sources;
        let sources = std::mem::take(&mut *fill.sources.borrow_mut());
        for wired in &sources {
            unwire(wired, destroy);
        }
        let pending = fill.pending.borrow_mut().take();
        if let Some(pending) = pending {
            unwire(&pending, destroy);
        }
    }
}

/// An iterator merging several sources fairly.
///
/// It ends once the source of sources is exhausted and every source it
/// yielded has ended. Errors of any source are forwarded without stopping
/// the others.
pub struct UnionIterator<T: 'static> {
    node: Rc<UnionNode<T>>,
    iterator: AsyncIterator<T>,
}

impl<T: Clone + 'static> UnionIterator<T> {
    /// Merge `sources`.
    ///
    /// Fails when one of the sources is already consumed elsewhere.
    pub fn new<S: Into<UnionSources<T>>>(sources: S, options: UnionOptions) -> Result<Self> {
        let fill = Union {
            sources: RefCell::new(Vec::new()),
            pending: RefCell::new(None),
            cursor: Cell::new(0),
            destroy_sources: options.destroy_sources,
        };
        let node = Buffered::create(fill, &options.buffer);
        let iterator = AsyncIterator::from_node(node.clone());
        if let Err(error) = Self::connect(&node, sources.into()) {
            iterator.destroy();
            return Err(error);
        }
        Ok(Self { node, iterator })
    }

    fn connect(node: &Rc<UnionNode<T>>, sources: UnionSources<T>) -> Result<()> {
        match sources {
            UnionSources::Fixed(sources) => {
                for source in sources {
                    Union::add_source(node, source)?;
                }
            }
            UnionSources::Dynamic(sources) => {
                sources.attach(Link::Stage)?;
                let subscriptions = wire(node, &sources);
                *node.stage.fill.pending.borrow_mut() = Some(Wired {
                    iterator: sources,
                    subscriptions,
                });
            }
        }
        Ok(())
    }

    /// Number of sources currently merged
    pub fn source_count(&self) -> usize {
        self.node.stage.fill.sources.borrow().len()
    }

    /// The underlying iterator handle
    pub fn into_iterator(self) -> AsyncIterator<T> {
        self.iterator
    }
}

impl<T: 'static> Deref for UnionIterator<T> {
    type Target = AsyncIterator<T>;

    fn deref(&self) -> &Self::Target {
        &self.iterator
    }
}

impl<T: 'static> From<UnionIterator<T>> for AsyncIterator<T> {
    fn from(union: UnionIterator<T>) -> Self {
        union.iterator
    }
}

impl<T: Clone + 'static> AsyncIterator<T> {
    /// Merge this iterator with `others`.
    pub fn union<I>(&self, others: I) -> Result<AsyncIterator<T>>
    where
        I: IntoIterator<Item = AsyncIterator<T>>,
    {
        let sources: Vec<_> = std::iter::once(self.clone()).chain(others).collect();
        UnionIterator::new(sources, UnionOptions::default()).map(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::options::BufferOptions;
    use crate::scheduler::{
        block_on, run_until_stalled, set_scheduler, LocalPoolScheduler, Scheduler, Task,
    };
    use crate::sources::{empty, from_iter, pushable, range};
    use futures::future::LocalBoxFuture;
    use std::collections::VecDeque;

    fn sorted(mut items: Vec<i64>) -> Vec<i64> {
        items.sort_unstable();
        items
    }

    #[test]
    fn test_merges_all_items() {
        let union = UnionIterator::new(
            vec![range(0, 2), range(3, 4), range(5, 6)],
            UnionOptions::default(),
        )
        .unwrap();
        let items = block_on(union.to_vec()).unwrap();
        assert_eq!(sorted(items), vec![0, 1, 2, 3, 4, 5, 6]);
        assert!(union.is_ended());
    }

    #[test]
    fn test_round_robin_order() {
        let union = UnionIterator::new(
            vec![range(0, 2), range(10, 12), range(20, 22)],
            UnionOptions::default().max_buffer_size(usize::MAX),
        )
        .unwrap();
        let items = block_on(union.to_vec()).unwrap();
        assert_eq!(items, vec![0, 10, 20, 1, 11, 21, 2, 12, 22]);
    }

    #[test]
    fn test_dynamic_sources() {
        let sources = from_iter(vec![range(0, 2), range(3, 4), range(5, 6)]);
        let union = UnionIterator::new(sources, UnionOptions::default()).unwrap();
        let items = block_on(union.to_vec()).unwrap();
        assert_eq!(sorted(items), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    /// Runs callbacks only when the test asks for them.
    struct Stepper(Rc<RefCell<VecDeque<Task>>>);

    impl Scheduler for Stepper {
        fn schedule(&self, task: Task) {
            self.0.borrow_mut().push_back(task);
        }

        fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
            LocalPoolScheduler.spawn(future);
        }
    }

    #[test]
    fn test_admits_one_source_per_fill() {
        let queue = Rc::new(RefCell::new(VecDeque::new()));
        set_scheduler(Stepper(queue.clone()));

        let (pushers, sources): (Vec<_>, Vec<_>) = (0..100)
            .map(|_| pushable::<i64>(BufferOptions::default()))
            .unzip();
        let union = UnionIterator::new(from_iter(sources), UnionOptions::default()).unwrap();
        let mut turns = 0;
        loop {
            let task = queue.borrow_mut().pop_front();
            let Some(task) = task else { break };
            let before = union.source_count();
            task();
            assert!(union.source_count() <= before + 1);
            turns += 1;
        }
        set_scheduler(LocalPoolScheduler);

        assert!(turns > 100);
        assert_eq!(union.source_count(), 100);
        assert!(!union.is_done());
        for pusher in &pushers {
            pusher.close();
        }
        assert_eq!(block_on(union.to_vec()).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_idle_source_does_not_block_later_sources() {
        let (pusher, idle) = pushable::<i64>(BufferOptions::default());
        let union =
            UnionIterator::new(from_iter(vec![idle, range(1, 3)]), UnionOptions::default()).unwrap();
        let collect = union.to_vec();
        run_until_stalled();
        assert_eq!(union.source_count(), 1);
        pusher.close();
        assert_eq!(block_on(collect).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_waits_for_every_source_to_end() {
        let (pusher, slow) = pushable::<i64>(BufferOptions::default());
        let union = UnionIterator::new(vec![range(1, 2), slow], UnionOptions::default()).unwrap();
        let collect = union.to_vec();
        run_until_stalled();
        assert!(!union.is_done());

        pusher.push(3);
        run_until_stalled();
        assert!(!union.is_done());
        pusher.close();
        assert_eq!(sorted(block_on(collect).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_sources_added_while_merging() {
        let (add, sources) = pushable::<AsyncIterator<i64>>(BufferOptions::default());
        let union = UnionIterator::new(sources, UnionOptions::default()).unwrap();
        let collect = union.to_vec();
        add.push(range(1, 2));
        run_until_stalled();
        assert!(!union.is_done());

        add.push(range(3, 3));
        add.close();
        assert_eq!(sorted(block_on(collect).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_errors_do_not_stop_siblings() {
        let (pusher, failing) = pushable::<i64>(BufferOptions::default());
        let union = UnionIterator::new(vec![failing, range(1, 3)], UnionOptions::default()).unwrap();
        let errors = Rc::new(Cell::new(0));
        let seen = errors.clone();
        union.on_error(move |_| seen.set(seen.get() + 1));
        pusher.error(Error::custom("one source failed"));
        pusher.close();
        assert_eq!(block_on(union.to_vec()).unwrap(), vec![1, 2, 3]);
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn test_empty_union() {
        let union = UnionIterator::new(Vec::<AsyncIterator<i64>>::new(), UnionOptions::default()).unwrap();
        run_until_stalled();
        assert!(union.is_ended());

        let lazy =
            UnionIterator::new(Vec::<AsyncIterator<i64>>::new(), UnionOptions::default().auto_start(false))
                .unwrap();
        run_until_stalled();
        assert!(!lazy.is_done());
        assert_eq!(lazy.read(), None);
        run_until_stalled();
        assert!(lazy.is_ended());
    }

    #[test]
    fn test_ended_sources_are_dropped() {
        let union =
            UnionIterator::new(vec![empty(), range(1, 1)], UnionOptions::default()).unwrap();
        assert_eq!(union.source_count(), 2);
        assert_eq!(block_on(union.to_vec()).unwrap(), vec![1]);
        assert_eq!(union.source_count(), 0);
    }

    #[test]
    fn test_destroy_releases_sources() {
        let first = range(1, 100);
        let second = range(1, 100);
        let union = first.union(vec![second.clone()]).unwrap();
        run_until_stalled();
        union.destroy();
        assert!(first.is_destroyed());
        assert!(second.is_destroyed());

        let kept = range(1, 100);
        let union = UnionIterator::new(vec![kept.clone()], UnionOptions::default().destroy_sources(false))
            .unwrap();
        union.destroy();
        assert!(!kept.is_done());
        assert!(!kept.has_destination());
    }

    #[test]
    fn test_source_consumed_elsewhere_fails() {
        let source = range(1, 3);
        let _mapped = source.map(|x| x + 1).unwrap();
        let union = UnionIterator::new(vec![range(4, 5), source], UnionOptions::default());
        assert!(matches!(union, Err(Error::AlreadyConnected)));
    }
}
