//! Terminal consumers.
//!
//! This module provides the ways to get items out of an iterator from async
//! code: collecting into a vector, adapting to a [`futures::Stream`], or
//! handing every item to a callback.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures_core::Stream;

use crate::core::iterator::WeakIterator;
use crate::core::{AsyncIterator, Subscription};
use crate::error::{Error, Result};

struct Collector<T: 'static> {
    iterator: WeakIterator<T>,
    items: RefCell<Vec<T>>,
    limit: Option<usize>,
    outcome: RefCell<Option<Result<()>>>,
    waker: RefCell<Option<Waker>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl<T: Clone + 'static> Collector<T> {
    fn push(&self, item: T) {
        if self.outcome.borrow().is_some() {
            return;
        }
        let len = {
            let mut items = self.items.borrow_mut();
            items.push(item);
            items.len()
        };
        if self.limit.is_some_and(|limit| len >= limit) {
            self.finish(Ok(()));
        }
    }

    fn finish(&self, outcome: Result<()>) {
        if self.outcome.borrow().is_some() {
            return;
        }
        *self.outcome.borrow_mut() = Some(outcome);
        self.detach();
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    fn detach(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        if let Some(it) = self.iterator.upgrade() {
            for subscription in &subscriptions {
                it.unsubscribe(subscription);
            }
        }
    }
}

/// Future returned by [`AsyncIterator::to_vec`].
///
/// Items are collected from the moment the future is created.
pub struct Collect<T: 'static> {
    collector: Rc<Collector<T>>,
}

impl<T: Clone + 'static> Collect<T> {
    fn new(iterator: &AsyncIterator<T>, limit: Option<usize>) -> Self {
        let collector = Rc::new(Collector {
            iterator: iterator.downgrade(),
            items: RefCell::new(Vec::new()),
            limit,
            outcome: RefCell::new(None),
            waker: RefCell::new(None),
            subscriptions: RefCell::new(Vec::new()),
        });
        if iterator.is_done() || limit == Some(0) {
            collector.finish(Ok(()));
            return Self { collector };
        }

        let on_error = collector.clone();
        let on_end = collector.clone();
        let on_data = collector.clone();
        let subscriptions = vec![
            iterator.on_error(move |error| on_error.finish(Err(error.clone()))),
            iterator.on_end(move || on_end.finish(Ok(()))),
            iterator.on_data(move |item| on_data.push(item)),
        ];
        *collector.subscriptions.borrow_mut() = subscriptions;

        let on_terminate = Rc::downgrade(&collector);
        iterator.on_terminate(move || {
            if let Some(collector) = on_terminate.upgrade() {
                collector.finish(Ok(()));
            }
        });
        Self { collector }
    }
}

impl<T: Clone + 'static> Future for Collect<T> {
    type Output = Result<Vec<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let collector = &self.collector;
        match collector.outcome.borrow_mut().take() {
            Some(outcome) => {
                Poll::Ready(outcome.map(|()| std::mem::take(&mut *collector.items.borrow_mut())))
            }
            None => {
                *collector.waker.borrow_mut() = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T: 'static> Drop for Collect<T> {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(&mut *self.collector.subscriptions.borrow_mut());
        if let Some(it) = self.collector.iterator.upgrade() {
            for subscription in &subscriptions {
                it.unsubscribe(subscription);
            }
        }
    }
}

struct StreamState {
    errors: RefCell<VecDeque<Error>>,
    waker: RefCell<Option<Waker>>,
}

impl StreamState {
    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// A [`Stream`] reading an iterator in pull mode.
///
/// Errors are yielded as `Err` items; the stream ends when the iterator does.
pub struct IteratorStream<T: 'static> {
    iterator: AsyncIterator<T>,
    state: Rc<StreamState>,
    subscriptions: Vec<Subscription>,
}

impl<T: Clone + 'static> IteratorStream<T> {
    fn new(iterator: AsyncIterator<T>) -> Self {
        let state = Rc::new(StreamState {
            errors: RefCell::new(VecDeque::new()),
            waker: RefCell::new(None),
        });
        let readable = state.clone();
        let errored = state.clone();
        let ended = state.clone();
        let subscriptions = vec![
            iterator.on_readable(move || readable.wake()),
            iterator.on_error(move |error| {
                errored.errors.borrow_mut().push_back(error.clone());
                errored.wake();
            }),
            iterator.on_end(move || ended.wake()),
        ];
        let terminated = Rc::downgrade(&state);
        iterator.on_terminate(move || {
            if let Some(state) = terminated.upgrade() {
                state.wake();
            }
        });
        Self {
            iterator,
            state,
            subscriptions,
        }
    }
}

impl<T: Clone + 'static> Stream for IteratorStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(error) = self.state.errors.borrow_mut().pop_front() {
            return Poll::Ready(Some(Err(error)));
        }
        if let Some(item) = self.iterator.read() {
            return Poll::Ready(Some(Ok(item)));
        }
        if self.iterator.is_done() {
            return Poll::Ready(None);
        }
        *self.state.waker.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T: 'static> Drop for IteratorStream<T> {
    fn drop(&mut self) {
        for subscription in &self.subscriptions {
            self.iterator.unsubscribe(subscription);
        }
    }
}

impl<T: Clone + 'static> AsyncIterator<T> {
    /// Collect all remaining items.
    ///
    /// Resolves with the items once the iterator ends, with the items read so
    /// far if it is destroyed without error, or with the first error.
    pub fn to_vec(&self) -> Collect<T> {
        Collect::new(self, None)
    }

    /// Collect at most `limit` items, then stop listening without
    /// destroying the iterator.
    pub fn to_vec_limit(&self, limit: usize) -> Collect<T> {
        Collect::new(self, Some(limit))
    }

    /// Read the iterator as a [`Stream`] of results.
    pub fn into_stream(self) -> IteratorStream<T> {
        IteratorStream::new(self)
    }

    /// Call `callback` for every item; switches the iterator to push mode.
    pub fn for_each<F: Fn(T) + 'static>(&self, callback: F) -> Subscription {
        self.on_data(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{block_on, run_until_stalled};
    use crate::sources::{from_iter, integers, pushable};
    use crate::options::BufferOptions;
    use futures::StreamExt;

    #[test]
    fn test_to_vec_collects_everything() {
        let it = from_iter(vec![1, 2, 3]);
        assert_eq!(block_on(it.to_vec()).unwrap(), vec![1, 2, 3]);
        assert!(it.is_ended());
    }

    #[test]
    fn test_to_vec_limit_detaches() {
        let it = integers(1);
        let items = block_on(it.to_vec_limit(3)).unwrap();
        assert_eq!(items, vec![1, 2, 3]);
        assert!(!it.is_done());
        assert_eq!(it.subscriber_count(crate::Signal::Data), 0);
        assert_eq!(it.read(), Some(4));
    }

    #[test]
    fn test_to_vec_fails_on_error() {
        let (pusher, it) = pushable::<i32>(BufferOptions::default());
        pusher.push(1);
        let collect = it.to_vec();
        pusher.error(Error::custom("broken"));
        let err = block_on(collect).unwrap_err();
        assert_eq!(err.to_string(), "broken");
    }

    #[test]
    fn test_to_vec_after_destroy_without_error() {
        let (pusher, it) = pushable::<i32>(BufferOptions::default());
        let collect = it.to_vec();
        pusher.push(7);
        run_until_stalled();
        it.destroy();
        assert_eq!(block_on(collect).unwrap(), vec![7]);
    }

    #[test]
    fn test_stream_adapter() {
        let it = from_iter(vec!["a", "b"]);
        let items: Vec<_> = block_on(it.into_stream().collect::<Vec<_>>());
        let items: Vec<_> = items.into_iter().map(|item| item.unwrap()).collect();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[test]
    fn test_stream_yields_errors_in_line() {
        let (pusher, it) = pushable::<i32>(BufferOptions::default());
        let mut stream = it.into_stream();
        pusher.push(1);
        assert_eq!(block_on(stream.next()).unwrap().unwrap(), 1);
        pusher.error(Error::custom("late"));
        assert!(block_on(stream.next()).unwrap().is_err());
        pusher.close();
        assert!(block_on(stream.next()).is_none());
    }

    #[test]
    fn test_for_each() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let it = from_iter(vec![5, 6]);
        it.for_each(move |item| sink.borrow_mut().push(item));
        run_until_stalled();
        assert_eq!(*seen.borrow(), vec![5, 6]);
        assert!(it.is_ended());
    }
}
