//! Chainable combinators on [`AsyncIterator`].
//!
//! Each combinator wraps the iterator in a new transforming iterator that
//! owns it: the original iterator must not already be consumed elsewhere,
//! and it is destroyed when the new iterator terminates.

use std::cell::RefCell;
use std::collections::HashSet;
use std::hash::Hash;

use crate::core::AsyncIterator;
use crate::error::Result;
use crate::processors::{
    Inserter, MultiTransformIterator, MultiTransformOptions, TransformIterator, TransformOptions,
};

/// A number of items that may be unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    /// At most this many items
    Finite(usize),
    /// No bound
    Unbounded,
}

impl Count {
    /// The bound, or `None` when unbounded
    pub fn finite(self) -> Option<usize> {
        match self {
            Count::Finite(n) => Some(n),
            Count::Unbounded => None,
        }
    }

    /// Whether there is no bound
    pub fn is_unbounded(self) -> bool {
        self == Count::Unbounded
    }
}

impl From<usize> for Count {
    fn from(n: usize) -> Self {
        Count::Finite(n)
    }
}

impl From<u32> for Count {
    fn from(n: u32) -> Self {
        Count::Finite(n as usize)
    }
}

impl From<i32> for Count {
    fn from(n: i32) -> Self {
        Count::from(n as i64)
    }
}

impl From<i64> for Count {
    fn from(n: i64) -> Self {
        Count::Finite(usize::try_from(n).unwrap_or(if n < 0 { 0 } else { usize::MAX }))
    }
}

impl From<f64> for Count {
    fn from(n: f64) -> Self {
        if n == f64::INFINITY {
            Count::Unbounded
        } else if n.is_nan() || n <= 0.0 {
            Count::Finite(0)
        } else {
            // `as` saturates for values beyond usize::MAX
            Count::Finite(n.floor() as usize)
        }
    }
}

impl<T: Clone + 'static> AsyncIterator<T> {
    /// Transform this iterator with `options`.
    pub fn transform<D: Clone + 'static>(
        &self,
        options: TransformOptions<T, D>,
    ) -> Result<AsyncIterator<D>> {
        TransformIterator::new(self.clone(), options).map(Into::into)
    }

    /// Map every item.
    pub fn map<D, F>(&self, map: F) -> Result<AsyncIterator<D>>
    where
        D: Clone + 'static,
        F: Fn(T) -> D + 'static,
    {
        self.transform(TransformOptions::map(map))
    }

    /// Map every item, dropping those mapped to `None`.
    pub fn filter_map<D, F>(&self, map: F) -> Result<AsyncIterator<D>>
    where
        D: Clone + 'static,
        F: Fn(T) -> Option<D> + 'static,
    {
        self.transform(TransformOptions::filter_map(map))
    }

    /// Keep the items matching `filter`.
    pub fn filter<F: Fn(&T) -> bool + 'static>(&self, filter: F) -> Result<AsyncIterator<T>> {
        self.transform(TransformOptions::identity().filter(filter))
    }

    /// Emit `items` before the items of this iterator.
    pub fn prepend<I: Into<Inserter<T>>>(&self, items: I) -> Result<AsyncIterator<T>> {
        self.transform(TransformOptions::identity().prepend(items))
    }

    /// Emit `items` after the items of this iterator.
    pub fn append<I: Into<Inserter<T>>>(&self, items: I) -> Result<AsyncIterator<T>> {
        self.transform(TransformOptions::identity().append(items))
    }

    /// Emit `before` first and `after` last.
    pub fn surround<B, A>(&self, before: B, after: A) -> Result<AsyncIterator<T>>
    where
        B: Into<Inserter<T>>,
        A: Into<Inserter<T>>,
    {
        self.transform(TransformOptions::identity().prepend(before).append(after))
    }

    /// Skip the first `offset` items.
    pub fn skip(&self, offset: usize) -> Result<AsyncIterator<T>> {
        self.transform(TransformOptions::identity().offset(offset))
    }

    /// Emit at most `limit` items.
    pub fn take(&self, limit: usize) -> Result<AsyncIterator<T>> {
        self.transform(TransformOptions::identity().limit(limit))
    }

    /// Emit the items at positions `start` to `end`, both inclusive.
    pub fn range(&self, start: usize, end: usize) -> Result<AsyncIterator<T>> {
        let limit = if end < start { 0 } else { end - start + 1 };
        self.transform(TransformOptions::identity().offset(start).limit(limit))
    }

    /// Replace every item by the items of the iterator `factory` returns;
    /// `None` skips the item.
    pub fn multi_transform<D, F>(&self, factory: F) -> Result<AsyncIterator<D>>
    where
        D: Clone + 'static,
        F: Fn(T) -> Option<AsyncIterator<D>> + 'static,
    {
        MultiTransformIterator::new(self.clone(), MultiTransformOptions::new(factory))
            .map(Into::into)
    }

    /// Drop the items whose key was already seen.
    pub fn uniq_by<K, F>(&self, key: F) -> Result<AsyncIterator<T>>
    where
        K: Eq + Hash + 'static,
        F: Fn(&T) -> K + 'static,
    {
        let seen = RefCell::new(HashSet::new());
        self.filter(move |item| seen.borrow_mut().insert(key(item)))
    }
}

impl<T: Clone + Eq + Hash + 'static> AsyncIterator<T> {
    /// Drop items that were already emitted.
    pub fn uniq(&self) -> Result<AsyncIterator<T>> {
        self.uniq_by(T::clone)
    }
}
