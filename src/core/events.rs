//! Typed notification channels of an iterator.

use std::rc::Rc;

use crate::error::Error;

/// The outbound signals an iterator can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// A call to `read` may now succeed
    Readable,
    /// An item was emitted in push mode
    Data,
    /// The iterator ended normally
    End,
    /// The iterator reported an error
    Error,
}

/// Handle returned by a subscription, used to unsubscribe again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    signal: Signal,
    id: u64,
}

impl Subscription {
    /// The signal this subscription listens to
    pub fn signal(&self) -> Signal {
        self.signal
    }
}

pub(crate) type Callback = Rc<dyn Fn()>;
pub(crate) type DataCallback<T> = Rc<dyn Fn(T)>;
pub(crate) type ErrorCallback = Rc<dyn Fn(&Error)>;

/// Subscribers per signal, in registration order.
pub(crate) struct Listeners<T> {
    next_id: u64,
    readable: Vec<(u64, Callback)>,
    data: Vec<(u64, DataCallback<T>)>,
    end: Vec<(u64, Callback)>,
    error: Vec<(u64, ErrorCallback)>,
}

impl<T> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            readable: Vec::new(),
            data: Vec::new(),
            end: Vec::new(),
            error: Vec::new(),
        }
    }

    fn subscription(&mut self, signal: Signal) -> Subscription {
        self.next_id += 1;
        Subscription {
            signal,
            id: self.next_id,
        }
    }

    pub(crate) fn add_readable(&mut self, callback: Callback) -> Subscription {
        let sub = self.subscription(Signal::Readable);
        self.readable.push((sub.id, callback));
        sub
    }

    pub(crate) fn add_data(&mut self, callback: DataCallback<T>) -> Subscription {
        let sub = self.subscription(Signal::Data);
        self.data.push((sub.id, callback));
        sub
    }

    pub(crate) fn add_end(&mut self, callback: Callback) -> Subscription {
        let sub = self.subscription(Signal::End);
        self.end.push((sub.id, callback));
        sub
    }

    pub(crate) fn add_error(&mut self, callback: ErrorCallback) -> Subscription {
        let sub = self.subscription(Signal::Error);
        self.error.push((sub.id, callback));
        sub
    }

    /// Remove a subscription, returning whether it was still registered.
    pub(crate) fn remove(&mut self, sub: &Subscription) -> bool {
        fn drop_id<C>(list: &mut Vec<(u64, C)>, id: u64) -> bool {
            let before = list.len();
            list.retain(|(entry, _)| *entry != id);
            list.len() != before
        }
        match sub.signal {
            Signal::Readable => drop_id(&mut self.readable, sub.id),
            Signal::Data => drop_id(&mut self.data, sub.id),
            Signal::End => drop_id(&mut self.end, sub.id),
            Signal::Error => drop_id(&mut self.error, sub.id),
        }
    }

    pub(crate) fn count(&self, signal: Signal) -> usize {
        match signal {
            Signal::Readable => self.readable.len(),
            Signal::Data => self.data.len(),
            Signal::End => self.end.len(),
            Signal::Error => self.error.len(),
        }
    }

    pub(crate) fn readable(&self) -> Vec<Callback> {
        self.readable.iter().map(|(_, cb)| cb.clone()).collect()
    }

    pub(crate) fn data(&self) -> Vec<DataCallback<T>> {
        self.data.iter().map(|(_, cb)| cb.clone()).collect()
    }

    pub(crate) fn end(&self) -> Vec<Callback> {
        self.end.iter().map(|(_, cb)| cb.clone()).collect()
    }

    pub(crate) fn error(&self) -> Vec<ErrorCallback> {
        self.error.iter().map(|(_, cb)| cb.clone()).collect()
    }

    /// Drop every subscription.
    pub(crate) fn clear(&mut self) {
        self.readable.clear();
        self.data.clear();
        self.end.clear();
        self.error.clear();
    }
}
