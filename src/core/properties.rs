//! Property bag: named values attached to an iterator, with one-shot waiters.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A property value of any type.
///
/// Cloning shares the underlying value.
#[derive(Clone)]
pub struct PropertyValue(Rc<dyn Any>);

impl PropertyValue {
    /// Wrap a value
    pub fn new<V: Any>(value: V) -> Self {
        PropertyValue(Rc::new(value))
    }

    /// Borrow the value if it has type `V`
    pub fn downcast_ref<V: Any>(&self) -> Option<&V> {
        self.0.downcast_ref::<V>()
    }

    /// Clone the value out if it has type `V`
    pub fn get<V: Any + Clone>(&self) -> Option<V> {
        self.downcast_ref::<V>().cloned()
    }

    /// Whether both handles share the same value
    pub fn ptr_eq(&self, other: &PropertyValue) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.downcast_ref::<String>() {
            write!(f, "PropertyValue({:?})", s)
        } else if let Some(s) = self.downcast_ref::<&'static str>() {
            write!(f, "PropertyValue({:?})", s)
        } else if let Some(n) = self.downcast_ref::<i64>() {
            write!(f, "PropertyValue({})", n)
        } else {
            f.write_str("PropertyValue(..)")
        }
    }
}

pub(crate) type PropertyCallback = Box<dyn FnOnce(PropertyValue)>;

/// Latest value per name plus the callbacks still waiting for one.
#[derive(Default)]
pub(crate) struct PropertyBag {
    values: HashMap<String, PropertyValue>,
    waiters: HashMap<String, Vec<PropertyCallback>>,
}

impl PropertyBag {
    pub(crate) fn get(&self, name: &str) -> Option<PropertyValue> {
        self.values.get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Store a value and hand back the waiters that must now be notified.
    pub(crate) fn set(&mut self, name: &str, value: PropertyValue) -> Vec<PropertyCallback> {
        self.values.insert(name.to_string(), value);
        self.waiters.remove(name).unwrap_or_default()
    }

    pub(crate) fn wait(&mut self, name: &str, callback: PropertyCallback) {
        self.waiters
            .entry(name.to_string())
            .or_default()
            .push(callback);
    }

    pub(crate) fn snapshot(&self) -> HashMap<String, PropertyValue> {
        self.values.clone()
    }
}
