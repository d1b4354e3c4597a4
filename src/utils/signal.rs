//! Single-threaded broadcast signals
//!
//! Observers subscribe callbacks and get invoked synchronously when the owner
//! emits. Everything runs on the event-loop thread, so emission re-entrancy is
//! the only hazard; listeners registered during emission are invoked starting
//! with the next emission.

use std::{cell::RefCell, collections::BTreeMap, fmt, rc::Rc};

type Listener<Data> = Box<dyn Fn(&Data)>;

/// Id of a registered listener, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// A broadcast signal carrying values of type `Data`
pub struct Signal<Data> {
    next_id: RefCell<u64>,
    listeners: RefCell<BTreeMap<u64, Rc<Listener<Data>>>>,
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({} listeners)", self.listeners.borrow().len())
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Signal {
            next_id: RefCell::new(0),
            listeners: RefCell::new(BTreeMap::new()),
        }
    }
}

impl<T> Signal<T> {
    /// Create a new signal without listeners
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a listener, returning an id usable with [`unsubscribe`](Signal::unsubscribe)
    pub fn subscribe(&self, handler: impl Fn(&T) + 'static) -> ListenerId {
        let id = *self.next_id.borrow();
        *self.next_id.borrow_mut() = id + 1;
        self.listeners.borrow_mut().insert(id, Rc::new(Box::new(handler)));
        ListenerId(id)
    }

    /// Remove a previously registered listener
    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.borrow_mut().remove(&id.0);
    }

    /// Invoke all listeners with the given value
    pub fn emit(&self, data: &T) {
        // clone the current listener set so listeners may (un)subscribe while running
        let listeners: Vec<_> = self.listeners.borrow().values().cloned().collect();
        for listener in listeners {
            listener(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn emit_reaches_all_listeners() {
        let signal: Signal<i32> = Signal::new();
        let count = Rc::new(Cell::new(0));

        let c1 = count.clone();
        signal.subscribe(move |v| c1.set(c1.get() + v));
        let c2 = count.clone();
        let id = signal.subscribe(move |v| c2.set(c2.get() + v));

        signal.emit(&1);
        assert_eq!(count.get(), 2);

        signal.unsubscribe(id);
        signal.emit(&1);
        assert_eq!(count.get(), 3);
    }
}
