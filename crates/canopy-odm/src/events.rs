use std::fmt;

use canopy_types::DocumentHandle;

/// Lifecycle points raised by the unit of work.
///
/// Document-scoped events carry the affected handle; the flush and clear
/// events carry none. `OnFlush` fires after change-set computation and
/// before any store I/O, so listeners observe the final scheduled state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
    PreMove,
    PostMove,
    PostLoad,
    PreFlush,
    OnFlush,
    PostFlush,
    OnClear,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PrePersist => "prePersist",
            Self::PostPersist => "postPersist",
            Self::PreUpdate => "preUpdate",
            Self::PostUpdate => "postUpdate",
            Self::PreRemove => "preRemove",
            Self::PostRemove => "postRemove",
            Self::PreMove => "preMove",
            Self::PostMove => "postMove",
            Self::PostLoad => "postLoad",
            Self::PreFlush => "preFlush",
            Self::OnFlush => "onFlush",
            Self::PostFlush => "postFlush",
            Self::OnClear => "onClear",
        };
        write!(f, "{s}")
    }
}

type Listener = Box<dyn Fn(LifecycleEvent, Option<DocumentHandle>)>;

/// Subscriber registry for lifecycle events.
///
/// Listeners run synchronously on the manager's thread, in subscription
/// order. Like the manager itself, the dispatcher is not safe for use
/// from multiple threads of control.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<Listener>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every lifecycle event.
    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(LifecycleEvent, Option<DocumentHandle>) + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Subscribe to one event kind.
    pub fn on<F>(&mut self, event: LifecycleEvent, listener: F)
    where
        F: Fn(Option<DocumentHandle>) + 'static,
    {
        self.subscribe(move |fired, handle| {
            if fired == event {
                listener(handle);
            }
        });
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Fire an event to all listeners.
    pub fn dispatch(&self, event: LifecycleEvent, handle: Option<DocumentHandle>) {
        for listener in &self.listeners {
            listener(event, handle);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dispatch_reaches_all_listeners() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();
        for _ in 0..2 {
            let seen = Rc::clone(&seen);
            dispatcher.subscribe(move |event, _| seen.borrow_mut().push(event));
        }
        dispatcher.dispatch(LifecycleEvent::PreFlush, None);
        assert_eq!(
            *seen.borrow(),
            vec![LifecycleEvent::PreFlush, LifecycleEvent::PreFlush]
        );
    }

    #[test]
    fn on_filters_by_event() {
        let count = Rc::new(RefCell::new(0));
        let mut dispatcher = EventDispatcher::new();
        let counter = Rc::clone(&count);
        dispatcher.on(LifecycleEvent::PostPersist, move |_| {
            *counter.borrow_mut() += 1;
        });
        dispatcher.dispatch(LifecycleEvent::PrePersist, None);
        dispatcher.dispatch(LifecycleEvent::PostPersist, None);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn handle_is_forwarded() {
        let seen = Rc::new(RefCell::new(None));
        let mut dispatcher = EventDispatcher::new();
        let sink = Rc::clone(&seen);
        dispatcher.subscribe(move |_, handle| *sink.borrow_mut() = handle);
        let handle = DocumentHandle::from_raw(3);
        dispatcher.dispatch(LifecycleEvent::PostLoad, Some(handle));
        assert_eq!(*seen.borrow(), Some(handle));
    }
}
