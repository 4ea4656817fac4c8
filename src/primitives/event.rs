//! Completion events.
//!
//! A [`UserEvent`] is triggered exactly once by whoever owns it; any number
//! of [`Event`] handles observe it. Remote requests hand out events so that
//! callers decide when (and whether) to block.

use std::fmt;
use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;

struct Trigger {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Trigger {
    fn is_fired(&self) -> bool {
        return *self.fired.lock();
    }

    fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cond.wait(&mut fired);
        }
    }
}

#[derive(Clone)]
enum EventKind {
    Done,
    Pending(Arc<Trigger>),
    Merged(Arc<[Event]>),
}

/// A handle on something that completes at some point.
#[derive(Clone)]
pub struct Event {
    kind: EventKind,
}

impl Event {
    /// An event that has already triggered.
    pub const NO_EVENT: Event = Event { kind: EventKind::Done };

    /// True unless this is [`Event::NO_EVENT`].
    pub fn exists(&self) -> bool {
        return !matches!(self.kind, EventKind::Done);
    }

    pub fn has_triggered(&self) -> bool {
        match &self.kind {
            EventKind::Done => return true,
            EventKind::Pending(trigger) => return trigger.is_fired(),
            EventKind::Merged(events) => return events.iter().all(Event::has_triggered),
        }
    }

    /// Block the calling thread until the event triggers.
    pub fn wait(&self) {
        match &self.kind {
            EventKind::Done => {}
            EventKind::Pending(trigger) => trigger.wait(),
            EventKind::Merged(events) => {
                for event in events.iter() {
                    event.wait();
                }
            }
        }
    }

    /// An event that triggers once every input has triggered.
    pub fn merge<I: IntoIterator<Item = Event>>(events: I) -> Event {
        let mut pending: Vec<Event> = events.into_iter().filter(|e| !e.has_triggered()).collect();
        match pending.len() {
            0 => return Event::NO_EVENT,
            1 => return pending.swap_remove(0),
            _ => return Event { kind: EventKind::Merged(pending.into()) },
        }
    }
}

impl Default for Event {
    fn default() -> Event {
        return Event::NO_EVENT;
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("Event")
            .field("triggered", &self.has_triggered())
            .finish();
    }
}

/// An event triggered explicitly by its owner.
///
/// Not `Clone`: triggering consumes the handle, so an event cannot fire twice.
pub struct UserEvent {
    trigger: Arc<Trigger>,
}

impl UserEvent {
    pub fn new() -> UserEvent {
        return UserEvent {
            trigger: Arc::new(Trigger { fired: Mutex::new(false), cond: Condvar::new() }),
        };
    }

    /// An observer of this event.
    pub fn event(&self) -> Event {
        return Event { kind: EventKind::Pending(self.trigger.clone()) };
    }

    pub fn trigger(self) {
        let mut fired = self.trigger.fired.lock();
        debug_assert!(!*fired);
        *fired = true;
        self.trigger.cond.notify_all();
    }
}

impl Default for UserEvent {
    fn default() -> UserEvent {
        return UserEvent::new();
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.debug_struct("UserEvent").field("triggered", &self.trigger.is_fired()).finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn trigger_is_observed() {
        let user = UserEvent::new();
        let event = user.event();
        assert!(event.exists());
        assert!(!event.has_triggered());
        user.trigger();
        assert!(event.has_triggered());
        event.wait();
    }

    #[test]
    fn merge_skips_triggered_inputs() {
        let a = UserEvent::new();
        let b = UserEvent::new();
        let merged = Event::merge([a.event(), Event::NO_EVENT, b.event()]);
        assert!(!merged.has_triggered());
        a.trigger();
        assert!(!merged.has_triggered());
        b.trigger();
        assert!(merged.has_triggered());

        assert!(!Event::merge(Vec::new()).exists());
    }

    #[test]
    fn wait_blocks_until_trigger() {
        let user = UserEvent::new();
        let event = user.event();
        let waiter = thread::spawn(move || event.wait());
        user.trigger();
        waiter.join().unwrap();
    }
}
