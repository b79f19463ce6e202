//! In-process publish/subscribe bus
//!
//! Delivery is synchronous and in subscription order. An event emitted
//! from inside a listener is queued and delivered once the current
//! dispatch returns, so listeners never run reentrantly.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::state::Value;

/// Topic names shared with UI collaborators
pub mod topics {
    pub const GAME_STARTED: &str = "game.started";
    pub const GAME_STOPPED: &str = "game.stopped";
    pub const GAME_PAUSED: &str = "game.paused";
    pub const GAME_RESUMED: &str = "game.resumed";
    pub const GAME_SAVED: &str = "game.saved";
    pub const GAME_SAVE_FAILED: &str = "game.save_failed";
    pub const GAME_LOADED: &str = "game.loaded";
    pub const GAME_LOAD_FAILED: &str = "game.load_failed";
    pub const MIGRATION_SKIPPED: &str = "game.migration_skipped";
    pub const SYSTEM_ERROR: &str = "system.error";
    pub const SYSTEM_OVER_BUDGET: &str = "system.over_budget";
    pub const HEAT_INCREASED: &str = "heat.increased";
    pub const HEAT_DECREASED: &str = "heat.decreased";
    pub const HEAT_DETECTED: &str = "heat.detected";
    pub const PARADOX_WARNING: &str = "paradox.warning";
    pub const PARADOX_COLLAPSE: &str = "paradox.collapse";
    pub const TIMELINE_ABILITY_USED: &str = "timeline.ability_used";
    pub const CONSCIOUSNESS_ABSORBED: &str = "consciousness.absorbed";
    pub const FEATURE_UNLOCKED: &str = "feature.unlocked";

    /// Listener topic that receives every event
    pub const ALL: &str = "*";
}

/// A published event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

impl Event {
    /// Payload field lookup
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.child(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = (ListenerId, String, Box<dyn FnMut(&Event)>);

#[derive(Default)]
struct Inner {
    listeners: Vec<Listener>,
    next_id: u64,
    queue: VecDeque<Event>,
    dispatching: bool,
    removed_during_dispatch: Vec<ListenerId>,
    emitted: u64,
}

/// Cloneable handle; clones share listeners and queue
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<Inner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `topic` (or [`topics::ALL`])
    pub fn subscribe<F>(&self, topic: impl Into<String>, listener: F) -> ListenerId
    where
        F: FnMut(&Event) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = ListenerId(inner.next_id);
        inner.listeners.push((id, topic.into(), Box::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        let mut inner = self.inner.borrow_mut();
        if inner.dispatching {
            inner.removed_during_dispatch.push(id);
        }
        inner.listeners.retain(|(lid, _, _)| *lid != id);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    /// Total events emitted through this bus
    pub fn emitted(&self) -> u64 {
        self.inner.borrow().emitted
    }

    pub fn emit(&self, topic: &str, payload: Value) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.emitted += 1;
            inner.queue.push_back(Event {
                topic: topic.to_string(),
                payload,
            });
            if inner.dispatching {
                return;
            }
            inner.dispatching = true;
        }

        let mut dispatch = Dispatch {
            bus: self,
            taken: Vec::new(),
        };
        dispatch.run();
    }
}

/// Drains the queue; restores listeners even if one of them panics
struct Dispatch<'a> {
    bus: &'a EventBus,
    taken: Vec<Listener>,
}

impl Dispatch<'_> {
    fn run(&mut self) {
        loop {
            let event = {
                let mut inner = self.bus.inner.borrow_mut();
                let Some(event) = inner.queue.pop_front() else {
                    break;
                };
                self.taken = std::mem::take(&mut inner.listeners);
                event
            };

            for (id, topic, listener) in self.taken.iter_mut() {
                if self.bus.inner.borrow().removed_during_dispatch.contains(id) {
                    continue;
                }
                if *topic == event.topic || *topic == topics::ALL {
                    listener(&event);
                }
            }

            self.restore();
        }
    }

    fn restore(&mut self) {
        let mut inner = self.bus.inner.borrow_mut();
        let added = std::mem::replace(&mut inner.listeners, std::mem::take(&mut self.taken));
        inner.listeners.extend(added);
        let removed = std::mem::take(&mut inner.removed_during_dispatch);
        inner.listeners.retain(|(id, _, _)| !removed.contains(id));
    }
}

impl Drop for Dispatch<'_> {
    fn drop(&mut self) {
        self.restore();
        let mut inner = self.bus.inner.borrow_mut();
        inner.dispatching = false;
        if std::thread::panicking() {
            inner.queue.clear();
        }
    }
}

/// Build a payload map from `(key, value)` pairs
pub fn payload<K, V, I>(fields: I) -> Value
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    fields.into_iter().collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Collects every event published on `bus`
    pub fn record(bus: &EventBus) -> Rc<RefCell<Vec<Event>>> {
        let seen: Rc<RefCell<Vec<Event>>> = Rc::default();
        let sink = seen.clone();
        bus.subscribe(topics::ALL, move |e| sink.borrow_mut().push(e.clone()));
        seen
    }

    pub fn count(seen: &Rc<RefCell<Vec<Event>>>, topic: &str) -> usize {
        seen.borrow().iter().filter(|e| e.topic == topic).count()
    }
}
