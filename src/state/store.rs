//! Reactive path-addressed state store
//!
//! The single source of truth for game state. Everything outside reads
//! through [`PathStore::get`] and reacts through [`PathStore::subscribe`].
//!
//! Notification rules for a write to `a.b.c`:
//! - subscribers of `a.b.c` get `(new, Some(old), "a.b.c")`
//! - then `a.b`, then `a`, each with `(value_at_prefix, None, prefix)`
//!
//! Ancestors never see the previous value.

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use serde_json::Value as Json;

use super::path;
use super::validation::ValidationRegistry;
use super::value::{NULL, Value, deep_merge};
use crate::consts::DEFAULT_HISTORY_CAPACITY;
use crate::error::{StateError, ValidationError};
use crate::platform::{Clock, SystemClock};

/// Subscriber callback: `(new_value, old_value, path)`
pub type Callback = Box<dyn FnMut(&Value, Option<&Value>, &str)>;

/// Token returned by [`PathStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Per-write switches
#[derive(Debug, Clone, Copy)]
pub struct SetOptions {
    pub validate: bool,
    pub notify: bool,
    pub record_history: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            validate: true,
            notify: true,
            record_history: true,
        }
    }
}

impl SetOptions {
    /// No validation, notification or history
    pub fn silent() -> Self {
        Self {
            validate: false,
            notify: false,
            record_history: false,
        }
    }
}

/// One applied write
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: f64,
}

pub struct PathStore {
    root: Value,
    defaults: Value,
    rules: ValidationRegistry,
    subscribers: HashMap<String, Vec<(SubscriptionId, Callback)>>,
    next_subscription: u64,
    history: VecDeque<ChangeRecord>,
    history_capacity: usize,
    clock: Rc<dyn Clock>,
}

impl PathStore {
    /// Create a store whose initial (and reset) shape is `defaults`
    pub fn new(defaults: Value) -> Self {
        Self {
            root: defaults.clone(),
            defaults,
            rules: ValidationRegistry::new(),
            subscribers: HashMap::new(),
            next_subscription: 1,
            history: VecDeque::with_capacity(DEFAULT_HISTORY_CAPACITY),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            clock: Rc::new(SystemClock),
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self.trim_history();
        self
    }

    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn rules(&self) -> &ValidationRegistry {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut ValidationRegistry {
        &mut self.rules
    }

    /// Shorthand for `rules_mut().register(..)`
    pub fn register_rule<F>(&mut self, path: impl Into<String>, rule: F)
    where
        F: Fn(&Value) -> Option<String> + 'static,
    {
        self.rules.register(path, rule);
    }

    // === Reads ===

    /// Value at `path`, or `None` as soon as a segment is missing
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.root, path)
    }

    pub fn get_or<'a>(&'a self, path: &str, default: &'a Value) -> &'a Value {
        self.get(path).unwrap_or(default)
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// The whole tree
    pub fn root(&self) -> &Value {
        &self.root
    }

    // === Writes ===

    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<(), ValidationError> {
        self.set_with(path, value, SetOptions::default())
    }

    /// Validate, write and notify.
    ///
    /// A rejected write leaves the tree untouched. Writing a value equal to
    /// the current one is accepted but records and notifies nothing.
    pub fn set_with(
        &mut self,
        path: &str,
        value: impl Into<Value>,
        opts: SetOptions,
    ) -> Result<(), ValidationError> {
        let value = value.into();
        let segments = self.check_write(path, &value)?;
        if opts.validate {
            self.validate(path, &value)?;
        }

        let Some(old) = self.apply(path, &segments, value, opts.record_history)? else {
            return Ok(());
        };
        if opts.notify {
            self.notify(path, old.as_ref());
        }
        Ok(())
    }

    /// All-or-nothing multi-path write.
    ///
    /// Every entry is validated against the pre-batch tree before any is
    /// applied. Writes go to a scratch copy that replaces the tree only once
    /// every entry landed. Notifications fire after all writes, in input
    /// order.
    pub fn batch_update<I, P>(&mut self, entries: I, opts: SetOptions) -> Result<(), ValidationError>
    where
        I: IntoIterator<Item = (P, Value)>,
        P: Into<String>,
    {
        let entries: Vec<(String, Value)> =
            entries.into_iter().map(|(p, v)| (p.into(), v)).collect();

        for (path, value) in &entries {
            self.check_write(path, value)?;
            if opts.validate {
                self.validate(path, value)?;
            }
        }

        // An earlier entry can reshape the tree under a later one
        let mut next = self.root.clone();
        let mut changed = Vec::new();
        for (path, value) in entries {
            if lookup(&next, &path) == Some(&value) {
                continue;
            }
            let segments = path::segments(&path)?;
            let new_value = opts.record_history.then(|| value.clone());
            let old = next.write_path(&segments, value)?;
            changed.push((path, old, new_value));
        }
        self.root = next;

        let mut notices = Vec::with_capacity(changed.len());
        for (path, old, new_value) in changed {
            if new_value.is_some() {
                self.record(&path, old.clone(), new_value);
            }
            notices.push((path, old));
        }
        if opts.notify {
            for (path, old) in &notices {
                self.notify(path, old.as_ref());
            }
        }
        Ok(())
    }

    /// Add `delta` to a numeric path (absent counts as 0). Returns the new value.
    pub fn increment(&mut self, path: &str, delta: f64) -> Result<f64, ValidationError> {
        let next = self.get_f64(path).unwrap_or(0.0) + delta;
        self.set(path, next)?;
        Ok(next)
    }

    /// Delete the value at `path`. Subscribers see `Value::Null` as the new value.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parent, last) = match path.rsplit_once('.') {
            Some((parent, last)) => (lookup_mut(&mut self.root, parent)?, last),
            None => (&mut self.root, path),
        };
        let old = match parent {
            Value::Map(map) => map.remove(last)?,
            Value::Opaque(list) => list.remove(last)?,
            _ => return None,
        };
        self.record(path, Some(old.clone()), None);
        self.notify(path, Some(&old));
        Some(old)
    }

    /// Checks every write gets regardless of options: a well-formed path
    /// that only passes through containers, and finite numbers.
    fn check_write<'p>(&self, path: &'p str, value: &Value) -> Result<Vec<&'p str>, ValidationError> {
        let segments = path::segments(path)?;
        self.root.check_writable(&segments)?;
        if !value.is_finite() {
            return Err(ValidationError::NonFinite(path.to_string()));
        }
        Ok(segments)
    }

    fn validate(&self, path: &str, value: &Value) -> Result<(), ValidationError> {
        match self.rules.check(&self.root, path, value) {
            Some((rule_path, message)) => {
                log::debug!("Rejected write to {path} (rule at {rule_path}): {message}");
                Err(ValidationError::Rule {
                    path: rule_path,
                    message,
                })
            }
            None => Ok(()),
        }
    }

    /// Write without validation or notification.
    ///
    /// Returns `None` when nothing changed, otherwise `Some(old)`.
    fn apply(
        &mut self,
        path: &str,
        segments: &[&str],
        value: Value,
        record_history: bool,
    ) -> Result<Option<Option<Value>>, ValidationError> {
        if self.get(path) == Some(&value) {
            return Ok(None);
        }
        let new_value = record_history.then(|| value.clone());
        let old = self.root.write_path(segments, value)?;
        if record_history {
            self.record(path, old.clone(), new_value);
        }
        Ok(Some(old))
    }

    // === Subscriptions ===

    /// Watch `path`. Registering the same callback twice gives two
    /// independent subscriptions.
    pub fn subscribe<F>(&mut self, path: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: FnMut(&Value, Option<&Value>, &str) + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers
            .entry(path.into())
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut found = false;
        self.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(sub_id, _)| *sub_id != id);
            found |= subs.len() != before;
            !subs.is_empty()
        });
        found
    }

    pub fn subscriber_count(&self, path: &str) -> usize {
        self.subscribers.get(path).map_or(0, Vec::len)
    }

    fn notify(&mut self, path: &str, old: Option<&Value>) {
        let Self {
            root, subscribers, ..
        } = self;

        if let Some(subs) = subscribers.get_mut(path) {
            let new = lookup(root, path).unwrap_or(&NULL);
            for (_, callback) in subs.iter_mut() {
                callback(new, old, path);
            }
        }

        for prefix in path::ancestors(path) {
            let Some(subs) = subscribers.get_mut(prefix) else {
                continue;
            };
            let current = lookup(root, prefix).unwrap_or(&NULL);
            for (_, callback) in subs.iter_mut() {
                callback(current, None, prefix);
            }
        }
    }

    // === History ===

    pub fn history(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.history.iter()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    fn record(&mut self, path: &str, old_value: Option<Value>, new_value: Option<Value>) {
        self.history.push_back(ChangeRecord {
            path: path.to_string(),
            old_value,
            new_value,
            timestamp: self.clock.now_ms(),
        });
        self.trim_history();
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
    }

    // === Whole-tree operations ===

    /// Deep copy of the tree
    pub fn snapshot(&self) -> Value {
        self.root.clone()
    }

    /// Replace the whole tree. Every subscribed path whose value differs
    /// is notified with its previous value.
    pub fn set_state(&mut self, tree: Value) {
        let old_root = std::mem::replace(&mut self.root, tree);

        let mut paths: Vec<String> = self.subscribers.keys().cloned().collect();
        paths.sort();
        for sub_path in paths {
            let old = lookup(&old_root, &sub_path);
            let new = lookup(&self.root, &sub_path);
            if old == new {
                continue;
            }
            if let Some(subs) = self.subscribers.get_mut(&sub_path) {
                let new = new.unwrap_or(&NULL);
                for (_, callback) in subs.iter_mut() {
                    callback(new, old, &sub_path);
                }
            }
        }
    }

    /// Restore the default shape
    pub fn reset(&mut self) {
        let defaults = self.defaults.clone();
        self.set_state(defaults);
        self.history.clear();
    }

    pub fn defaults(&self) -> &Value {
        &self.defaults
    }

    /// JSON form of the tree; opaque lists become tagged pair arrays
    pub fn serialize(&self) -> Json {
        self.root.to_json()
    }

    /// Load a serialized tree, deep-merged over the defaults so paths
    /// added since the save was written come back populated.
    pub fn deserialize(&mut self, data: &Json) -> Result<(), StateError> {
        let loaded = Value::from_json(data);
        if !matches!(loaded, Value::Map(_)) {
            return Err(StateError::NotAMap(loaded.kind()));
        }
        let merged = deep_merge(&self.defaults, &loaded);
        self.set_state(merged);
        Ok(())
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, seg| node.child(seg))
}

fn lookup_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(root, |node, seg| node.child_mut(seg))
}
