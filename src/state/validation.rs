//! Path-keyed validation rules
//!
//! Lookup on a write to `path`:
//! 1. a rule registered at exactly `path` gets the candidate value;
//! 2. otherwise the deepest ancestor with a rule gets a composite: the
//!    ancestor's current value with the candidate written in at the
//!    remaining suffix;
//! 3. no rule anywhere means the write is valid.

use std::collections::HashMap;

use super::path;
use super::value::Value;

/// `Some(message)` rejects the value
pub type Rule = Box<dyn Fn(&Value) -> Option<String>>;

#[derive(Default)]
pub struct ValidationRegistry {
    rules: HashMap<String, Rule>,
}

impl ValidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the rule at `path`
    pub fn register<F>(&mut self, path: impl Into<String>, rule: F)
    where
        F: Fn(&Value) -> Option<String> + 'static,
    {
        self.rules.insert(path.into(), Box::new(rule));
    }

    pub fn unregister(&mut self, path: &str) -> bool {
        self.rules.remove(path).is_some()
    }

    pub fn has_rule(&self, path: &str) -> bool {
        self.rules.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check a candidate write against `root`.
    ///
    /// Returns the path of the rule that rejected it and its message.
    pub fn check(&self, root: &Value, target: &str, candidate: &Value) -> Option<(String, String)> {
        if let Some(rule) = self.rules.get(target) {
            return rule(candidate).map(|msg| (target.to_string(), msg));
        }

        for prefix in path::ancestors(target) {
            let Some(rule) = self.rules.get(prefix) else {
                continue;
            };
            let suffix = &target[prefix.len() + 1..];
            let composite = compose(lookup(root, prefix), suffix, candidate);
            return rule(&composite).map(|msg| (prefix.to_string(), msg));
        }

        None
    }
}

fn lookup<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(root, |node, seg| node.child(seg))
}

/// Current value at a prefix with `candidate` placed at `suffix`
fn compose(current: Option<&Value>, suffix: &str, candidate: &Value) -> Value {
    let mut composite = current.cloned().unwrap_or_else(Value::map);
    let segments: Vec<&str> = suffix.split('.').collect();
    if let Err(err) = composite.write_path(&segments, candidate.clone()) {
        log::debug!("Rule composite left as is: {err}");
    }
    composite
}

#[cfg(test)]
mod tests {
    use super::*;

    fn non_negative(v: &Value) -> Option<String> {
        match v.as_f64() {
            Some(n) if n < 0.0 => Some(format!("{n} is negative")),
            _ => None,
        }
    }

    fn tree() -> Value {
        [(
            "resources",
            [("energy", 10.0), ("data", 5.0)].into_iter().collect::<Value>(),
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_exact_rule_wins() {
        let mut reg = ValidationRegistry::new();
        reg.register("resources.energy", non_negative);
        reg.register("resources", |_| Some("prefix rule should not run".into()));

        let root = tree();
        assert!(reg.check(&root, "resources.energy", &Value::from(3.0)).is_none());
        let (at, _) = reg.check(&root, "resources.energy", &Value::from(-1.0)).unwrap();
        assert_eq!(at, "resources.energy");
    }

    #[test]
    fn test_prefix_rule_sees_merged_parent() {
        let mut reg = ValidationRegistry::new();
        reg.register("resources", |v| {
            let map = v.as_map()?;
            // The sibling must still be there alongside the new value
            match (map.get("data"), map.get("energy")) {
                (Some(_), Some(e)) if e.as_f64() < Some(0.0) => Some("negative".into()),
                (None, _) => Some("sibling missing".into()),
                _ => None,
            }
        });

        let root = tree();
        assert!(reg.check(&root, "resources.energy", &Value::from(1.0)).is_none());
        let (at, msg) = reg.check(&root, "resources.energy", &Value::from(-1.0)).unwrap();
        assert_eq!(at, "resources");
        assert_eq!(msg, "negative");
    }

    #[test]
    fn test_deepest_prefix_first() {
        let mut reg = ValidationRegistry::new();
        reg.register("a", |_| Some("shallow".into()));
        reg.register("a.b", |_| Some("deep".into()));

        let (at, msg) = reg.check(&Value::map(), "a.b.c.d", &Value::from(1.0)).unwrap();
        assert_eq!(at, "a.b");
        assert_eq!(msg, "deep");
    }

    #[test]
    fn test_multi_segment_suffix_is_nested() {
        let mut reg = ValidationRegistry::new();
        reg.register("a", |v| {
            let inner = v.child("b")?.child("c")?;
            (inner.as_f64() != Some(7.0)).then(|| "expected nested 7".to_string())
        });
        assert!(reg.check(&Value::map(), "a.b.c", &Value::from(7.0)).is_none());
    }

    #[test]
    fn test_prefix_rule_over_opaque_list_keeps_entries() {
        let mut reg = ValidationRegistry::new();
        reg.register("absorbed", |v| {
            let list = v.as_opaque()?;
            (list.len() > 2).then(|| format!("{} targets", list.len()))
        });
        let root: Value = [(
            "absorbed",
            Value::Opaque([("n1", 1.0), ("n2", 2.0)].into_iter().collect()),
        )]
        .into_iter()
        .collect();

        assert!(reg.check(&root, "absorbed.n1", &Value::from(5.0)).is_none());
        let (_, msg) = reg.check(&root, "absorbed.n3", &Value::from(3.0)).unwrap();
        assert_eq!(msg, "3 targets");
    }

    #[test]
    fn test_no_rule_is_valid() {
        let reg = ValidationRegistry::new();
        assert!(reg.check(&Value::map(), "anything.at.all", &Value::Null).is_none());
    }
}
