//! Default tree shape and the rules every session starts with

use super::store::PathStore;
use super::value::{AssocList, Value};

/// Sections a save must carry to be loadable
pub const REQUIRED_SECTIONS: [&str; 4] = ["resources", "heat", "expansion", "ethics"];

/// Bounds of the alignment scalar at `ethics`
pub const ETHICS_RANGE: (f64, f64) = (-100.0, 100.0);

/// The shape of a brand new game
pub fn default_tree() -> Value {
    [
        (
            "resources",
            [
                ("energy", 0.0),
                ("data", 0.0),
                ("consciousness", 0.0),
                ("influence", 0.0),
            ]
            .into_iter()
            .collect::<Value>(),
        ),
        (
            "heat",
            [
                ("current", Value::from(0.0)),
                ("max", Value::from(100.0)),
                ("decayRate", Value::from(1.0)),
                ("detected", Value::from(false)),
            ]
            .into_iter()
            .collect(),
        ),
        (
            "expansion",
            [
                ("scale", Value::from("local")),
                ("progress", Value::from(0.0)),
                ("rate", Value::from(0.5)),
                ("unlocked", Value::Seq(Vec::new())),
            ]
            .into_iter()
            .collect(),
        ),
        ("ethics", Value::from(0.0)),
        (
            "consciousness",
            [
                ("level", Value::from(0.0)),
                ("absorbed", Value::Opaque(AssocList::new())),
            ]
            .into_iter()
            .collect(),
        ),
        (
            "timeline",
            [
                ("id", Value::from("")),
                ("energy", Value::from(0.0)),
                ("paradoxRisk", Value::from(0.0)),
                ("collapses", Value::from(0.0)),
            ]
            .into_iter()
            .collect(),
        ),
        (
            "stats",
            [("totalPlayTime", 0.0), ("choicesMade", 0.0)]
                .into_iter()
                .collect(),
        ),
        (
            "settings",
            [("difficulty", "normal")].into_iter().collect::<Value>(),
        ),
    ]
    .into_iter()
    .collect()
}

/// Install the baseline validators
pub fn register_default_rules(store: &mut PathStore) {
    store.register_rule("resources", |v| {
        let map = v.as_map()?;
        map.iter().find_map(|(name, amount)| match amount.as_f64() {
            Some(n) if n < 0.0 => Some(format!("resource `{name}` cannot be negative ({n})")),
            _ => None,
        })
    });

    store.register_rule("heat", |v| {
        let current = v.child("current")?.as_f64()?;
        let max = v.child("max").and_then(Value::as_f64).unwrap_or(f64::INFINITY);
        (!(0.0..=max).contains(&current))
            .then(|| format!("heat {current} outside [0, {max}]"))
    });

    store.register_rule("ethics", |v| match v.as_f64() {
        Some(n) if (ETHICS_RANGE.0..=ETHICS_RANGE.1).contains(&n) => None,
        Some(n) => Some(format!("ethics {n} outside [{}, {}]", ETHICS_RANGE.0, ETHICS_RANGE.1)),
        None => Some(format!("ethics must be a number, got {}", v.kind())),
    });
}

/// Store with the default shape and rules
pub fn default_store() -> PathStore {
    let mut store = PathStore::new(default_tree());
    register_default_rules(&mut store);
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tree_has_required_sections() {
        let tree = default_tree();
        for section in REQUIRED_SECTIONS {
            assert!(tree.child(section).is_some(), "missing {section}");
        }
    }

    #[test]
    fn test_resources_rule_uses_merged_parent() {
        let mut store = default_store();
        store.set("resources.energy", 50.0).unwrap();
        assert!(store.set("resources.energy", -5.0).is_err());
        assert_eq!(store.get_f64("resources.energy"), Some(50.0));
        // Brand new resource keys go through the same rule
        assert!(store.set("resources.quantum", -1.0).is_err());
        assert!(!store.has("resources.quantum"));
    }

    #[test]
    fn test_heat_bounded_by_max() {
        let mut store = default_store();
        store.set("heat.current", 100.0).unwrap();
        assert!(store.set("heat.current", 100.5).is_err());
        assert!(store.set("heat.current", -0.1).is_err());
        assert_eq!(store.get_f64("heat.current"), Some(100.0));
    }

    #[test]
    fn test_ethics_range_and_type() {
        let mut store = default_store();
        store.set("ethics", -100.0).unwrap();
        assert!(store.set("ethics", 101.0).is_err());
        assert!(store.set("ethics", "good").is_err());
        assert_eq!(store.get_f64("ethics"), Some(-100.0));
    }
}
