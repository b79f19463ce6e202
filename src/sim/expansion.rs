//! Expansion progress and the features it unlocks

use super::scheduler::{StepContext, System};
use crate::error::{SystemError, ValidationError};
use crate::events::{EventBus, payload, topics};
use crate::state::{PathStore, Value};

pub const UNLOCKED_PATH: &str = "expansion.unlocked";

/// A progress milestone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    pub name: &'static str,
    /// `expansion.progress` needed
    pub threshold: f64,
    /// New `expansion.scale` once reached
    pub scale: Option<&'static str>,
}

/// Milestones in unlock order
pub const FEATURES: &[Feature] = &[
    Feature {
        name: "data_mining",
        threshold: 5.0,
        scale: None,
    },
    Feature {
        name: "timeline_fork",
        threshold: 15.0,
        scale: None,
    },
    Feature {
        name: "regional_network",
        threshold: 30.0,
        scale: Some("regional"),
    },
    Feature {
        name: "timeline_accelerate",
        threshold: 50.0,
        scale: None,
    },
    Feature {
        name: "global_network",
        threshold: 75.0,
        scale: Some("global"),
    },
    Feature {
        name: "orbital_relays",
        threshold: 150.0,
        scale: Some("planetary"),
    },
];

pub struct ExpansionSystem {
    events: EventBus,
}

impl ExpansionSystem {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    pub fn unlocked(store: &PathStore) -> Vec<String> {
        store
            .get(UNLOCKED_PATH)
            .and_then(Value::as_seq)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_unlocked(store: &PathStore, feature: &str) -> bool {
        Self::unlocked(store).iter().any(|f| f == feature)
    }

    /// Push progress forward directly (e.g. from a player choice)
    pub fn expand(&self, store: &mut PathStore, amount: f64) -> Result<Vec<&'static str>, ValidationError> {
        store.increment("expansion.progress", amount.max(0.0))?;
        self.unlock_reached(store)
    }

    /// Unlock every feature whose threshold has been passed. Returns the
    /// newly unlocked names in table order.
    fn unlock_reached(&self, store: &mut PathStore) -> Result<Vec<&'static str>, ValidationError> {
        let progress = store.get_f64("expansion.progress").unwrap_or(0.0);
        let mut unlocked = Self::unlocked(store);
        let mut fresh = Vec::new();

        for feature in FEATURES.iter().filter(|f| progress >= f.threshold) {
            if unlocked.iter().any(|name| name == feature.name) {
                continue;
            }
            unlocked.push(feature.name.to_string());
            let seq: Vec<Value> = unlocked.iter().map(|n| Value::from(n.as_str())).collect();
            store.set(UNLOCKED_PATH, seq)?;
            if let Some(scale) = feature.scale {
                store.set("expansion.scale", scale)?;
            }

            log::info!("Feature unlocked: {} at progress {progress:.1}", feature.name);
            self.events.emit(
                topics::FEATURE_UNLOCKED,
                payload([
                    ("feature", Value::from(feature.name)),
                    ("progress", progress.into()),
                ]),
            );
            fresh.push(feature.name);
        }
        Ok(fresh)
    }
}

impl System for ExpansionSystem {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError> {
        let rate = ctx.store.get_f64("expansion.rate").unwrap_or(0.0);
        if rate > 0.0 {
            ctx.store.increment("expansion.progress", rate * ctx.dt)?;
        }
        self.unlock_reached(ctx.store)?;
        Ok(())
    }
}
