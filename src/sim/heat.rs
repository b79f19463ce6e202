//! Heat: how much attention the player is drawing
//!
//! Lives entirely in the store under `heat.*`. Actions add heat, time
//! bleeds it off at `heat.decayRate` per second, and crossing the
//! detection ratio flips `heat.detected` once.

use super::scheduler::{StepContext, System};
use crate::error::{SystemError, ValidationError};
use crate::events::{EventBus, payload, topics};
use crate::settings::Difficulty;
use crate::state::{PathStore, Value};

/// Share of `heat.max` at which the player is detected
pub const DETECTION_RATIO: f64 = 0.9;
/// Detection clears again below this share
pub const CLEAR_RATIO: f64 = 0.5;

pub struct HeatSystem {
    difficulty: Difficulty,
    events: EventBus,
}

impl HeatSystem {
    pub fn new(difficulty: Difficulty, events: EventBus) -> Self {
        Self { difficulty, events }
    }

    pub fn current(store: &PathStore) -> f64 {
        store.get_f64("heat.current").unwrap_or(0.0)
    }

    pub fn max(store: &PathStore) -> f64 {
        store.get_f64("heat.max").unwrap_or(100.0)
    }

    /// Add heat scaled by difficulty, capped at `heat.max`. Returns the new total.
    pub fn add_heat(&self, store: &mut PathStore, amount: f64) -> Result<f64, ValidationError> {
        let scaled = amount.max(0.0) * self.difficulty.heat_gain();
        let current = Self::current(store);
        let total = (current + scaled).min(Self::max(store));
        store.set("heat.current", total)?;

        let applied = total - current;
        if applied > 0.0 {
            self.events.emit(
                topics::HEAT_INCREASED,
                payload([("amount", applied), ("total", total)]),
            );
            self.check_detection(store)?;
        }
        Ok(total)
    }

    /// Remove heat, floored at zero. Returns the new total.
    pub fn reduce_heat(&self, store: &mut PathStore, amount: f64) -> Result<f64, ValidationError> {
        let current = Self::current(store);
        let total = (current - amount.max(0.0)).max(0.0);
        store.set("heat.current", total)?;

        let applied = current - total;
        if applied > 0.0 {
            self.events.emit(
                topics::HEAT_DECREASED,
                payload([("amount", applied), ("total", total)]),
            );
            self.check_detection(store)?;
        }
        Ok(total)
    }

    fn check_detection(&self, store: &mut PathStore) -> Result<(), ValidationError> {
        let ratio = Self::current(store) / Self::max(store).max(f64::EPSILON);
        let detected = store.get("heat.detected").and_then(Value::as_bool).unwrap_or(false);

        if !detected && ratio >= DETECTION_RATIO {
            store.set("heat.detected", true)?;
            log::info!("Detected at {:.0}% heat", ratio * 100.0);
            self.events.emit(
                topics::HEAT_DETECTED,
                payload([("total", Self::current(store))]),
            );
        } else if detected && ratio < CLEAR_RATIO {
            store.set("heat.detected", false)?;
        }
        Ok(())
    }
}

impl System for HeatSystem {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError> {
        let current = Self::current(ctx.store);
        if current <= 0.0 {
            return Ok(());
        }
        let rate = ctx.store.get_f64("heat.decayRate").unwrap_or(0.0);
        let total = (current - rate * ctx.dt).max(0.0);
        ctx.store.set("heat.current", total)?;
        self.check_detection(ctx.store)?;
        Ok(())
    }
}
