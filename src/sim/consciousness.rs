//! Absorbed minds and the passive output they produce
//!
//! Absorbed targets are kept at `consciousness.absorbed` as an ordered
//! association list (target name -> `{power, absorbedAt}`), so absorption
//! order survives a save round-trip.

use super::scheduler::{StepContext, System};
use crate::error::{SystemError, ValidationError};
use crate::events::{EventBus, payload, topics};
use crate::state::{AssocList, PathStore, Value};

pub const ABSORBED_PATH: &str = "consciousness.absorbed";
pub const LEVEL_PATH: &str = "consciousness.level";

/// Energy per second with nothing absorbed
const BASE_ENERGY_RATE: f64 = 1.0;
/// Extra energy per second per consciousness level
const ENERGY_PER_LEVEL: f64 = 0.5;
/// Data per second per absorbed target
const DATA_PER_TARGET: f64 = 0.2;

pub struct ConsciousnessSystem {
    events: EventBus,
}

impl ConsciousnessSystem {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }

    pub fn absorbed(store: &PathStore) -> AssocList {
        store
            .get(ABSORBED_PATH)
            .and_then(Value::as_opaque)
            .cloned()
            .unwrap_or_default()
    }

    /// Absorb `target`. Returns false if it was already absorbed.
    pub fn absorb(
        &self,
        store: &mut PathStore,
        target: &str,
        power: f64,
        now_ms: f64,
    ) -> Result<bool, ValidationError> {
        let mut absorbed = Self::absorbed(store);
        if absorbed.contains_key(target) {
            log::debug!("{target} already absorbed");
            return Ok(false);
        }
        absorbed.insert(
            target.to_string(),
            [("power", power), ("absorbedAt", now_ms)].into_iter().collect(),
        );
        let count = absorbed.len();
        store.set(ABSORBED_PATH, absorbed)?;
        let level = store.increment(LEVEL_PATH, power)?;
        store.increment("resources.consciousness", power)?;

        self.events.emit(
            topics::CONSCIOUSNESS_ABSORBED,
            payload([
                ("target", Value::from(target)),
                ("power", power.into()),
                ("level", level.into()),
                ("count", (count as f64).into()),
            ]),
        );
        Ok(true)
    }
}

impl System for ConsciousnessSystem {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError> {
        let level = ctx.store.get_f64(LEVEL_PATH).unwrap_or(0.0);
        let targets = ctx
            .store
            .get(ABSORBED_PATH)
            .and_then(Value::as_opaque)
            .map_or(0, AssocList::len);

        ctx.store
            .increment("resources.energy", (BASE_ENERGY_RATE + level * ENERGY_PER_LEVEL) * ctx.dt)?;
        if targets > 0 {
            ctx.store
                .increment("resources.data", targets as f64 * DATA_PER_TARGET * ctx.dt)?;
        }
        Ok(())
    }
}
