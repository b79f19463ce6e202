//! Temporal subsystem: timeline energy, paradox risk and collapse
//!
//! Every meaningful action is logged as a [`TimelineEvent`] whose risk
//! contribution comes from [`TimelineEventKind::paradox_weight`], never
//! from the call site. Risk at 100 collapses the timeline: the current
//! one is archived and a fresh one starts at half energy.

use std::collections::{BTreeSet, VecDeque};
use std::rc::Rc;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use super::scheduler::{StepContext, System};
use crate::error::{AbilityError, StateError, SystemError};
use crate::events::{EventBus, payload, topics};
use crate::persistence::Persistable;
use crate::platform::{Clock, SystemClock};
use crate::settings::{Difficulty, TimelineSettings};
use crate::state::{PathStore, SetOptions, Value};

pub const MAX_PARADOX_RISK: f64 = 100.0;

/// Risk removed by [`Ability::Stabilize`]
const STABILIZE_AMOUNT: f64 = 20.0;
/// Seconds of doubled regeneration per [`Ability::Accelerate`]
const ACCELERATE_SECONDS: f64 = 10.0;
/// Weight of the newest sample in the risk growth estimate
const GROWTH_SMOOTHING: f64 = 0.2;

/// Player-invoked timeline manipulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ability {
    /// Undo the most recent event, refunding half its risk
    Rewind,
    /// Branch off a copy of the current timeline into the archive
    Fork,
    /// Shed a fixed amount of paradox risk
    Stabilize,
    /// Double energy regeneration for a while
    Accelerate,
}

impl Ability {
    pub const ALL: [Ability; 4] = [
        Ability::Rewind,
        Ability::Fork,
        Ability::Stabilize,
        Ability::Accelerate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ability::Rewind => "rewind",
            Ability::Fork => "fork",
            Ability::Stabilize => "stabilize",
            Ability::Accelerate => "accelerate",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == s)
    }

    /// Energy spent on use
    pub fn cost(&self) -> f64 {
        match self {
            Ability::Rewind => 30.0,
            Ability::Fork => 50.0,
            Ability::Stabilize => 25.0,
            Ability::Accelerate => 20.0,
        }
    }

    /// Available from the start of a game
    pub fn starts_unlocked(&self) -> bool {
        matches!(self, Ability::Rewind | Ability::Stabilize)
    }

    fn event_kind(&self) -> TimelineEventKind {
        match self {
            Ability::Rewind => TimelineEventKind::Rewind,
            Ability::Fork => TimelineEventKind::Fork,
            Ability::Stabilize => TimelineEventKind::Stabilize,
            Ability::Accelerate => TimelineEventKind::Accelerate,
        }
    }
}

/// What happened, independent of how risky it was
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelineEventKind {
    Choice,
    Absorption,
    Expansion,
    Detection,
    Rewind,
    Fork,
    Stabilize,
    Accelerate,
}

impl TimelineEventKind {
    /// Base paradox risk contributed by one event of this kind
    pub fn paradox_weight(&self) -> f64 {
        match self {
            TimelineEventKind::Choice => 5.0,
            TimelineEventKind::Absorption => 8.0,
            TimelineEventKind::Expansion => 3.0,
            TimelineEventKind::Detection => 10.0,
            TimelineEventKind::Rewind => 15.0,
            TimelineEventKind::Fork => 20.0,
            TimelineEventKind::Stabilize => 0.0,
            TimelineEventKind::Accelerate => 6.0,
        }
    }
}

/// Immutable record of one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub kind: TimelineEventKind,
    pub timestamp: f64,
    /// Risk actually applied (base weight times difficulty)
    pub paradox_weight: f64,
    pub description: String,
}

/// What remains of a timeline after it is left behind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedTimeline {
    pub id: String,
    pub archived_at: f64,
    pub event_count: usize,
    pub alteration_count: usize,
    pub peak_risk: f64,
    /// `collapse` or `fork`
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineState {
    pub timeline_id: String,
    pub energy: f64,
    pub max_energy: f64,
    pub paradox_risk: f64,
    pub peak_risk: f64,
    pub unlocked: BTreeSet<Ability>,
    pub events: VecDeque<TimelineEvent>,
    pub alterations: Vec<String>,
    pub archived: VecDeque<ArchivedTimeline>,
    pub collapse_count: u64,
    #[serde(default)]
    pub accelerate_remaining: f64,
}

impl TimelineState {
    /// First timeline of a new game
    fn fresh(settings: &TimelineSettings) -> Self {
        Self {
            timeline_id: timeline_id(settings.seed, 0),
            energy: settings.max_energy,
            max_energy: settings.max_energy,
            paradox_risk: 0.0,
            peak_risk: 0.0,
            unlocked: Ability::ALL.into_iter().filter(Ability::starts_unlocked).collect(),
            events: VecDeque::new(),
            alterations: Vec::new(),
            archived: VecDeque::new(),
            collapse_count: 0,
            accelerate_remaining: 0.0,
        }
    }
}

pub struct TimelineSystem {
    state: TimelineState,
    settings: TimelineSettings,
    difficulty: Difficulty,
    events: EventBus,
    clock: Rc<dyn Clock>,
    /// Smoothed risk change per second
    risk_growth: f64,
    last_risk: f64,
}

impl TimelineSystem {
    pub fn new(settings: TimelineSettings, difficulty: Difficulty, events: EventBus) -> Self {
        Self {
            state: TimelineState::fresh(&settings),
            settings,
            difficulty,
            events,
            clock: Rc::new(SystemClock),
            risk_growth: 0.0,
            last_risk: 0.0,
        }
    }

    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> &TimelineState {
        &self.state
    }

    pub fn timeline_id(&self) -> &str {
        &self.state.timeline_id
    }

    pub fn energy(&self) -> f64 {
        self.state.energy
    }

    pub fn paradox_risk(&self) -> f64 {
        self.state.paradox_risk
    }

    pub fn is_unlocked(&self, ability: Ability) -> bool {
        self.state.unlocked.contains(&ability)
    }

    /// Returns false if it was already unlocked
    pub fn unlock(&mut self, ability: Ability) -> bool {
        let added = self.state.unlocked.insert(ability);
        if added {
            log::info!("Timeline ability unlocked: {}", ability.as_str());
        }
        added
    }

    /// Seconds until collapse at the current growth rate, if growing
    pub fn time_to_collapse(&self) -> Option<f64> {
        (self.risk_growth > f64::EPSILON)
            .then(|| (MAX_PARADOX_RISK - self.state.paradox_risk) / self.risk_growth)
    }

    // === Actions ===

    /// Log an action and apply its paradox weight. Returns true if the
    /// resulting risk collapsed the timeline.
    pub fn record_event(&mut self, kind: TimelineEventKind, description: impl Into<String>) -> bool {
        let weight = kind.paradox_weight() * self.difficulty.paradox_gain();
        self.state.events.push_back(TimelineEvent {
            kind,
            timestamp: self.clock.now_ms(),
            paradox_weight: weight,
            description: description.into(),
        });
        while self.state.events.len() > self.settings.event_cap {
            self.state.events.pop_front();
        }
        self.increase_paradox_risk(weight)
    }

    /// Mark the present timeline as altered by `what`
    pub fn record_alteration(&mut self, what: impl Into<String>) {
        self.state.alterations.push(what.into());
    }

    /// Add (or with a negative amount, remove) risk. Reaching the maximum
    /// collapses the timeline; returns true when that happened.
    pub fn increase_paradox_risk(&mut self, amount: f64) -> bool {
        let risk = (self.state.paradox_risk + amount).clamp(0.0, MAX_PARADOX_RISK);
        self.state.paradox_risk = risk;
        self.state.peak_risk = self.state.peak_risk.max(risk);
        if risk >= MAX_PARADOX_RISK {
            self.collapse("paradox_overflow");
            return true;
        }
        false
    }

    /// Spend energy on an ability. Fails without side effects when the
    /// ability is locked or unaffordable.
    pub fn use_ability(&mut self, ability: Ability) -> Result<(), AbilityError> {
        if !self.is_unlocked(ability) {
            return Err(AbilityError::Locked(ability.as_str()));
        }
        let cost = ability.cost();
        if self.state.energy < cost {
            return Err(AbilityError::InsufficientEnergy {
                ability: ability.as_str(),
                cost,
                available: self.state.energy,
            });
        }
        self.state.energy -= cost;

        match ability {
            Ability::Rewind => {
                if let Some(undone) = self.state.events.pop_back() {
                    self.state.paradox_risk =
                        (self.state.paradox_risk - undone.paradox_weight / 2.0).max(0.0);
                }
                self.state.alterations.pop();
            }
            Ability::Fork => {
                let branch = self.archive_entry("fork");
                self.push_archive(branch);
            }
            Ability::Stabilize => {
                self.state.paradox_risk = (self.state.paradox_risk - STABILIZE_AMOUNT).max(0.0);
            }
            Ability::Accelerate => {
                self.state.accelerate_remaining += ACCELERATE_SECONDS;
            }
        }

        log::debug!("Used {} for {cost} energy", ability.as_str());
        self.events.emit(
            topics::TIMELINE_ABILITY_USED,
            payload([
                ("ability", Value::from(ability.as_str())),
                ("cost", cost.into()),
                ("energy", self.state.energy.into()),
            ]),
        );
        self.record_event(ability.event_kind(), ability.as_str());
        Ok(())
    }

    /// Archive the current timeline and start a fresh one
    pub fn collapse(&mut self, collapse_type: &str) {
        let archived = self.archive_entry("collapse");
        let old_id = archived.id.clone();
        self.push_archive(archived);

        self.state.collapse_count += 1;
        self.state.timeline_id = timeline_id(self.settings.seed, self.state.collapse_count);
        self.state.events.clear();
        self.state.alterations.clear();
        self.state.paradox_risk = 0.0;
        self.state.peak_risk = 0.0;
        self.state.energy = self.state.max_energy / 2.0;
        self.state.accelerate_remaining = 0.0;
        self.risk_growth = 0.0;
        self.last_risk = 0.0;

        log::info!(
            "Timeline {old_id} collapsed ({collapse_type}), now {}",
            self.state.timeline_id
        );
        self.events.emit(
            topics::PARADOX_COLLAPSE,
            payload([
                ("timelineId", old_id.as_str()),
                ("newTimelineId", self.state.timeline_id.as_str()),
                ("collapseType", collapse_type),
            ]),
        );
    }

    fn archive_entry(&self, reason: &str) -> ArchivedTimeline {
        ArchivedTimeline {
            id: self.state.timeline_id.clone(),
            archived_at: self.clock.now_ms(),
            event_count: self.state.events.len(),
            alteration_count: self.state.alterations.len(),
            peak_risk: self.state.peak_risk,
            reason: reason.to_string(),
        }
    }

    fn push_archive(&mut self, entry: ArchivedTimeline) {
        self.state.archived.push_back(entry);
        while self.state.archived.len() > self.settings.archive_cap {
            self.state.archived.pop_front();
        }
    }

    /// Mirror the UI-facing numbers into `timeline.*`
    pub fn project(&self, store: &mut PathStore) {
        let opts = SetOptions {
            validate: false,
            notify: true,
            record_history: false,
        };
        let entries = [
            ("timeline.id", Value::from(self.state.timeline_id.as_str())),
            ("timeline.energy", self.state.energy.into()),
            ("timeline.paradoxRisk", self.state.paradox_risk.into()),
            ("timeline.collapses", (self.state.collapse_count as f64).into()),
        ];
        if let Err(err) = store.batch_update(entries, opts) {
            log::warn!("Timeline projection rejected: {err}");
        }
    }
}

impl System for TimelineSystem {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError> {
        let dt = ctx.dt;

        let mut regen = self.settings.energy_regen * dt;
        if self.state.accelerate_remaining > 0.0 {
            regen *= 2.0;
            self.state.accelerate_remaining = (self.state.accelerate_remaining - dt).max(0.0);
        }
        self.state.energy = (self.state.energy + regen).min(self.state.max_energy);
        self.state.paradox_risk = (self.state.paradox_risk - self.settings.risk_decay * dt).max(0.0);

        if dt > 0.0 {
            let sample = (self.state.paradox_risk - self.last_risk) / dt;
            self.risk_growth =
                self.risk_growth * (1.0 - GROWTH_SMOOTHING) + sample * GROWTH_SMOOTHING;
        }
        self.last_risk = self.state.paradox_risk;

        if self.state.paradox_risk >= self.settings.critical_risk {
            let ttc = self.time_to_collapse().map_or(Value::Null, Value::from);
            ctx.events.emit(
                topics::PARADOX_WARNING,
                payload([
                    ("risk", Value::from(self.state.paradox_risk)),
                    ("timeToCollapse", ttc),
                ]),
            );
        }

        self.project(ctx.store);
        Ok(())
    }
}

impl Persistable for TimelineSystem {
    fn name(&self) -> &'static str {
        "timeline"
    }

    fn get_state(&self) -> Result<Json, StateError> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn set_state(&mut self, state: &Json) -> Result<(), StateError> {
        let mut loaded: TimelineState = serde_json::from_value(state.clone())?;
        if !(0.0..=MAX_PARADOX_RISK).contains(&loaded.paradox_risk) {
            return Err(StateError::OutOfRange(format!(
                "paradox risk {}",
                loaded.paradox_risk
            )));
        }
        if !(0.0..=loaded.max_energy).contains(&loaded.energy) {
            return Err(StateError::OutOfRange(format!(
                "timeline energy {} of {}",
                loaded.energy, loaded.max_energy
            )));
        }
        while loaded.events.len() > self.settings.event_cap {
            loaded.events.pop_front();
        }
        while loaded.archived.len() > self.settings.archive_cap {
            loaded.archived.pop_front();
        }
        self.last_risk = loaded.paradox_risk;
        self.risk_growth = 0.0;
        self.state = loaded;
        Ok(())
    }

    fn reset_default(&mut self) {
        self.state = TimelineState::fresh(&self.settings);
        self.last_risk = 0.0;
        self.risk_growth = 0.0;
    }
}

/// Deterministic id for the `n`th timeline of a seed
fn timeline_id(seed: u64, n: u64) -> String {
    let mut rng = Pcg32::seed_from_u64(seed ^ n.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    format!("tl-{:08x}", rng.random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::{count, record};
    use crate::platform::ManualClock;
    use crate::state::default_store;

    fn system(bus: &EventBus) -> TimelineSystem {
        TimelineSystem::new(TimelineSettings::default(), Difficulty::Normal, bus.clone())
            .with_clock(Rc::new(ManualClock::new(1_000.0)))
    }

    fn step(system: &mut TimelineSystem, store: &mut PathStore, bus: &EventBus, dt: f64) {
        let mut ctx = StepContext {
            store,
            events: bus,
            dt,
            now_ms: 0.0,
            tick: 1,
        };
        system.update(&mut ctx).unwrap();
    }

    #[test]
    fn test_repeated_risk_collapses_exactly_once() {
        let bus = EventBus::new();
        let seen = record(&bus);
        let mut timeline = system(&bus);
        let first_id = timeline.timeline_id().to_string();
        timeline.state.energy = 80.0;

        let mut collapsed = 0;
        for _ in 0..4 {
            if timeline.increase_paradox_risk(30.0) {
                collapsed += 1;
            }
        }
        // 30, 60, 90, 100 -> collapse
        assert_eq!(collapsed, 1);
        assert_eq!(count(&seen, topics::PARADOX_COLLAPSE), 1);
        assert_eq!(timeline.paradox_risk(), 0.0);
        assert_eq!(timeline.energy(), 50.0);
        assert_ne!(timeline.timeline_id(), first_id);
        assert_eq!(timeline.state().archived.len(), 1);
        assert_eq!(timeline.state().archived[0].id, first_id);

        let event = seen.borrow()[0].clone();
        assert_eq!(event.field("timelineId").and_then(Value::as_str), Some(first_id.as_str()));
        assert_eq!(
            event.field("collapseType").and_then(Value::as_str),
            Some("paradox_overflow")
        );
    }

    #[test]
    fn test_timeline_ids_are_seeded() {
        let bus = EventBus::new();
        let a = system(&bus);
        let b = system(&bus);
        assert_eq!(a.timeline_id(), b.timeline_id());
        assert!(a.timeline_id().starts_with("tl-"));
        assert_ne!(timeline_id(0x5eed, 0), timeline_id(0x5eed, 1));
    }

    #[test]
    fn test_locked_ability_is_noop() {
        let bus = EventBus::new();
        let mut timeline = system(&bus);
        let before = timeline.state().clone();
        assert_eq!(
            timeline.use_ability(Ability::Fork),
            Err(AbilityError::Locked("fork"))
        );
        assert_eq!(*timeline.state(), before);
    }

    #[test]
    fn test_unaffordable_ability_is_noop() {
        let bus = EventBus::new();
        let mut timeline = system(&bus);
        timeline.state.energy = 10.0;
        let before = timeline.state().clone();
        let err = timeline.use_ability(Ability::Stabilize).unwrap_err();
        assert!(matches!(err, AbilityError::InsufficientEnergy { cost, available, .. }
            if cost == 25.0 && available == 10.0));
        assert_eq!(*timeline.state(), before);
    }

    #[test]
    fn test_stabilize_spends_and_lowers_risk() {
        let bus = EventBus::new();
        let seen = record(&bus);
        let mut timeline = system(&bus);
        timeline.increase_paradox_risk(50.0);
        timeline.use_ability(Ability::Stabilize).unwrap();
        assert_eq!(timeline.energy(), 75.0);
        assert_eq!(timeline.paradox_risk(), 30.0);
        assert_eq!(count(&seen, topics::TIMELINE_ABILITY_USED), 1);
        assert_eq!(timeline.state().events.back().unwrap().kind, TimelineEventKind::Stabilize);
    }

    #[test]
    fn test_rewind_undoes_last_event() {
        let bus = EventBus::new();
        let mut timeline = system(&bus);
        timeline.record_event(TimelineEventKind::Fork, "manual");
        assert_eq!(timeline.paradox_risk(), 20.0);
        timeline.use_ability(Ability::Rewind).unwrap();
        // Half of the fork refunded, then the rewind's own weight
        assert_eq!(timeline.paradox_risk(), 10.0 + 15.0);
        assert_eq!(timeline.state().events.len(), 1);
        assert_eq!(timeline.state().events[0].kind, TimelineEventKind::Rewind);
    }

    #[test]
    fn test_fork_archives_branch_without_reset() {
        let bus = EventBus::new();
        let mut timeline = system(&bus);
        assert!(timeline.unlock(Ability::Fork));
        assert!(!timeline.unlock(Ability::Fork));
        let id = timeline.timeline_id().to_string();
        timeline.use_ability(Ability::Fork).unwrap();
        assert_eq!(timeline.timeline_id(), id);
        assert_eq!(timeline.state().archived[0].reason, "fork");
        assert_eq!(timeline.energy(), 50.0);
    }

    #[test]
    fn test_event_weights_scale_with_difficulty() {
        let bus = EventBus::new();
        let mut hard = TimelineSystem::new(TimelineSettings::default(), Difficulty::Hard, bus);
        hard.record_event(TimelineEventKind::Choice, "pick");
        assert_eq!(hard.paradox_risk(), 5.0 * 1.25);
        assert_eq!(hard.state().events[0].paradox_weight, 6.25);
    }

    #[test]
    fn test_event_log_is_capped() {
        let bus = EventBus::new();
        let settings = TimelineSettings {
            event_cap: 3,
            ..TimelineSettings::default()
        };
        let mut timeline = TimelineSystem::new(settings, Difficulty::Easy, bus);
        for i in 0..5 {
            timeline.record_event(TimelineEventKind::Expansion, format!("e{i}"));
        }
        let kept: Vec<_> = timeline.state().events.iter().map(|e| e.description.as_str()).collect();
        assert_eq!(kept, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn test_update_regenerates_decays_and_projects() {
        let bus = EventBus::new();
        let mut store = default_store();
        let mut timeline = system(&bus);
        timeline.state.energy = 10.0;
        timeline.increase_paradox_risk(10.0);

        step(&mut timeline, &mut store, &bus, 2.0);
        assert_eq!(timeline.energy(), 12.0);
        assert_eq!(timeline.paradox_risk(), 9.0);
        assert_eq!(store.get_f64("timeline.energy"), Some(12.0));
        assert_eq!(store.get_f64("timeline.paradoxRisk"), Some(9.0));
        assert_eq!(store.get_str("timeline.id"), Some(timeline.timeline_id()));
    }

    #[test]
    fn test_warning_every_tick_above_threshold() {
        let bus = EventBus::new();
        let seen = record(&bus);
        let mut store = default_store();
        let mut timeline = system(&bus);

        timeline.increase_paradox_risk(70.0);
        step(&mut timeline, &mut store, &bus, 1.0);
        assert_eq!(count(&seen, topics::PARADOX_WARNING), 0);

        timeline.increase_paradox_risk(10.0);
        step(&mut timeline, &mut store, &bus, 1.0);
        timeline.increase_paradox_risk(10.0);
        step(&mut timeline, &mut store, &bus, 1.0);
        assert_eq!(count(&seen, topics::PARADOX_WARNING), 2);

        let last = seen.borrow().last().cloned().unwrap();
        assert!(last.field("timeToCollapse").and_then(Value::as_f64).unwrap() > 0.0);
    }

    #[test]
    fn test_accelerate_doubles_regen() {
        let bus = EventBus::new();
        let mut store = default_store();
        let mut timeline = system(&bus);
        timeline.unlock(Ability::Accelerate);
        timeline.use_ability(Ability::Accelerate).unwrap();
        assert_eq!(timeline.energy(), 80.0);
        step(&mut timeline, &mut store, &bus, 1.0);
        assert_eq!(timeline.energy(), 82.0);
        assert_eq!(timeline.state().accelerate_remaining, 9.0);
    }

    #[test]
    fn test_persist_roundtrip_and_reject_out_of_range() {
        let bus = EventBus::new();
        let mut source = system(&bus);
        source.unlock(Ability::Fork);
        source.record_event(TimelineEventKind::Absorption, "node-7");
        let snapshot = source.get_state().unwrap();

        let mut target = system(&bus);
        target.set_state(&snapshot).unwrap();
        assert_eq!(target.state(), source.state());

        let mut broken = snapshot.clone();
        broken["paradoxRisk"] = serde_json::json!(140.0);
        assert!(matches!(target.set_state(&broken), Err(StateError::OutOfRange(_))));
        assert_eq!(target.state(), source.state());

        assert!(matches!(
            target.set_state(&serde_json::json!({"energy": "lots"})),
            Err(StateError::Malformed(_))
        ));
    }

    #[test]
    fn test_reset_default_matches_new_game() {
        let bus = EventBus::new();
        let mut timeline = system(&bus);
        timeline.unlock(Ability::Fork);
        timeline.increase_paradox_risk(70.0);
        timeline.record_event(TimelineEventKind::Choice, "crossroads");

        timeline.reset_default();
        assert_eq!(timeline.state(), system(&bus).state());
        assert_eq!(timeline.paradox_risk(), 0.0);
        assert_eq!(timeline.time_to_collapse(), None);
    }
}
