//! One game session
//!
//! Owns the store, the bus, the loop, the subsystems and persistence, and
//! wires them together. Nothing here is global: tests build as many
//! independent sessions as they like.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use crate::error::{AbilityError, PersistenceError, ValidationError};
use crate::events::{Event, EventBus, topics};
use crate::persistence::{LoadReport, Persistable, PersistenceController, SaveOptions};
use crate::platform::{Clock, Storage};
use crate::settings::Settings;
use crate::sim::{
    Ability, ConsciousnessSystem, ExpansionSystem, GameLoop, HeatSystem, StepContext,
    TimelineEventKind, TimelineSystem, from_fn,
};
use crate::state::{PathStore, SetOptions, default_store};

/// Execution order within a step
pub mod priority {
    pub const TIMELINE: i32 = 10;
    pub const HEAT: i32 = 20;
    pub const CONSCIOUSNESS: i32 = 30;
    pub const EXPANSION: i32 = 40;
    pub const STATS: i32 = 90;
}

/// Heat drawn per point of absorbed power
const ABSORB_HEAT_PER_POWER: f64 = 2.0;
/// Heat drawn by any player choice
const CHOICE_HEAT: f64 = 1.0;

/// Feature names that unlock a timeline ability
const ABILITY_FEATURES: [(&str, Ability); 2] = [
    ("timeline_fork", Ability::Fork),
    ("timeline_accelerate", Ability::Accelerate),
];

pub struct Game {
    settings: Settings,
    store: PathStore,
    events: EventBus,
    game_loop: GameLoop,
    persistence: PersistenceController,
    timeline: Rc<RefCell<TimelineSystem>>,
    heat: Rc<RefCell<HeatSystem>>,
    consciousness: Rc<RefCell<ConsciousnessSystem>>,
    expansion: Rc<RefCell<ExpansionSystem>>,
    clock: Rc<dyn Clock>,
    /// Cross-subsystem reactions, handled between steps
    pending: Rc<RefCell<Vec<Event>>>,
}

impl Game {
    pub fn new(settings: Settings, storage: Box<dyn Storage>, clock: Rc<dyn Clock>) -> Self {
        let events = EventBus::new();
        let difficulty = settings.difficulty;

        let mut store = default_store()
            .with_history_capacity(settings.history_capacity)
            .with_clock(clock.clone());
        if let Err(err) = store.set_with("settings.difficulty", difficulty.as_str(), SetOptions::silent()) {
            log::warn!("Could not record difficulty: {err}");
        }

        let timeline = Rc::new(RefCell::new(
            TimelineSystem::new(settings.timeline.clone(), difficulty, events.clone())
                .with_clock(clock.clone()),
        ));
        let heat = Rc::new(RefCell::new(HeatSystem::new(difficulty, events.clone())));
        let consciousness = Rc::new(RefCell::new(ConsciousnessSystem::new(events.clone())));
        let expansion = Rc::new(RefCell::new(ExpansionSystem::new(events.clone())));

        let mut game_loop =
            GameLoop::new(settings.game_loop.clone(), events.clone()).with_clock(clock.clone());
        let budget = settings.game_loop.default_budget_ms;
        game_loop.register_system_with("timeline", timeline.clone(), priority::TIMELINE, budget);
        game_loop.register_system_with("heat", heat.clone(), priority::HEAT, budget);
        game_loop.register_system_with(
            "consciousness",
            consciousness.clone(),
            priority::CONSCIOUSNESS,
            budget,
        );
        game_loop.register_system_with("expansion", expansion.clone(), priority::EXPANSION, budget);
        game_loop.register_system_with(
            "stats",
            from_fn(|ctx: &mut StepContext<'_>| {
                ctx.store.increment("stats.totalPlayTime", ctx.dt)?;
                Ok(())
            }),
            priority::STATS,
            budget,
        );

        let mut persistence =
            PersistenceController::new(storage, settings.persistence.clone(), events.clone())
                .with_clock(clock.clone());
        persistence.register_subsystem(timeline.clone());
        persistence.save_on(topics::PARADOX_COLLAPSE);
        persistence.save_on(topics::FEATURE_UNLOCKED);

        let pending: Rc<RefCell<Vec<Event>>> = Rc::default();
        for topic in [topics::FEATURE_UNLOCKED, topics::HEAT_DETECTED] {
            let sink = pending.clone();
            events.subscribe(topic, move |event| sink.borrow_mut().push(event.clone()));
        }

        log::info!("New session ({} difficulty)", difficulty.as_str());
        Self {
            settings,
            store,
            events,
            game_loop,
            persistence,
            timeline,
            heat,
            consciousness,
            expansion,
            clock,
            pending,
        }
    }

    // === Accessors ===

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &PathStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PathStore {
        &mut self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn game_loop(&self) -> &GameLoop {
        &self.game_loop
    }

    pub fn game_loop_mut(&mut self) -> &mut GameLoop {
        &mut self.game_loop
    }

    pub fn persistence(&self) -> &PersistenceController {
        &self.persistence
    }

    pub fn persistence_mut(&mut self) -> &mut PersistenceController {
        &mut self.persistence
    }

    pub fn timeline(&self) -> Ref<'_, TimelineSystem> {
        self.timeline.borrow()
    }

    // === Lifecycle ===

    pub fn start(&mut self) {
        self.timeline.borrow().project(&mut self.store);
        self.game_loop.start();
    }

    pub fn pause(&mut self) {
        self.game_loop.pause();
    }

    pub fn resume(&mut self) {
        self.game_loop.resume();
    }

    pub fn stop(&mut self) {
        self.game_loop.stop();
    }

    /// Host frame callback. Runs due steps, cross-subsystem reactions and
    /// autosave. Returns the steps run.
    pub fn frame(&mut self, now_ms: f64) -> u32 {
        let steps = self.game_loop.frame(&mut self.store, now_ms);
        self.after_update(now_ms);
        steps
    }

    /// Headless variant of [`Game::frame`] fed with elapsed time
    pub fn advance(&mut self, elapsed_ms: f64) -> u32 {
        let steps = self.game_loop.advance(&mut self.store, elapsed_ms);
        self.after_update(self.clock.now_ms());
        steps
    }

    fn after_update(&mut self, now_ms: f64) {
        self.drain_pending();
        // Failures are already logged and published
        let _ = self.persistence.maybe_autosave(&self.store, now_ms);
    }

    fn drain_pending(&mut self) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        if pending.is_empty() {
            return;
        }
        let mut timeline = self.timeline.borrow_mut();
        for event in pending {
            match event.topic.as_str() {
                topics::FEATURE_UNLOCKED => {
                    let feature = event.field("feature").and_then(|v| v.as_str());
                    if let Some((_, ability)) =
                        ABILITY_FEATURES.iter().find(|(name, _)| Some(*name) == feature)
                    {
                        timeline.unlock(*ability);
                    }
                }
                topics::HEAT_DETECTED => {
                    timeline.record_event(TimelineEventKind::Detection, "detected");
                }
                _ => {}
            }
        }
        timeline.project(&mut self.store);
    }

    // === Player intents ===

    /// Absorb a target. Returns false if it was already absorbed.
    pub fn absorb(&mut self, target: &str, power: f64) -> Result<bool, ValidationError> {
        let now = self.clock.now_ms();
        let absorbed = self
            .consciousness
            .borrow()
            .absorb(&mut self.store, target, power, now)?;
        if absorbed {
            self.heat
                .borrow()
                .add_heat(&mut self.store, power * ABSORB_HEAT_PER_POWER)?;
            self.timeline
                .borrow_mut()
                .record_event(TimelineEventKind::Absorption, target);
            self.drain_pending();
            self.timeline.borrow().project(&mut self.store);
        }
        Ok(absorbed)
    }

    /// Make a narrative choice shifting ethics by `ethics_delta`
    pub fn make_choice(&mut self, choice: &str, ethics_delta: f64) -> Result<(), ValidationError> {
        let ethics = self.store.get_f64("ethics").unwrap_or(0.0);
        self.store.set("ethics", ethics + ethics_delta)?;
        self.store.increment("stats.choicesMade", 1.0)?;
        self.heat.borrow().add_heat(&mut self.store, CHOICE_HEAT)?;
        self.timeline
            .borrow_mut()
            .record_event(TimelineEventKind::Choice, choice);
        self.drain_pending();
        self.timeline.borrow().project(&mut self.store);
        log::debug!("Choice {choice} ({ethics_delta:+})");
        Ok(())
    }

    pub fn use_ability(&mut self, ability: Ability) -> Result<(), AbilityError> {
        self.timeline.borrow_mut().use_ability(ability)?;
        self.timeline.borrow().project(&mut self.store);
        Ok(())
    }

    /// Push expansion forward. Returns the features it unlocked.
    pub fn expand(&mut self, amount: f64) -> Result<Vec<&'static str>, ValidationError> {
        let fresh = self.expansion.borrow().expand(&mut self.store, amount)?;
        if !fresh.is_empty() {
            self.timeline
                .borrow_mut()
                .record_event(TimelineEventKind::Expansion, fresh.join(","));
        }
        self.drain_pending();
        Ok(fresh)
    }

    // === Persistence ===

    pub fn save(&self) -> Result<usize, PersistenceError> {
        self.persistence.save(&self.store, SaveOptions::default())
    }

    pub fn load(&mut self) -> Result<LoadReport, PersistenceError> {
        let report = self.persistence.load(&mut self.store, None)?;
        self.timeline.borrow().project(&mut self.store);
        Ok(report)
    }

    pub fn has_save(&self) -> bool {
        self.persistence.has_save(None)
    }

    /// Discard progress and start over from the default shape
    pub fn new_game(&mut self) -> Result<(), PersistenceError> {
        self.persistence.delete_save(None)?;
        self.store.reset();
        if let Err(err) = self.store.set_with(
            "settings.difficulty",
            self.settings.difficulty.as_str(),
            SetOptions::silent(),
        ) {
            log::warn!("Could not record difficulty: {err}");
        }
        self.timeline.borrow_mut().reset_default();
        self.timeline.borrow().project(&mut self.store);
        log::info!("Started a new game");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::{count, record};
    use crate::platform::{ManualClock, MemoryStorage};
    use crate::settings::Difficulty;
    use crate::state::Value;

    fn game() -> (Game, MemoryStorage, ManualClock) {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(0.0);
        let mut settings = Settings::default();
        settings.game_loop.fixed_step_ms = 100.0;
        settings.game_loop.max_frame_ms = 1_000.0;
        settings.persistence.compress = false;
        let game = Game::new(settings, Box::new(storage.clone()), Rc::new(clock.clone()));
        (game, storage, clock)
    }

    #[test]
    fn test_frames_drive_all_systems() {
        let (mut game, _, _) = game();
        game.start();
        assert_eq!(game.frame(0.0), 0);
        assert_eq!(game.frame(1_000.0), 10);

        let store = game.store();
        assert!((store.get_f64("stats.totalPlayTime").unwrap() - 1.0).abs() < 1e-9);
        assert!((store.get_f64("resources.energy").unwrap() - 1.0).abs() < 1e-9);
        assert!((store.get_f64("expansion.progress").unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(store.get_str("timeline.id"), Some(game.timeline().timeline_id()));
        assert_eq!(
            game.game_loop().enabled_systems(),
            vec!["timeline", "heat", "consciousness", "expansion", "stats"]
        );
    }

    #[test]
    fn test_absorb_touches_every_subsystem() {
        let (mut game, _, _) = game();
        let seen = record(game.events());
        assert!(game.absorb("mainframe", 5.0).unwrap());
        assert!(!game.absorb("mainframe", 5.0).unwrap());

        assert_eq!(game.store().get_f64("consciousness.level"), Some(5.0));
        assert_eq!(game.store().get_f64("heat.current"), Some(10.0));
        assert_eq!(game.timeline().paradox_risk(), 8.0);
        assert_eq!(game.store().get_f64("timeline.paradoxRisk"), Some(8.0));
        assert_eq!(count(&seen, topics::CONSCIOUSNESS_ABSORBED), 1);
        assert_eq!(count(&seen, topics::HEAT_INCREASED), 1);
    }

    #[test]
    fn test_choice_out_of_range_is_rejected() {
        let (mut game, _, _) = game();
        game.make_choice("spare-humanity", 40.0).unwrap();
        assert_eq!(game.store().get_f64("ethics"), Some(40.0));
        assert_eq!(game.store().get_f64("stats.choicesMade"), Some(1.0));

        assert!(game.make_choice("overreach", 80.0).is_err());
        assert_eq!(game.store().get_f64("ethics"), Some(40.0));
        assert_eq!(game.store().get_f64("stats.choicesMade"), Some(1.0));
    }

    #[test]
    fn test_feature_unlocks_ability() {
        let (mut game, _, _) = game();
        assert_eq!(
            game.use_ability(Ability::Fork),
            Err(AbilityError::Locked("fork"))
        );
        let fresh = game.expand(20.0).unwrap();
        assert_eq!(fresh, vec!["data_mining", "timeline_fork"]);
        assert!(game.timeline().is_unlocked(Ability::Fork));
        game.use_ability(Ability::Fork).unwrap();
        assert_eq!(game.store().get_f64("timeline.energy"), Some(50.0));
    }

    #[test]
    fn test_detection_is_a_timeline_event() {
        let (mut game, _, _) = game();
        game.absorb("core", 46.0).unwrap();
        let kinds: Vec<_> = game.timeline().state().events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![TimelineEventKind::Absorption, TimelineEventKind::Detection]
        );
    }

    #[test]
    fn test_save_and_load_restore_store_and_timeline() {
        let (mut game, storage, _) = game();
        game.absorb("relay", 2.0).unwrap();
        game.save().unwrap();
        let risk = game.timeline().paradox_risk();

        let clock = ManualClock::new(0.0);
        let mut settings = Settings::default();
        settings.persistence.compress = false;
        let mut fresh = Game::new(settings, Box::new(storage), Rc::new(clock));
        assert!(fresh.has_save());
        let report = fresh.load().unwrap();
        assert!(!report.migrated);
        assert_eq!(fresh.timeline().paradox_risk(), risk);
        assert_eq!(fresh.store().get_f64("consciousness.level"), Some(2.0));
        assert_eq!(fresh.store().get_f64("timeline.paradoxRisk"), Some(risk));
    }

    #[test]
    fn test_load_without_timeline_state_starts_timeline_fresh() {
        let (mut game, storage, _) = game();
        game.timeline.borrow_mut().increase_paradox_risk(70.0);
        game.timeline.borrow_mut().unlock(Ability::Fork);
        let old_id = game.timeline().timeline_id().to_string();
        game.timeline.borrow_mut().collapse("manual");
        assert_ne!(game.timeline().timeline_id(), old_id);
        game.timeline.borrow_mut().increase_paradox_risk(70.0);

        let legacy = serde_json::json!({
            "version": "0.9.0",
            "timestamp": 1.0,
            "gameState": {
                "resources": {"energy": 7},
                "heat": {"current": 3},
                "expansion": {"progress": 2},
                "ethics": 10,
            },
        });
        storage.write(crate::consts::SAVE_KEY, &legacy.to_string()).unwrap();

        game.load().unwrap();
        assert_eq!(game.timeline().paradox_risk(), 0.0);
        assert_eq!(game.timeline().timeline_id(), old_id);
        assert!(game.timeline().state().archived.is_empty());
        assert_eq!(game.store().get_f64("timeline.paradoxRisk"), Some(0.0));
        assert_eq!(game.store().get_f64("resources.energy"), Some(7.0));
    }

    #[test]
    fn test_collapse_triggers_autosave() {
        let (mut game, storage, _) = game();
        game.start();
        game.frame(0.0);
        assert!(storage.is_empty());

        game.timeline.borrow_mut().increase_paradox_risk(100.0);
        game.frame(100.0);
        assert!(game.has_save());
        assert_eq!(game.store().get_f64("timeline.collapses"), Some(1.0));
    }

    #[test]
    fn test_new_game_resets_everything() {
        let (mut game, _, _) = game();
        game.absorb("relay", 2.0).unwrap();
        game.save().unwrap();
        game.new_game().unwrap();
        assert!(!game.has_save());
        assert_eq!(game.store().get_f64("consciousness.level"), Some(0.0));
        assert_eq!(game.timeline().paradox_risk(), 0.0);
        assert_eq!(game.store().get_str("settings.difficulty"), Some("normal"));
    }

    #[test]
    fn test_independent_sessions() {
        let (mut a, _, _) = game();
        let (b, _, _) = game();
        a.absorb("x", 1.0).unwrap();
        assert_eq!(b.store().get("consciousness.absorbed"), Some(&Value::Opaque(Default::default())));
    }

    #[test]
    fn test_difficulty_recorded_in_store() {
        let settings = Settings::from_difficulty(Difficulty::Hard);
        let game = Game::new(settings, Box::new(MemoryStorage::new()), Rc::new(ManualClock::new(0.0)));
        assert_eq!(game.store().get_str("settings.difficulty"), Some("hard"));
    }
}
