//! Fixed timestep game loop
//!
//! Each frame the elapsed wall time is clamped, added to an accumulator,
//! and drained in fixed steps. Every step runs each enabled system once,
//! lowest priority number first (ties by registration order).
//!
//! A system that returns an error or panics is disabled and reported on
//! `system.error`; the remaining systems keep running. Per-system budgets
//! only produce warnings.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::consts::{DEFAULT_BUDGET_MS, DEFAULT_PRIORITY};
use crate::error::SystemError;
use crate::events::{EventBus, payload, topics};
use crate::platform::{Clock, SystemClock};
use crate::settings::LoopSettings;
use crate::state::PathStore;

/// What a system sees during one step
pub struct StepContext<'a> {
    pub store: &'a mut PathStore,
    pub events: &'a EventBus,
    /// Step length in seconds
    pub dt: f64,
    /// Simulated time in milliseconds
    pub now_ms: f64,
    /// Steps run so far, including this one
    pub tick: u64,
}

/// A unit of per-step simulation work
pub trait System {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError>;
}

impl<T: System + ?Sized> System for Box<T> {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError> {
        (**self).update(ctx)
    }
}

/// Shared subsystems stay reachable from outside the loop
impl<T: System + ?Sized> System for Rc<RefCell<T>> {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError> {
        self.borrow_mut().update(ctx)
    }
}

/// Closure adapter, see [`from_fn`]
pub struct FnSystem<F>(F);

impl<F> System for FnSystem<F>
where
    F: FnMut(&mut StepContext<'_>) -> Result<(), SystemError>,
{
    fn update(&mut self, ctx: &mut StepContext<'_>) -> Result<(), SystemError> {
        (self.0)(ctx)
    }
}

/// Turn a closure into a [`System`]
pub fn from_fn<F>(f: F) -> FnSystem<F>
where
    F: FnMut(&mut StepContext<'_>) -> Result<(), SystemError>,
{
    FnSystem(f)
}

/// Loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Paused,
}

/// Performance accounting for one system
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemStats {
    pub calls: u64,
    pub last_ms: f64,
    /// Exponentially weighted average update time
    pub avg_ms: f64,
    pub over_budget: u64,
    pub faults: u64,
}

struct SystemEntry {
    name: String,
    priority: i32,
    budget_ms: f64,
    order: u64,
    enabled: bool,
    system: Box<dyn System>,
    stats: SystemStats,
}

pub struct GameLoop {
    state: LoopState,
    systems: Vec<SystemEntry>,
    next_order: u64,
    accumulator_ms: f64,
    last_frame_ms: Option<f64>,
    sim_time_ms: f64,
    ticks: u64,
    frames: u64,
    settings: LoopSettings,
    events: EventBus,
    clock: Rc<dyn Clock>,
}

impl GameLoop {
    pub fn new(settings: LoopSettings, events: EventBus) -> Self {
        Self {
            state: LoopState::Stopped,
            systems: Vec::new(),
            next_order: 0,
            accumulator_ms: 0.0,
            last_frame_ms: None,
            sim_time_ms: 0.0,
            ticks: 0,
            frames: 0,
            settings: settings.sanitized(),
            events,
            clock: Rc::new(SystemClock),
        }
    }

    /// Clock used to time system updates
    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // === Registry ===

    /// Register with the default priority and budget
    pub fn register_system(&mut self, name: impl Into<String>, system: impl System + 'static) {
        let budget = if self.settings.default_budget_ms > 0.0 {
            self.settings.default_budget_ms
        } else {
            DEFAULT_BUDGET_MS
        };
        self.register_system_with(name, system, DEFAULT_PRIORITY, budget);
    }

    /// Register (or replace) a system. Lower priority runs earlier.
    pub fn register_system_with(
        &mut self,
        name: impl Into<String>,
        system: impl System + 'static,
        priority: i32,
        budget_ms: f64,
    ) {
        let name = name.into();
        if self.systems.iter().any(|e| e.name == name) {
            log::debug!("Replacing system {name}");
            self.systems.retain(|e| e.name != name);
        }
        let order = self.next_order;
        self.next_order += 1;
        self.systems.push(SystemEntry {
            name,
            priority,
            budget_ms,
            order,
            enabled: true,
            system: Box::new(system),
            stats: SystemStats::default(),
        });
        self.systems.sort_by_key(|e| (e.priority, e.order));
    }

    pub fn unregister_system(&mut self, name: &str) -> bool {
        let before = self.systems.len();
        self.systems.retain(|e| e.name != name);
        self.systems.len() != before
    }

    /// Re-enable a system, e.g. after a fault has been dealt with
    pub fn enable_system(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable_system(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.systems.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Enabled systems in execution order
    pub fn enabled_systems(&self) -> Vec<&str> {
        self.systems
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.name.as_str())
            .collect()
    }

    /// All systems in execution order
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn system_stats(&self, name: &str) -> Option<&SystemStats> {
        self.systems.iter().find(|e| e.name == name).map(|e| &e.stats)
    }

    // === Lifecycle ===

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == LoopState::Running
    }

    pub fn start(&mut self) {
        match self.state {
            LoopState::Running => {}
            LoopState::Paused => self.resume(),
            LoopState::Stopped => {
                self.state = LoopState::Running;
                self.last_frame_ms = None;
                log::info!("Game loop started ({} systems)", self.systems.len());
                self.events.emit(topics::GAME_STARTED, payload::<&str, f64, _>([]));
            }
        }
    }

    /// Cancel future ticks; the accumulator is discarded
    pub fn stop(&mut self) {
        if self.state == LoopState::Stopped {
            return;
        }
        self.state = LoopState::Stopped;
        self.accumulator_ms = 0.0;
        self.last_frame_ms = None;
        log::info!("Game loop stopped after {} ticks", self.ticks);
        self.events.emit(
            topics::GAME_STOPPED,
            payload([("ticks", self.ticks as f64), ("simTimeMs", self.sim_time_ms)]),
        );
    }

    pub fn pause(&mut self) {
        if self.state != LoopState::Running {
            return;
        }
        self.state = LoopState::Paused;
        log::info!("Game loop paused");
        self.events.emit(topics::GAME_PAUSED, payload([("simTimeMs", self.sim_time_ms)]));
    }

    pub fn resume(&mut self) {
        if self.state != LoopState::Paused {
            return;
        }
        self.state = LoopState::Running;
        // Time spent paused is not simulated
        self.last_frame_ms = None;
        log::info!("Game loop resumed");
        self.events.emit(topics::GAME_RESUMED, payload([("simTimeMs", self.sim_time_ms)]));
    }

    // === Ticking ===

    /// Host frame callback. Returns the number of fixed steps run.
    pub fn frame(&mut self, store: &mut PathStore, now_ms: f64) -> u32 {
        if self.state != LoopState::Running {
            return 0;
        }
        self.frames += 1;
        let elapsed = self.last_frame_ms.map_or(0.0, |last| now_ms - last);
        self.last_frame_ms = Some(now_ms);
        self.advance(store, elapsed)
    }

    /// Feed `elapsed_ms` of real time and run the fixed steps it pays for
    pub fn advance(&mut self, store: &mut PathStore, elapsed_ms: f64) -> u32 {
        let step = self.settings.fixed_step_ms;
        if elapsed_ms.is_nan() {
            return 0;
        }
        self.accumulator_ms += elapsed_ms.clamp(0.0, self.settings.max_frame_ms);

        let mut steps = 0;
        while self.accumulator_ms >= step {
            self.ticks += 1;
            self.sim_time_ms += step;
            self.run_systems(store, step);
            self.accumulator_ms -= step;
            steps += 1;
        }
        steps
    }

    /// Run every enabled system once, outside the accumulator cadence
    pub fn force_update(&mut self, store: &mut PathStore) {
        self.ticks += 1;
        let step = self.settings.fixed_step_ms;
        self.run_systems(store, step);
    }

    fn run_systems(&mut self, store: &mut PathStore, step_ms: f64) {
        let Self {
            systems,
            events,
            clock,
            settings,
            ticks,
            sim_time_ms,
            ..
        } = self;

        let mut ctx = StepContext {
            store,
            events,
            dt: step_ms / 1000.0,
            now_ms: *sim_time_ms,
            tick: *ticks,
        };

        for entry in systems.iter_mut().filter(|e| e.enabled) {
            let started = clock.precise_ms();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| entry.system.update(&mut ctx)));
            let elapsed = (clock.precise_ms() - started).max(0.0);

            record_timing(entry, elapsed, settings.budget_smoothing, events);

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(error) = failure {
                entry.enabled = false;
                entry.stats.faults += 1;
                log::error!("System {} failed and was disabled: {error}", entry.name);
                events.emit(
                    topics::SYSTEM_ERROR,
                    payload([("systemName", entry.name.as_str()), ("error", error.as_str())]),
                );
            }
        }
    }

    // === Accounting ===

    pub fn accumulator_ms(&self) -> f64 {
        self.accumulator_ms
    }

    pub fn sim_time_ms(&self) -> f64 {
        self.sim_time_ms
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn fixed_step_ms(&self) -> f64 {
        self.settings.fixed_step_ms
    }
}

fn record_timing(entry: &mut SystemEntry, elapsed: f64, smoothing: f64, events: &EventBus) {
    let stats = &mut entry.stats;
    stats.avg_ms = if stats.calls == 0 {
        elapsed
    } else {
        stats.avg_ms * (1.0 - smoothing) + elapsed * smoothing
    };
    stats.calls += 1;
    stats.last_ms = elapsed;

    if elapsed > entry.budget_ms {
        stats.over_budget += 1;
        log::warn!(
            "System {} took {elapsed:.2}ms (budget {:.2}ms, avg {:.2}ms)",
            entry.name,
            entry.budget_ms,
            stats.avg_ms
        );
        events.emit(
            topics::SYSTEM_OVER_BUDGET,
            payload([
                ("systemName", crate::state::Value::from(entry.name.as_str())),
                ("durationMs", elapsed.into()),
                ("budgetMs", entry.budget_ms.into()),
            ]),
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "system panicked".to_string()
    }
}
