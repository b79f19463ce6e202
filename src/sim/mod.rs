//! Simulation module
//!
//! The fixed-timestep loop and the subsystems it drives:
//! - Fixed timestep only
//! - Systems run in priority order, one at a time
//! - A failing system is disabled, never fatal
//! - No rendering or platform dependencies beyond the injected clock

pub mod consciousness;
pub mod expansion;
pub mod heat;
pub mod scheduler;
pub mod timeline;

pub use consciousness::ConsciousnessSystem;
pub use expansion::{ExpansionSystem, FEATURES, Feature};
pub use heat::HeatSystem;
pub use scheduler::{GameLoop, LoopState, StepContext, System, SystemStats, from_fn};
pub use timeline::{
    Ability, ArchivedTimeline, MAX_PARADOX_RISK, TimelineEvent, TimelineEventKind, TimelineState,
    TimelineSystem,
};
