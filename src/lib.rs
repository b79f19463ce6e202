//! Singularity Idle - state and simulation core of a browser idle game
//!
//! Core modules:
//! - `state`: Reactive dot-path state store (get/set/subscribe/validate/history)
//! - `sim`: Fixed-timestep scheduler and the pluggable subsystems it drives
//! - `persistence`: Save/load with validation, migration, compression and backups
//! - `events`: In-process publish/subscribe bus
//! - `platform`: Browser/native platform abstraction (time, storage)
//! - `game`: Wires everything into one session

pub mod error;
pub mod events;
pub mod game;
pub mod persistence;
pub mod platform;
pub mod settings;
pub mod sim;
pub mod state;

pub use error::{
    AbilityError, PathError, PersistenceError, StateError, StorageError, SystemError,
    ValidationError,
};
pub use events::{Event, EventBus};
pub use game::Game;
pub use settings::{Difficulty, Settings};
pub use state::{PathStore, Value};

/// Engine configuration constants
pub mod consts {
    /// Fixed simulation timestep (60 Hz)
    pub const FIXED_STEP_MS: f64 = 1000.0 / 60.0;
    /// Longest frame fed to the accumulator, prevents spiral of death
    pub const MAX_FRAME_MS: f64 = 250.0;

    /// Scheduler defaults
    pub const DEFAULT_PRIORITY: i32 = 50;
    pub const DEFAULT_BUDGET_MS: f64 = 2.0;

    /// Change records kept by the state store
    pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

    /// Save format version written by this build
    pub const SAVE_VERSION: &str = "1.0.0";
    /// Main save slot
    pub const SAVE_KEY: &str = "singularity_idle_save";
    /// localStorage quota is ~5 MiB per origin
    pub const MAX_SAVE_BYTES: usize = 5 * 1024 * 1024;
    pub const BACKUP_COUNT: usize = 5;
}
