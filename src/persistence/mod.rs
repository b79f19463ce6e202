//! Save/load pipeline
//!
//! - `blob`: the versioned save shape and its structural checks
//! - `compress`: reversible key-renaming
//! - `migration`: version-to-version transforms
//! - `controller`: the save/load/backup orchestration

pub mod blob;
pub mod compress;
pub mod controller;
pub mod migration;

pub use blob::{SaveBlob, SaveMetadata};
pub use controller::{BackupInfo, LoadReport, PersistenceController, SaveOptions};
pub use migration::{MigrationOutcome, MigrationRegistry};

use serde_json::Value as Json;

use crate::error::StateError;

/// Subsystem-owned state saved alongside the store tree.
///
/// The controller never looks inside the snapshot; it only stores what
/// `get_state` returns under `name` and hands it back to `set_state`.
pub trait Persistable {
    fn name(&self) -> &'static str;
    fn get_state(&self) -> Result<Json, StateError>;
    /// Apply a snapshot. On error the subsystem must be left unchanged.
    fn set_state(&mut self, state: &Json) -> Result<(), StateError>;
    /// Return to a new-game state. Loads call this when the save holds no
    /// snapshot under `name`.
    fn reset_default(&mut self);
}
