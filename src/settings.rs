//! Engine settings and difficulty presets
//!
//! Persisted separately from game saves, under their own storage key.

use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::platform::Storage;

/// Difficulty preset levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Normal => "normal",
            Difficulty::Hard => "hard",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "easy" => Some(Difficulty::Easy),
            "normal" | "norm" => Some(Difficulty::Normal),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }

    /// Multiplier on heat gained from actions
    pub fn heat_gain(&self) -> f64 {
        match self {
            Difficulty::Easy => 0.75,
            Difficulty::Normal => 1.0,
            Difficulty::Hard => 1.5,
        }
    }

    /// Multiplier on paradox risk gained from timeline events
    pub fn paradox_gain(&self) -> f64 {
        match self {
            Difficulty::Easy => 0.5,
            Difficulty::Normal => 1.0,
            Difficulty::Hard => 1.25,
        }
    }
}

/// Fixed-timestep loop tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoopSettings {
    /// Simulation step in milliseconds
    pub fixed_step_ms: f64,
    /// Longest real frame fed to the accumulator (spiral-of-death guard)
    pub max_frame_ms: f64,
    /// Budget for systems registered without one
    pub default_budget_ms: f64,
    /// Weight of the newest sample in the rolling update-time average
    pub budget_smoothing: f64,
}

impl LoopSettings {
    /// Swap timing values the loop cannot run with for usable ones
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !(self.fixed_step_ms.is_finite() && self.fixed_step_ms > 0.0) {
            log::warn!("Fixed step {}ms unusable, using {}ms", self.fixed_step_ms, defaults.fixed_step_ms);
            self.fixed_step_ms = defaults.fixed_step_ms;
        }
        if !(self.max_frame_ms.is_finite() && self.max_frame_ms >= self.fixed_step_ms) {
            self.max_frame_ms = defaults.max_frame_ms.max(self.fixed_step_ms);
        }
        self.budget_smoothing = if self.budget_smoothing.is_nan() {
            defaults.budget_smoothing
        } else {
            self.budget_smoothing.clamp(0.0, 1.0)
        };
        self
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            fixed_step_ms: FIXED_STEP_MS,
            max_frame_ms: MAX_FRAME_MS,
            default_budget_ms: DEFAULT_BUDGET_MS,
            budget_smoothing: 0.1,
        }
    }
}

/// Save pipeline tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistenceSettings {
    /// Main save slot key
    pub save_key: String,
    /// Hard ceiling on a serialized save
    pub max_save_bytes: usize,
    /// Backups kept besides the main slot
    pub backup_count: usize,
    /// Milliseconds between timed autosaves (0 disables)
    pub autosave_interval_ms: f64,
    /// Key-rename compression on write
    pub compress: bool,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            save_key: SAVE_KEY.to_string(),
            max_save_bytes: MAX_SAVE_BYTES,
            backup_count: BACKUP_COUNT,
            autosave_interval_ms: 30_000.0,
            compress: true,
        }
    }
}

/// Timeline subsystem balance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimelineSettings {
    pub max_energy: f64,
    /// Energy regained per second
    pub energy_regen: f64,
    /// Risk shed per second
    pub risk_decay: f64,
    /// Risk at which warnings start
    pub critical_risk: f64,
    /// Oldest events are trimmed past this many
    pub event_cap: usize,
    /// Collapsed timelines remembered
    pub archive_cap: usize,
    /// Seed for timeline identifiers
    pub seed: u64,
}

impl Default for TimelineSettings {
    fn default() -> Self {
        Self {
            max_energy: 100.0,
            energy_regen: 1.0,
            risk_decay: 0.5,
            critical_risk: 75.0,
            event_cap: 100,
            archive_cap: 10,
            seed: 0x5eed,
        }
    }
}

/// Everything tunable about a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub difficulty: Difficulty,
    /// Change-history ring size for the state store
    pub history_capacity: usize,
    #[serde(rename = "loop")]
    pub game_loop: LoopSettings,
    pub persistence: PersistenceSettings,
    pub timeline: TimelineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            difficulty: Difficulty::Normal,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            game_loop: LoopSettings::default(),
            persistence: PersistenceSettings::default(),
            timeline: TimelineSettings::default(),
        }
    }
}

impl Settings {
    /// Storage key
    const STORAGE_KEY: &'static str = "singularity_idle_settings";

    /// Create settings for a difficulty preset
    pub fn from_difficulty(difficulty: Difficulty) -> Self {
        let mut settings = Self::default();
        settings.difficulty = difficulty;
        settings
    }

    /// Load settings, falling back to defaults if absent or corrupt
    pub fn load(storage: &dyn Storage) -> Self {
        match storage.read(Self::STORAGE_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<Settings>(&json) {
                Ok(settings) => {
                    log::info!("Loaded settings");
                    return settings.sanitized();
                }
                Err(e) => log::warn!("Ignoring corrupt settings: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::warn!("Could not read settings: {e}"),
        }

        log::info!("Using default settings");
        Self::default()
    }

    /// Persist settings
    pub fn save(&self, storage: &dyn Storage) {
        match serde_json::to_string(self) {
            Ok(json) => match storage.write(Self::STORAGE_KEY, &json) {
                Ok(()) => log::info!("Settings saved"),
                Err(e) => log::warn!("Settings not saved: {e}"),
            },
            Err(e) => log::warn!("Settings not serializable: {e}"),
        }
    }

    /// Replace unusable values with defaults
    fn sanitized(mut self) -> Self {
        self.game_loop = self.game_loop.sanitized();
        if self.history_capacity == 0 {
            self.history_capacity = DEFAULT_HISTORY_CAPACITY;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryStorage;

    #[test]
    fn test_difficulty_from_str() {
        assert_eq!(Difficulty::from_str("HARD"), Some(Difficulty::Hard));
        assert_eq!(Difficulty::from_str("norm"), Some(Difficulty::Normal));
        assert_eq!(Difficulty::from_str("brutal"), None);
        assert_eq!(Difficulty::Easy.as_str(), "easy");
    }

    #[test]
    fn test_load_missing_uses_defaults() {
        let storage = MemoryStorage::new();
        let settings = Settings::load(&storage);
        assert_eq!(settings.difficulty, Difficulty::Normal);
        assert_eq!(settings.persistence.backup_count, BACKUP_COUNT);
    }

    #[test]
    fn test_save_then_load() {
        let storage = MemoryStorage::new();
        let mut settings = Settings::from_difficulty(Difficulty::Hard);
        settings.persistence.compress = false;
        settings.save(&storage);

        let loaded = Settings::load(&storage);
        assert_eq!(loaded.difficulty, Difficulty::Hard);
        assert!(!loaded.persistence.compress);
    }

    #[test]
    fn test_partial_and_bad_values() {
        let storage = MemoryStorage::new();
        storage
            .write(
                Settings::STORAGE_KEY,
                r#"{"difficulty":"easy","loop":{"fixedStepMs":-1},"historyCapacity":0}"#,
            )
            .unwrap();
        let loaded = Settings::load(&storage);
        assert_eq!(loaded.difficulty, Difficulty::Easy);
        assert_eq!(loaded.game_loop.fixed_step_ms, FIXED_STEP_MS);
        assert_eq!(loaded.history_capacity, DEFAULT_HISTORY_CAPACITY);
        assert_eq!(loaded.timeline.critical_risk, 75.0);
    }

    #[test]
    fn test_corrupt_settings_fall_back() {
        let storage = MemoryStorage::new();
        storage.write(Settings::STORAGE_KEY, "{not json").unwrap();
        assert_eq!(Settings::load(&storage).difficulty, Difficulty::Normal);
    }
}
