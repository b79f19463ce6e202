//! Save/load orchestration
//!
//! Save: build blob -> validate -> compress -> size check -> write ->
//! rotate backups -> counters. Load: read -> decompress -> validate ->
//! migrate -> subsystems -> store. Any failing stage aborts the whole
//! operation and is reported on the event bus; neither pipeline leaves a
//! half-written slot or a half-loaded game behind.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value as Json;

use super::Persistable;
use super::blob::{SaveBlob, SaveMetadata, validate_structure};
use super::compress;
use super::migration::{MigrationOutcome, MigrationRegistry};
use crate::consts::SAVE_VERSION;
use crate::error::PersistenceError;
use crate::events::{EventBus, ListenerId, payload, topics};
use crate::platform::{Clock, Storage, SystemClock};
use crate::settings::PersistenceSettings;
use crate::state::{PathStore, Value};

/// Per-save switches
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Skip structural validation (autosaves)
    pub quick: bool,
    /// Slot to write instead of the main one
    pub key: Option<String>,
}

impl SaveOptions {
    pub fn quick() -> Self {
        Self {
            quick: true,
            key: None,
        }
    }
}

/// A rotated copy of an earlier main-slot save
#[derive(Debug, Clone, PartialEq)]
pub struct BackupInfo {
    pub key: String,
    pub created_at: f64,
}

/// Result of a successful load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    pub key: String,
    /// Version the save was written with
    pub from_version: String,
    pub migrated: bool,
}

/// Clears the in-progress flag however the save ends
struct SaveGuard<'a>(&'a Cell<bool>);

impl Drop for SaveGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct PersistenceController {
    storage: Box<dyn Storage>,
    settings: PersistenceSettings,
    version: String,
    migrations: MigrationRegistry,
    subsystems: Vec<Rc<RefCell<dyn Persistable>>>,
    events: EventBus,
    clock: Rc<dyn Clock>,
    saving: Cell<bool>,
    save_count: Cell<u64>,
    last_save_ms: Cell<Option<f64>>,
    /// Autosave timer, on the caller's frame clock
    last_autosave_ms: Cell<Option<f64>>,
    /// Set by `save_on` listeners, consumed by `maybe_autosave`
    save_requested: Rc<Cell<bool>>,
    triggers: Vec<ListenerId>,
}

impl PersistenceController {
    pub fn new(storage: Box<dyn Storage>, settings: PersistenceSettings, events: EventBus) -> Self {
        Self {
            storage,
            settings,
            version: SAVE_VERSION.to_string(),
            migrations: MigrationRegistry::new(),
            subsystems: Vec::new(),
            events,
            clock: Rc::new(SystemClock),
            saving: Cell::new(false),
            save_count: Cell::new(0),
            last_save_ms: Cell::new(None),
            last_autosave_ms: Cell::new(None),
            save_requested: Rc::new(Cell::new(false)),
            triggers: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Version stamped on saves and targeted by migrations
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn migrations_mut(&mut self) -> &mut MigrationRegistry {
        &mut self.migrations
    }

    /// Include a subsystem's private state in every save
    pub fn register_subsystem(&mut self, subsystem: Rc<RefCell<dyn Persistable>>) {
        let name = subsystem.borrow().name();
        self.subsystems.retain(|s| s.borrow().name() != name);
        self.subsystems.push(subsystem);
    }

    pub fn save_count(&self) -> u64 {
        self.save_count.get()
    }

    pub fn last_save_ms(&self) -> Option<f64> {
        self.last_save_ms.get()
    }

    pub fn is_saving(&self) -> bool {
        self.saving.get()
    }

    // === Save ===

    /// Write the store and subsystem state. Returns the bytes written.
    pub fn save(&self, store: &PathStore, opts: SaveOptions) -> Result<usize, PersistenceError> {
        if self.saving.replace(true) {
            log::warn!("Save requested while another is in progress");
            return Err(PersistenceError::SaveInProgress);
        }
        let _guard = SaveGuard(&self.saving);

        let key = opts.key.clone().unwrap_or_else(|| self.settings.save_key.clone());
        match self.write_save(store, &key, opts.quick) {
            Ok(bytes) => {
                log::info!("Saved {bytes} bytes to {key}");
                self.events.emit(
                    topics::GAME_SAVED,
                    payload([
                        ("key", Value::from(key.as_str())),
                        ("bytes", (bytes as f64).into()),
                        ("saveCount", (self.save_count.get() as f64).into()),
                        ("quick", opts.quick.into()),
                    ]),
                );
                Ok(bytes)
            }
            Err(err) => {
                log::warn!("Save to {key} failed: {err}");
                self.events.emit(
                    topics::GAME_SAVE_FAILED,
                    payload([("key", key.as_str()), ("cause", err.to_string().as_str())]),
                );
                Err(err)
            }
        }
    }

    fn write_save(&self, store: &PathStore, key: &str, quick: bool) -> Result<usize, PersistenceError> {
        let blob = self.build_blob(store)?;
        let raw = serde_json::to_value(&blob)?;
        if !quick {
            validate_structure(&raw)?;
        }

        let plain = serde_json::to_string(&raw)?;
        let text = if self.settings.compress {
            serde_json::to_string(&compress::wrap(&raw, plain.len()))?
        } else {
            plain
        };
        if text.len() > self.settings.max_save_bytes {
            return Err(PersistenceError::Capacity {
                size: text.len(),
                limit: self.settings.max_save_bytes,
            });
        }

        // The slot being replaced becomes a backup once the new save is down
        let previous = if key == self.settings.save_key && self.settings.backup_count > 0 {
            self.storage.read(key)?
        } else {
            None
        };
        self.storage.write(key, &text)?;
        if let Some(previous) = previous {
            if let Err(err) = self.rotate_backups(&previous) {
                log::warn!("Backup rotation after save to {key} failed: {err}");
            }
        }

        self.save_count.set(blob.metadata.save_count);
        self.last_save_ms.set(Some(self.clock.now_ms()));
        Ok(text.len())
    }

    /// Everything a save needs, without writing it
    pub fn build_blob(&self, store: &PathStore) -> Result<SaveBlob, PersistenceError> {
        let mut subsystems = BTreeMap::new();
        for subsystem in &self.subsystems {
            let subsystem = subsystem.borrow();
            let state = subsystem
                .get_state()
                .map_err(|source| PersistenceError::Subsystem {
                    name: subsystem.name().to_string(),
                    source,
                })?;
            subsystems.insert(subsystem.name().to_string(), state);
        }

        let metadata = SaveMetadata {
            save_count: self.save_count.get() + 1,
            total_play_time: store.get_f64("stats.totalPlayTime").unwrap_or(0.0),
            last_scale: store.get_str("expansion.scale").unwrap_or("local").to_string(),
            difficulty: store.get_str("settings.difficulty").unwrap_or("normal").to_string(),
        };

        Ok(SaveBlob {
            version: self.version.clone(),
            timestamp: self.clock.now_ms(),
            game_state: store.serialize(),
            subsystems,
            metadata,
        })
    }

    // === Backups ===

    fn backup_prefix(&self) -> String {
        format!("{}_backup_", self.settings.save_key)
    }

    /// Copy the current main slot to a timestamped backup, then evict the
    /// oldest backups past the cap
    fn rotate_backups(&self, previous: &str) -> Result<(), PersistenceError> {
        let backup_key = format!("{}{}", self.backup_prefix(), self.clock.now_ms() as u64);
        self.storage.write(&backup_key, previous)?;

        let backups = self.list_backups()?;
        let excess = backups.len().saturating_sub(self.settings.backup_count);
        for old in backups.iter().take(excess) {
            log::debug!("Evicting backup {}", old.key);
            self.storage.remove(&old.key)?;
        }
        Ok(())
    }

    /// Backups of the main slot, oldest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, PersistenceError> {
        let prefix = self.backup_prefix();
        let mut backups: Vec<BackupInfo> = self
            .storage
            .keys()?
            .into_iter()
            .filter_map(|key| {
                let created_at = key.strip_prefix(&prefix)?.parse::<u64>().ok()? as f64;
                Some(BackupInfo { key, created_at })
            })
            .collect();
        backups.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(backups)
    }

    /// Load a backup into the game (the main slot is left alone)
    pub fn restore_backup(
        &self,
        store: &mut PathStore,
        backup: &BackupInfo,
    ) -> Result<LoadReport, PersistenceError> {
        self.load(store, Some(&backup.key))
    }

    // === Load ===

    /// Load the main slot, or `key` if given
    pub fn load(&self, store: &mut PathStore, key: Option<&str>) -> Result<LoadReport, PersistenceError> {
        let key = key.unwrap_or(&self.settings.save_key).to_string();
        let result = self
            .storage
            .read(&key)
            .map_err(PersistenceError::from)
            .and_then(|text| text.ok_or_else(|| PersistenceError::NotFound(key.clone())))
            .and_then(|text| Ok(serde_json::from_str::<Json>(&text)?))
            .and_then(|raw| self.restore(store, raw, &key));
        self.report_load(&key, result)
    }

    /// Load from an exported string
    pub fn import_save(&self, store: &mut PathStore, text: &str) -> Result<LoadReport, PersistenceError> {
        let result = serde_json::from_str::<Json>(text)
            .map_err(PersistenceError::from)
            .and_then(|raw| self.restore(store, raw, "import"));
        self.report_load("import", result)
    }

    /// Portable, uncompressed form of the current game
    pub fn export_save(&self, store: &PathStore) -> Result<String, PersistenceError> {
        let raw = serde_json::to_value(self.build_blob(store)?)?;
        validate_structure(&raw)?;
        Ok(serde_json::to_string(&raw)?)
    }

    fn report_load(
        &self,
        key: &str,
        result: Result<LoadReport, PersistenceError>,
    ) -> Result<LoadReport, PersistenceError> {
        match &result {
            Ok(report) => {
                log::info!(
                    "Loaded {key} (version {}, migrated: {})",
                    report.from_version,
                    report.migrated
                );
                self.events.emit(
                    topics::GAME_LOADED,
                    payload([
                        ("key", Value::from(key)),
                        ("version", report.from_version.as_str().into()),
                        ("migrated", report.migrated.into()),
                    ]),
                );
            }
            Err(err) => {
                log::warn!("Load of {key} failed: {err}");
                self.events.emit(
                    topics::GAME_LOAD_FAILED,
                    payload([("key", key), ("cause", err.to_string().as_str())]),
                );
            }
        }
        result
    }

    fn restore(&self, store: &mut PathStore, raw: Json, key: &str) -> Result<LoadReport, PersistenceError> {
        let raw = if compress::is_compressed(&raw) {
            compress::unwrap(&raw)?
        } else {
            raw
        };
        validate_structure(&raw)?;

        let (raw, outcome) = self.migrations.migrate(raw, &self.version)?;
        let from_version = match &outcome {
            MigrationOutcome::Current => self.version.clone(),
            MigrationOutcome::Migrated { path } => path.first().cloned().unwrap_or_default(),
            MigrationOutcome::Skipped { from } => {
                self.events.emit(
                    topics::MIGRATION_SKIPPED,
                    payload([("from", from.as_str()), ("to", self.version.as_str())]),
                );
                from.clone()
            }
        };
        if outcome.migrated() {
            validate_structure(&raw)?;
        }
        let blob: SaveBlob = serde_json::from_value(raw)?;

        let applied = self.apply_subsystems(&blob)?;
        if let Err(err) = store.deserialize(&blob.game_state) {
            rollback(&applied);
            return Err(PersistenceError::Structural(err.to_string()));
        }

        self.save_count
            .set(self.save_count.get().max(blob.metadata.save_count));
        Ok(LoadReport {
            key: key.to_string(),
            from_version,
            migrated: outcome.migrated(),
        })
    }

    /// Hand each subsystem its snapshot, or reset it when the save has
    /// none. If one rejects its snapshot, the ones already updated are put
    /// back the way they were.
    ///
    /// Returns the previous snapshots so the caller can undo them too.
    fn apply_subsystems(&self, blob: &SaveBlob) -> Result<Applied<'_>, PersistenceError> {
        let mut applied: Applied<'_> = Vec::new();

        for subsystem in &self.subsystems {
            let name = subsystem.borrow().name();
            let previous = match subsystem.borrow().get_state() {
                Ok(previous) => previous,
                Err(source) => {
                    rollback(&applied);
                    return Err(PersistenceError::Subsystem {
                        name: name.to_string(),
                        source,
                    });
                }
            };

            let Some(state) = blob.subsystems.get(name) else {
                log::info!("Save has no {name} state, starting it fresh");
                subsystem.borrow_mut().reset_default();
                applied.push((subsystem, previous));
                continue;
            };

            let result = subsystem.borrow_mut().set_state(state);
            if let Err(source) = result {
                rollback(&applied);
                return Err(PersistenceError::Subsystem {
                    name: name.to_string(),
                    source,
                });
            }
            applied.push((subsystem, previous));
        }
        Ok(applied)
    }

    // === Slots ===

    pub fn has_save(&self, key: Option<&str>) -> bool {
        let key = key.unwrap_or(&self.settings.save_key);
        matches!(self.storage.read(key), Ok(Some(_)))
    }

    /// Remove a slot (the main one by default). Backups are kept.
    pub fn delete_save(&self, key: Option<&str>) -> Result<(), PersistenceError> {
        let key = key.unwrap_or(&self.settings.save_key);
        self.storage.remove(key)?;
        log::info!("Deleted save {key}");
        Ok(())
    }

    // === Autosave ===

    /// Request a save whenever `topic` is published
    pub fn save_on(&mut self, topic: &str) -> ListenerId {
        let requested = self.save_requested.clone();
        let id = self.events.subscribe(topic, move |_| requested.set(true));
        self.triggers.push(id);
        id
    }

    /// Quick-save if the timer ran out or a trigger fired. Returns the
    /// save result when one was attempted.
    pub fn maybe_autosave(
        &self,
        store: &PathStore,
        now_ms: f64,
    ) -> Option<Result<usize, PersistenceError>> {
        let interval = self.settings.autosave_interval_ms;
        let requested = self.save_requested.replace(false);
        let Some(last) = self.last_autosave_ms.get() else {
            // Timer starts with the first poll
            self.last_autosave_ms.set(Some(now_ms));
            return requested.then(|| self.save(store, SaveOptions::quick()));
        };

        let due = interval > 0.0 && now_ms - last >= interval;
        if !(due || requested) {
            return None;
        }
        self.last_autosave_ms.set(Some(now_ms));
        Some(self.save(store, SaveOptions::quick()))
    }
}

impl Drop for PersistenceController {
    fn drop(&mut self) {
        for id in self.triggers.drain(..) {
            self.events.unsubscribe(id);
        }
    }
}

/// Subsystems touched by a load, with the snapshot each had before
type Applied<'a> = Vec<(&'a Rc<RefCell<dyn Persistable>>, Json)>;

fn rollback(applied: &Applied<'_>) {
    for (subsystem, previous) in applied.iter().rev() {
        if let Err(err) = subsystem.borrow_mut().set_state(previous) {
            log::error!("Rollback of {} failed: {err}", subsystem.borrow().name());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::StateError;
    use crate::events::testing::{count, record};
    use crate::platform::{ManualClock, MemoryStorage};
    use crate::consts::SAVE_KEY;
    use crate::settings::{Difficulty, TimelineSettings};
    use crate::sim::TimelineSystem;
    use crate::state::default_store;

    struct Fixture {
        storage: MemoryStorage,
        clock: ManualClock,
        bus: EventBus,
        controller: PersistenceController,
    }

    fn fixture(settings: PersistenceSettings) -> Fixture {
        let storage = MemoryStorage::new();
        let clock = ManualClock::new(1_000.0);
        let bus = EventBus::new();
        let controller = PersistenceController::new(Box::new(storage.clone()), settings, bus.clone())
            .with_clock(Rc::new(clock.clone()));
        Fixture {
            storage,
            clock,
            bus,
            controller,
        }
    }

    fn plain() -> PersistenceSettings {
        PersistenceSettings {
            compress: false,
            ..PersistenceSettings::default()
        }
    }

    /// Subsystem whose state is a bare number; refuses negatives
    struct Counter(f64);

    impl Persistable for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn get_state(&self) -> Result<Json, StateError> {
            Ok(json!(self.0))
        }

        fn set_state(&mut self, state: &Json) -> Result<(), StateError> {
            let n: f64 = serde_json::from_value(state.clone())?;
            if n < 0.0 {
                return Err(StateError::OutOfRange(n.to_string()));
            }
            self.0 = n;
            Ok(())
        }

        fn reset_default(&mut self) {
            self.0 = 0.0;
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let f = fixture(PersistenceSettings::default());
        let seen = record(&f.bus);
        let mut store = default_store();
        store.set("resources.energy", 42.0).unwrap();
        store.set("expansion.scale", "regional").unwrap();
        store.set("custom.flag", true).unwrap();

        f.controller.save(&store, SaveOptions::default()).unwrap();
        assert_eq!(f.controller.save_count(), 1);
        assert_eq!(count(&seen, topics::GAME_SAVED), 1);

        let mut restored = default_store();
        let report = f.controller.load(&mut restored, None).unwrap();
        assert!(!report.migrated);
        assert_eq!(report.from_version, SAVE_VERSION);
        assert_eq!(restored.snapshot(), store.snapshot());
        assert_eq!(count(&seen, topics::GAME_LOADED), 1);
    }

    #[test]
    fn test_compressed_save_is_smaller_and_flagged() {
        let f = fixture(PersistenceSettings::default());
        let store = default_store();
        f.controller.save(&store, SaveOptions::default()).unwrap();

        let text = f.storage.read(SAVE_KEY).unwrap().unwrap();
        let raw: Json = serde_json::from_str(&text).unwrap();
        assert!(compress::is_compressed(&raw));
        let original = raw["_originalSize"].as_u64().unwrap() as usize;
        assert!(serde_json::to_string(&raw["data"]).unwrap().len() < original);
    }

    #[test]
    fn test_old_version_without_edge_loads_with_defaults() {
        let f = fixture(plain());
        let seen = record(&f.bus);
        let blob = json!({
            "version": "0.9.0",
            "timestamp": 1.0,
            "gameState": {
                "resources": {"energy": 7},
                "heat": {"current": 3},
                "expansion": {"progress": 2},
                "ethics": 10,
            },
        });
        f.storage
            .write(SAVE_KEY, &blob.to_string())
            .unwrap();

        let mut store = default_store();
        let report = f.controller.load(&mut store, None).unwrap();
        assert!(!report.migrated);
        assert_eq!(report.from_version, "0.9.0");
        assert_eq!(count(&seen, topics::MIGRATION_SKIPPED), 1);
        assert_eq!(store.get_f64("resources.energy"), Some(7.0));
        assert_eq!(store.get_f64("heat.max"), Some(100.0));
        assert_eq!(store.get_str("expansion.scale"), Some("local"));
        assert_eq!(store.get_f64("ethics"), Some(10.0));
    }

    #[test]
    fn test_registered_migration_runs() {
        let mut f = fixture(plain());
        f.controller
            .migrations_mut()
            .register("0.9.0", SAVE_VERSION, |mut blob| {
                blob["gameState"]["resources"]["influence"] = json!(5);
                Ok(blob)
            });
        let mut blob = serde_json::to_value(f.controller.build_blob(&default_store()).unwrap()).unwrap();
        blob["version"] = json!("0.9.0");
        f.storage.write(SAVE_KEY, &blob.to_string()).unwrap();

        let mut store = default_store();
        let report = f.controller.load(&mut store, None).unwrap();
        assert!(report.migrated);
        assert_eq!(store.get_f64("resources.influence"), Some(5.0));
    }

    #[test]
    fn test_structurally_invalid_load_touches_nothing() {
        let f = fixture(plain());
        let seen = record(&f.bus);
        let blob = json!({
            "version": SAVE_VERSION,
            "timestamp": 1.0,
            "gameState": {"resources": {"energy": 999}, "heat": {}, "ethics": 0},
        });
        f.storage.write(SAVE_KEY, &blob.to_string()).unwrap();

        let mut store = default_store();
        store.set("resources.energy", 1.0).unwrap();
        let err = f.controller.load(&mut store, None).unwrap_err();
        assert!(matches!(err, PersistenceError::Structural(_)));
        assert_eq!(store.get_f64("resources.energy"), Some(1.0));
        assert_eq!(count(&seen, topics::GAME_LOAD_FAILED), 1);
    }

    #[test]
    fn test_missing_slot_is_not_found() {
        let f = fixture(plain());
        let mut store = default_store();
        assert!(matches!(
            f.controller.load(&mut store, None),
            Err(PersistenceError::NotFound(_))
        ));
        assert!(!f.controller.has_save(None));
    }

    #[test]
    fn test_oversized_save_rejected_and_slot_kept() {
        let settings = PersistenceSettings {
            max_save_bytes: 64,
            ..plain()
        };
        let f = fixture(settings);
        let seen = record(&f.bus);
        f.storage.write(SAVE_KEY, "previous").unwrap();

        let err = f.controller.save(&default_store(), SaveOptions::default()).unwrap_err();
        assert!(matches!(err, PersistenceError::Capacity { limit: 64, .. }));
        assert_eq!(f.storage.read(SAVE_KEY).unwrap().as_deref(), Some("previous"));
        assert_eq!(f.controller.save_count(), 0);

        let failed = seen
            .borrow()
            .iter()
            .find(|e| e.topic == topics::GAME_SAVE_FAILED)
            .cloned()
            .unwrap();
        assert!(failed.field("cause").and_then(Value::as_str).unwrap().contains("limit"));
    }

    #[test]
    fn test_write_failure_reports_and_keeps_counters() {
        let f = fixture(plain());
        let seen = record(&f.bus);
        f.storage.set_fail_writes(true);
        assert!(matches!(
            f.controller.save(&default_store(), SaveOptions::default()),
            Err(PersistenceError::Storage(_))
        ));
        assert_eq!(f.controller.save_count(), 0);
        assert_eq!(f.controller.last_save_ms(), None);
        assert_eq!(count(&seen, topics::GAME_SAVE_FAILED), 1);
        assert!(!f.controller.is_saving());
    }

    #[test]
    fn test_backups_rotate_fifo() {
        let settings = PersistenceSettings {
            backup_count: 2,
            ..plain()
        };
        let f = fixture(settings);
        let mut store = default_store();

        for i in 0..4 {
            store.set("resources.energy", f64::from(i)).unwrap();
            f.clock.advance(1_000.0);
            f.controller.save(&store, SaveOptions::default()).unwrap();
        }
        let backups = f.controller.list_backups().unwrap();
        // Saves at 2000..5000; backups copy the slot before saves 2..4
        let times: Vec<f64> = backups.iter().map(|b| b.created_at).collect();
        assert_eq!(times, vec![4_000.0, 5_000.0]);

        let mut restored = default_store();
        f.controller.restore_backup(&mut restored, &backups[0]).unwrap();
        assert_eq!(restored.get_f64("resources.energy"), Some(1.0));
    }

    #[test]
    fn test_failed_write_leaves_backups_alone() {
        let settings = PersistenceSettings {
            backup_count: 2,
            ..plain()
        };
        let f = fixture(settings);
        let mut store = default_store();
        for i in 0..3 {
            store.set("resources.energy", f64::from(i)).unwrap();
            f.clock.advance(1_000.0);
            f.controller.save(&store, SaveOptions::default()).unwrap();
        }
        let backups_before = f.controller.list_backups().unwrap();
        let slot_before = f.storage.read(SAVE_KEY).unwrap();
        assert_eq!(backups_before.len(), 2);

        f.storage.fail_writes_to(SAVE_KEY);
        f.clock.advance(1_000.0);
        store.set("resources.energy", 50.0).unwrap();
        assert!(f.controller.save(&store, SaveOptions::default()).is_err());

        assert_eq!(f.controller.list_backups().unwrap(), backups_before);
        assert_eq!(f.storage.read(SAVE_KEY).unwrap(), slot_before);
    }

    #[test]
    fn test_alternate_slot_skips_backups() {
        let f = fixture(plain());
        let opts = SaveOptions {
            quick: false,
            key: Some("slot2".into()),
        };
        f.controller.save(&default_store(), opts.clone()).unwrap();
        f.controller.save(&default_store(), opts).unwrap();
        assert!(f.controller.list_backups().unwrap().is_empty());
        assert!(f.controller.has_save(Some("slot2")));
        f.controller.delete_save(Some("slot2")).unwrap();
        assert!(!f.controller.has_save(Some("slot2")));
    }

    #[test]
    fn test_subsystem_state_round_trips() {
        let mut f = fixture(plain());
        let timeline = Rc::new(RefCell::new(TimelineSystem::new(
            TimelineSettings::default(),
            Difficulty::Normal,
            f.bus.clone(),
        )));
        f.controller.register_subsystem(timeline.clone());
        timeline.borrow_mut().increase_paradox_risk(40.0);
        f.controller.save(&default_store(), SaveOptions::default()).unwrap();

        timeline.borrow_mut().increase_paradox_risk(20.0);
        f.controller.load(&mut default_store(), None).unwrap();
        assert_eq!(timeline.borrow().paradox_risk(), 40.0);
    }

    #[test]
    fn test_rejected_subsystem_rolls_back_others() {
        let mut f = fixture(plain());
        let timeline = Rc::new(RefCell::new(TimelineSystem::new(
            TimelineSettings::default(),
            Difficulty::Normal,
            f.bus.clone(),
        )));
        let counter = Rc::new(RefCell::new(Counter(1.0)));
        f.controller.register_subsystem(timeline.clone());
        f.controller.register_subsystem(counter.clone());

        let mut raw = serde_json::to_value(f.controller.build_blob(&default_store()).unwrap()).unwrap();
        raw["subsystems"]["timeline"]["paradoxRisk"] = json!(55.0);
        raw["subsystems"]["counter"] = json!(-3.0);
        f.storage.write(SAVE_KEY, &raw.to_string()).unwrap();

        let mut store = default_store();
        store.set("resources.energy", 9.0).unwrap();
        let err = f.controller.load(&mut store, None).unwrap_err();
        assert!(matches!(err, PersistenceError::Subsystem { ref name, .. } if name == "counter"));
        assert_eq!(timeline.borrow().paradox_risk(), 0.0);
        assert_eq!(counter.borrow().0, 1.0);
        assert_eq!(store.get_f64("resources.energy"), Some(9.0));
    }

    fn legacy_blob() -> Json {
        json!({
            "version": "0.9.0",
            "timestamp": 1.0,
            "gameState": {
                "resources": {"energy": 7},
                "heat": {"current": 3},
                "expansion": {"progress": 2},
                "ethics": 10,
            },
        })
    }

    #[test]
    fn test_subsystem_missing_from_save_is_reset() {
        let mut f = fixture(plain());
        let timeline = Rc::new(RefCell::new(TimelineSystem::new(
            TimelineSettings::default(),
            Difficulty::Normal,
            f.bus.clone(),
        )));
        let counter = Rc::new(RefCell::new(Counter(4.0)));
        f.controller.register_subsystem(timeline.clone());
        f.controller.register_subsystem(counter.clone());
        timeline.borrow_mut().increase_paradox_risk(70.0);
        f.storage.write(SAVE_KEY, &legacy_blob().to_string()).unwrap();

        f.controller.load(&mut default_store(), None).unwrap();
        assert_eq!(timeline.borrow().paradox_risk(), 0.0);
        assert_eq!(counter.borrow().0, 0.0);
    }

    #[test]
    fn test_reset_subsystem_restored_when_a_later_one_rejects() {
        let mut f = fixture(plain());
        let timeline = Rc::new(RefCell::new(TimelineSystem::new(
            TimelineSettings::default(),
            Difficulty::Normal,
            f.bus.clone(),
        )));
        let counter = Rc::new(RefCell::new(Counter(4.0)));
        f.controller.register_subsystem(timeline.clone());
        f.controller.register_subsystem(counter.clone());
        timeline.borrow_mut().increase_paradox_risk(70.0);

        let mut raw = legacy_blob();
        raw["subsystems"] = json!({"counter": -1.0});
        f.storage.write(SAVE_KEY, &raw.to_string()).unwrap();

        assert!(f.controller.load(&mut default_store(), None).is_err());
        assert_eq!(timeline.borrow().paradox_risk(), 70.0);
        assert_eq!(counter.borrow().0, 4.0);
    }

    #[test]
    fn test_failing_migration_aborts_load() {
        let mut f = fixture(plain());
        let seen = record(&f.bus);
        let timeline = Rc::new(RefCell::new(TimelineSystem::new(
            TimelineSettings::default(),
            Difficulty::Normal,
            f.bus.clone(),
        )));
        f.controller.register_subsystem(timeline.clone());
        f.controller
            .migrations_mut()
            .register("0.9.0", SAVE_VERSION, |_| Err("resources section unreadable".into()));
        timeline.borrow_mut().increase_paradox_risk(30.0);

        let mut raw = legacy_blob();
        raw["subsystems"] = json!({"timeline": timeline.borrow().get_state().unwrap()});
        raw["subsystems"]["timeline"]["paradoxRisk"] = json!(80.0);
        f.storage.write(SAVE_KEY, &raw.to_string()).unwrap();

        let mut store = default_store();
        store.set("resources.energy", 9.0).unwrap();
        let before = store.snapshot();

        let err = f.controller.load(&mut store, None).unwrap_err();
        match err {
            PersistenceError::Migration { from, to, message } => {
                assert_eq!(from, "0.9.0");
                assert_eq!(to, SAVE_VERSION);
                assert_eq!(message, "resources section unreadable");
            }
            other => panic!("expected a migration error, got {other:?}"),
        }
        assert_eq!(store.snapshot(), before);
        assert_eq!(timeline.borrow().paradox_risk(), 30.0);
        assert_eq!(count(&seen, topics::GAME_LOAD_FAILED), 1);
        assert_eq!(count(&seen, topics::GAME_LOADED), 0);
    }

    #[test]
    fn test_reentrant_save_is_rejected() {
        let f = fixture(plain());
        let controller = Rc::new(f.controller);
        let inner_result: Rc<RefCell<Option<bool>>> = Rc::default();

        let handle = Rc::downgrade(&controller);
        let sink = inner_result.clone();
        f.bus.subscribe(topics::GAME_SAVED, move |_| {
            if let Some(controller) = handle.upgrade() {
                let busy = matches!(
                    controller.save(&default_store(), SaveOptions::default()),
                    Err(PersistenceError::SaveInProgress)
                );
                *sink.borrow_mut() = Some(busy);
            }
        });

        controller.save(&default_store(), SaveOptions::default()).unwrap();
        assert_eq!(*inner_result.borrow(), Some(true));
        assert!(!controller.is_saving());
        assert_eq!(controller.save_count(), 1);
    }

    #[test]
    fn test_export_import() {
        let f = fixture(PersistenceSettings::default());
        let mut store = default_store();
        store.set("ethics", -20.0).unwrap();
        let text = f.controller.export_save(&store).unwrap();
        assert!(text.contains("\"gameState\""));

        let mut restored = default_store();
        f.controller.import_save(&mut restored, &text).unwrap();
        assert_eq!(restored.get_f64("ethics"), Some(-20.0));

        assert!(f.controller.import_save(&mut restored, "{oops").is_err());
        assert_eq!(restored.get_f64("ethics"), Some(-20.0));
    }

    #[test]
    fn test_autosave_timer_and_triggers() {
        let mut f = fixture(plain());
        let store = default_store();
        f.controller.save_on(topics::PARADOX_COLLAPSE);

        assert!(f.controller.maybe_autosave(&store, 0.0).is_none());
        assert!(f.controller.maybe_autosave(&store, 10_000.0).is_none());
        assert!(f.controller.maybe_autosave(&store, 30_000.0).unwrap().is_ok());
        assert!(f.controller.maybe_autosave(&store, 31_000.0).is_none());

        f.bus.emit(topics::PARADOX_COLLAPSE, Value::Null);
        assert!(f.controller.maybe_autosave(&store, 32_000.0).is_some());
        assert!(f.controller.maybe_autosave(&store, 33_000.0).is_none());
        assert_eq!(f.controller.save_count(), 2);
    }

    #[test]
    fn test_blob_metadata_from_store() {
        let f = fixture(plain());
        let mut store = default_store();
        store.set("stats.totalPlayTime", 12.5).unwrap();
        store.set("settings.difficulty", "hard").unwrap();
        let blob = f.controller.build_blob(&store).unwrap();
        assert_eq!(blob.metadata.save_count, 1);
        assert_eq!(blob.metadata.total_play_time, 12.5);
        assert_eq!(blob.metadata.difficulty, "hard");
        assert_eq!(blob.version, SAVE_VERSION);
        assert_eq!(blob.timestamp, 1_000.0);
        assert_eq!(Value::from_json(&blob.game_state), store.snapshot());
    }
}
